use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use framepipe_channel::{ChannelError, ChannelReader};
use tracing::{debug, info};

use crate::cmd::{install_ctrlc_handler, parse_duration, WatchArgs};
use crate::exit::{channel_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::{print_frame, OutputFormat};

pub fn run(args: WatchArgs, format: OutputFormat) -> CliResult<i32> {
    let poll = parse_duration(&args.poll)?;
    let timeout = args.timeout.as_deref().map(parse_duration).transpose()?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(Arc::clone(&running))?;

    let mut reader = ChannelReader::attach(args.name.as_str());
    let mut printed = 0u64;
    let mut generation = None;
    let mut last_frame = Instant::now();

    while running.load(Ordering::SeqCst) {
        match reader.poll_new() {
            Ok(Some(frame)) => {
                if reader.generation() != generation {
                    generation = reader.generation();
                    info!(
                        channel = %args.name,
                        generation = ?generation,
                        geometry = %frame.geometry(),
                        "following channel generation"
                    );
                }
                print_frame(&frame, format);
                printed = printed.saturating_add(1);
                last_frame = Instant::now();

                if args.count.is_some_and(|count| printed >= count) {
                    return Ok(SUCCESS);
                }
                continue;
            }
            Ok(None) => {}
            Err(ChannelError::Closed) => {
                info!(channel = %args.name, frames = printed, "channel closed by writer");
                return Ok(SUCCESS);
            }
            Err(ChannelError::ReadContended { attempts }) => {
                debug!(attempts, "read contended; retrying");
                continue;
            }
            Err(err) => return Err(channel_error("read failed", err)),
        }

        if let Some(timeout) = timeout {
            if last_frame.elapsed() >= timeout {
                return Err(CliError::new(
                    TIMEOUT,
                    format!("no new frame on {} within {timeout:?}", args.name),
                ));
            }
        }
        std::thread::sleep(poll);
    }

    Ok(SUCCESS)
}

