use framepipe_channel::ChannelReader;

use crate::cmd::InspectArgs;
use crate::exit::{channel_error, CliError, CliResult, FAILURE, NOT_FOUND, SUCCESS};
use crate::output::{print_descriptor, print_frame, OutputFormat};

pub fn run(args: InspectArgs, format: OutputFormat) -> CliResult<i32> {
    let mut reader =
        ChannelReader::open(&args.name).map_err(|err| channel_error("open failed", err))?;

    // Raw output is pixel data only, so the descriptor is skipped.
    let raw = matches!(format, OutputFormat::Raw);
    if !args.frame || !raw {
        let descriptor = reader
            .descriptor()
            .map_err(|err| channel_error("header read failed", err))?
            .ok_or_else(|| {
                CliError::new(NOT_FOUND, format!("{} is not initialized yet", args.name))
            })?;
        print_descriptor(&descriptor, format);
    }

    if args.frame {
        match reader
            .read_latest()
            .map_err(|err| channel_error("frame read failed", err))?
        {
            Some(frame) => print_frame(&frame, format),
            None => {
                return Err(CliError::new(
                    FAILURE,
                    format!("no frame published on {} yet", args.name),
                ))
            }
        }
    }

    Ok(SUCCESS)
}
