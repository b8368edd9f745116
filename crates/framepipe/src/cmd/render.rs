use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use framepipe_renderer::command::encode_batch;
use framepipe_renderer::{
    Command, ProcessConfig, ProcessOutcome, Renderer, RendererConfig, RendererProcess, Rotation,
};
use tracing::{info, warn};

use crate::cmd::{install_ctrlc_handler, parse_duration, parse_size, RenderArgs};
use crate::exit::{io_error, process_error, renderer_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{info_value, print_info, print_outcome, OutputFormat};

const HOLD_POLL: Duration = Duration::from_millis(50);

/// Where batches go: this process or a sandboxed worker.
enum Session {
    Local(Renderer),
    Isolated(RendererProcess),
}

impl Session {
    fn start(config: RendererConfig, isolate: bool) -> CliResult<Self> {
        if !isolate {
            let renderer = Renderer::new();
            renderer
                .initialize(config)
                .map_err(|err| renderer_error("initialize failed", err))?;
            return Ok(Self::Local(renderer));
        }

        let config = ProcessConfig::current_exe(config)
            .map_err(|err| io_error("cannot locate framepipe executable", err))?;
        let mut process = RendererProcess::new(config);
        process.add_state_callback(|old, new| info!(from = %old, to = %new, "worker state"));
        process
            .start()
            .map_err(|err| process_error("worker start failed", err))?;
        Ok(Self::Isolated(process))
    }

    fn process(&mut self, batch: &[u8]) -> CliResult<ProcessOutcome> {
        match self {
            Self::Local(renderer) => renderer
                .process_commands(batch)
                .map_err(|err| renderer_error("render failed", err)),
            Self::Isolated(process) => process
                .process_commands(batch)
                .map_err(|err| process_error("render failed", err)),
        }
    }

    fn resize(&mut self, width: u32, height: u32) -> CliResult<()> {
        match self {
            Self::Local(renderer) => renderer
                .resize(width, height)
                .map_err(|err| renderer_error("resize failed", err)),
            Self::Isolated(process) => process
                .resize(width, height)
                .map_err(|err| process_error("resize failed", err)),
        }
    }

    fn info(&mut self) -> CliResult<serde_json::Value> {
        match self {
            Self::Local(renderer) => Ok(info_value(&renderer.get_info())),
            Self::Isolated(process) => process
                .info()
                .map_err(|err| process_error("info failed", err)),
        }
    }

    fn finish(self) -> CliResult<()> {
        match self {
            Self::Local(renderer) => {
                renderer.cleanup();
                Ok(())
            }
            Self::Isolated(mut process) => process
                .stop()
                .map_err(|err| process_error("worker stop failed", err)),
        }
    }
}

/// What to render once the session is up.
struct Plan {
    frames: u64,
    interval: Duration,
    resize: Option<(u32, u32)>,
    size: (u32, u32),
    format: OutputFormat,
}

pub fn run(args: RenderArgs, format: OutputFormat) -> CliResult<i32> {
    let config = build_config(&args)?;
    if args.isolate && config.channel.anonymous {
        return Err(CliError::new(
            USAGE,
            "--isolate needs a named channel; anonymous channels stay inside the worker",
        ));
    }
    let plan = Plan {
        frames: args.frames,
        interval: args
            .interval
            .as_deref()
            .map(parse_duration)
            .transpose()?
            .unwrap_or(Duration::ZERO),
        resize: args.resize.as_deref().map(parse_size).transpose()?,
        size: (config.width, config.height),
        format,
    };

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(Arc::clone(&running))?;

    let channel = config
        .channel
        .channel_config()
        .name
        .unwrap_or_else(|| "(anonymous)".to_string());
    let mut session = Session::start(config, args.isolate)?;
    info!(channel = %channel, frames = plan.frames, isolated = args.isolate, "rendering");

    let result = render_frames(&mut session, &plan, &running).and_then(|()| {
        if args.info {
            print_info(&session.info()?, format);
        }
        Ok(())
    });

    if result.is_ok() && args.hold && running.load(Ordering::SeqCst) {
        info!(channel = %channel, "holding channel open; interrupt to exit");
        while running.load(Ordering::SeqCst) {
            std::thread::sleep(HOLD_POLL);
        }
    }

    if let Err(err) = session.finish() {
        warn!(error = %err, "renderer shutdown failed");
    }
    result.map(|()| SUCCESS)
}

fn render_frames(session: &mut Session, plan: &Plan, running: &AtomicBool) -> CliResult<()> {
    let (mut width, mut height) = plan.size;
    let resize_at = plan.frames / 2;

    for index in 0..plan.frames {
        if !running.load(Ordering::SeqCst) {
            info!(rendered = index, "interrupted");
            break;
        }
        if let Some((new_width, new_height)) = plan.resize.filter(|_| index == resize_at) {
            session.resize(new_width, new_height)?;
            (width, height) = (new_width, new_height);
        }

        let outcome = session.process(&frame_commands(index, width, height))?;
        print_outcome(&outcome, plan.format);

        if index + 1 < plan.frames && !plan.interval.is_zero() {
            std::thread::sleep(plan.interval);
        }
    }
    Ok(())
}

/// A cleared background with a square sweeping left to right.
fn frame_commands(index: u64, width: u32, height: u32) -> bytes::Bytes {
    let side = (width.min(height) / 4).max(1);
    let travel = u64::from(width.saturating_sub(side).max(1));
    let x = u32::try_from((index * 8) % travel).unwrap_or(0);
    let shade = u32::try_from(index % 256).unwrap_or(0);

    encode_batch(&[
        Command::Clear {
            color: 0xFF10_1010 | (shade << 8),
        },
        Command::FillRect {
            x,
            y: (height - side.min(height)) / 2,
            width: side,
            height: side,
            color: 0xFFE0_4020,
        },
        Command::Flush,
    ])
}

fn build_config(args: &RenderArgs) -> CliResult<RendererConfig> {
    let mut config = match &args.config {
        Some(path) => {
            RendererConfig::load(path).map_err(|err| renderer_error("config rejected", err))?
        }
        None => RendererConfig::default(),
    };

    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(width) = args.width {
        config.width = width;
    }
    if let Some(height) = args.height {
        config.height = height;
    }
    if let Some(degrees) = args.rotation {
        config.rotation =
            Rotation::try_from(degrees).map_err(|err| renderer_error("bad --rotation", err))?;
    }
    if let Some(format) = args.pixel_format {
        config.format = format.into();
    }
    if let Some(name) = &args.channel {
        config.channel.name = Some(name.clone());
        config.channel.anonymous = false;
    }
    if args.anonymous {
        config.channel.name = None;
        config.channel.anonymous = true;
    }
    if let Some(library) = &args.library {
        config.native.library_path = Some(library.clone());
    }
    if let Some(device) = &args.device {
        config.device_node = Some(device.clone());
    }

    config
        .validate()
        .map_err(|err| renderer_error("config rejected", err))?;
    Ok(config)
}
