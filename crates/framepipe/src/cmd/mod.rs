use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use framepipe_channel::PixelFormat;
use framepipe_renderer::BackendKind;

use crate::exit::{CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod doctor;
pub mod inspect;
pub mod render;
pub mod version;
pub mod watch;
pub mod worker;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Render frames and publish them to a frame channel.
    Render(RenderArgs),
    /// Follow a named frame channel and print each new frame.
    Watch(WatchArgs),
    /// Print a channel's descriptor and optionally its latest frame.
    Inspect(InspectArgs),
    /// Serve renderer control requests on stdin/stdout.
    #[command(hide = true)]
    Worker(WorkerArgs),
    /// Run local environment health checks.
    Doctor(DoctorArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Render(args) => render::run(args, format),
        Command::Watch(args) => watch::run(args, format),
        Command::Inspect(args) => inspect::run(args, format),
        Command::Worker(args) => worker::run(args),
        Command::Doctor(args) => doctor::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PixelFormatArg {
    Rgba8888,
    Bgra8888,
    Rgb888,
}

impl From<PixelFormatArg> for PixelFormat {
    fn from(arg: PixelFormatArg) -> Self {
        match arg {
            PixelFormatArg::Rgba8888 => PixelFormat::Rgba8888,
            PixelFormatArg::Bgra8888 => PixelFormat::Bgra8888,
            PixelFormatArg::Rgb888 => PixelFormat::Rgb888,
        }
    }
}

#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Renderer configuration file (JSON). Flags below override it.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Backend variant: stub or native.
    #[arg(long)]
    pub backend: Option<BackendKind>,
    #[arg(long)]
    pub width: Option<u32>,
    #[arg(long)]
    pub height: Option<u32>,
    /// Clockwise rotation in degrees (0, 90, 180, 270).
    #[arg(long)]
    pub rotation: Option<u32>,
    #[arg(long, value_name = "FORMAT")]
    pub pixel_format: Option<PixelFormatArg>,
    /// Channel segment name, e.g. /framepipe-demo.
    #[arg(long, conflicts_with = "anonymous")]
    pub channel: Option<String>,
    /// Publish to an in-process channel only.
    #[arg(long)]
    pub anonymous: bool,
    /// Translation library to load for the native backend.
    #[arg(long, value_name = "PATH")]
    pub library: Option<PathBuf>,
    /// Render device node checked before every batch.
    #[arg(long, value_name = "PATH")]
    pub device: Option<PathBuf>,
    /// Number of frames to render.
    #[arg(long, default_value = "1")]
    pub frames: u64,
    /// Delay between frames (e.g. 16ms, 1s).
    #[arg(long)]
    pub interval: Option<String>,
    /// Resize to WIDTHxHEIGHT halfway through the run.
    #[arg(long, value_name = "WxH")]
    pub resize: Option<String>,
    /// Run the renderer in a sandboxed worker process.
    #[arg(long)]
    pub isolate: bool,
    /// Keep the channel open until interrupted.
    #[arg(long)]
    pub hold: bool,
    /// Print renderer info after the last frame.
    #[arg(long)]
    pub info: bool,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Channel segment name.
    pub name: String,
    /// Exit after N frames.
    #[arg(long)]
    pub count: Option<u64>,
    /// Give up when no new frame arrives for this long (e.g. 5s, 500ms).
    #[arg(long)]
    pub timeout: Option<String>,
    /// Poll interval.
    #[arg(long, default_value = "5ms")]
    pub poll: String,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Channel segment name.
    pub name: String,
    /// Also copy out and print the latest frame.
    #[arg(long)]
    pub frame: bool,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Skip resource limits and no_new_privs.
    #[arg(long)]
    pub no_sandbox: bool,
    /// Address-space limit in MiB.
    #[arg(long, value_name = "MIB")]
    pub max_memory: Option<u64>,
}

#[derive(Args, Debug, Default)]
pub struct DoctorArgs {
    /// Also check this translation library.
    #[arg(long, value_name = "PATH")]
    pub library: Option<PathBuf>,
    /// Also check this render device node.
    #[arg(long, value_name = "PATH")]
    pub device: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `150ms`, `2s` or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

/// Parse `WIDTHxHEIGHT`.
pub fn parse_size(input: &str) -> CliResult<(u32, u32)> {
    let invalid = || CliError::new(USAGE, format!("invalid size {input:?}, expected WIDTHxHEIGHT"));
    let (width, height) = input.split_once(['x', 'X']).ok_or_else(invalid)?;
    let width = width.trim().parse().map_err(|_| invalid())?;
    let height = height.trim().parse().map_err(|_| invalid())?;
    Ok((width, height))
}

/// Clear `running` on Ctrl-C.
pub fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("16ms").unwrap(), Duration::from_millis(16));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("0ms").unwrap(), Duration::ZERO);
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn parse_size_accepts_both_separators() {
        assert_eq!(parse_size("540x960").unwrap(), (540, 960));
        assert_eq!(parse_size("64X32").unwrap(), (64, 32));
        assert_eq!(parse_size("640").unwrap_err().code, USAGE);
        assert!(parse_size("ax4").is_err());
    }
}
