use std::fmt;
use std::io;

use framepipe_channel::ChannelError;
use framepipe_renderer::{ProcessError, RendererError};
use framepipe_shm::ShmError;

// Exit codes follow the sysexits-style layout used across our tools.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const NOT_FOUND: i32 = 2;
pub const CHANNEL_ERROR: i32 = 3;
pub const RENDERER_ERROR: i32 = 4;
pub const HEALTH_CHECK_FAILED: i32 = 30;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::NotFound => NOT_FOUND,
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn shm_error(context: &str, err: ShmError) -> CliError {
    if err.is_not_found() {
        return CliError::new(NOT_FOUND, format!("{context}: {err}"));
    }
    match err {
        ShmError::Create { ref source, .. }
        | ShmError::Open { ref source, .. }
        | ShmError::Map { ref source, .. }
        | ShmError::Io(ref source)
            if source.kind() == io::ErrorKind::PermissionDenied =>
        {
            CliError::new(PERMISSION_DENIED, format!("{context}: {err}"))
        }
        ShmError::InvalidName { .. } => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(CHANNEL_ERROR, format!("{context}: {other}")),
    }
}

pub fn channel_error(context: &str, err: ChannelError) -> CliError {
    match err {
        ChannelError::Shm(err) => shm_error(context, err),
        ChannelError::InvalidGeometry { .. } => CliError::new(USAGE, format!("{context}: {err}")),
        ChannelError::IncompatibleVersion { .. } | ChannelError::Corrupt(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        ChannelError::ReadContended { .. } => CliError::new(TIMEOUT, format!("{context}: {err}")),
        other => CliError::new(CHANNEL_ERROR, format!("{context}: {other}")),
    }
}

pub fn renderer_error(context: &str, err: RendererError) -> CliError {
    match err {
        RendererError::InvalidArgument(_) => CliError::new(USAGE, format!("{context}: {err}")),
        RendererError::ConfigRead { source, path } => {
            io_error(&format!("{context}: failed to read config {path}"), source)
        }
        RendererError::ConfigParse(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        RendererError::ChannelFault(err) => channel_error(context, err),
        other => CliError::new(RENDERER_ERROR, format!("{context}: {other}")),
    }
}

pub fn process_error(context: &str, err: ProcessError) -> CliError {
    match err {
        ProcessError::Spawn(source) => io_error(context, source),
        ProcessError::Rejected(_) => CliError::new(USAGE, format!("{context}: {err}")),
        ProcessError::Response(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        ProcessError::Fatal(_) => CliError::new(RENDERER_ERROR, format!("{context}: {err}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_segment_maps_to_not_found() {
        let err = ShmError::Open {
            name: "/nope".to_string(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(channel_error("open", ChannelError::Shm(err)).code, NOT_FOUND);
    }

    #[test]
    fn invalid_arguments_are_usage_errors() {
        let err = RendererError::InvalidArgument("rotation".to_string());
        let cli = renderer_error("rotate", err);
        assert_eq!(cli.code, USAGE);
        assert!(cli.message.starts_with("rotate: "));
    }

    #[test]
    fn closed_channel_is_a_channel_error() {
        assert_eq!(
            channel_error("read", ChannelError::Closed).code,
            CHANNEL_ERROR
        );
    }
}
