use framepipe_channel::ChannelError;
use serde::Serialize;

use crate::sandbox::DeviceError;
use crate::state::RendererState;

/// Why `initialize` could not bring a backend up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitFailure {
    MissingDriver,
    IncompatibleVersion,
    ResourceExhausted,
    DeviceUnavailable,
}

impl InitFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingDriver => "missing_driver",
            Self::IncompatibleVersion => "incompatible_version",
            Self::ResourceExhausted => "resource_exhausted",
            Self::DeviceUnavailable => "device_unavailable",
        }
    }
}

impl std::fmt::Display for InitFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by a renderer backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The translation library or one of its required symbols is missing.
    #[error("graphics library unavailable: {0}")]
    MissingDriver(String),

    /// The translation library speaks a different ABI revision.
    #[error("incompatible graphics library ABI {found} (expected {expected})")]
    IncompatibleVersion { found: u32, expected: u32 },

    /// The library or host ran out of memory or handles.
    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),

    /// The render device node could not be used at initialization.
    #[error("render device unavailable: {0}")]
    DeviceUnavailable(#[source] DeviceError),

    /// The render device node disappeared or lost permissions mid-session.
    #[error("render device revoked: {0}")]
    DeviceRevoked(#[source] DeviceError),

    /// The library reported an unrecoverable context failure.
    #[error("graphics context lost in {call} (code {code})")]
    ContextLost { call: &'static str, code: i32 },

    /// A call was made before `initialize` or after `shutdown`.
    #[error("backend not initialized")]
    NotInitialized,
}

impl BackendError {
    /// Structured cause reported when this error aborts initialization.
    pub fn init_failure(&self) -> InitFailure {
        match self {
            Self::MissingDriver(_) => InitFailure::MissingDriver,
            Self::IncompatibleVersion { .. } => InitFailure::IncompatibleVersion,
            Self::ResourceExhausted(_) => InitFailure::ResourceExhausted,
            Self::DeviceUnavailable(_)
            | Self::DeviceRevoked(_)
            | Self::ContextLost { .. }
            | Self::NotInitialized => InitFailure::DeviceUnavailable,
        }
    }
}

/// Errors surfaced by the renderer facade.
#[derive(Debug, thiserror::Error)]
pub enum RendererError {
    /// An argument or configuration value was rejected; state is unchanged.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `initialize` was called while already initialized.
    #[error("renderer already initialized (state {0})")]
    AlreadyInitialized(RendererState),

    /// The operation is not valid in the current state.
    #[error("renderer not ready (state {0})")]
    NotReady(RendererState),

    /// Backend or channel bring-up failed; the renderer is in `Error`.
    #[error("initialization failed ({cause}): {message}")]
    InitFailed { cause: InitFailure, message: String },

    /// The backend failed unrecoverably; the renderer is in `Error`.
    #[error("fatal backend fault: {0}")]
    Fatal(#[source] BackendError),

    /// Publishing to the frame channel failed; the renderer is in `Error`.
    #[error("fatal channel fault: {0}")]
    ChannelFault(#[source] ChannelError),

    /// Configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: String,
        source: std::io::Error,
    },

    /// Configuration JSON is malformed.
    #[error("invalid config: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl RendererError {
    /// True for faults that moved the renderer into the sticky `Error` state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InitFailed { .. } | Self::Fatal(_) | Self::ChannelFault(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RendererError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_errors_map_to_device_unavailable() {
        let err = BackendError::DeviceRevoked(DeviceError::Missing("/dev/dri/renderD128".into()));
        assert_eq!(err.init_failure(), InitFailure::DeviceUnavailable);
        assert_eq!(
            BackendError::ResourceExhausted("oom".into()).init_failure(),
            InitFailure::ResourceExhausted
        );
    }

    #[test]
    fn only_faults_are_fatal() {
        assert!(RendererError::Fatal(BackendError::NotInitialized).is_fatal());
        assert!(RendererError::ChannelFault(ChannelError::Closed).is_fatal());
        assert!(!RendererError::InvalidArgument("rotation".into()).is_fatal());
        assert!(!RendererError::NotReady(RendererState::Uninitialized).is_fatal());
    }
}
