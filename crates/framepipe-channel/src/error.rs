use crate::format::Geometry;

/// Errors that can occur while publishing or reading frames.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Shared-memory failure (allocation, mapping, access).
    #[error("shared memory error: {0}")]
    Shm(#[from] framepipe_shm::ShmError),

    /// Requested dimensions are not representable.
    #[error("invalid geometry {width}x{height}: {reason}")]
    InvalidGeometry {
        width: u32,
        height: u32,
        reason: &'static str,
    },

    /// Pixel payload length disagrees with stride x height.
    #[error("payload is {actual} bytes, geometry requires {expected}")]
    PayloadSize { expected: usize, actual: usize },

    /// A frame was offered at a geometry the channel has not negotiated.
    #[error("frame geometry {actual} does not match channel geometry {expected}")]
    GeometryMismatch { expected: Geometry, actual: Geometry },

    /// The segment was written by an incompatible layout version.
    #[error("incompatible channel layout version {found} (expected {expected})")]
    IncompatibleVersion { found: u32, expected: u32 },

    /// The segment is malformed beyond a transient in-progress state.
    #[error("corrupt channel segment: {0}")]
    Corrupt(&'static str),

    /// The writer closed the channel.
    #[error("channel closed by writer")]
    Closed,

    /// The writer kept overwriting the slot faster than it could be copied.
    #[error("read abandoned after {attempts} torn attempts")]
    ReadContended { attempts: u32 },
}

impl ChannelError {
    /// True when a segment could not be allocated for lack of memory or
    /// descriptors.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, Self::Shm(err) if err.is_resource_exhaustion())
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
