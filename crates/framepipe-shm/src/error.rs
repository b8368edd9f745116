/// Errors that can occur while creating, mapping or accessing a segment.
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// The segment name is not a valid POSIX shared-memory name.
    #[error("invalid segment name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Failed to create the named segment.
    #[error("failed to create segment {name}: {source}")]
    Create {
        name: String,
        source: std::io::Error,
    },

    /// Failed to open an existing named segment.
    #[error("failed to open segment {name}: {source}")]
    Open {
        name: String,
        source: std::io::Error,
    },

    /// `mmap` refused the mapping.
    #[error("failed to map {len} bytes: {source}")]
    Map { len: usize, source: std::io::Error },

    /// Segments must have a non-zero size.
    #[error("segment size must be non-zero")]
    ZeroLength,

    /// An access fell outside the mapping.
    #[error("access out of bounds (offset {offset}, len {len}, segment {size} bytes)")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    /// An atomic access was not naturally aligned.
    #[error("misaligned atomic access at offset {offset} (align {align})")]
    Misaligned { offset: usize, align: usize },

    /// A write was attempted through a read-only mapping.
    #[error("segment is mapped read-only")]
    ReadOnly,

    /// An I/O error occurred on the segment descriptor.
    #[error("segment I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShmError {
    /// True when the named segment does not exist (yet).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ShmError::Open { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }

    /// True when the failure is a memory/descriptor exhaustion condition.
    pub fn is_resource_exhaustion(&self) -> bool {
        let source = match self {
            ShmError::Create { source, .. }
            | ShmError::Open { source, .. }
            | ShmError::Map { source, .. }
            | ShmError::Io(source) => source,
            _ => return false,
        };
        matches!(
            source.raw_os_error(),
            Some(libc::ENOMEM) | Some(libc::ENOSPC) | Some(libc::EMFILE) | Some(libc::ENFILE)
        )
    }
}

pub type Result<T> = std::result::Result<T, ShmError>;
