use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::MetadataExt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::error::{Result, ShmError};

/// How a segment is mapped into this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// A mapped shared-memory segment.
///
/// Named segments created by this process are unlinked on drop, but only if
/// the name still refers to the object this process created (a replacement
/// created by someone else under the same name is left alone).
pub struct ShmSegment {
    ptr: NonNull<u8>,
    len: usize,
    access: Access,
    name: Option<String>,
    created_inode: Option<(u64, u64)>,
    /// Whether the name should be removed on drop (segments created here only).
    unlink_on_drop: AtomicBool,
}

// SAFETY: the mapping is process-shared memory with no thread affinity. All
// typed access goes through atomics or through explicit byte copies whose
// ordering is the caller's protocol (see framepipe-channel).
unsafe impl Send for ShmSegment {}
// SAFETY: see `Send`; `&ShmSegment` only exposes atomics and copies.
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Default permission mode for created segments.
    pub const DEFAULT_SEGMENT_MODE: u32 = 0o600;
    /// Maximum segment name length including the leading slash.
    /// macOS limits POSIX shm names to `PSHMNAMLEN` (31); Linux to `NAME_MAX`.
    #[cfg(target_os = "macos")]
    const MAX_NAME_LEN: usize = 31;
    #[cfg(not(target_os = "macos"))]
    const MAX_NAME_LEN: usize = 255;

    /// Create a named read-write segment of `len` bytes.
    ///
    /// A stale segment with the same name is removed first.
    pub fn create(name: &str, len: usize) -> Result<Self> {
        Self::create_with_mode(name, len, Self::DEFAULT_SEGMENT_MODE)
    }

    /// Create a named read-write segment with an explicit permission mode.
    pub fn create_with_mode(name: &str, len: usize, mode: u32) -> Result<Self> {
        validate_name(name)?;
        if len == 0 {
            return Err(ShmError::ZeroLength);
        }
        let cname = c_name(name)?;
        let create_err = |source: io::Error| ShmError::Create {
            name: name.to_string(),
            source,
        };

        let flags = libc::O_CREAT | libc::O_EXCL | libc::O_RDWR;
        let fd = match shm_open_raw(&cname, flags, mode) {
            Ok(fd) => fd,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                debug!(name, "removing stale segment");
                match shm_unlink_raw(&cname) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(create_err(err)),
                }
                shm_open_raw(&cname, flags, mode).map_err(create_err)?
            }
            Err(err) => return Err(create_err(err)),
        };

        let file = File::from(fd);
        let sized = file
            .set_len(len as u64)
            .and_then(|()| file.metadata())
            .map_err(create_err);
        let metadata = match sized {
            Ok(metadata) => metadata,
            Err(err) => {
                let _ = shm_unlink_raw(&cname);
                return Err(err);
            }
        };

        let ptr = match map(Some(&file), len, Access::ReadWrite) {
            Ok(ptr) => ptr,
            Err(err) => {
                let _ = shm_unlink_raw(&cname);
                return Err(err);
            }
        };

        info!(name, len, "created shared-memory segment");

        Ok(Self {
            ptr,
            len,
            access: Access::ReadWrite,
            name: Some(name.to_string()),
            created_inode: Some((metadata.dev(), metadata.ino())),
            unlink_on_drop: AtomicBool::new(true),
        })
    }

    /// Map an existing named segment.
    ///
    /// The mapping covers the whole object as sized by its creator.
    pub fn open(name: &str, access: Access) -> Result<Self> {
        validate_name(name)?;
        let cname = c_name(name)?;
        let open_err = |source: io::Error| ShmError::Open {
            name: name.to_string(),
            source,
        };

        let flags = match access {
            Access::ReadOnly => libc::O_RDONLY,
            Access::ReadWrite => libc::O_RDWR,
        };
        let fd = shm_open_raw(&cname, flags, 0).map_err(open_err)?;
        let file = File::from(fd);
        let len = file.metadata().map_err(open_err)?.len() as usize;
        if len == 0 {
            // Creator has not sized the object yet.
            return Err(ShmError::ZeroLength);
        }

        let ptr = map(Some(&file), len, access)?;
        debug!(name, len, ?access, "opened shared-memory segment");

        Ok(Self {
            ptr,
            len,
            access,
            name: Some(name.to_string()),
            created_inode: None,
            unlink_on_drop: AtomicBool::new(false),
        })
    }

    /// Create an anonymous shared mapping (inherited across `fork`, visible to
    /// every thread of this process).
    pub fn anonymous(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(ShmError::ZeroLength);
        }
        let ptr = map(None, len, Access::ReadWrite)?;
        debug!(len, "created anonymous segment");
        Ok(Self {
            ptr,
            len,
            access: Access::ReadWrite,
            name: None,
            created_inode: None,
            unlink_on_drop: AtomicBool::new(false),
        })
    }

    /// Mapping size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Segments are never empty; provided for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Segment name, or `None` for anonymous mappings.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Mapping access mode.
    pub fn access(&self) -> Access {
        self.access
    }

    /// Borrow a `u32` word of the mapping as an atomic.
    pub fn atomic_u32(&self, offset: usize) -> Result<&AtomicU32> {
        self.check_range(offset, 4)?;
        check_align(offset, 4)?;
        // SAFETY: range and alignment checked above; the mapping outlives `&self`
        // and `AtomicU32` has the same layout as `u32`.
        Ok(unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU32) })
    }

    /// Borrow a `u64` word of the mapping as an atomic.
    pub fn atomic_u64(&self, offset: usize) -> Result<&AtomicU64> {
        self.check_range(offset, 8)?;
        check_align(offset, 8)?;
        // SAFETY: range and alignment checked above; the mapping outlives `&self`
        // and `AtomicU64` has the same layout as `u64`.
        Ok(unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU64) })
    }

    /// Copy `src` into the mapping at `offset`.
    pub fn write_bytes(&self, offset: usize, src: &[u8]) -> Result<()> {
        if self.access == Access::ReadOnly {
            return Err(ShmError::ReadOnly);
        }
        self.check_range(offset, src.len())?;
        // SAFETY: the destination range is inside a writable mapping and cannot
        // overlap `src`, which is a Rust-owned slice.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len());
        }
        Ok(())
    }

    /// Copy `dst.len()` bytes out of the mapping starting at `offset`.
    ///
    /// Bytes may be concurrently modified by another process; callers must
    /// validate the copy with their own sequence protocol.
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, dst.len())?;
        // SAFETY: the source range is inside the mapping and `dst` is a
        // distinct Rust-owned buffer.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(offset),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
        Ok(())
    }

    /// Remove the segment name so new openers no longer find it.
    ///
    /// Existing mappings (including this one) stay valid. Returns `true` when
    /// the name was removed, `false` when it was already gone or now refers to
    /// a different object.
    pub fn unlink(&self) -> Result<bool> {
        self.unlink_on_drop.store(false, Ordering::Relaxed);
        let (Some(name), Some(expected)) = (self.name.as_deref(), self.created_inode) else {
            return Ok(false);
        };
        let cname = c_name(name)?;

        match current_identity(&cname) {
            Ok(Some(identity)) if identity == expected => {
                debug!(name, "unlinking segment");
                match shm_unlink_raw(&cname) {
                    Ok(()) => Ok(true),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
                    Err(err) => Err(ShmError::Io(err)),
                }
            }
            Ok(Some(_)) => {
                debug!(name, "segment identity changed; skipping unlink");
                Ok(false)
            }
            Ok(None) => Ok(false),
            Err(err) => Err(ShmError::Io(err)),
        }
    }

    /// Whether the name still refers to the object this handle created.
    ///
    /// Always `false` for opened and anonymous segments.
    pub fn is_linked(&self) -> Result<bool> {
        let (Some(name), Some(expected)) = (self.name.as_deref(), self.created_inode) else {
            return Ok(false);
        };
        let identity = current_identity(&c_name(name)?).map_err(ShmError::Io)?;
        Ok(identity == Some(expected))
    }

    /// Remove `name` regardless of who created it.
    ///
    /// Used to clear segments left behind by a writer that died without
    /// cleaning up. Returns `false` when no such segment exists.
    pub fn remove(name: &str) -> Result<bool> {
        validate_name(name)?;
        match shm_unlink_raw(&c_name(name)?) {
            Ok(()) => {
                debug!(name, "removed segment");
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(ShmError::Io(err)),
        }
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(ShmError::OutOfBounds {
                offset,
                len,
                size: self.len,
            }),
        }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        if *self.unlink_on_drop.get_mut() {
            if let Err(err) = self.unlink() {
                warn!(name = ?self.name, error = %err, "failed to unlink segment on drop");
            }
        }

        // SAFETY: `ptr`/`len` describe a mapping created by `map` and not yet
        // unmapped; no borrows derived from `&self` can outlive `self`.
        let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast::<libc::c_void>(), self.len) };
        if rc != 0 {
            warn!(
                len = self.len,
                error = %io::Error::last_os_error(),
                "munmap failed"
            );
        }
    }
}

impl std::fmt::Debug for ShmSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmSegment")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("access", &self.access)
            .finish()
    }
}

/// Check `name` against POSIX shared-memory naming rules: a leading `/`, no
/// further slashes, and the platform length limit.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason| {
        Err(ShmError::InvalidName {
            name: name.to_string(),
            reason,
        })
    };
    if !name.starts_with('/') {
        return invalid("must start with '/'");
    }
    if name.len() < 2 {
        return invalid("must not be empty after '/'");
    }
    if name[1..].contains('/') {
        return invalid("must not contain '/' after the first character");
    }
    if name.len() > ShmSegment::MAX_NAME_LEN {
        return invalid("name too long for this platform");
    }
    Ok(())
}

fn c_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| ShmError::InvalidName {
        name: name.to_string(),
        reason: "must not contain NUL bytes",
    })
}

fn check_align(offset: usize, align: usize) -> Result<()> {
    if offset % align == 0 {
        Ok(())
    } else {
        Err(ShmError::Misaligned { offset, align })
    }
}

fn shm_open_raw(name: &CString, flags: libc::c_int, mode: u32) -> io::Result<OwnedFd> {
    // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
    #[cfg(target_os = "linux")]
    let fd = unsafe { libc::shm_open(name.as_ptr(), flags, mode as libc::mode_t) };
    // SAFETY: as above; non-Linux `shm_open` is variadic and takes the mode as `c_uint`.
    #[cfg(not(target_os = "linux"))]
    let fd = unsafe { libc::shm_open(name.as_ptr(), flags, mode as libc::c_uint) };

    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just returned by `shm_open` and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn shm_unlink_raw(name: &CString) -> io::Result<()> {
    // SAFETY: `name` is a valid NUL-terminated string.
    let rc = unsafe { libc::shm_unlink(name.as_ptr()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn current_identity(name: &CString) -> io::Result<Option<(u64, u64)>> {
    match shm_open_raw(name, libc::O_RDONLY, 0) {
        Ok(fd) => {
            let metadata = File::from(fd).metadata()?;
            Ok(Some((metadata.dev(), metadata.ino())))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn map(file: Option<&File>, len: usize, access: Access) -> Result<NonNull<u8>> {
    let prot = match access {
        Access::ReadOnly => libc::PROT_READ,
        Access::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    };
    let (flags, fd) = match file {
        Some(file) => (libc::MAP_SHARED, file.as_raw_fd()),
        None => (libc::MAP_SHARED | libc::MAP_ANON, -1),
    };

    // SAFETY: a fresh mapping is requested (null hint); `fd` is either -1 for
    // anonymous memory or an open descriptor borrowed for the call.
    let ptr = unsafe { libc::mmap(std::ptr::null_mut(), len, prot, flags, fd, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(ShmError::Map {
            len,
            source: io::Error::last_os_error(),
        });
    }
    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| ShmError::Map {
        len,
        source: io::Error::other("mmap returned a null mapping"),
    })
}
