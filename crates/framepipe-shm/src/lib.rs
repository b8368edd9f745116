//! POSIX shared-memory segments.
//!
//! This is the lowest layer of framepipe. A [`ShmSegment`] is a fixed-size
//! mapping that is either:
//! - named (`shm_open`), so display consumers in other processes can map it
//!   by name, or
//! - anonymous (`MAP_SHARED | MAP_ANONYMOUS`), for in-process consumers and
//!   tests.
//!
//! Everything above this crate talks to shared memory only through the
//! bounds-checked accessors exposed here.

#[cfg(not(unix))]
compile_error!("framepipe-shm requires a Unix platform");

pub mod clock;
pub mod error;
pub mod segment;

pub use clock::monotonic_ns;
pub use error::{Result, ShmError};
pub use segment::{validate_name, Access, ShmSegment};
