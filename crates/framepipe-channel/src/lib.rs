//! Latest-value frame channel over shared memory.
//!
//! One writer publishes finished frames into a two-slot segment; any number
//! of readers (threads or processes) copy out the newest complete frame:
//! - every slot carries a sequence word that is odd while the slot is being
//!   written, so readers detect and retry torn copies
//! - the segment header carries the published counter, which only advances
//!   after a slot is complete
//! - a geometry change replaces the whole segment and bumps its generation,
//!   so readers holding an old mapping remap before trusting new data
//!
//! Readers never block the writer and the writer never waits for readers;
//! frames a slow reader misses are simply overwritten.

pub mod descriptor;
pub mod error;
pub mod format;
pub mod frame;
pub mod layout;
pub mod reader;
pub mod writer;

pub use descriptor::{ChannelDescriptor, ChannelStatus};
pub use error::{ChannelError, Result};
pub use format::{Geometry, PixelFormat, MAX_DIMENSION, ROW_ALIGN};
pub use frame::{FrameBuffer, FrameView};
pub use reader::ChannelReader;
pub use reader::DEFAULT_READ_ATTEMPTS;
pub use writer::{ChannelConfig, ChannelWriter};
