//! Shared-memory layout of a frame channel segment.
//!
//! All multi-byte fields are native-endian words accessed atomically; the
//! writer and its readers always run on the same host.
//!
//! ```text
//! 0    segment header (64 B)
//! 64   slot header 0 (64 B)
//! 128  slot header 1 (64 B)
//! 192  slot 0 payload (slot_capacity B)
//! ..   slot 1 payload (slot_capacity B)
//! ```

use std::sync::atomic::{AtomicU32, AtomicU64};

use framepipe_shm::ShmSegment;

use crate::error::{ChannelError, Result};
use crate::format::{align_up, Geometry};

/// `b"FPCH"` as a little-endian `u32`.
pub const MAGIC: u32 = 0x4843_5046;

/// Segment layout version.
pub const VERSION: u32 = 1;

pub const HEADER_LEN: usize = 64;
pub const SLOT_COUNT: usize = 2;
pub const SLOT_HEADER_LEN: usize = 64;

/// Byte offset of the first slot payload.
pub const PAYLOAD_OFFSET: usize = HEADER_LEN + SLOT_COUNT * SLOT_HEADER_LEN;

/// Slot payload capacities are rounded up to this many bytes.
pub const PAYLOAD_ALIGN: usize = 64;

/// Byte offsets within the segment header.
pub mod header {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 4;
    pub const HEADER_LEN: usize = 8;
    pub const SLOT_COUNT: usize = 12;
    pub const GENERATION: usize = 16;
    pub const STATUS: usize = 20;
    pub const SLOT_CAPACITY: usize = 24; // u64
    pub const PUBLISHED: usize = 32; // u64
    pub const WRITER_PID: usize = 40;
    pub const WIDTH: usize = 44;
    pub const HEIGHT: usize = 48;
    pub const STRIDE: usize = 52;
    pub const FORMAT: usize = 56;
}

/// Byte offsets within a slot header.
pub mod slot {
    pub const SEQ: usize = 0; // u64, odd while the slot is being written
    pub const WIDTH: usize = 8;
    pub const HEIGHT: usize = 12;
    pub const STRIDE: usize = 16;
    pub const FORMAT: usize = 20;
    pub const FRAME_NUMBER: usize = 24; // u64
    pub const TIMESTAMP_NS: usize = 32; // u64
    pub const PAYLOAD_LEN: usize = 40; // u64
}

/// Values of the segment `STATUS` word.
pub mod status {
    pub const LIVE: u32 = 0;
    /// A newer segment (next generation) has been published under the same name.
    pub const REPLACED: u32 = 1;
    pub const CLOSED: u32 = 2;
}

/// Payload bytes reserved per slot for `geometry`.
pub fn slot_capacity(geometry: &Geometry) -> usize {
    align_up(geometry.frame_len(), PAYLOAD_ALIGN)
}

/// Total segment size for a given slot capacity.
pub fn segment_len(slot_capacity: usize) -> usize {
    PAYLOAD_OFFSET + SLOT_COUNT * slot_capacity
}

/// Slot that publication number `publication` is written into.
pub fn slot_for(publication: u64) -> usize {
    (publication % SLOT_COUNT as u64) as usize
}

pub fn slot_header_offset(index: usize) -> usize {
    HEADER_LEN + index * SLOT_HEADER_LEN
}

pub fn slot_payload_offset(index: usize, slot_capacity: usize) -> usize {
    PAYLOAD_OFFSET + index * slot_capacity
}

/// Typed view of the segment header words.
pub(crate) struct SegmentHeader<'a> {
    pub magic: &'a AtomicU32,
    pub version: &'a AtomicU32,
    pub header_len: &'a AtomicU32,
    pub slot_count: &'a AtomicU32,
    pub generation: &'a AtomicU32,
    pub status: &'a AtomicU32,
    pub slot_capacity: &'a AtomicU64,
    pub published: &'a AtomicU64,
    pub writer_pid: &'a AtomicU32,
    pub width: &'a AtomicU32,
    pub height: &'a AtomicU32,
    pub stride: &'a AtomicU32,
    pub format: &'a AtomicU32,
}

impl<'a> SegmentHeader<'a> {
    pub fn new(segment: &'a ShmSegment) -> Result<Self> {
        if segment.len() < PAYLOAD_OFFSET {
            return Err(ChannelError::Corrupt("segment smaller than header"));
        }
        Ok(Self {
            magic: segment.atomic_u32(header::MAGIC)?,
            version: segment.atomic_u32(header::VERSION)?,
            header_len: segment.atomic_u32(header::HEADER_LEN)?,
            slot_count: segment.atomic_u32(header::SLOT_COUNT)?,
            generation: segment.atomic_u32(header::GENERATION)?,
            status: segment.atomic_u32(header::STATUS)?,
            slot_capacity: segment.atomic_u64(header::SLOT_CAPACITY)?,
            published: segment.atomic_u64(header::PUBLISHED)?,
            writer_pid: segment.atomic_u32(header::WRITER_PID)?,
            width: segment.atomic_u32(header::WIDTH)?,
            height: segment.atomic_u32(header::HEIGHT)?,
            stride: segment.atomic_u32(header::STRIDE)?,
            format: segment.atomic_u32(header::FORMAT)?,
        })
    }
}

/// Typed view of one slot header.
pub(crate) struct SlotHeader<'a> {
    pub seq: &'a AtomicU64,
    pub width: &'a AtomicU32,
    pub height: &'a AtomicU32,
    pub stride: &'a AtomicU32,
    pub format: &'a AtomicU32,
    pub frame_number: &'a AtomicU64,
    pub timestamp_ns: &'a AtomicU64,
    pub payload_len: &'a AtomicU64,
}

impl<'a> SlotHeader<'a> {
    pub fn new(segment: &'a ShmSegment, index: usize) -> Result<Self> {
        let base = slot_header_offset(index);
        Ok(Self {
            seq: segment.atomic_u64(base + slot::SEQ)?,
            width: segment.atomic_u32(base + slot::WIDTH)?,
            height: segment.atomic_u32(base + slot::HEIGHT)?,
            stride: segment.atomic_u32(base + slot::STRIDE)?,
            format: segment.atomic_u32(base + slot::FORMAT)?,
            frame_number: segment.atomic_u64(base + slot::FRAME_NUMBER)?,
            timestamp_ns: segment.atomic_u64(base + slot::TIMESTAMP_NS)?,
            payload_len: segment.atomic_u64(base + slot::PAYLOAD_LEN)?,
        })
    }
}
