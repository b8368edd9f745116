use std::fmt;
use std::sync::atomic::Ordering;

use framepipe_shm::ShmSegment;
use serde::Serialize;

use crate::error::{ChannelError, Result};
use crate::format::Geometry;
use crate::layout::{self, SegmentHeader};

/// Lifecycle of a channel segment as recorded in its header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Live,
    /// A newer generation exists under the same name.
    Replaced,
    Closed,
}

impl ChannelStatus {
    pub(crate) fn from_word(word: u32) -> Option<Self> {
        match word {
            layout::status::LIVE => Some(Self::Live),
            layout::status::REPLACED => Some(Self::Replaced),
            layout::status::CLOSED => Some(Self::Closed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Replaced => "replaced",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a consumer needs to know to attach to a channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChannelDescriptor {
    /// Segment name, `None` for anonymous in-process channels.
    pub name: Option<String>,
    pub generation: u32,
    /// Geometry of every frame published in this generation.
    pub geometry: Geometry,
    /// Number of frames published in this generation.
    pub published: u64,
    /// Payload bytes reserved per slot.
    pub slot_capacity: u64,
    pub status: ChannelStatus,
    pub writer_pid: u32,
}

impl ChannelDescriptor {
    /// Decode the header of a mapped segment.
    ///
    /// Returns `Ok(None)` while the creator is still initialising the header
    /// (magic not yet stored).
    pub(crate) fn read(segment: &ShmSegment) -> Result<Option<Self>> {
        let header = SegmentHeader::new(segment)?;

        match header.magic.load(Ordering::Acquire) {
            0 => return Ok(None),
            layout::MAGIC => {}
            _ => return Err(ChannelError::Corrupt("bad magic")),
        }
        let version = header.version.load(Ordering::Relaxed);
        if version != layout::VERSION {
            return Err(ChannelError::IncompatibleVersion {
                found: version,
                expected: layout::VERSION,
            });
        }
        if header.header_len.load(Ordering::Relaxed) as usize != layout::HEADER_LEN
            || header.slot_count.load(Ordering::Relaxed) as usize != layout::SLOT_COUNT
        {
            return Err(ChannelError::Corrupt("unexpected header shape"));
        }

        let geometry = Geometry::from_raw(
            header.width.load(Ordering::Relaxed),
            header.height.load(Ordering::Relaxed),
            header.stride.load(Ordering::Relaxed),
            header.format.load(Ordering::Relaxed),
        )
        .ok_or(ChannelError::Corrupt("invalid negotiated geometry"))?;

        let slot_capacity = header.slot_capacity.load(Ordering::Relaxed);
        if (slot_capacity as usize) < geometry.frame_len()
            || layout::segment_len(slot_capacity as usize) > segment.len()
        {
            return Err(ChannelError::Corrupt("slot capacity does not fit segment"));
        }

        let status = ChannelStatus::from_word(header.status.load(Ordering::Acquire))
            .ok_or(ChannelError::Corrupt("unknown status"))?;

        Ok(Some(Self {
            name: segment.name().map(str::to_owned),
            generation: header.generation.load(Ordering::Relaxed),
            geometry,
            published: header.published.load(Ordering::Acquire),
            slot_capacity,
            status,
            writer_pid: header.writer_pid.load(Ordering::Relaxed),
        }))
    }
}

impl fmt::Display for ChannelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} gen {} {} ({}, {} published)",
            self.name.as_deref().unwrap_or("anonymous"),
            self.generation,
            self.geometry,
            self.status,
            self.published
        )
    }
}
