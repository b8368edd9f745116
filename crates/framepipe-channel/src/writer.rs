use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use framepipe_shm::ShmSegment;
use tracing::{debug, info, warn};

use crate::descriptor::{ChannelDescriptor, ChannelStatus};
use crate::error::{ChannelError, Result};
use crate::format::Geometry;
use crate::frame::FrameView;
use crate::layout::{self, SegmentHeader, SlotHeader};
use crate::reader::ChannelReader;

/// Segment currently owned by a writer, shared with in-process readers.
pub(crate) type SegmentCell = Arc<RwLock<Arc<ShmSegment>>>;

/// Channel creation options.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// POSIX segment name (`/name`); `None` creates an anonymous channel that
    /// only [`ChannelWriter::subscribe`] readers can see.
    pub name: Option<String>,
    /// Permission mode for named segments.
    pub mode: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: None,
            mode: ShmSegment::DEFAULT_SEGMENT_MODE,
        }
    }
}

impl ChannelConfig {
    /// Named channel with default permissions.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Conventional per-process segment name.
    pub fn default_name() -> String {
        format!("/framepipe-{}", std::process::id())
    }
}

/// Single writer of a frame channel.
///
/// Publication never waits for readers. Dropping the writer closes the
/// channel.
pub struct ChannelWriter {
    config: ChannelConfig,
    cell: SegmentCell,
    segment: Arc<ShmSegment>,
    geometry: Geometry,
    slot_capacity: usize,
    generation: u32,
    published: u64,
    closed: bool,
}

impl ChannelWriter {
    /// Create generation 1 of a channel for `geometry`.
    pub fn create(config: ChannelConfig, geometry: Geometry) -> Result<Self> {
        let generation = 1;
        let (segment, slot_capacity) = allocate(&config, geometry, generation)?;
        let segment = Arc::new(segment);

        info!(
            name = config.name.as_deref().unwrap_or("anonymous"),
            %geometry,
            slot_capacity,
            "frame channel created"
        );

        Ok(Self {
            cell: Arc::new(RwLock::new(Arc::clone(&segment))),
            config,
            segment,
            geometry,
            slot_capacity,
            generation,
            published: 0,
            closed: false,
        })
    }

    /// Copy `frame` into the next slot and make it the latest frame.
    ///
    /// Returns the publication number within the current generation.
    pub fn publish(&mut self, frame: &FrameView<'_>) -> Result<u64> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        if frame.geometry != self.geometry {
            return Err(ChannelError::GeometryMismatch {
                expected: self.geometry,
                actual: frame.geometry,
            });
        }
        if frame.pixels.len() != self.geometry.frame_len() {
            return Err(ChannelError::PayloadSize {
                expected: self.geometry.frame_len(),
                actual: frame.pixels.len(),
            });
        }

        let publication = self.published + 1;
        let index = layout::slot_for(publication);
        let segment = &*self.segment;
        let slot = SlotHeader::new(segment, index)?;

        let seq = slot.seq.load(Ordering::Relaxed);
        let writing = seq | 1;
        slot.seq.store(writing, Ordering::Relaxed);
        fence(Ordering::Release);

        segment.write_bytes(
            layout::slot_payload_offset(index, self.slot_capacity),
            frame.pixels,
        )?;
        slot.width.store(frame.geometry.width(), Ordering::Relaxed);
        slot.height.store(frame.geometry.height(), Ordering::Relaxed);
        slot.stride.store(frame.geometry.stride(), Ordering::Relaxed);
        slot.format
            .store(frame.geometry.format().code(), Ordering::Relaxed);
        slot.frame_number
            .store(frame.frame_number, Ordering::Relaxed);
        slot.timestamp_ns
            .store(frame.timestamp_ns, Ordering::Relaxed);
        slot.payload_len
            .store(frame.pixels.len() as u64, Ordering::Relaxed);

        slot.seq.store(writing.wrapping_add(1), Ordering::Release);

        SegmentHeader::new(segment)?
            .published
            .store(publication, Ordering::Release);
        self.published = publication;
        Ok(publication)
    }

    /// Switch the channel to `geometry`.
    ///
    /// A different geometry replaces the segment with a new generation. The
    /// old segment is marked replaced before the new one becomes visible, so
    /// readers remap before trusting any frame at the new geometry. Returns
    /// `false` when the geometry is unchanged.
    ///
    /// If the new segment cannot be allocated the current generation stays
    /// published under the channel name with its latest frame.
    pub fn renegotiate(&mut self, geometry: Geometry) -> Result<bool> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        if geometry == self.geometry {
            return Ok(false);
        }

        let old_header = SegmentHeader::new(&self.segment)?;
        let generation = self.generation.wrapping_add(1).max(1);

        if self.config.name.is_some() {
            old_header
                .status
                .store(layout::status::REPLACED, Ordering::Release);
        }

        let (segment, slot_capacity) = match allocate(&self.config, geometry, generation) {
            Ok(allocated) => allocated,
            Err(err) => {
                warn!(error = %err, to = %geometry, "frame channel replacement failed");
                if let Err(restore_err) = self.restore() {
                    warn!(error = %restore_err, "failed to restore frame channel name");
                }
                return Err(err);
            }
        };
        let segment = Arc::new(segment);

        *self.cell.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&segment);
        old_header
            .status
            .store(layout::status::REPLACED, Ordering::Release);

        info!(
            name = self.config.name.as_deref().unwrap_or("anonymous"),
            from = %self.geometry,
            to = %geometry,
            generation,
            "frame channel replaced"
        );

        self.segment = segment;
        self.geometry = geometry;
        self.slot_capacity = slot_capacity;
        self.generation = generation;
        self.published = 0;
        Ok(true)
    }

    /// Republish the current generation after a failed replacement.
    ///
    /// When the channel name was lost along the way, a fresh segment with the
    /// same generation and slot contents is created under it.
    fn restore(&mut self) -> Result<()> {
        let header = SegmentHeader::new(&self.segment)?;
        if self.config.name.is_none() || self.segment.is_linked()? {
            header.status.store(layout::status::LIVE, Ordering::Release);
            return Ok(());
        }

        let restored = match allocate(&self.config, self.geometry, self.generation) {
            Ok((segment, _)) => segment,
            Err(err) => {
                // Readers that still map the old segment keep using it.
                header.status.store(layout::status::LIVE, Ordering::Release);
                return Err(err);
            }
        };

        let mut slots = vec![0u8; self.segment.len() - layout::HEADER_LEN];
        self.segment.read_bytes(layout::HEADER_LEN, &mut slots)?;
        restored.write_bytes(layout::HEADER_LEN, &slots)?;
        SegmentHeader::new(&restored)?
            .published
            .store(self.published, Ordering::Release);

        let restored = Arc::new(restored);
        *self.cell.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&restored);
        self.segment = restored;
        info!(
            name = self.config.name.as_deref().unwrap_or("anonymous"),
            generation = self.generation,
            published = self.published,
            "frame channel restored after failed replacement"
        );
        Ok(())
    }

    /// Mark the channel closed and remove its name. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        SegmentHeader::new(&self.segment)?
            .status
            .store(layout::status::CLOSED, Ordering::Release);
        self.segment.unlink()?;
        debug!(
            name = self.config.name.as_deref().unwrap_or("anonymous"),
            generation = self.generation,
            "frame channel closed"
        );
        Ok(())
    }

    /// In-process reader that follows this writer across replacements.
    pub fn subscribe(&self) -> ChannelReader {
        ChannelReader::local(Arc::clone(&self.cell))
    }

    /// Descriptor of the current generation.
    pub fn descriptor(&self) -> ChannelDescriptor {
        ChannelDescriptor {
            name: self.config.name.clone(),
            generation: self.generation,
            geometry: self.geometry,
            published: self.published,
            slot_capacity: self.slot_capacity as u64,
            status: if self.closed {
                ChannelStatus::Closed
            } else {
                ChannelStatus::Live
            },
            writer_pid: std::process::id(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.config.name.as_deref()
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Frames published in the current generation.
    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "failed to close frame channel");
        }
    }
}

impl std::fmt::Debug for ChannelWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWriter")
            .field("name", &self.config.name)
            .field("geometry", &self.geometry)
            .field("generation", &self.generation)
            .field("published", &self.published)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Create and initialise a segment. The magic word is stored last so readers
/// never act on a half-written header.
fn allocate(
    config: &ChannelConfig,
    geometry: Geometry,
    generation: u32,
) -> Result<(ShmSegment, usize)> {
    let slot_capacity = layout::slot_capacity(&geometry);
    let len = layout::segment_len(slot_capacity);
    let segment = match &config.name {
        Some(name) => ShmSegment::create_with_mode(name, len, config.mode)?,
        None => ShmSegment::anonymous(len)?,
    };

    let header = SegmentHeader::new(&segment)?;
    header.version.store(layout::VERSION, Ordering::Relaxed);
    header
        .header_len
        .store(layout::HEADER_LEN as u32, Ordering::Relaxed);
    header
        .slot_count
        .store(layout::SLOT_COUNT as u32, Ordering::Relaxed);
    header.generation.store(generation, Ordering::Relaxed);
    header
        .status
        .store(layout::status::LIVE, Ordering::Relaxed);
    header
        .slot_capacity
        .store(slot_capacity as u64, Ordering::Relaxed);
    header.published.store(0, Ordering::Relaxed);
    header.writer_pid.store(std::process::id(), Ordering::Relaxed);
    header.width.store(geometry.width(), Ordering::Relaxed);
    header.height.store(geometry.height(), Ordering::Relaxed);
    header.stride.store(geometry.stride(), Ordering::Relaxed);
    header
        .format
        .store(geometry.format().code(), Ordering::Relaxed);
    header.magic.store(layout::MAGIC, Ordering::Release);

    Ok((segment, slot_capacity))
}
