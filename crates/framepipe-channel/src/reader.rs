use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, PoisonError};

use framepipe_shm::{Access, ShmError, ShmSegment};
use tracing::{debug, trace};

use crate::descriptor::{ChannelDescriptor, ChannelStatus};
use crate::error::{ChannelError, Result};
use crate::format::Geometry;
use crate::frame::FrameBuffer;
use crate::layout::{self, SegmentHeader, SlotHeader};
use crate::writer::SegmentCell;

/// Torn copies tolerated per read before giving up.
pub const DEFAULT_READ_ATTEMPTS: u32 = 64;

/// Attempts that busy-spin before the reader starts yielding.
const SPIN_ATTEMPTS: u32 = 8;

enum Source {
    Named(String),
    Local(SegmentCell),
}

/// Read-only consumer of a frame channel.
///
/// A reader copies the newest complete frame out of the segment; it never
/// blocks or slows the writer. Segment replacement is followed
/// transparently.
pub struct ChannelReader {
    source: Source,
    segment: Option<Arc<ShmSegment>>,
    generation: Option<u32>,
    /// `(generation, publication)` of the last frame returned.
    last_seen: Option<(u32, u64)>,
    max_attempts: u32,
}

impl ChannelReader {
    /// Map the named channel, failing if it does not exist.
    pub fn open(name: &str) -> Result<Self> {
        let mut reader = Self::attach(name);
        let segment = ShmSegment::open(name, Access::ReadOnly)?;
        reader.segment = Some(Arc::new(segment));
        if reader.current()?.is_none() {
            debug!(name, "channel exists but is not initialised yet");
        }
        Ok(reader)
    }

    /// Reader for a named channel that may not exist yet.
    ///
    /// Reads return `Ok(None)` until the writer creates the segment.
    pub fn attach(name: impl Into<String>) -> Self {
        Self::with_source(Source::Named(name.into()))
    }

    pub(crate) fn local(cell: SegmentCell) -> Self {
        Self::with_source(Source::Local(cell))
    }

    fn with_source(source: Source) -> Self {
        Self {
            source,
            segment: None,
            generation: None,
            last_seen: None,
            max_attempts: DEFAULT_READ_ATTEMPTS,
        }
    }

    /// Override the torn-copy retry bound.
    pub fn with_read_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Copy out the most recently published frame.
    ///
    /// `Ok(None)` means nothing is available yet: no frame has been published
    /// in the current generation, or the segment is being replaced.
    pub fn read_latest(&mut self) -> Result<Option<FrameBuffer>> {
        let Some((segment, descriptor)) = self.current()? else {
            return Ok(None);
        };
        let Some((publication, frame)) = self.read_slot(&segment, &descriptor)? else {
            return Ok(None);
        };
        self.last_seen = Some((descriptor.generation, publication));
        Ok(Some(frame))
    }

    /// Like [`read_latest`](Self::read_latest), but only returns a frame
    /// published after the last one this reader returned.
    pub fn poll_new(&mut self) -> Result<Option<FrameBuffer>> {
        let Some((segment, descriptor)) = self.current()? else {
            return Ok(None);
        };
        let seen = |publication| self.last_seen == Some((descriptor.generation, publication));

        if descriptor.published == 0 || seen(descriptor.published) {
            return Ok(None);
        }
        let Some((publication, frame)) = self.read_slot(&segment, &descriptor)? else {
            return Ok(None);
        };
        if seen(publication) {
            return Ok(None);
        }
        self.last_seen = Some((descriptor.generation, publication));
        Ok(Some(frame))
    }

    /// Current channel header, `None` while the channel is unavailable.
    pub fn descriptor(&mut self) -> Result<Option<ChannelDescriptor>> {
        Ok(self.current()?.map(|(_, descriptor)| descriptor))
    }

    /// Generation of the segment this reader last mapped.
    pub fn generation(&self) -> Option<u32> {
        self.generation
    }

    /// Resolve the live segment, remapping after a replacement.
    fn current(&mut self) -> Result<Option<(Arc<ShmSegment>, ChannelDescriptor)>> {
        // A replaced segment is retried once: the successor is usually
        // already visible by the time the old status is observed.
        for _ in 0..2 {
            let Some(segment) = self.resolve_segment()? else {
                return Ok(None);
            };
            let Some(descriptor) = ChannelDescriptor::read(&segment)? else {
                return Ok(None);
            };

            match descriptor.status {
                ChannelStatus::Live => {
                    if self.generation != Some(descriptor.generation) {
                        debug!(
                            generation = descriptor.generation,
                            geometry = %descriptor.geometry,
                            "reader attached to channel generation"
                        );
                        self.generation = Some(descriptor.generation);
                    }
                    return Ok(Some((segment, descriptor)));
                }
                ChannelStatus::Replaced => {
                    trace!(generation = descriptor.generation, "segment replaced; remapping");
                    self.segment = None;
                }
                ChannelStatus::Closed => {
                    self.segment = None;
                    return Err(ChannelError::Closed);
                }
            }
        }
        Ok(None)
    }

    fn resolve_segment(&mut self) -> Result<Option<Arc<ShmSegment>>> {
        match &self.source {
            Source::Local(cell) => {
                let segment = Arc::clone(&cell.read().unwrap_or_else(PoisonError::into_inner));
                self.segment = Some(Arc::clone(&segment));
                Ok(Some(segment))
            }
            Source::Named(name) => {
                if let Some(segment) = &self.segment {
                    return Ok(Some(Arc::clone(segment)));
                }
                match ShmSegment::open(name, Access::ReadOnly) {
                    Ok(segment) => {
                        let segment = Arc::new(segment);
                        self.segment = Some(Arc::clone(&segment));
                        Ok(Some(segment))
                    }
                    // Not created yet, or mid-replacement.
                    Err(err) if err.is_not_found() => Ok(None),
                    Err(ShmError::ZeroLength) => Ok(None),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }

    /// Seqlock copy of the latest slot.
    fn read_slot(
        &self,
        segment: &ShmSegment,
        descriptor: &ChannelDescriptor,
    ) -> Result<Option<(u64, FrameBuffer)>> {
        let header = SegmentHeader::new(segment)?;
        let slot_capacity = descriptor.slot_capacity as usize;
        let mut pixels = Vec::new();

        for attempt in 0..self.max_attempts {
            let publication = header.published.load(Ordering::Acquire);
            if publication == 0 {
                return Ok(None);
            }
            let index = layout::slot_for(publication);
            let slot = SlotHeader::new(segment, index)?;

            let seq = slot.seq.load(Ordering::Acquire);
            if seq & 1 == 1 {
                backoff(attempt);
                continue;
            }

            let geometry = Geometry::from_raw(
                slot.width.load(Ordering::Relaxed),
                slot.height.load(Ordering::Relaxed),
                slot.stride.load(Ordering::Relaxed),
                slot.format.load(Ordering::Relaxed),
            );
            let frame_number = slot.frame_number.load(Ordering::Relaxed);
            let timestamp_ns = slot.timestamp_ns.load(Ordering::Relaxed);
            let payload_len = slot.payload_len.load(Ordering::Relaxed) as usize;

            let geometry = match geometry {
                Some(g) if g == descriptor.geometry && payload_len == g.frame_len() => g,
                _ => {
                    fence(Ordering::Acquire);
                    if slot.seq.load(Ordering::Relaxed) == seq {
                        return Err(ChannelError::Corrupt("slot metadata disagrees with header"));
                    }
                    backoff(attempt);
                    continue;
                }
            };

            pixels.resize(payload_len, 0);
            segment.read_bytes(layout::slot_payload_offset(index, slot_capacity), &mut pixels)?;

            fence(Ordering::Acquire);
            if slot.seq.load(Ordering::Relaxed) != seq {
                backoff(attempt);
                continue;
            }

            let frame = FrameBuffer::new(geometry, frame_number, timestamp_ns, pixels)?;
            return Ok(Some((publication, frame)));
        }

        Err(ChannelError::ReadContended {
            attempts: self.max_attempts,
        })
    }
}

impl std::fmt::Debug for ChannelReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match &self.source {
            Source::Named(name) => name.as_str(),
            Source::Local(_) => "local",
        };
        f.debug_struct("ChannelReader")
            .field("source", &source)
            .field("generation", &self.generation)
            .field("last_seen", &self.last_seen)
            .finish()
    }
}

fn backoff(attempt: u32) {
    if attempt < SPIN_ATTEMPTS {
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;
    use crate::writer::{ChannelConfig, ChannelWriter};
    use std::sync::atomic::AtomicBool;
    use std::sync::Barrier;
    use std::thread;

    fn unique_name(tag: &str) -> String {
        format!(
            "/fp-chan-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        )
    }

    fn geometry(width: u32, height: u32) -> Geometry {
        Geometry::new(width, height, PixelFormat::Bgra8888).unwrap()
    }

    /// Frame whose every byte is derived from `frame_number`, so a torn copy
    /// is detectable from the payload alone.
    fn stamped(geometry: Geometry, frame_number: u64) -> FrameBuffer {
        FrameBuffer::new(
            geometry,
            frame_number,
            frame_number + 1_000,
            vec![frame_number as u8; geometry.frame_len()],
        )
        .unwrap()
    }

    fn assert_consistent(frame: &FrameBuffer) {
        assert_eq!(frame.pixels().len(), frame.stride() as usize * frame.height() as usize);
        assert_eq!(frame.timestamp_ns(), frame.frame_number() + 1_000);
        let expected = frame.frame_number() as u8;
        assert!(
            frame.pixels().iter().all(|&b| b == expected),
            "torn payload in frame {}",
            frame.frame_number()
        );
    }

    #[test]
    fn empty_channel_reads_none() {
        let writer = ChannelWriter::create(ChannelConfig::default(), geometry(4, 4)).unwrap();
        let mut reader = writer.subscribe();
        assert!(reader.read_latest().unwrap().is_none());
        assert_eq!(reader.descriptor().unwrap().unwrap().published, 0);
    }

    #[test]
    fn subscriber_sees_latest_frame() {
        let g = geometry(4, 4);
        let mut writer = ChannelWriter::create(ChannelConfig::default(), g).unwrap();
        let mut reader = writer.subscribe();

        writer.publish(&stamped(g, 0).as_view()).unwrap();
        writer.publish(&stamped(g, 1).as_view()).unwrap();

        let frame = reader.read_latest().unwrap().unwrap();
        assert_eq!(frame.frame_number(), 1);
        assert_consistent(&frame);
    }

    #[test]
    fn poll_new_returns_each_publication_once() {
        let g = geometry(2, 2);
        let mut writer = ChannelWriter::create(ChannelConfig::default(), g).unwrap();
        let mut reader = writer.subscribe();

        assert!(reader.poll_new().unwrap().is_none());
        writer.publish(&stamped(g, 0).as_view()).unwrap();
        assert_eq!(reader.poll_new().unwrap().unwrap().frame_number(), 0);
        assert!(reader.poll_new().unwrap().is_none());

        writer.publish(&stamped(g, 1).as_view()).unwrap();
        writer.publish(&stamped(g, 2).as_view()).unwrap();
        // Frame 1 was overwritten before the reader looked.
        assert_eq!(reader.poll_new().unwrap().unwrap().frame_number(), 2);
        assert!(reader.poll_new().unwrap().is_none());
    }

    #[test]
    fn subscriber_follows_replacement() {
        let mut writer = ChannelWriter::create(ChannelConfig::default(), geometry(4, 4)).unwrap();
        let mut reader = writer.subscribe();
        writer.publish(&stamped(geometry(4, 4), 0).as_view()).unwrap();
        assert_eq!(reader.read_latest().unwrap().unwrap().width(), 4);

        writer.renegotiate(geometry(2, 8)).unwrap();
        // Nothing published at the new geometry yet.
        assert!(reader.read_latest().unwrap().is_none());
        assert_eq!(reader.generation(), Some(2));

        writer.publish(&stamped(geometry(2, 8), 1).as_view()).unwrap();
        let frame = reader.read_latest().unwrap().unwrap();
        assert_eq!(frame.geometry(), geometry(2, 8));
        assert_eq!(frame.frame_number(), 1);
    }

    #[test]
    fn closed_channel_is_reported() {
        let g = geometry(2, 2);
        let mut writer = ChannelWriter::create(ChannelConfig::default(), g).unwrap();
        let mut reader = writer.subscribe();
        writer.publish(&stamped(g, 0).as_view()).unwrap();
        writer.close().unwrap();
        assert!(matches!(reader.read_latest(), Err(ChannelError::Closed)));
    }

    #[test]
    fn named_reader_opens_and_remaps() {
        let name = unique_name("named");
        let mut writer =
            ChannelWriter::create(ChannelConfig::named(&name), geometry(4, 4)).unwrap();
        writer.publish(&stamped(geometry(4, 4), 0).as_view()).unwrap();

        let mut reader = ChannelReader::open(&name).unwrap();
        let descriptor = reader.descriptor().unwrap().unwrap();
        assert_eq!(descriptor.name.as_deref(), Some(name.as_str()));
        assert_eq!(descriptor.generation, 1);
        assert_eq!(reader.read_latest().unwrap().unwrap().frame_number(), 0);

        writer.renegotiate(geometry(8, 2)).unwrap();
        writer.publish(&stamped(geometry(8, 2), 1).as_view()).unwrap();

        let frame = reader.read_latest().unwrap().unwrap();
        assert_eq!(frame.geometry(), geometry(8, 2));
        assert_eq!(reader.generation(), Some(2));

        drop(writer);
        assert!(matches!(reader.read_latest(), Err(ChannelError::Closed)));
        // The name is gone after close.
        assert!(reader.read_latest().unwrap().is_none());
    }

    #[test]
    fn open_missing_channel_fails_but_attach_waits() {
        let name = unique_name("missing");
        let err = ChannelReader::open(&name).unwrap_err();
        assert!(matches!(err, ChannelError::Shm(ref e) if e.is_not_found()));

        let mut reader = ChannelReader::attach(&name);
        assert!(reader.read_latest().unwrap().is_none());

        let g = geometry(2, 2);
        let mut writer = ChannelWriter::create(ChannelConfig::named(&name), g).unwrap();
        writer.publish(&stamped(g, 5).as_view()).unwrap();
        assert_eq!(reader.read_latest().unwrap().unwrap().frame_number(), 5);
    }

    #[test]
    fn concurrent_readers_never_observe_torn_frames() {
        let small = geometry(16, 8);
        let large = geometry(24, 12);
        let mut writer = ChannelWriter::create(ChannelConfig::default(), small).unwrap();

        let start = Arc::new(Barrier::new(3));
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let mut reader = writer.subscribe();
                let start = start.clone();
                let done = done.clone();
                thread::spawn(move || {
                    start.wait();
                    let mut last = None;
                    while !done.load(Ordering::SeqCst) {
                        match reader.read_latest() {
                            Ok(Some(frame)) => {
                                assert_consistent(&frame);
                                assert!(
                                    frame.geometry() == small || frame.geometry() == large,
                                    "unexpected geometry {}",
                                    frame.geometry()
                                );
                                // Within one generation the latest frame never goes backwards.
                                if let Some((generation, number)) = last {
                                    if reader.generation() == Some(generation) {
                                        assert!(frame.frame_number() >= number);
                                    }
                                }
                                last = reader.generation().map(|g| (g, frame.frame_number()));
                            }
                            Ok(None) | Err(ChannelError::ReadContended { .. }) => {}
                            Err(err) => panic!("unexpected read error: {err}"),
                        }
                    }

                    // One last read after the writer has finished.
                    let frame = reader.read_latest().unwrap().unwrap();
                    assert_eq!(frame.frame_number(), 9_999);
                    assert_consistent(&frame);
                })
            })
            .collect();

        start.wait();
        for frame_number in 0u64..10_000 {
            if frame_number % 2_500 == 0 && frame_number > 0 {
                let next = if writer.geometry() == small { large } else { small };
                writer.renegotiate(next).unwrap();
            }
            let frame = stamped(writer.geometry(), frame_number);
            writer.publish(&frame.as_view()).unwrap();
        }
        done.store(true, Ordering::SeqCst);

        for reader in readers {
            reader.join().unwrap();
        }
    }
}
