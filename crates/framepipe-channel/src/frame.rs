use bytes::Bytes;

use crate::error::{ChannelError, Result};
use crate::format::{Geometry, PixelFormat};

/// One fully rendered image plus its metadata.
///
/// The payload is exactly `stride * height` bytes. Cloning is cheap: the
/// pixels are reference counted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameBuffer {
    geometry: Geometry,
    frame_number: u64,
    timestamp_ns: u64,
    pixels: Bytes,
}

impl FrameBuffer {
    /// Create a frame, validating the payload length against `geometry`.
    pub fn new(
        geometry: Geometry,
        frame_number: u64,
        timestamp_ns: u64,
        pixels: impl Into<Bytes>,
    ) -> Result<Self> {
        let pixels = pixels.into();
        check_len(&geometry, pixels.len())?;
        Ok(Self {
            geometry,
            frame_number,
            timestamp_ns,
            pixels,
        })
    }

    /// Copy a borrowed frame into an owned one.
    pub fn from_view(view: &FrameView<'_>) -> Self {
        Self {
            geometry: view.geometry,
            frame_number: view.frame_number,
            timestamp_ns: view.timestamp_ns,
            pixels: Bytes::copy_from_slice(view.pixels),
        }
    }

    /// Borrow this frame for publication.
    pub fn as_view(&self) -> FrameView<'_> {
        FrameView {
            geometry: self.geometry,
            frame_number: self.frame_number,
            timestamp_ns: self.timestamp_ns,
            pixels: &self.pixels,
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn width(&self) -> u32 {
        self.geometry.width()
    }

    pub fn height(&self) -> u32 {
        self.geometry.height()
    }

    pub fn stride(&self) -> u32 {
        self.geometry.stride()
    }

    pub fn format(&self) -> PixelFormat {
        self.geometry.format()
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Capture time on the host monotonic clock, in nanoseconds.
    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    /// Raw payload, `stride * height` bytes including row padding.
    pub fn pixels(&self) -> &Bytes {
        &self.pixels
    }

    /// Visible bytes of row `y` (padding excluded).
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height() {
            return None;
        }
        let start = y as usize * self.stride() as usize;
        Some(&self.pixels[start..start + self.geometry.row_bytes()])
    }

    /// Bytes of the pixel at (`x`, `y`).
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width() {
            return None;
        }
        let bpp = self.format().bytes_per_pixel();
        let row = self.row(y)?;
        let start = x as usize * bpp;
        Some(&row[start..start + bpp])
    }
}

/// A frame whose pixels are borrowed from a working buffer.
///
/// Backends render into a buffer they reuse for the next frame; publication
/// copies the view into channel storage.
#[derive(Clone, Copy, Debug)]
pub struct FrameView<'a> {
    pub geometry: Geometry,
    pub frame_number: u64,
    pub timestamp_ns: u64,
    pub pixels: &'a [u8],
}

impl<'a> FrameView<'a> {
    /// Create a view, validating the payload length against `geometry`.
    pub fn new(
        geometry: Geometry,
        frame_number: u64,
        timestamp_ns: u64,
        pixels: &'a [u8],
    ) -> Result<Self> {
        check_len(&geometry, pixels.len())?;
        Ok(Self {
            geometry,
            frame_number,
            timestamp_ns,
            pixels,
        })
    }
}

fn check_len(geometry: &Geometry, actual: usize) -> Result<()> {
    let expected = geometry.frame_len();
    if actual == expected {
        Ok(())
    } else {
        Err(ChannelError::PayloadSize { expected, actual })
    }
}
