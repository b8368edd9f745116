use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, Result};

/// Row alignment in bytes applied to every pixel format.
pub const ROW_ALIGN: usize = 4;

/// Largest accepted width or height.
pub const MAX_DIMENSION: u32 = 16_384;

/// Pixel layouts a frame can carry.
///
/// The discriminants are the wire codes stored in the channel header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgba8888 = 0,
    #[default]
    Bgra8888 = 1,
    Rgb888 = 2,
}

impl PixelFormat {
    /// Wire code stored in segment headers.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Decode a wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Rgba8888),
            1 => Some(Self::Bgra8888),
            2 => Some(Self::Rgb888),
            _ => None,
        }
    }

    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8888 | Self::Bgra8888 => 4,
            Self::Rgb888 => 3,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Rgba8888 => "rgba8888",
            Self::Bgra8888 => "bgra8888",
            Self::Rgb888 => "rgb888",
        }
    }

    /// Byte offsets of the (r, g, b, a) channels within one pixel.
    pub const fn channel_offsets(self) -> (usize, usize, usize, Option<usize>) {
        match self {
            Self::Rgba8888 => (0, 1, 2, Some(3)),
            Self::Bgra8888 => (2, 1, 0, Some(3)),
            Self::Rgb888 => (0, 1, 2, None),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Negotiated frame geometry: dimensions, row stride and pixel format.
///
/// Always constructed through [`Geometry::new`], so `stride` is the padded
/// row size for `format` and `stride * height` fits in memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Geometry {
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
}

impl Geometry {
    /// Validate dimensions and compute the padded stride.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        let invalid = |reason| ChannelError::InvalidGeometry {
            width,
            height,
            reason,
        };
        if width == 0 || height == 0 {
            return Err(invalid("dimensions must be positive"));
        }
        if width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(invalid("dimension exceeds maximum"));
        }

        let stride = align_up(width as usize * format.bytes_per_pixel(), ROW_ALIGN);
        Ok(Self {
            width,
            height,
            stride: stride as u32,
            format,
        })
    }

    /// Rebuild a geometry read back from a segment, rejecting inconsistent
    /// combinations (which a reader treats as a torn or corrupt header).
    pub(crate) fn from_raw(width: u32, height: u32, stride: u32, format_code: u32) -> Option<Self> {
        let format = PixelFormat::from_code(format_code)?;
        let geometry = Self::new(width, height, format).ok()?;
        (geometry.stride == stride).then_some(geometry)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per row, including alignment padding.
    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Bytes of visible pixel data per row (stride minus padding).
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Exact payload size of one frame: `stride * height`.
    pub fn frame_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} stride {} {}",
            self.width, self.height, self.stride, self.format
        )
    }
}

pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}
