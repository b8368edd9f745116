use framepipe_channel::{FrameView, Geometry};

use super::{BackendIdentity, OpStatus, Readiness};
use crate::command::Command;
use crate::config::{BackendKind, Rotation};
use crate::error::BackendError;

/// Checker cell size of the red channel, in source pixels.
const CHECKER: u64 = 32;

/// Backend that ignores command content and renders a test pattern.
#[derive(Debug, Default)]
pub struct StubBackend {
    geometry: Option<Geometry>,
    rotation: Rotation,
    buffer: Vec<u8>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&mut self, geometry: Geometry, rotation: Rotation) {
        self.geometry = Some(geometry);
        self.rotation = rotation;
    }

    pub fn check_ready(&self) -> Result<Geometry, BackendError> {
        self.geometry.ok_or(BackendError::NotInitialized)
    }

    pub fn process(&mut self, _command: &Command) -> Result<OpStatus, BackendError> {
        self.check_ready()?;
        Ok(OpStatus::Applied)
    }

    pub fn produce_frame(
        &mut self,
        frame_number: u64,
        timestamp_ns: u64,
    ) -> Result<FrameView<'_>, BackendError> {
        let geometry = self.check_ready()?;
        self.buffer.resize(geometry.frame_len(), 0);
        render_pattern(&geometry, self.rotation, frame_number, &mut self.buffer);
        Ok(FrameView {
            geometry,
            frame_number,
            timestamp_ns,
            pixels: &self.buffer,
        })
    }

    pub fn readiness(&self) -> Readiness {
        if self.geometry.is_some() {
            Readiness::Ready
        } else {
            Readiness::Uninitialized
        }
    }

    pub fn resize(&mut self, geometry: Geometry) -> Result<(), BackendError> {
        self.check_ready()?;
        self.geometry = Some(geometry);
        Ok(())
    }

    pub fn set_rotation(&mut self, rotation: Rotation) -> Result<(), BackendError> {
        self.check_ready()?;
        self.rotation = rotation;
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.geometry = None;
        self.buffer = Vec::new();
    }

    pub fn identity(&self) -> BackendIdentity {
        BackendIdentity {
            kind: BackendKind::Stub,
            vendor: "framepipe".to_string(),
            version: concat!("stub ", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    pub fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }
}

/// Render the stub test pattern into `dst` (`geometry.frame_len()` bytes).
///
/// The image is a pure function of its inputs. The pattern is laid out in
/// the unrotated source image and sampled through `rotation`:
/// blue follows x and green follows y, both shifted by
/// `(frame_number * 2) mod 256`; red alternates 0x80/0x40 on a 32-pixel
/// checker; alpha is opaque. Row padding is zeroed.
pub fn render_pattern(geometry: &Geometry, rotation: Rotation, frame_number: u64, dst: &mut [u8]) {
    debug_assert_eq!(dst.len(), geometry.frame_len());

    let (width, height) = (geometry.width() as u64, geometry.height() as u64);
    let (src_width, src_height) = if rotation.swaps_axes() {
        (height, width)
    } else {
        (width, height)
    };
    let shift = (frame_number % 128) as u8 * 2;

    let format = geometry.format();
    let bpp = format.bytes_per_pixel();
    let (r, g, b, a) = format.channel_offsets();

    for (y, row) in dst
        .chunks_exact_mut(geometry.stride() as usize)
        .enumerate()
    {
        let (pixels, padding) = row.split_at_mut(geometry.row_bytes());
        padding.fill(0);

        for (x, pixel) in pixels.chunks_exact_mut(bpp).enumerate() {
            let (sx, sy) = source_coords(rotation, x as u64, y as u64, width, height);
            pixel[b] = ((sx * 255 / src_width) as u8).wrapping_add(shift);
            pixel[g] = ((sy * 255 / src_height) as u8).wrapping_add(shift);
            pixel[r] = if (sx / CHECKER + sy / CHECKER) % 2 == 0 {
                0x80
            } else {
                0x40
            };
            if let Some(a) = a {
                pixel[a] = 0xFF;
            }
        }
    }
}

/// Map an output pixel back to the unrotated source image (clockwise).
fn source_coords(rotation: Rotation, x: u64, y: u64, width: u64, height: u64) -> (u64, u64) {
    match rotation {
        Rotation::Deg0 => (x, y),
        Rotation::Deg90 => (y, width - 1 - x),
        Rotation::Deg180 => (width - 1 - x, height - 1 - y),
        Rotation::Deg270 => (height - 1 - y, x),
    }
}
