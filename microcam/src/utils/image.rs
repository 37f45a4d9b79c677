use crate::error::{CameraError, Result};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Region of interest read out from the sensor, the `frameformat`
/// parameter. Components are kept in the canonical `x, y, w, h` order
/// everywhere in the crate; only the device command line uses a different
/// order (see [`FrameFormat::device_order`]).
#[derive(Deserialize, Clone, Copy, Debug, Serialize, PartialEq, Eq, Hash)]
pub struct FrameFormat {
    /// X offset from upper left of the sensor.
    pub x: i64,
    /// Y offset from upper left of the sensor.
    pub y: i64,
    /// Width in x.
    pub w: i64,
    /// Height in y.
    pub h: i64,
}

impl FrameFormat {
    /// Full sensor readout of the CL600x2 head.
    pub const FULL_SENSOR: FrameFormat = FrameFormat {
        x: 0,
        y: 0,
        w: 1280,
        h: 1024,
    };

    pub fn new(x: i64, y: i64, w: i64, h: i64) -> Self {
        Self { x, y, w, h }
    }

    /// Components in canonical `[x, y, w, h]` order.
    pub fn components(&self) -> [i64; 4] {
        [self.x, self.y, self.w, self.h]
    }

    pub fn from_components(c: [i64; 4]) -> Self {
        Self::new(c[0], c[1], c[2], c[3])
    }

    /// Components in the order the sensor expects on the `#R` command:
    /// x-offset, y-offset, height, width.
    pub fn device_order(&self) -> [i64; 4] {
        [self.x, self.y, self.h, self.w]
    }

    pub fn from_device_order(c: [i64; 4]) -> Self {
        Self::new(c[0], c[1], c[3], c[2])
    }

    /// Number of pixels in one frame; a negative extent counts as empty.
    pub fn pixel_count(&self) -> u64 {
        let w = u64::try_from(self.w).unwrap_or(0);
        let h = u64::try_from(self.h).unwrap_or(0);
        w * h
    }
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self::FULL_SENSOR
    }
}

impl Display for FrameFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}+{}+{}", self.w, self.h, self.x, self.y)
    }
}

/// Copy an 8 bit frame out of board memory into an owned grey image.
///
/// * `geometry`: frame geometry the buffer was sized with.
/// * `data`: raw frame bytes, row major.
pub fn frame_to_image(geometry: &FrameFormat, data: &[u8]) -> Result<GrayImage> {
    let width = u32::try_from(geometry.w)
        .map_err(|_| CameraError::Validation(format!("invalid frame width {}", geometry.w)))?;
    let height = u32::try_from(geometry.h)
        .map_err(|_| CameraError::Validation(format!("invalid frame height {}", geometry.h)))?;
    let expected = geometry.pixel_count() as usize;
    if data.len() < expected {
        return Err(CameraError::Board(format!(
            "frame holds {} bytes, {geometry} needs {expected}",
            data.len()
        )));
    }
    GrayImage::from_raw(width, height, data[..expected].to_vec()).ok_or_else(|| {
        CameraError::Board(format!("could not build {geometry} image from frame data"))
    })
}
