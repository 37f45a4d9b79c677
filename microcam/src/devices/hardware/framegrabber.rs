use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, time::Duration};
use strum_macros::{AsRefStr, EnumString, IntoStaticStr};

/// Index the board reports when a blocking wait for the next frame expired.
/// Any other negative index is a board failure.
pub const FRAME_WAIT_TIMEOUT: i64 = -2120;

/// Parameters held by the acquisition board itself, mirrored from the
/// sensor-side values so both halves agree on frame size and timing. The
/// string form is the identifier the board SDK expects.
#[derive(
    EnumString,
    AsRefStr,
    IntoStaticStr,
    Deserialize,
    Serialize,
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
)]
pub enum BoardField {
    #[strum(serialize = "FG_XOFFSET")]
    #[serde(rename = "FG_XOFFSET")]
    XOffset,
    #[strum(serialize = "FG_YOFFSET")]
    #[serde(rename = "FG_YOFFSET")]
    YOffset,
    #[strum(serialize = "FG_WIDTH")]
    #[serde(rename = "FG_WIDTH")]
    Width,
    #[strum(serialize = "FG_HEIGHT")]
    #[serde(rename = "FG_HEIGHT")]
    Height,
    #[strum(serialize = "FG_FRAMESPERSEC")]
    #[serde(rename = "FG_FRAMESPERSEC")]
    FramesPerSec,
    #[strum(serialize = "FG_EXPOSURE")]
    #[serde(rename = "FG_EXPOSURE")]
    Exposure,
}

impl BoardField {
    /// Board fields for the four geometry components, in canonical
    /// `x, y, w, h` order.
    pub const GEOMETRY: [BoardField; 4] = [
        BoardField::XOffset,
        BoardField::YOffset,
        BoardField::Width,
        BoardField::Height,
    ];
}

/// Opaque handle to board memory holding `depth` frames.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Opaque handle to a live-view display surface.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DisplayHandle(pub u64);

/// How many frames an acquisition should run for.
#[derive(Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameTarget {
    /// Run until stopped.
    Continuous,
    /// Stop once this many frames have been captured.
    Finite(u64),
}

impl FrameTarget {
    /// `0` requests continuous acquisition.
    pub fn from_count(count: u64) -> Self {
        if count == 0 {
            FrameTarget::Continuous
        } else {
            FrameTarget::Finite(count)
        }
    }
}

impl Display for FrameTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameTarget::Continuous => write!(f, "continuous"),
            FrameTarget::Finite(n) => write!(f, "finite({n})"),
        }
    }
}

/// The narrow capability the camera core needs from the vendor board SDK.
/// Everything the controller does to hardware memory goes through here, so
/// a deterministic implementation can stand in for the board in tests.
///
/// Frame indices are 1-based: `0` means nothing captured yet and a
/// negative value is a board failure.
pub trait FrameGrabber {
    /// Request board memory for `frames` frames totalling `size_bytes`.
    fn allocate_buffer(&mut self, size_bytes: u64, frames: u32) -> Result<BufferHandle>;

    fn free_buffer(&mut self, buffer: BufferHandle) -> Result<()>;

    fn create_display(&mut self, bit_depth: u8, width: u32, height: u32) -> Result<DisplayHandle>;

    fn close_display(&mut self, display: DisplayHandle) -> Result<()>;

    /// Write a board-side parameter.
    fn set_parameter(&mut self, field: BoardField, value: i64) -> Result<()>;

    fn acquire_start(&mut self, buffer: BufferHandle, target: FrameTarget) -> Result<()>;

    fn acquire_stop(&mut self) -> Result<()>;

    /// Index of the most recently completed frame.
    fn last_frame_index(&mut self, buffer: BufferHandle) -> i64;

    /// Block until frame `frame` has completed or `timeout` expires.
    /// Returns the latest completed index, [`FRAME_WAIT_TIMEOUT`] on expiry
    /// or another negative value on failure.
    fn wait_frame_index(&mut self, buffer: BufferHandle, frame: i64, timeout: Duration) -> i64;

    /// Raw bytes of a frame still held in the buffer.
    fn frame(&mut self, buffer: BufferHandle, index: i64) -> Result<&[u8]>;

    /// Render a buffered frame on a display surface.
    fn draw_frame(&mut self, display: DisplayHandle, buffer: BufferHandle, index: i64) -> Result<()>;
}

impl<G: FrameGrabber + ?Sized> FrameGrabber for Box<G> {
    fn allocate_buffer(&mut self, size_bytes: u64, frames: u32) -> Result<BufferHandle> {
        (**self).allocate_buffer(size_bytes, frames)
    }

    fn free_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        (**self).free_buffer(buffer)
    }

    fn create_display(&mut self, bit_depth: u8, width: u32, height: u32) -> Result<DisplayHandle> {
        (**self).create_display(bit_depth, width, height)
    }

    fn close_display(&mut self, display: DisplayHandle) -> Result<()> {
        (**self).close_display(display)
    }

    fn set_parameter(&mut self, field: BoardField, value: i64) -> Result<()> {
        (**self).set_parameter(field, value)
    }

    fn acquire_start(&mut self, buffer: BufferHandle, target: FrameTarget) -> Result<()> {
        (**self).acquire_start(buffer, target)
    }

    fn acquire_stop(&mut self) -> Result<()> {
        (**self).acquire_stop()
    }

    fn last_frame_index(&mut self, buffer: BufferHandle) -> i64 {
        (**self).last_frame_index(buffer)
    }

    fn wait_frame_index(&mut self, buffer: BufferHandle, frame: i64, timeout: Duration) -> i64 {
        (**self).wait_frame_index(buffer, frame, timeout)
    }

    fn frame(&mut self, buffer: BufferHandle, index: i64) -> Result<&[u8]> {
        (**self).frame(buffer, index)
    }

    fn draw_frame(&mut self, display: DisplayHandle, buffer: BufferHandle, index: i64) -> Result<()> {
        (**self).draw_frame(display, buffer, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;

    #[rstest]
    #[case("FG_WIDTH", BoardField::Width)]
    #[case("FG_HEIGHT", BoardField::Height)]
    #[case("FG_XOFFSET", BoardField::XOffset)]
    #[case("FG_YOFFSET", BoardField::YOffset)]
    #[case("FG_FRAMESPERSEC", BoardField::FramesPerSec)]
    #[case("FG_EXPOSURE", BoardField::Exposure)]
    fn test_board_field_identifiers(#[case] raw: &str, #[case] field: BoardField) {
        assert_eq!(BoardField::from_str(raw).unwrap(), field);
        assert_eq!(field.as_ref(), raw);
        let yaml = serde_yaml::to_string(&field).unwrap();
        assert_eq!(yaml.trim(), raw);
    }

    #[test]
    fn test_frame_target_from_count() {
        assert_eq!(FrameTarget::from_count(0), FrameTarget::Continuous);
        assert_eq!(FrameTarget::from_count(50), FrameTarget::Finite(50));
    }
}
