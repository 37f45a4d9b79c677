use crate::{error::Result, utils::image::{frame_to_image, FrameFormat}};
use chrono::{DateTime, Utc};
use std::{
    fs::create_dir_all,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Receives frames copied out of board memory during a bulk export.
pub trait FrameExporter {
    /// Write one frame into `dest`.
    ///
    /// * `dest`: export directory, created by the caller.
    /// * `geometry`: geometry the frame was captured with.
    /// * `index`: 1-based frame number within the acquisition.
    /// * `data`: raw 8 bit frame.
    fn write_frame(&mut self, dest: &Path, geometry: &FrameFormat, index: i64, data: &[u8]) -> Result<()>;
}

impl<E: FrameExporter + ?Sized> FrameExporter for Box<E> {
    fn write_frame(&mut self, dest: &Path, geometry: &FrameFormat, index: i64, data: &[u8]) -> Result<()> {
        (**self).write_frame(dest, geometry, index, data)
    }
}

/// Writes each frame as `frame_000001.png` and so on.
#[derive(Default)]
pub struct PngSequenceExporter;

impl PngSequenceExporter {
    pub fn filename(index: i64) -> String {
        format!("frame_{index:06}.png")
    }
}

impl FrameExporter for PngSequenceExporter {
    fn write_frame(&mut self, dest: &Path, geometry: &FrameFormat, index: i64, data: &[u8]) -> Result<()> {
        let path = dest.join(Self::filename(index));
        frame_to_image(geometry, data)?.save(&path)?;
        Ok(())
    }
}

/// Summary of a finished export.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportSummary {
    pub dest: PathBuf,
    pub first: i64,
    pub last: i64,
}

impl ExportSummary {
    pub fn frames(&self) -> u64 {
        u64::try_from(self.last - self.first + 1).unwrap_or(0)
    }
}

/// Directory for one autosaved acquisition, named by the time it
/// finished.
pub fn timestamped_dir(base: &Path, finished: DateTime<Utc>) -> PathBuf {
    base.join(finished.format("%Y%m%d_%H%M%S%.3f").to_string())
}

/// Write a single frame as a still image, creating parent directories.
pub fn save_still(path: &Path, geometry: &FrameFormat, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_dir_all(parent)?;
        }
    }
    frame_to_image(geometry, data)?.save(path)?;
    debug!(?path, "saved still image");
    Ok(())
}
