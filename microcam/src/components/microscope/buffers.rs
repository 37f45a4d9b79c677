use crate::{
    devices::hardware::framegrabber::{BufferHandle, DisplayHandle, FrameGrabber, FrameTarget},
    error::{CameraError, Result},
    utils::image::FrameFormat,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Resources of one acquisition session. Created by
/// [`AcquisitionBufferManager::open_session`] and torn down by
/// [`AcquisitionBufferManager::release_session`]; a reconfiguration always
/// builds a fresh one.
#[derive(Debug)]
pub struct AcquisitionSession {
    /// Unique identifier, used to correlate log lines.
    uuid: Uuid,
    pub buffer: Option<BufferHandle>,
    pub display: Option<DisplayHandle>,
    /// Geometry the buffer and display were sized with.
    pub geometry: FrameFormat,
    /// Number of frames the buffer holds.
    pub buffer_depth: u32,
    pub target: FrameTarget,
    /// Index of the last frame seen by the poll loop.
    pub frame_counter: i64,
}

impl AcquisitionSession {
    pub fn get_uuid(&self) -> Uuid {
        self.uuid
    }

    /// Both handles are live.
    pub fn is_live(&self) -> bool {
        self.buffer.is_some() && self.display.is_some()
    }
}

/// Unit struct grouping the buffer lifecycle; the handles themselves are
/// owned by the session passed in.
pub struct AcquisitionBufferManager;

impl AcquisitionBufferManager {
    /// Bytes needed for `depth` 8 bit frames of `geometry`.
    pub fn compute_buffer_size(geometry: &FrameFormat, depth: u32) -> u64 {
        geometry.pixel_count() * u64::from(depth)
    }

    /// Request board memory for `depth` frames.
    pub fn allocate<G: FrameGrabber + ?Sized>(
        grabber: &mut G,
        size: u64,
        depth: u32,
    ) -> Result<BufferHandle> {
        let buffer = grabber.allocate_buffer(size, depth)?;
        debug!(?buffer, size, depth, "allocated frame buffer");
        Ok(buffer)
    }

    pub fn create_display<G: FrameGrabber + ?Sized>(
        grabber: &mut G,
        bit_depth: u8,
        width: u32,
        height: u32,
    ) -> Result<DisplayHandle> {
        let handle = grabber.create_display(bit_depth, width, height)?;
        debug!(display = ?handle, width, height, "created display");
        Ok(handle)
    }

    /// Release the buffer if one is held. Calling again is a no-op.
    pub fn free<G: FrameGrabber + ?Sized>(
        grabber: &mut G,
        buffer: &mut Option<BufferHandle>,
    ) -> Result<()> {
        match buffer.take() {
            Some(handle) => {
                debug!(buffer = ?handle, "freeing frame buffer");
                grabber.free_buffer(handle)
            }
            None => Ok(()),
        }
    }

    /// Close the display if one is open. Calling again is a no-op.
    pub fn close_display<G: FrameGrabber + ?Sized>(
        grabber: &mut G,
        display: &mut Option<DisplayHandle>,
    ) -> Result<()> {
        match display.take() {
            Some(handle) => {
                debug!(display = ?handle, "closing display");
                grabber.close_display(handle)
            }
            None => Ok(()),
        }
    }

    /// Allocate a buffer and display for `geometry`. If the display cannot
    /// be created the buffer is released again before the error is
    /// returned, so a failed open leaves nothing behind.
    pub fn open_session<G: FrameGrabber + ?Sized>(
        grabber: &mut G,
        geometry: FrameFormat,
        buffer_depth: u32,
        bit_depth: u8,
    ) -> Result<AcquisitionSession> {
        let (width, height) = match (u32::try_from(geometry.w), u32::try_from(geometry.h)) {
            (Ok(w), Ok(h)) if w > 0 && h > 0 => (w, h),
            _ => {
                return Err(CameraError::Resource(format!(
                    "cannot size buffers for geometry {geometry}"
                )))
            }
        };
        let size = Self::compute_buffer_size(&geometry, buffer_depth);
        let mut buffer = Some(Self::allocate(grabber, size, buffer_depth)?);
        let display = match Self::create_display(grabber, bit_depth, width, height) {
            Ok(display) => display,
            Err(e) => {
                if let Err(free_err) = Self::free(grabber, &mut buffer) {
                    warn!("failed to free buffer after display error: {free_err}");
                }
                return Err(e);
            }
        };
        let session = AcquisitionSession {
            uuid: Uuid::new_v4(),
            buffer,
            display: Some(display),
            geometry,
            buffer_depth,
            target: FrameTarget::Continuous,
            frame_counter: 0,
        };
        info!(session = %session.uuid, %geometry, buffer_depth, size, "opened acquisition session");
        Ok(session)
    }

    /// Free the buffer, then close the display. Both steps are attempted
    /// even if the first fails; the first error is returned.
    pub fn release_session<G: FrameGrabber + ?Sized>(
        grabber: &mut G,
        session: &mut AcquisitionSession,
    ) -> Result<()> {
        let freed = Self::free(grabber, &mut session.buffer);
        let closed = Self::close_display(grabber, &mut session.display);
        info!(session = %session.uuid, "released acquisition session");
        freed.and(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::simulated::{BoardCall, SimulatedGrabber};
    use rstest::rstest;

    #[rstest]
    #[case(FrameFormat::FULL_SENSOR, 1000, 1_310_720_000)]
    #[case(FrameFormat::new(0, 0, 640, 480), 500, 153_600_000)]
    #[case(FrameFormat::new(16, 16, 16, 1), 1, 16)]
    fn test_compute_buffer_size(#[case] geometry: FrameFormat, #[case] depth: u32, #[case] bytes: u64) {
        assert_eq!(
            AcquisitionBufferManager::compute_buffer_size(&geometry, depth),
            bytes
        );
    }

    #[rstest]
    #[case(FrameFormat::FULL_SENSOR)]
    #[case(FrameFormat::new(0, 0, 640, 480))]
    #[case(FrameFormat::new(8, 8, 256, 128))]
    fn test_compute_buffer_size_is_linear_in_depth(#[case] geometry: FrameFormat) {
        let one = AcquisitionBufferManager::compute_buffer_size(&geometry, 1);
        assert_eq!(one, (geometry.w * geometry.h) as u64);
        for depth in [2u32, 10, 1000] {
            assert_eq!(
                AcquisitionBufferManager::compute_buffer_size(&geometry, depth),
                one * u64::from(depth)
            );
        }
    }

    #[test]
    fn test_free_and_close_are_idempotent() {
        let mut grabber = SimulatedGrabber::new();
        let mut session = AcquisitionBufferManager::open_session(
            &mut grabber,
            FrameFormat::new(0, 0, 64, 32),
            10,
            8,
        )
        .unwrap();
        assert!(session.is_live());
        AcquisitionBufferManager::release_session(&mut grabber, &mut session).unwrap();
        assert!(!session.is_live());
        AcquisitionBufferManager::release_session(&mut grabber, &mut session).unwrap();
        AcquisitionBufferManager::free(&mut grabber, &mut session.buffer).unwrap();

        let frees = grabber
            .calls()
            .iter()
            .filter(|c| matches!(c, BoardCall::FreeBuffer(_)))
            .count();
        assert_eq!(frees, 1);
        assert_eq!(grabber.live_buffers(), 0);
        assert_eq!(grabber.live_displays(), 0);
    }

    #[test]
    fn test_create_display_returns_handle() {
        let mut grabber = SimulatedGrabber::new();
        let display = AcquisitionBufferManager::create_display(&mut grabber, 8, 640, 480).unwrap();
        assert_eq!(display, DisplayHandle(1));
        assert_eq!(grabber.live_displays(), 1);
        let mut held = Some(display);
        AcquisitionBufferManager::close_display(&mut grabber, &mut held).unwrap();
        assert_eq!(held, None);
        assert_eq!(grabber.live_displays(), 0);
    }

    #[test]
    fn test_release_frees_before_closing_display() {
        let mut grabber = SimulatedGrabber::new();
        let mut session = AcquisitionBufferManager::open_session(
            &mut grabber,
            FrameFormat::new(0, 0, 64, 32),
            10,
            8,
        )
        .unwrap();
        grabber.clear_calls();
        AcquisitionBufferManager::release_session(&mut grabber, &mut session).unwrap();
        assert!(matches!(grabber.calls()[0], BoardCall::FreeBuffer(_)));
        assert!(matches!(grabber.calls()[1], BoardCall::CloseDisplay(_)));
    }

    #[test]
    fn test_display_failure_releases_buffer() {
        let mut grabber = SimulatedGrabber::new();
        grabber.fail_display(true);
        let result = AcquisitionBufferManager::open_session(
            &mut grabber,
            FrameFormat::FULL_SENSOR,
            1000,
            8,
        );
        assert!(matches!(result, Err(CameraError::Resource(_))));
        assert_eq!(grabber.live_buffers(), 0);
        assert_eq!(
            grabber.calls(),
            &[
                BoardCall::AllocateBuffer {
                    size_bytes: 1_310_720_000,
                    frames: 1000
                },
                BoardCall::CreateDisplay {
                    bit_depth: 8,
                    width: 1280,
                    height: 1024
                },
                BoardCall::FreeBuffer(BufferHandle(1)),
            ]
        );
    }
}
