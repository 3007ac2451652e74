//! Frame acquisition
//!
//! Owns the reusable live buffer and the most recent padding-free frame.
//! Every successful pull replaces the latest raw frame, so snaps and macro
//! captures can fall back to it when a pull reports pending.

use crate::error::{ControllerError, ControllerResult};
use photsat_imaging::{container_bits, FrameBuffer, SampleArray};
use photsat_native::{DeviceSession, PullOutcome};

/// A pulled frame, both as padded device bytes and as samples
#[derive(Debug, Clone)]
pub struct Capture {
    pub samples: SampleArray,
    /// Device buffer as pulled, including row padding
    pub padded: Vec<u8>,
}

/// Live frame state for one open camera
#[derive(Debug, Default)]
pub struct Acquisition {
    buffer: FrameBuffer,
    last_raw: Option<SampleArray>,
    frames_received: u64,
    trigger_mark: Option<u64>,
}

impl Acquisition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the live buffer for a new geometry and forget old frames
    pub fn configure(&mut self, width: u32, height: u32, bit_depth: u32) -> ControllerResult<()> {
        self.buffer.ensure_geometry(width, height, bit_depth)?;
        self.last_raw = None;
        self.trigger_mark = None;
        tracing::debug!("Acquisition configured for {}x{} at {} bits", width, height, bit_depth);
        Ok(())
    }

    /// Release the buffer when the camera closes
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.buffer.height()
    }

    pub fn bit_depth(&self) -> u32 {
        self.buffer.bit_depth()
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    /// Pull the newest live frame into the reusable buffer.
    ///
    /// Returns `Ok(None)` when the device has no frame ready.
    pub fn pull_live(&mut self, session: &mut DeviceSession) -> ControllerResult<Option<SampleArray>> {
        if self.buffer.is_empty() {
            return Err(ControllerError::NoFrame);
        }
        let bits = self.buffer.container_bits();
        let info = match session.pull_frame(Some(self.buffer.as_bytes_mut()), false, bits)? {
            PullOutcome::Frame(info) => info,
            PullOutcome::Pending => return Ok(None),
        };
        if info.width != self.buffer.width() || info.height != self.buffer.height() {
            return Err(ControllerError::InvalidParameter(format!(
                "frame is {}x{}, buffer is {}x{}",
                info.width,
                info.height,
                self.buffer.width(),
                self.buffer.height()
            )));
        }

        let samples = self.buffer.to_samples()?;
        self.record(samples.clone());
        Ok(Some(samples))
    }

    /// Pull a still frame: query its geometry first, then pull into a buffer
    /// sized for it.
    pub fn pull_still(&mut self, session: &mut DeviceSession) -> ControllerResult<Option<Capture>> {
        let bit_depth = self.buffer.bit_depth();
        let bits = container_bits(bit_depth);
        let info = match session.pull_frame(None, true, bits)? {
            PullOutcome::Frame(info) => info,
            PullOutcome::Pending => return Ok(None),
        };
        if info.width == 0 || info.height == 0 {
            return Ok(None);
        }

        let mut still = FrameBuffer::new(info.width, info.height, bit_depth)?;
        match session.pull_frame(Some(still.as_bytes_mut()), true, bits)? {
            PullOutcome::Frame(_) => {}
            PullOutcome::Pending => return Ok(None),
        }

        let samples = still.to_samples()?;
        self.record(samples.clone());
        Ok(Some(Capture {
            samples,
            padded: still.as_bytes().to_vec(),
        }))
    }

    fn record(&mut self, samples: SampleArray) {
        self.frames_received += 1;
        self.last_raw = Some(samples);
    }

    /// Latest live frame with the buffer bytes it came from
    pub fn last_capture(&self) -> Option<Capture> {
        let samples = self.last_raw.clone()?;
        Some(Capture {
            samples,
            padded: self.buffer.as_bytes().to_vec(),
        })
    }

    pub fn last_raw(&self) -> Option<&SampleArray> {
        self.last_raw.as_ref()
    }

    /// Remember that a capture was just requested
    pub fn mark_trigger(&mut self) {
        self.trigger_mark = Some(self.frames_received);
    }

    /// Latest frame received after the last `mark_trigger`
    pub fn frame_since_mark(&self) -> Option<&SampleArray> {
        let mark = self.trigger_mark?;
        if self.frames_received > mark {
            self.last_raw.as_ref()
        } else {
            None
        }
    }

    /// Value of the latest frame at (x, y)
    pub fn pixel(&self, x: u32, y: u32) -> Option<u16> {
        self.last_raw.as_ref()?.get(x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use photsat_native::vendor::simulated::sample_value;
    use photsat_native::{CameraOption, FatalLatch, SimulatedCameraModel, SimulatedDriver};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn running(model: SimulatedCameraModel) -> (SimulatedDriver, DeviceSession, mpsc::Receiver<photsat_native::DeviceMessage>) {
        let driver = SimulatedDriver::new(model);
        let mut session = DeviceSession::open_first(&driver).unwrap();
        session.configure(CameraOption::Raw, 1).unwrap();
        let (tx, rx) = mpsc::channel(16);
        session.start(tx, Arc::new(FatalLatch::new())).unwrap();
        (driver, session, rx)
    }

    #[test]
    fn test_live_pull_strips_padding() {
        let (driver, mut session, _rx) = running(SimulatedCameraModel::default());
        let mut acquisition = Acquisition::new();
        acquisition.configure(30, 4, 12).unwrap();

        assert!(acquisition.pull_live(&mut session).unwrap().is_none());
        driver.control().push_live_frame();
        let samples = acquisition.pull_live(&mut session).unwrap().unwrap();

        assert_eq!((samples.width(), samples.height(), samples.bit_depth()), (30, 4, 12));
        assert_eq!(samples.get(29, 3), Some(sample_value(29, 3, 1, 12)));
        assert_eq!(acquisition.pixel(29, 3), samples.get(29, 3));
        assert_eq!(acquisition.frames_received(), 1);
        assert_eq!(acquisition.last_capture().unwrap().padded.len(), 60 * 4);
    }

    #[test]
    fn test_frame_since_mark() {
        let (driver, mut session, _rx) = running(SimulatedCameraModel::default());
        let mut acquisition = Acquisition::new();
        acquisition.configure(30, 4, 12).unwrap();

        driver.control().push_live_frame();
        acquisition.pull_live(&mut session).unwrap();
        acquisition.mark_trigger();
        assert!(acquisition.frame_since_mark().is_none());
        assert!(acquisition.last_raw().is_some());

        driver.control().push_live_frame();
        acquisition.pull_live(&mut session).unwrap();
        assert!(acquisition.frame_since_mark().is_some());
    }

    #[test]
    fn test_still_pull_sizes_its_own_buffer() {
        let model = SimulatedCameraModel {
            still_resolutions: 2,
            ..Default::default()
        };
        let (_driver, mut session, _rx) = running(model);
        let mut acquisition = Acquisition::new();
        acquisition.configure(15, 2, 12).unwrap();

        assert!(acquisition.pull_still(&mut session).unwrap().is_none());
        session.handle_mut().unwrap().snap(0).unwrap();
        let capture = acquisition.pull_still(&mut session).unwrap().unwrap();

        assert_eq!((capture.samples.width(), capture.samples.height()), (30, 4));
        assert_eq!(capture.padded.len(), 60 * 4);
        assert_eq!(acquisition.last_raw().unwrap().width(), 30);
    }

    #[test]
    fn test_pull_without_buffer_is_an_error() {
        let (_driver, mut session, _rx) = running(SimulatedCameraModel::default());
        let mut acquisition = Acquisition::new();
        assert!(matches!(acquisition.pull_live(&mut session), Err(ControllerError::NoFrame)));
    }
}
