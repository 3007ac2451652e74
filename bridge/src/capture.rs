//! Camera-side capture state
//!
//! `CaptureRig` owns the open session together with everything that reacts to
//! its frames: acquisition, exposure sync, snap persistence and the macro
//! device port. The controller task is its only owner, so none of this is
//! shared across threads.

use crate::acquisition::{Acquisition, Capture};
use crate::config::AppSettings;
use crate::controls::{ControlId, ControlSurface};
use crate::error::{ControllerError, ControllerResult};
use crate::event::{AppEvent, CameraStatus, EventSeverity, ProgressKind, SharedEventBus};
use crate::exposure_sync::ExposureSync;
use photsat_imaging::histogram::{histogram, DEFAULT_BINS};
use photsat_imaging::persist::{persist, persist_all};
use photsat_imaging::preview::to_preview;
use photsat_imaging::{CaptureMetadata, CaptureSettings, SampleArray};
use photsat_native::{
    CameraDriver, CameraOption, DeviceEvent, DeviceMessage, DeviceSession, FatalLatch, NativeError,
    Resolution,
};
use photsat_sequencer::{Extraction, MacroPort, ResolvedStep, TriggerPath};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Bit depth assumed when the device cannot report one
const FALLBACK_BIT_DEPTH: u32 = 16;

const START_FAILED: &str = "Failed to start camera.";

pub(crate) struct CaptureRig {
    driver: Arc<dyn CameraDriver>,
    session: Option<DeviceSession>,
    device_tx: mpsc::Sender<DeviceMessage>,
    fatal: Arc<FatalLatch>,
    acquisition: Acquisition,
    sync: ExposureSync,
    controls: Box<dyn ControlSurface>,
    pub(crate) settings: AppSettings,
    events: SharedEventBus,
    resolution_index: u32,
    /// Files written by snap and burst so far
    capture_count: u64,
    /// Live mode snaps waiting for a frame, one frame each
    pending_live: u32,
    /// Still mode snaps waiting for their still image
    pending_stills: u32,
    /// Session a macro run is bound to
    macro_session: Option<u64>,
    macro_trigger: Option<TriggerPath>,
    macro_still: Option<Capture>,
}

impl CaptureRig {
    pub(crate) fn new(
        driver: Arc<dyn CameraDriver>,
        settings: AppSettings,
        controls: Box<dyn ControlSurface>,
        events: SharedEventBus,
        device_tx: mpsc::Sender<DeviceMessage>,
        fatal: Arc<FatalLatch>,
    ) -> Self {
        Self {
            driver,
            session: None,
            device_tx,
            fatal,
            acquisition: Acquisition::new(),
            sync: ExposureSync::new(),
            controls,
            settings,
            events,
            resolution_index: 0,
            capture_count: 0,
            pending_live: 0,
            pending_stills: 0,
            macro_session: None,
            macro_trigger: None,
            macro_still: None,
        }
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    pub(crate) fn publish(&self, event: AppEvent) {
        self.events.publish(event);
    }

    /// Publish a user-facing message
    pub(crate) fn notify(&self, severity: EventSeverity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            EventSeverity::Info => tracing::info!("{}", message),
            EventSeverity::Warning => tracing::warn!("{}", message),
            EventSeverity::Error => tracing::error!("{}", message),
        }
        self.publish(AppEvent::notice(severity, message));
    }

    fn publish_preview(&self, samples: &SampleArray) {
        self.publish(AppEvent::Preview {
            width: samples.width(),
            height: samples.height(),
            pixels: to_preview(samples),
        });
        if self.settings.publish_histogram {
            self.publish(AppEvent::Histogram {
                bins: histogram(samples, DEFAULT_BINS),
                max_value: samples.max_value(),
            });
        }
    }

    // =========================================================================
    // SESSION
    // =========================================================================

    pub(crate) fn session_id(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.id())
    }

    pub(crate) fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn session_mut(&mut self) -> ControllerResult<&mut DeviceSession> {
        self.session.as_mut().ok_or(ControllerError::NoCamera)
    }

    pub(crate) fn manual_exposure(&self) -> Option<u32> {
        self.sync.manual_exposure()
    }

    pub(crate) fn open_camera(&mut self, device_id: Option<&str>) -> ControllerResult<photsat_native::DeviceDescriptor> {
        if self.session.is_some() {
            return Err(NativeError::AlreadyOpen.into());
        }
        let mut session = match device_id {
            Some(id) => DeviceSession::open(&*self.driver, id)?,
            None => DeviceSession::open_first(&*self.driver)?,
        };
        let descriptor = session.descriptor().clone();

        let handle = session.handle_mut()?;
        self.resolution_index = handle.resolution_index().unwrap_or(0);
        if let Err(e) = handle.set_auto_exposure(false) {
            tracing::warn!("Failed to disable auto exposure: {}", e);
        }

        self.session = Some(session);
        self.controls.set_enabled(true);
        if let Err(e) = self.start_camera() {
            self.abandon_start(&e);
            return Err(e);
        }

        self.publish(AppEvent::CameraOpened {
            device_id: descriptor.id.clone(),
            display_name: descriptor.display_name.clone(),
            width: self.acquisition.width(),
            height: self.acquisition.height(),
            bit_depth: self.acquisition.bit_depth(),
        });
        Ok(descriptor)
    }

    /// Configure raw output, allocate the frame buffer, load the exposure
    /// ranges into the controls and start pull mode.
    fn start_camera(&mut self) -> ControllerResult<()> {
        let resolution_index = self.resolution_index;
        let session = self.session.as_mut().ok_or(ControllerError::NoCamera)?;

        session.configure(CameraOption::Raw, 1)?;
        let bit_depth = match session.handle()?.max_bit_depth() {
            Ok(bits) => bits,
            Err(e) => {
                tracing::warn!("Failed to read max bit depth, assuming {}: {}", FALLBACK_BIT_DEPTH, e);
                FALLBACK_BIT_DEPTH
            }
        };
        session.configure(CameraOption::BitDepth, if bit_depth > 8 { 1 } else { 0 })?;
        session.configure(CameraOption::Trigger, 0)?;

        let resolution = session.descriptor().resolution(resolution_index).ok_or_else(|| {
            ControllerError::InvalidParameter(format!("no resolution at index {}", resolution_index))
        })?;
        self.acquisition.configure(resolution.width, resolution.height, bit_depth)?;

        let handle = session.handle()?;
        let exposure = handle.exposure_range()?;
        let gain = handle.gain_range()?;
        self.controls.set_range(ControlId::ExposureTime, exposure.min, exposure.max);
        self.controls.set_value_silently(ControlId::ExposureTime, exposure.default);
        self.controls.set_range(ControlId::Gain, gain.min as u32, gain.max as u32);
        self.controls.set_value_silently(ControlId::Gain, gain.default as u32);
        self.sync.remember_manual(exposure.default, gain.default);
        self.sync.on_exposure_event(handle, &mut *self.controls);

        session.start(self.device_tx.clone(), Arc::clone(&self.fatal))?;

        let auto = session.handle()?.auto_exposure().unwrap_or(false);
        self.sync.set_auto(auto);
        self.controls.set_auto_exposure_checked(auto);
        tracing::info!(
            "Camera started at {}x{}, {} bits",
            resolution.width,
            resolution.height,
            bit_depth
        );
        Ok(())
    }

    /// Close after a failed start or restart so no half-configured session
    /// stays open
    fn abandon_start(&mut self, error: &ControllerError) {
        tracing::error!("Failed to start camera: {}", error);
        self.close_camera(Some(START_FAILED));
        self.notify(EventSeverity::Warning, START_FAILED);
    }

    /// Release the device. Safe to call with no camera open.
    pub(crate) fn close_camera(&mut self, reason: Option<&str>) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let device_id = session.descriptor().id.clone();
        session.close();

        self.acquisition.reset();
        self.controls.set_enabled(false);
        self.pending_live = 0;
        self.pending_stills = 0;
        self.macro_session = None;
        self.macro_trigger = None;
        self.macro_still = None;

        self.publish(AppEvent::CameraClosed {
            device_id,
            reason: reason.map(str::to_string),
        });
    }

    /// Stop, switch the sensor resolution and restart.
    ///
    /// A failed restart closes the camera.
    pub(crate) fn set_resolution(&mut self, index: u32) -> ControllerResult<Resolution> {
        let session = self.session_mut()?;
        let resolution = session
            .descriptor()
            .resolution(index)
            .ok_or_else(|| ControllerError::InvalidParameter(format!("no resolution at index {}", index)))?;
        session.stop()?;

        let result = session.handle_mut().and_then(|h| h.set_resolution_index(index));
        match &result {
            Ok(()) => self.resolution_index = index,
            Err(e) => tracing::warn!("Failed to set resolution {}: {}", index, e),
        }
        if let Err(e) = self.start_camera() {
            self.abandon_start(&e);
            return Err(e);
        }
        result?;
        Ok(resolution)
    }

    pub(crate) fn set_auto_exposure(&mut self, enabled: bool) -> ControllerResult<()> {
        self.session_mut()?.handle_mut()?.set_auto_exposure(enabled)?;
        self.sync.set_auto(enabled);
        self.controls.set_auto_exposure_checked(enabled);
        Ok(())
    }

    pub(crate) fn edit_exposure(&mut self, micros: u32) -> ControllerResult<()> {
        let session = self.session.as_mut().ok_or(ControllerError::NoCamera)?;
        match self.sync.apply_user_exposure(session.handle_mut()?, &mut *self.controls, micros) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.notify(EventSeverity::Warning, format!("Failed to set exposure time: {}", e));
                Err(e.into())
            }
        }
    }

    pub(crate) fn edit_gain(&mut self, percent: u16) -> ControllerResult<()> {
        let session = self.session.as_mut().ok_or(ControllerError::NoCamera)?;
        match self.sync.apply_user_gain(session.handle_mut()?, &mut *self.controls, percent) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.notify(EventSeverity::Warning, format!("Failed to set gain: {}", e));
                Err(e.into())
            }
        }
    }

    /// Current telemetry for the status line
    pub(crate) fn status(&self) -> ControllerResult<CameraStatus> {
        let session = self.session.as_ref().ok_or(ControllerError::NoCamera)?;
        let handle = session.handle()?;
        let rate = handle.frame_rate()?;
        let exposure_secs = handle.exposure_time()? as f64 / 1_000_000.0;
        let fps = if exposure_secs > 0.0 { 1.0 / exposure_secs } else { 0.0 };
        Ok(CameraStatus {
            frames: rate.total_frames,
            exposure_secs,
            fps,
            temperature_c: handle.temperature().ok().map(|t| t as f64 / 10.0),
            clock_ms: rate.window_ms,
        })
    }

    pub(crate) fn inspect_pixel(&self, x: u32, y: u32) -> Option<u16> {
        self.acquisition.pixel(x, y)
    }

    // =========================================================================
    // DEVICE EVENTS
    // =========================================================================

    /// Handle a non-fatal device event. Returns the number of pending snaps
    /// it saved.
    pub(crate) fn on_device_event(&mut self, event: DeviceEvent) -> u32 {
        match event {
            DeviceEvent::Image => return self.on_image(),
            DeviceEvent::StillImage => return self.on_still_image(),
            DeviceEvent::Exposure => {
                if let Some(handle) = self.session.as_ref().and_then(|s| s.handle().ok()) {
                    self.sync.on_exposure_event(handle, &mut *self.controls);
                }
            }
            DeviceEvent::TriggerFailed => tracing::warn!("Device reported a failed trigger"),
            DeviceEvent::NoFrameTimeout => tracing::debug!("Device frame timeout"),
            DeviceEvent::Error | DeviceEvent::Disconnected => {
                tracing::debug!("Fatal event {:?} reached the capture rig", event)
            }
            DeviceEvent::Other(code) => tracing::trace!("Unhandled device event 0x{:04x}", code),
        }
        0
    }

    fn on_image(&mut self) -> u32 {
        let Some(session) = self.session.as_mut() else {
            return 0;
        };
        match self.acquisition.pull_live(session) {
            Ok(Some(samples)) => {
                self.publish_preview(&samples);
                if self.pending_live == 0 {
                    return 0;
                }
                self.pending_live -= 1;
                if let Some(capture) = self.acquisition.last_capture() {
                    self.save_capture(&capture);
                }
                1
            }
            Ok(None) => {
                tracing::trace!("Image event with no frame ready");
                0
            }
            Err(e) => {
                tracing::debug!("Live pull failed: {}", e);
                0
            }
        }
    }

    fn on_still_image(&mut self) -> u32 {
        let Some(session) = self.session.as_mut() else {
            return 0;
        };
        match self.acquisition.pull_still(session) {
            Ok(Some(capture)) => {
                self.publish_preview(&capture.samples);
                if self.macro_trigger == Some(TriggerPath::Snap) {
                    self.macro_still = Some(capture);
                    0
                } else if self.pending_stills > 0 {
                    self.pending_stills -= 1;
                    self.save_capture(&capture);
                    1
                } else {
                    tracing::debug!("Still image with no pending snap");
                    0
                }
            }
            Ok(None) => {
                tracing::debug!("Still image event with no frame ready");
                0
            }
            Err(e) => {
                tracing::warn!("Still pull failed: {}", e);
                0
            }
        }
    }

    // =========================================================================
    // SNAP
    // =========================================================================

    /// Capture one image with the snap prefix and formats.
    ///
    /// Still-capable cameras take a still; otherwise the latest live frame is
    /// saved, or the next one if none has arrived yet. Returns true when the
    /// image was saved right away and false when it is pending.
    pub(crate) fn snap(&mut self) -> ControllerResult<bool> {
        let resolution_index = self.resolution_index;
        let session = self.session_mut()?;
        if session.descriptor().capabilities.has_still_mode() {
            session.handle_mut()?.snap(resolution_index)?;
            self.pending_stills += 1;
            return Ok(false);
        }

        match self.acquisition.last_capture() {
            Some(capture) => {
                self.save_capture(&capture);
                Ok(true)
            }
            None => {
                tracing::info!("No frame yet, saving the next live frame");
                self.pending_live += 1;
                Ok(false)
            }
        }
    }

    fn capture_settings(&self) -> CaptureSettings {
        let handle = self.session.as_ref().and_then(|s| s.handle().ok());
        let exposure_us = self
            .sync
            .manual_exposure()
            .or_else(|| handle.and_then(|h| h.exposure_time().ok()))
            .unwrap_or(0);
        let gain_percent = self
            .sync
            .manual_gain()
            .or_else(|| handle.and_then(|h| h.gain().ok()))
            .unwrap_or(0);
        CaptureSettings {
            exposure_us,
            gain_percent,
            temperature_tenths: handle.and_then(|h| h.temperature().ok()),
            camera_name: self.session.as_ref().map(|s| s.descriptor().display_name.clone()),
        }
    }

    fn save_capture(&mut self, capture: &Capture) {
        self.capture_count += 1;
        let directory = self.settings.output_directory.clone();
        if let Err(e) = std::fs::create_dir_all(&directory) {
            tracing::warn!("Failed to create {}: {}", directory.display(), e);
        }

        let metadata = CaptureMetadata::new(&capture.samples, &self.capture_settings());
        let report = persist_all(
            &capture.samples,
            &capture.padded,
            &metadata,
            &directory,
            &self.settings.file_prefix,
            self.capture_count,
            self.settings.save_formats,
        );
        for path in report.written {
            self.publish(AppEvent::FileSaved { path });
        }
        for (path, e) in report.failures {
            self.notify(EventSeverity::Warning, format!("Failed to save {}: {}", path.display(), e));
        }
    }

    // =========================================================================
    // MACRO
    // =========================================================================

    /// Bind a macro run to the current session
    pub(crate) fn bind_macro(&mut self) {
        self.macro_session = self.session_id();
    }

    pub(crate) fn unbind_macro(&mut self) {
        self.macro_session = None;
        self.macro_trigger = None;
        self.macro_still = None;
    }

    /// Trigger for cameras without a software trigger
    fn snap_trigger(&mut self, still_mode: bool) -> TriggerPath {
        if !still_mode {
            return TriggerPath::LiveFrame;
        }
        let resolution_index = self.resolution_index;
        let Some(session) = self.session.as_mut() else {
            return TriggerPath::LiveFrame;
        };
        match session.handle_mut().and_then(|h| h.snap(resolution_index)) {
            Ok(()) => TriggerPath::Snap,
            Err(e) => {
                tracing::warn!("Error in Snap, using the live stream: {}", e);
                TriggerPath::LiveFrame
            }
        }
    }
}

impl MacroPort for CaptureRig {
    type Error = ControllerError;

    fn session_available(&self) -> bool {
        match (self.session_id(), self.macro_session) {
            (Some(current), Some(bound)) => current == bound,
            _ => false,
        }
    }

    fn apply_step_settings(&mut self, step: &ResolvedStep) -> Result<(), ControllerError> {
        let handle = self.session_mut()?.handle_mut()?;
        handle.set_exposure_time(step.exposure_us)?;
        handle.set_gain(step.gain_percent)?;

        self.sync.remember_manual(step.exposure_us, step.gain_percent);
        self.controls.set_value_silently(ControlId::ExposureTime, step.exposure_us);
        self.controls.set_value_silently(ControlId::Gain, step.gain_percent as u32);
        Ok(())
    }

    fn trigger_capture(&mut self) -> TriggerPath {
        self.macro_still = None;
        self.acquisition.mark_trigger();

        let Some(session) = self.session.as_mut() else {
            return TriggerPath::LiveFrame;
        };
        let capabilities = session.descriptor().capabilities.clone();
        let path = if capabilities.software_trigger {
            match session.handle_mut().and_then(|h| h.software_trigger()) {
                Ok(()) => TriggerPath::SoftwareTrigger,
                Err(e) => {
                    tracing::warn!("Error in TriggerSoftware, using the live stream: {}", e);
                    TriggerPath::LiveFrame
                }
            }
        } else {
            self.snap_trigger(capabilities.has_still_mode())
        };

        tracing::debug!("Macro capture requested via {:?}", path);
        self.macro_trigger = Some(path);
        path
    }

    fn extract_capture(&mut self, path: TriggerPath) -> Result<Extraction, ControllerError> {
        if path == TriggerPath::Snap {
            if let Some(capture) = self.macro_still.take() {
                return Ok(Extraction::Ready(capture.samples));
            }
            let session = self.session.as_mut().ok_or(ControllerError::NoCamera)?;
            return Ok(match self.acquisition.pull_still(session)? {
                Some(capture) => Extraction::Ready(capture.samples),
                None => Extraction::Pending,
            });
        }

        let session = self.session.as_mut().ok_or(ControllerError::NoCamera)?;
        let pulled = self.acquisition.pull_live(session);
        match pulled {
            Ok(Some(samples)) => Ok(Extraction::Ready(samples)),
            Ok(None) => Ok(match self.acquisition.frame_since_mark() {
                Some(samples) => Extraction::Ready(samples.clone()),
                None => Extraction::Pending,
            }),
            Err(e) => match self.acquisition.frame_since_mark() {
                Some(samples) => {
                    tracing::debug!("Pull failed, using the frame already received: {}", e);
                    Ok(Extraction::Ready(samples.clone()))
                }
                None => Err(e),
            },
        }
    }

    fn persist_capture(
        &mut self,
        samples: &SampleArray,
        step: &ResolvedStep,
        destination: &Path,
    ) -> Result<(), ControllerError> {
        std::fs::create_dir_all(&step.directory)?;
        let metadata = CaptureMetadata::new(samples, &self.capture_settings());
        persist(samples, &metadata, destination)?;

        self.macro_trigger = None;
        self.publish_preview(samples);
        self.publish(AppEvent::FileSaved {
            path: destination.to_path_buf(),
        });
        Ok(())
    }

    fn report_progress(&mut self, completed: u32, total: u32) {
        self.publish(AppEvent::Progress {
            kind: ProgressKind::Macro,
            completed,
            total,
        });
    }
}
