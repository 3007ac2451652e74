//! Exposure and gain synchronization
//!
//! Device-side exposure changes flow into the controls only from
//! `on_exposure_event`, and user edits flow to the device only from
//! `apply_user_*`. Writes into the controls are silent and skip a focused
//! control, so neither direction re-triggers the other.

use crate::controls::{ControlId, ControlSurface};
use photsat_native::{CameraHandle, NativeError};

/// Tracks auto mode and the last manual exposure settings
#[derive(Debug, Clone, Default)]
pub struct ExposureSync {
    auto: bool,
    manual_exposure: Option<u32>,
    manual_gain: Option<u16>,
}

impl ExposureSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_enabled(&self) -> bool {
        self.auto
    }

    pub fn set_auto(&mut self, enabled: bool) {
        self.auto = enabled;
    }

    pub fn manual_exposure(&self) -> Option<u32> {
        self.manual_exposure
    }

    pub fn manual_gain(&self) -> Option<u16> {
        self.manual_gain
    }

    pub fn remember_manual(&mut self, exposure_us: u32, gain_percent: u16) {
        self.manual_exposure = Some(exposure_us);
        self.manual_gain = Some(gain_percent);
    }

    /// Handle an exposure-changed event from the device.
    ///
    /// In auto mode the device values are copied into the controls and
    /// remembered; otherwise the remembered manual values are reasserted.
    pub fn on_exposure_event(&mut self, handle: &dyn CameraHandle, controls: &mut dyn ControlSurface) {
        if self.auto {
            match handle.exposure_time() {
                Ok(exposure) => {
                    write_unfocused(controls, ControlId::ExposureTime, exposure);
                    self.manual_exposure = Some(exposure);
                }
                Err(e) => tracing::warn!("Failed to read exposure time: {}", e),
            }
            match handle.gain() {
                Ok(gain) => {
                    write_unfocused(controls, ControlId::Gain, gain as u32);
                    self.manual_gain = Some(gain);
                }
                Err(e) => tracing::warn!("Failed to read gain: {}", e),
            }
        } else {
            if let Some(exposure) = self.manual_exposure {
                write_unfocused(controls, ControlId::ExposureTime, exposure);
            }
            if let Some(gain) = self.manual_gain {
                write_unfocused(controls, ControlId::Gain, gain as u32);
            }
        }
    }

    /// Apply an exposure time typed by the user.
    ///
    /// Ignored in auto mode. On a device error the control reverts to the
    /// last manual value.
    pub fn apply_user_exposure(
        &mut self,
        handle: &mut dyn CameraHandle,
        controls: &mut dyn ControlSurface,
        micros: u32,
    ) -> Result<bool, NativeError> {
        if self.auto {
            return Ok(false);
        }
        match handle.set_exposure_time(micros) {
            Ok(()) => {
                self.manual_exposure = Some(micros);
                Ok(true)
            }
            Err(e) => {
                tracing::warn!("Failed to set exposure time: {}", e);
                if let Some(previous) = self.manual_exposure {
                    controls.set_value_silently(ControlId::ExposureTime, previous);
                }
                Err(e)
            }
        }
    }

    /// Apply a gain typed by the user. Same rules as `apply_user_exposure`.
    pub fn apply_user_gain(
        &mut self,
        handle: &mut dyn CameraHandle,
        controls: &mut dyn ControlSurface,
        percent: u16,
    ) -> Result<bool, NativeError> {
        if self.auto {
            return Ok(false);
        }
        match handle.set_gain(percent) {
            Ok(()) => {
                self.manual_gain = Some(percent);
                Ok(true)
            }
            Err(e) => {
                tracing::warn!("Failed to set gain: {}", e);
                if let Some(previous) = self.manual_gain {
                    controls.set_value_silently(ControlId::Gain, previous as u32);
                }
                Err(e)
            }
        }
    }
}

fn write_unfocused(controls: &mut dyn ControlSurface, control: ControlId, value: u32) {
    if !controls.has_focus(control) {
        controls.set_value_silently(control, value);
    }
}
