//! Device operations needed by the macro sequencer
//!
//! The sequencer calls these without knowing how the camera is driven.
//! The bridge implements the port against the live camera session.

use crate::plan::ResolvedStep;
use photsat_imaging::SampleArray;
use std::fmt::Display;
use std::path::Path;

/// How a capture was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPath {
    /// The device's software trigger primitive
    SoftwareTrigger,
    /// A still-mode snap
    Snap,
    /// No trigger; the next streamed live frame is the capture
    LiveFrame,
}

/// Result of one extraction attempt
#[derive(Debug, Clone)]
pub enum Extraction {
    Ready(SampleArray),
    /// No frame available yet
    Pending,
}

/// Trait defining the device operations needed by `MacroSequencer`
pub trait MacroPort {
    type Error: Display;

    /// False once the camera session the run started on is gone
    fn session_available(&self) -> bool;

    /// Push the step's exposure and gain to the device and reflect them in the
    /// exposure controls. An error aborts the run.
    fn apply_step_settings(&mut self, step: &ResolvedStep) -> Result<(), Self::Error>;

    /// Request a capture, choosing the best trigger the device offers
    fn trigger_capture(&mut self) -> TriggerPath;

    /// Try to pull the captured frame
    fn extract_capture(&mut self, path: TriggerPath) -> Result<Extraction, Self::Error>;

    /// Write the capture to `destination` and refresh the preview
    fn persist_capture(
        &mut self,
        samples: &SampleArray,
        step: &ResolvedStep,
        destination: &Path,
    ) -> Result<(), Self::Error>;

    fn report_progress(&mut self, completed: u32, total: u32);
}
