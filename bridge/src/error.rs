//! Error types for the capture controller

use photsat_imaging::ImagingError;
use photsat_native::NativeError;
use photsat_sequencer::MacroError;
use thiserror::Error;

/// Errors returned by controller commands
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("No camera is open")]
    NoCamera,

    #[error("No frame has been received yet")]
    NoFrame,

    #[error("Controller busy: {0}")]
    Busy(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Camera error: {0}")]
    Native(#[from] NativeError),

    #[error("Image error: {0}")]
    Imaging(#[from] ImagingError),

    #[error("Macro error: {0}")]
    Macro(#[from] MacroError),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The controller task has stopped
    #[error("Controller is not running")]
    ControllerGone,
}

impl ControllerError {
    /// Errors that leave the camera unusable
    pub fn is_fatal(&self) -> bool {
        match self {
            ControllerError::Native(e) => e.is_fatal(),
            ControllerError::ControllerGone => true,
            _ => false,
        }
    }
}

/// Result type for controller operations
pub type ControllerResult<T> = Result<T, ControllerError>;
