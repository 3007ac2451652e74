//! Native Driver Traits
//!
//! Defines the common interface every camera driver implements. The capture
//! layer only talks to hardware through `CameraDriver` and `CameraHandle`, so
//! the vendor SDK binding and the simulated camera are interchangeable.

use crate::event::EventSink;
use crate::session::SessionSlot;
use crate::utils::hresult;
use photsat_imaging::frame::stride_bytes;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

// =============================================================================
// DEVICE DESCRIPTION
// =============================================================================

/// Options accepted by `CameraHandle::configure`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraOption {
    /// Raw sensor output: 1 = raw, 0 = processed
    Raw,
    /// Sample width: 0 = 8 bits, 1 = high bit depth
    BitDepth,
    /// Trigger mode: 0 = video (free running), 1 = software trigger
    Trigger,
}

/// A sensor readout resolution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Static capabilities reported by the driver at enumeration time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraCapabilities {
    /// Number of still-capture resolutions. Zero means the camera has no
    /// still mode and captures come from the live stream.
    pub still_resolutions: u32,
    /// Camera accepts a software trigger
    pub software_trigger: bool,
    /// Monochrome sensor
    pub mono: bool,
}

impl CameraCapabilities {
    pub fn has_still_mode(&self) -> bool {
        self.still_resolutions > 0
    }
}

/// Information about an enumerated camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Opaque id used to open the device
    pub id: String,
    pub display_name: String,
    pub model_name: String,
    pub capabilities: CameraCapabilities,
    /// Preview resolutions, indexed by resolution index
    pub resolutions: Vec<Resolution>,
    /// Physical pixel size in micrometers (x, y)
    pub pixel_size_um: (f32, f32),
}

impl DeviceDescriptor {
    pub fn resolution(&self, index: u32) -> Option<Resolution> {
        self.resolutions.get(index as usize).copied()
    }
}

/// Inclusive range with the device default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueRange<T> {
    pub min: T,
    pub max: T,
    pub default: T,
}

impl<T: PartialOrd + Copy> ValueRange<T> {
    pub fn contains(&self, value: T) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Metadata returned by a successful frame pull
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    /// Frame sequence number
    pub seq: u32,
    /// Device timestamp in microseconds
    pub timestamp_us: u64,
    pub exposure_us: u32,
    pub gain: u16,
}

impl FrameInfo {
    /// Bytes of a padded frame of this size at `bit_depth` (8 or 16)
    pub fn buffer_len(&self, bit_depth: u32) -> usize {
        stride_bytes(self.width, bit_depth) * self.height as usize
    }

    /// Reject a destination buffer that cannot hold this frame
    pub fn check_buffer(&self, len: usize, bit_depth: u32) -> Result<(), NativeError> {
        let needed = self.buffer_len(bit_depth);
        if len < needed {
            return Err(NativeError::InvalidParameter(format!(
                "buffer of {} bytes too small for {}x{} at {} bits ({} bytes)",
                len, self.width, self.height, bit_depth, needed
            )));
        }
        Ok(())
    }
}

/// Result of a frame pull that did not fail
///
/// `Pending` is the device saying "no frame ready yet". It is a normal,
/// benign outcome and never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    Frame(FrameInfo),
    Pending,
}

/// Recent frame rate as reported by the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRate {
    /// Frames delivered in the measurement window
    pub frames: u32,
    /// Length of the measurement window in milliseconds
    pub window_ms: u32,
    /// Frames delivered since start
    pub total_frames: u32,
}

impl FrameRate {
    pub fn fps(&self) -> f64 {
        if self.window_ms == 0 {
            0.0
        } else {
            self.frames as f64 * 1000.0 / self.window_ms as f64
        }
    }
}

// =============================================================================
// DRIVER TRAITS
// =============================================================================

/// Entry point of a driver: enumeration and opening
pub trait CameraDriver: Send + Sync {
    /// Human readable driver name, used in logs
    fn name(&self) -> &str;

    /// List connected cameras
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, NativeError>;

    /// Open a camera by the id reported from `enumerate`
    fn open(&self, device_id: &str) -> Result<Box<dyn CameraHandle>, NativeError>;

    /// Slot tracking the single open session allowed per driver
    fn session_slot(&self) -> &SessionSlot;
}

/// An opened camera
///
/// All methods are non-blocking. Events are delivered through the sink given
/// to `start`, from whatever thread the driver uses internally.
pub trait CameraHandle: Send + Debug {
    /// Set a device option
    fn configure(&mut self, option: CameraOption, value: i32) -> Result<(), NativeError>;

    /// Start pull mode. Events are delivered to `sink` until `stop`.
    fn start(&mut self, sink: EventSink) -> Result<(), NativeError>;

    /// Stop streaming. No events are delivered after this returns.
    fn stop(&mut self) -> Result<(), NativeError>;

    /// Release the device. Safe to call more than once.
    fn close(&mut self);

    /// Pull the newest frame into `buffer` using the padded row layout.
    ///
    /// Passing `None` only queries the frame geometry without consuming it.
    fn pull_frame(
        &mut self,
        buffer: Option<&mut [u8]>,
        still: bool,
        bit_depth: u32,
    ) -> Result<PullOutcome, NativeError>;

    /// Request a still capture at the given still resolution index
    fn snap(&mut self, resolution_index: u32) -> Result<(), NativeError>;

    /// Fire one software trigger. `NotSupported` when the camera lacks one.
    fn software_trigger(&mut self) -> Result<(), NativeError>;

    /// Exposure time in microseconds
    fn exposure_time(&self) -> Result<u32, NativeError>;
    fn set_exposure_time(&mut self, micros: u32) -> Result<(), NativeError>;
    fn exposure_range(&self) -> Result<ValueRange<u32>, NativeError>;

    /// Analog gain in percent
    fn gain(&self) -> Result<u16, NativeError>;
    fn set_gain(&mut self, percent: u16) -> Result<(), NativeError>;
    fn gain_range(&self) -> Result<ValueRange<u16>, NativeError>;

    /// Sensor temperature in tenths of a degree Celsius
    fn temperature(&self) -> Result<i16, NativeError>;

    fn auto_exposure(&self) -> Result<bool, NativeError>;
    fn set_auto_exposure(&mut self, enabled: bool) -> Result<(), NativeError>;

    fn max_bit_depth(&self) -> Result<u32, NativeError>;

    fn resolution_index(&self) -> Result<u32, NativeError>;
    fn set_resolution_index(&mut self, index: u32) -> Result<(), NativeError>;

    fn frame_rate(&self) -> Result<FrameRate, NativeError>;
}

// =============================================================================
// ERRORS
// =============================================================================

/// Errors returned across the driver boundary
#[derive(Debug, thiserror::Error)]
pub enum NativeError {
    #[error("Device not connected")]
    NotConnected,

    #[error("A camera session is already open")]
    AlreadyOpen,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("SDK not loaded: {0}")]
    SdkNotLoaded(String),

    /// A vendor call returned a failure code
    #[error("{operation} failed with error code {code:#010x}")]
    Sdk { operation: String, code: i32 },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NativeError {
    /// Create an error for a failed vendor call
    pub fn sdk(operation: impl Into<String>, code: i32) -> Self {
        Self::Sdk {
            operation: operation.into(),
            code,
        }
    }

    /// Numeric code in the vendor's HRESULT space
    pub fn code(&self) -> i32 {
        match self {
            NativeError::Sdk { code, .. } => *code,
            NativeError::NotConnected | NativeError::Disconnected => hresult::E_UNEXPECTED,
            NativeError::AlreadyOpen => hresult::E_BUSY,
            NativeError::DeviceNotFound(_) => hresult::E_GEN_FAILURE,
            NativeError::InvalidParameter(_) => hresult::E_INVALIDARG,
            NativeError::NotSupported(_) => hresult::E_NOTIMPL,
            NativeError::SdkNotLoaded(_) | NativeError::Io(_) => hresult::E_FAIL,
        }
    }

    /// True when the session can no longer be used
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NativeError::NotConnected | NativeError::Disconnected | NativeError::SdkNotLoaded(_)
        )
    }
}
