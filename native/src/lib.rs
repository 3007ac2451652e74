//! Native camera drivers
//!
//! Exposes the driver boundary the capture layer is written against, the
//! session wrapper that owns an open device, and two drivers: the runtime
//! loaded nncam SDK binding and an in-memory simulated camera.

pub mod event;
pub mod session;
pub mod traits;
pub mod utils;
pub mod vendor;

pub use event::{DeviceEvent, DeviceMessage, EventSink, FatalLatch};
pub use session::{DeviceSession, SessionSlot, SessionState};
pub use traits::*;
pub use vendor::{NncamDriver, SimulatedCameraModel, SimulatedDriver, SimulatorControl};
