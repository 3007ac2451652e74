//! Device session
//!
//! `DeviceSession` owns one opened camera for its whole lifetime. It enforces
//! the single-open rule through the driver's `SessionSlot`, tags every event
//! with its session id so late callbacks from a previous session can be
//! recognized, and makes `close` idempotent.

use crate::event::{DeviceMessage, EventSink, FatalLatch};
use crate::traits::{
    CameraDriver, CameraHandle, CameraOption, DeviceDescriptor, NativeError, PullOutcome,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Tracks whether a driver currently has an open session
#[derive(Debug, Clone, Default)]
pub struct SessionSlot {
    occupied: Arc<AtomicBool>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_occupied(&self) -> bool {
        self.occupied.load(Ordering::SeqCst)
    }

    fn claim(&self) -> Result<SlotClaim, NativeError> {
        self.occupied
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| NativeError::AlreadyOpen)?;
        Ok(SlotClaim {
            occupied: Arc::clone(&self.occupied),
        })
    }
}

/// Releases the slot when dropped
#[derive(Debug)]
struct SlotClaim {
    occupied: Arc<AtomicBool>,
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        self.occupied.store(false, Ordering::SeqCst);
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opened,
    Running,
    Closed,
}

/// An open camera
#[derive(Debug)]
pub struct DeviceSession {
    id: u64,
    descriptor: DeviceDescriptor,
    handle: Option<Box<dyn CameraHandle>>,
    state: SessionState,
    claim: Option<SlotClaim>,
}

impl DeviceSession {
    /// Open the camera with the given id.
    ///
    /// Fails with `AlreadyOpen` while another session from the same driver
    /// is alive, and with `DeviceNotFound` when the id is not enumerated.
    pub fn open(driver: &dyn CameraDriver, device_id: &str) -> Result<Self, NativeError> {
        let claim = driver.session_slot().claim()?;
        let descriptor = driver
            .enumerate()?
            .into_iter()
            .find(|d| d.id == device_id)
            .ok_or_else(|| NativeError::DeviceNotFound(device_id.to_string()))?;
        Self::open_with(driver, descriptor, claim)
    }

    /// Open the first enumerated camera
    pub fn open_first(driver: &dyn CameraDriver) -> Result<Self, NativeError> {
        let claim = driver.session_slot().claim()?;
        let descriptor = driver
            .enumerate()?
            .into_iter()
            .next()
            .ok_or_else(|| NativeError::DeviceNotFound("no camera found".to_string()))?;
        Self::open_with(driver, descriptor, claim)
    }

    fn open_with(
        driver: &dyn CameraDriver,
        descriptor: DeviceDescriptor,
        claim: SlotClaim,
    ) -> Result<Self, NativeError> {
        let handle = driver.open(&descriptor.id)?;
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            "Opened camera '{}' ({}) via {} as session {}",
            descriptor.display_name,
            descriptor.id,
            driver.name(),
            id
        );
        Ok(Self {
            id,
            descriptor,
            handle: Some(handle),
            state: SessionState::Opened,
            claim: Some(claim),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state != SessionState::Closed
    }

    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    /// Borrow the device handle
    pub fn handle(&self) -> Result<&dyn CameraHandle, NativeError> {
        self.handle.as_deref().ok_or(NativeError::NotConnected)
    }

    /// Mutably borrow the device handle
    pub fn handle_mut(&mut self) -> Result<&mut dyn CameraHandle, NativeError> {
        match self.handle.as_mut() {
            Some(handle) => Ok(&mut **handle),
            None => Err(NativeError::NotConnected),
        }
    }

    pub fn configure(&mut self, option: CameraOption, value: i32) -> Result<(), NativeError> {
        self.handle_mut()?.configure(option, value)
    }

    /// Start pull mode, routing events tagged with this session id into `tx`.
    /// Fatal events that find `tx` full are parked in `fatal`.
    pub fn start(
        &mut self,
        tx: mpsc::Sender<DeviceMessage>,
        fatal: Arc<FatalLatch>,
    ) -> Result<(), NativeError> {
        if self.state == SessionState::Running {
            return Ok(());
        }
        let sink = EventSink::new(self.id, tx).with_fatal_latch(fatal);
        self.handle_mut()?.start(sink)?;
        self.state = SessionState::Running;
        Ok(())
    }

    /// Stop streaming. A no-op when not running.
    pub fn stop(&mut self) -> Result<(), NativeError> {
        if self.state != SessionState::Running {
            return Ok(());
        }
        self.handle_mut()?.stop()?;
        self.state = SessionState::Opened;
        Ok(())
    }

    pub fn pull_frame(
        &mut self,
        buffer: Option<&mut [u8]>,
        still: bool,
        bit_depth: u32,
    ) -> Result<PullOutcome, NativeError> {
        self.handle_mut()?.pull_frame(buffer, still, bit_depth)
    }

    /// Release the device. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(mut handle) = self.handle.take() {
            if self.state == SessionState::Running {
                if let Err(e) = handle.stop() {
                    tracing::warn!("Stop before close failed for session {}: {}", self.id, e);
                }
            }
            handle.close();
        }
        self.state = SessionState::Closed;
        self.claim = None;
        tracing::info!("Closed camera session {}", self.id);
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}
