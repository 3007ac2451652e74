//! Device event marshaling
//!
//! Vendor SDKs invoke their event callback on an internal thread. The
//! callback only forwards a `DeviceMessage` into a bounded channel owned by
//! the control loop; all real work happens on the receiving side. Fatal
//! events that find the channel full are parked in a `FatalLatch` instead,
//! which the control loop polls ahead of the channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};

/// Asynchronous notifications raised by an open camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEvent {
    /// Exposure time or gain changed on the device side
    Exposure,
    /// A live frame is ready to pull
    Image,
    /// A still (snap) frame is ready to pull
    StillImage,
    /// A trigger request could not be honored
    TriggerFailed,
    /// Generic device error
    Error,
    /// The camera was unplugged
    Disconnected,
    /// The device stopped producing frames
    NoFrameTimeout,
    /// Any other vendor event code
    Other(u32),
}

impl DeviceEvent {
    /// Events after which the session cannot continue
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeviceEvent::Error | DeviceEvent::Disconnected)
    }
}

/// An event tagged with the session that raised it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMessage {
    pub session: u64,
    pub event: DeviceEvent,
}

/// Holds the most recent fatal event that could not be queued
#[derive(Debug, Default)]
pub struct FatalLatch {
    pending: Mutex<Option<DeviceMessage>>,
    notify: Notify,
}

impl FatalLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `message` and wake the waiter
    pub fn raise(&self, message: DeviceMessage) {
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(message);
        self.notify.notify_one();
    }

    pub fn take(&self) -> Option<DeviceMessage> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Wait for a parked message. Cancel safe: the message stays parked
    /// until this future completes.
    pub async fn raised(&self) -> DeviceMessage {
        loop {
            if let Some(message) = self.take() {
                return message;
            }
            self.notify.notified().await;
        }
    }
}

/// Sending half handed to a driver at `start`
///
/// Cloneable and callable from any thread. Delivery never blocks: when the
/// channel is full a frame or exposure event is dropped and counted, since
/// the next pull returns the newest frame anyway. A fatal event goes to the
/// latch when one is attached.
#[derive(Debug, Clone)]
pub struct EventSink {
    session: u64,
    tx: mpsc::Sender<DeviceMessage>,
    fatal: Option<Arc<FatalLatch>>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    pub fn new(session: u64, tx: mpsc::Sender<DeviceMessage>) -> Self {
        Self {
            session,
            tx,
            fatal: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Route fatal events that find the channel full into `latch`
    pub fn with_fatal_latch(mut self, latch: Arc<FatalLatch>) -> Self {
        self.fatal = Some(latch);
        self
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Forward an event. Returns false if it was not delivered.
    pub fn deliver(&self, event: DeviceEvent) -> bool {
        let message = DeviceMessage {
            session: self.session,
            event,
        };
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                if let (true, Some(latch)) = (event.is_fatal(), &self.fatal) {
                    tracing::warn!(
                        "Event channel full, latching {:?} for session {}",
                        event,
                        self.session
                    );
                    latch.raise(message);
                    return true;
                }
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if event.is_fatal() {
                    tracing::error!(
                        "Event channel full, dropped {:?} for session {} ({} dropped total)",
                        event,
                        self.session,
                        dropped
                    );
                } else {
                    tracing::trace!("Event channel full, dropped {:?} ({} total)", event, dropped);
                }
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Event receiver gone, ignoring {:?}", event);
                false
            }
        }
    }

    /// Number of events dropped because the channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
