//! Outbound event bus
//!
//! The controller publishes `AppEvent`s for whatever front end is attached.
//! Each published event carries a monotonically increasing id and a
//! timestamp. Slow subscribers lag and skip to the newest events.

use photsat_sequencer::{MacroOutcome, MacroSummary};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default event buffer size
///
/// Preview and histogram events arrive at the camera frame rate, so the
/// buffer is sized for a few seconds of streaming.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

/// Event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
}

/// What a progress event counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressKind {
    Macro,
    Burst,
}

/// Periodic camera telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraStatus {
    /// Frames delivered since start
    pub frames: u32,
    pub exposure_secs: f64,
    /// `1 / exposure`, zero for a zero exposure
    pub fps: f64,
    pub temperature_c: Option<f64>,
    /// Device frame-rate window in milliseconds
    pub clock_ms: u32,
}

/// Events published by the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AppEvent {
    CameraOpened {
        device_id: String,
        display_name: String,
        width: u32,
        height: u32,
        bit_depth: u32,
    },
    CameraClosed {
        device_id: String,
        reason: Option<String>,
    },
    /// 8-bit rendering of the newest frame
    Preview { width: u32, height: u32, pixels: Vec<u8> },
    Histogram { bins: Vec<u64>, max_value: u16 },
    Progress { kind: ProgressKind, completed: u32, total: u32 },
    FileSaved { path: PathBuf },
    MacroFinished(MacroSummary),
    Status(CameraStatus),
    /// User-facing message
    Notice { severity: EventSeverity, message: String },
}

impl AppEvent {
    pub fn severity(&self) -> EventSeverity {
        match self {
            AppEvent::Notice { severity, .. } => *severity,
            AppEvent::MacroFinished(summary) => match summary.outcome {
                MacroOutcome::Completed => EventSeverity::Info,
                MacroOutcome::Cancelled => EventSeverity::Warning,
                MacroOutcome::Aborted(_) => EventSeverity::Error,
            },
            _ => EventSeverity::Info,
        }
    }

    pub fn notice(severity: EventSeverity, message: impl Into<String>) -> Self {
        AppEvent::Notice {
            severity,
            message: message.into(),
        }
    }
}

/// A published event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotsatEvent {
    /// Unique event ID (monotonically increasing sequence number)
    pub event_id: u64,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub severity: EventSeverity,
    pub payload: AppEvent,
}

/// Broadcast bus for controller events
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<PhotsatEvent>,
    sequence: AtomicU64,
    events_published: AtomicU64,
    capacity: usize,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: AtomicU64::new(1),
            events_published: AtomicU64::new(0),
            capacity,
        }
    }

    /// Publish an event to all subscribers, returning its id
    pub fn publish(&self, payload: AppEvent) -> u64 {
        let event_id = self.sequence.fetch_add(1, Ordering::SeqCst);
        let event = PhotsatEvent {
            event_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
            severity: payload.severity(),
            payload,
        };
        self.events_published.fetch_add(1, Ordering::Relaxed);

        // No receivers is fine
        let _ = self.sender.send(event);
        event_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PhotsatEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

/// Thread-safe shared event bus
pub type SharedEventBus = Arc<EventBus>;
