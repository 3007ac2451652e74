// Photsat capture bridge
//
// Runs the camera controller task and exposes it to front ends through a
// cloneable handle and a broadcast event bus.

pub mod acquisition;
mod capture;
pub mod config;
pub mod controller;
pub mod controls;
pub mod error;
pub mod event;
pub mod exposure_sync;
pub mod timers;

pub use acquisition::{Acquisition, Capture};
pub use config::AppSettings;
pub use controller::{CameraController, Command, ControllerHandle};
pub use controls::{ControlId, ControlSurface, HeadlessControls};
pub use error::{ControllerError, ControllerResult};
pub use event::{AppEvent, CameraStatus, EventBus, EventSeverity, PhotsatEvent, ProgressKind, SharedEventBus};
pub use exposure_sync::ExposureSync;

use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Base name of the daily log files
pub const LOG_FILE_NAME: &str = "photsat.log";

/// Days of log files kept by `init_logging`
const LOG_RETENTION_DAYS: i64 = 7;

/// Global log directory path
static LOG_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Global log file guard (keeps file writer alive)
static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Install the global tracing subscriber.
///
/// Logs go to the console and, when `log_directory` is given, to a daily
/// rolling file in it. `RUST_LOG` overrides the default `info` level.
pub fn init_logging(log_directory: Option<&Path>) -> ControllerResult<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = fmt::layer().with_target(false).with_ansi(true);

    let Some(log_dir) = log_directory else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init()
            .map_err(|e| ControllerError::Settings(format!("logging already initialized: {}", e)))?;
        tracing::info!("Photsat initialized (console logging only)");
        return Ok(());
    };

    std::fs::create_dir_all(log_dir)?;
    LOG_DIR.set(log_dir.to_path_buf()).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    LOG_GUARD.set(guard).ok();

    let file_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| ControllerError::Settings(format!("logging already initialized: {}", e)))?;

    tracing::info!("Photsat initialized with file logging");
    tracing::info!("Log directory: {}", log_dir.display());

    let today = chrono::Local::now().date_naive();
    for path in stale_log_files(log_dir, today, LOG_RETENTION_DAYS) {
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!("Removed old log file {}", path.display()),
            Err(e) => tracing::debug!("Failed to remove {}: {}", path.display(), e),
        }
    }
    Ok(())
}

/// Directory passed to `init_logging`, if any
pub fn log_directory() -> Option<PathBuf> {
    LOG_DIR.get().cloned()
}

/// Daily log files in `log_dir` dated more than `keep_days` before `today`
fn stale_log_files(log_dir: &Path, today: NaiveDate, keep_days: i64) -> Vec<PathBuf> {
    let cutoff = today - chrono::Duration::days(keep_days);
    let prefix = format!("{}.", LOG_FILE_NAME);

    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Cannot read log directory for cleanup: {}", e);
            return Vec::new();
        }
    };

    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(&prefix))
                .and_then(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok())
                .map(|date| date < cutoff)
                .unwrap_or(false)
        })
        .collect()
}
