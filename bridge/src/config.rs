//! Persistent application settings

use crate::error::{ControllerError, ControllerResult};
use crate::event::DEFAULT_EVENT_BUFFER_SIZE;
use photsat_imaging::SaveFormats;
use photsat_sequencer::{BurstTiming, MacroTiming};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings loaded at startup, stored as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Global output directory; macro steps without a directory use it
    pub output_directory: PathBuf,
    /// File prefix for snap and burst captures
    pub file_prefix: String,
    pub save_formats: SaveFormats,
    pub macro_timing: MacroTiming,
    pub burst_timing: BurstTiming,
    /// Capacity of the device event channel
    pub event_channel_capacity: usize,
    /// Capacity of the outbound event bus
    pub event_bus_capacity: usize,
    pub status_poll_ms: u64,
    /// Publish a histogram with every preview
    pub publish_histogram: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            output_directory: PathBuf::from("."),
            file_prefix: "capture_".to_string(),
            save_formats: SaveFormats::default(),
            macro_timing: MacroTiming::default(),
            burst_timing: BurstTiming::default(),
            event_channel_capacity: 64,
            event_bus_capacity: DEFAULT_EVENT_BUFFER_SIZE,
            status_poll_ms: 1000,
            publish_histogram: true,
        }
    }
}

impl AppSettings {
    /// Load settings, falling back to defaults when the file does not exist
    pub fn load(path: &Path) -> ControllerResult<Self> {
        if !path.exists() {
            tracing::info!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&text)
            .map_err(|e| ControllerError::Settings(format!("{}: {}", path.display(), e)))?;
        tracing::info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> ControllerResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| ControllerError::Settings(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }
}
