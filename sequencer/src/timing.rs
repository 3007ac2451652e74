//! Timing tunables for macro and burst captures
//!
//! These are empirical values for the supported camera family; other models
//! may need different settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delays and retry bounds used by `MacroSequencer`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacroTiming {
    /// Extraction attempts per capture before it is skipped
    pub max_extract_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Pause between finishing one capture and configuring the next
    pub advance_delay_ms: u64,
    /// Added to the exposure time before the first extraction attempt
    pub settle_margin_ms: u64,
}

impl Default for MacroTiming {
    fn default() -> Self {
        Self {
            max_extract_attempts: 5,
            retry_backoff_ms: 500,
            advance_delay_ms: 500,
            settle_margin_ms: 500,
        }
    }
}

impl MacroTiming {
    /// `exposure_us / 1000` ms plus the settle margin
    pub fn settle_delay(&self, exposure_us: u32) -> Duration {
        Duration::from_millis(exposure_us as u64 / 1000 + self.settle_margin_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn advance_delay(&self) -> Duration {
        Duration::from_millis(self.advance_delay_ms)
    }
}

/// Spacing for multi-capture bursts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BurstTiming {
    pub spacing_margin_ms: u64,
}

impl Default for BurstTiming {
    fn default() -> Self {
        Self { spacing_margin_ms: 100 }
    }
}

impl BurstTiming {
    /// `exposure_us / 1000` ms plus the spacing margin
    pub fn spacing(&self, exposure_us: u32) -> Duration {
        Duration::from_millis(exposure_us as u64 / 1000 + self.spacing_margin_ms)
    }
}
