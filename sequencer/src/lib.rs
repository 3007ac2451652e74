//! Macro capture sequencing
//!
//! A macro is an ordered plan of capture steps. `MacroSequencer` drives a plan
//! one capture at a time through a `MacroPort`, returning timer directives
//! to its owner instead of sleeping, so it can run on a single control task.

pub mod device_ops;
pub mod executor;
pub mod plan;
pub mod timing;

pub use device_ops::{Extraction, MacroPort, TriggerPath};
pub use executor::{
    CancelToken, Directive, MacroOutcome, MacroPhase, MacroProgress, MacroSequencer, MacroSummary, MacroTicket,
    MacroWake,
};
pub use plan::{MacroPlan, MacroStep, ResolvedStep};
pub use timing::{BurstTiming, MacroTiming};

/// Errors raised while loading or starting a macro
#[derive(Debug, thiserror::Error)]
pub enum MacroError {
    #[error("A macro is already running")]
    AlreadyRunning,

    #[error("Invalid macro plan: {0}")]
    InvalidPlan(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
