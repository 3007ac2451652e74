//! Macro execution engine
//!
//! `MacroSequencer` is a state machine. Every transition that has to wait
//! returns a `Directive::Schedule`; the owner arms a one-shot timer and feeds
//! the ticket back through `on_wake` when it fires. Tickets from an earlier
//! run are ignored.

use crate::device_ops::{Extraction, MacroPort, TriggerPath};
use crate::plan::{MacroPlan, ResolvedStep};
use crate::timing::MacroTiming;
use crate::MacroError;
use photsat_imaging::{capture_path, SampleArray};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// State of the macro sequencer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacroPhase {
    Idle,
    ConfiguringStep,
    AwaitingCapture,
    Extracting,
    Persisting,
    Advancing,
}

/// What a scheduled wake should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroWake {
    Configure,
    Extract,
}

/// Identifies a scheduled wake and the run it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacroTicket {
    pub run_id: u64,
    pub wake: MacroWake,
}

/// Instruction returned to the owner after every transition
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Call `on_wake(ticket)` after `after` has elapsed
    Schedule { after: Duration, ticket: MacroTicket },
    /// The run ended
    Finished(MacroSummary),
    /// Nothing to do
    Idle,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacroOutcome {
    Completed,
    Cancelled,
    Aborted(String),
}

/// Final report of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroSummary {
    pub run_id: u64,
    pub outcome: MacroOutcome,
    pub completed: u32,
    pub total: u32,
    /// Captures that ended without a saved file
    pub skipped: u32,
    pub saved: Vec<PathBuf>,
}

/// Snapshot of a running macro
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroProgress {
    pub phase: MacroPhase,
    pub step_index: usize,
    pub capture_index: u32,
    pub completed: u32,
    pub total: u32,
    pub retry_count: u32,
}

/// Shared cancellation flag, checked on every scheduled wake
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct MacroRun {
    id: u64,
    steps: Vec<ResolvedStep>,
    step_index: usize,
    capture_index: u32,
    completed: u32,
    total: u32,
    retry_count: u32,
    /// Shared across steps; bumped only when a file is written
    file_counter: u64,
    trigger: TriggerPath,
    saved: Vec<PathBuf>,
    skipped: u32,
    cancel: CancelToken,
}

/// Runs one macro plan at a time
pub struct MacroSequencer {
    timing: MacroTiming,
    phase: MacroPhase,
    run: Option<MacroRun>,
    next_run_id: u64,
}

impl Default for MacroSequencer {
    fn default() -> Self {
        Self::new(MacroTiming::default())
    }
}

impl MacroSequencer {
    pub fn new(timing: MacroTiming) -> Self {
        Self {
            timing,
            phase: MacroPhase::Idle,
            run: None,
            next_run_id: 1,
        }
    }

    pub fn timing(&self) -> &MacroTiming {
        &self.timing
    }

    /// Takes effect for the next run
    pub fn set_timing(&mut self, timing: MacroTiming) {
        if self.run.is_none() {
            self.timing = timing;
        }
    }

    pub fn phase(&self) -> MacroPhase {
        self.phase
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.run.as_ref().map(|run| run.cancel.clone())
    }

    pub fn progress(&self) -> Option<MacroProgress> {
        self.run.as_ref().map(|run| MacroProgress {
            phase: self.phase,
            step_index: run.step_index,
            capture_index: run.capture_index,
            completed: run.completed,
            total: run.total,
            retry_count: run.retry_count,
        })
    }

    /// Start a run and configure its first step.
    ///
    /// # Arguments
    /// * `plan` - Steps to execute in order
    /// * `global_directory` - Directory for steps without one, captured now
    /// * `port` - Device operations for the run
    pub fn start<P: MacroPort>(
        &mut self,
        plan: &MacroPlan,
        global_directory: &Path,
        port: &mut P,
    ) -> Result<Directive, MacroError> {
        if self.run.is_some() {
            return Err(MacroError::AlreadyRunning);
        }
        plan.validate()?;

        let id = self.next_run_id;
        self.next_run_id += 1;
        let total = plan.total_captures();

        tracing::info!("Starting Macro: {} steps, {} total captures", plan.len(), total);

        self.run = Some(MacroRun {
            id,
            steps: plan.resolve(global_directory),
            step_index: 0,
            capture_index: 0,
            completed: 0,
            total,
            retry_count: 0,
            file_counter: 0,
            trigger: TriggerPath::LiveFrame,
            saved: Vec::new(),
            skipped: 0,
            cancel: CancelToken::new(),
        });

        if total == 0 {
            return Ok(self.finish(MacroOutcome::Completed));
        }
        port.report_progress(0, total);
        Ok(self.configure(port))
    }

    /// Handle a fired timer
    pub fn on_wake<P: MacroPort>(&mut self, ticket: MacroTicket, port: &mut P) -> Directive {
        let Some(run) = self.run.as_ref() else {
            return Directive::Idle;
        };
        if run.id != ticket.run_id {
            tracing::debug!("Ignoring stale macro wake for run {}", ticket.run_id);
            return Directive::Idle;
        }
        if run.cancel.is_cancelled() {
            return self.finish(MacroOutcome::Cancelled);
        }
        if !port.session_available() {
            return self.finish(MacroOutcome::Aborted("camera session closed".to_string()));
        }

        match ticket.wake {
            MacroWake::Configure => self.configure(port),
            MacroWake::Extract => self.extract(port),
        }
    }

    /// Stop the current run at the user's request
    pub fn cancel(&mut self) -> Option<MacroSummary> {
        self.run.as_ref()?;
        match self.finish(MacroOutcome::Cancelled) {
            Directive::Finished(summary) => Some(summary),
            _ => None,
        }
    }

    /// End the current run immediately
    pub fn abort(&mut self, reason: &str) -> Option<MacroSummary> {
        self.run.as_ref()?;
        tracing::warn!("Macro aborted: {}", reason);
        match self.finish(MacroOutcome::Aborted(reason.to_string())) {
            Directive::Finished(summary) => Some(summary),
            _ => None,
        }
    }

    // =========================================================================
    // TRANSITIONS
    // =========================================================================

    fn configure<P: MacroPort>(&mut self, port: &mut P) -> Directive {
        if !port.session_available() {
            return self.finish(MacroOutcome::Aborted("camera session closed".to_string()));
        }
        let Some(run) = self.run.as_mut() else {
            return Directive::Idle;
        };
        let Some(step) = run.steps.get(run.step_index) else {
            // Ran off the end of the plan; nothing left to capture
            return self.finish(MacroOutcome::Completed);
        };

        self.phase = MacroPhase::ConfiguringStep;
        if let Err(e) = port.apply_step_settings(step) {
            tracing::error!("Error configuring camera in Macro: {}", e);
            return self.finish(MacroOutcome::Aborted(format!("camera configuration failed: {}", e)));
        }

        tracing::info!(
            "Macro step {}/{}, capture {}/{}: Expo={} us, Gain={}, Prefix={}, Dir={}",
            run.step_index + 1,
            run.steps.len(),
            run.capture_index + 1,
            step.captures,
            step.exposure_us,
            step.gain_percent,
            step.prefix,
            step.directory.display()
        );

        let settle = self.timing.settle_delay(step.exposure_us);
        run.trigger = port.trigger_capture();
        run.retry_count = 0;
        self.phase = MacroPhase::AwaitingCapture;

        Directive::Schedule {
            after: settle,
            ticket: MacroTicket {
                run_id: run.id,
                wake: MacroWake::Extract,
            },
        }
    }

    fn extract<P: MacroPort>(&mut self, port: &mut P) -> Directive {
        let Some(run) = self.run.as_mut() else {
            return Directive::Idle;
        };
        self.phase = MacroPhase::Extracting;

        let failure = match port.extract_capture(run.trigger) {
            Ok(Extraction::Ready(samples)) => return self.persist(samples, port),
            Ok(Extraction::Pending) => "no frame available".to_string(),
            Err(e) => e.to_string(),
        };

        run.retry_count += 1;
        tracing::warn!(
            "Error extracting image (attempt {}/{}): {}",
            run.retry_count,
            self.timing.max_extract_attempts,
            failure
        );

        if run.retry_count < self.timing.max_extract_attempts {
            return Directive::Schedule {
                after: self.timing.retry_backoff(),
                ticket: MacroTicket {
                    run_id: run.id,
                    wake: MacroWake::Extract,
                },
            };
        }

        tracing::error!("Maximum retries reached, skipping this capture.");
        run.retry_count = 0;
        run.skipped += 1;
        self.advance(port)
    }

    fn persist<P: MacroPort>(&mut self, samples: SampleArray, port: &mut P) -> Directive {
        let Some(run) = self.run.as_mut() else {
            return Directive::Idle;
        };
        let Some(step) = run.steps.get(run.step_index) else {
            return self.finish(MacroOutcome::Completed);
        };
        self.phase = MacroPhase::Persisting;
        run.retry_count = 0;

        let counter = run.file_counter + 1;
        let destination = capture_path(&step.directory, &step.prefix, counter, "fits");
        match port.persist_capture(&samples, step, &destination) {
            Ok(()) => {
                tracing::info!("Macro FITS saved: {}", destination.display());
                run.file_counter = counter;
                run.saved.push(destination);
            }
            Err(e) => {
                tracing::warn!("Failed to save macro capture {}: {}", destination.display(), e);
                run.skipped += 1;
            }
        }

        self.advance(port)
    }

    fn advance<P: MacroPort>(&mut self, port: &mut P) -> Directive {
        let Some(run) = self.run.as_mut() else {
            return Directive::Idle;
        };
        self.phase = MacroPhase::Advancing;

        run.completed += 1;
        port.report_progress(run.completed, run.total);

        let captures = run.steps.get(run.step_index).map(|s| s.captures).unwrap_or(0);
        if run.capture_index + 1 < captures {
            run.capture_index += 1;
        } else {
            run.capture_index = 0;
            run.step_index += 1;
        }

        if run.completed >= run.total || run.step_index >= run.steps.len() {
            return self.finish(MacroOutcome::Completed);
        }

        Directive::Schedule {
            after: self.timing.advance_delay(),
            ticket: MacroTicket {
                run_id: run.id,
                wake: MacroWake::Configure,
            },
        }
    }

    fn finish(&mut self, outcome: MacroOutcome) -> Directive {
        self.phase = MacroPhase::Idle;
        let Some(run) = self.run.take() else {
            return Directive::Idle;
        };

        match &outcome {
            MacroOutcome::Completed => {
                tracing::info!("Macro sequence completed ({} captures processed).", run.completed)
            }
            MacroOutcome::Cancelled => tracing::info!("Macro cancelled after {} captures", run.completed),
            MacroOutcome::Aborted(reason) => {
                tracing::error!("Macro aborted after {} captures: {}", run.completed, reason)
            }
        }

        Directive::Finished(MacroSummary {
            run_id: run.id,
            outcome,
            completed: run.completed,
            total: run.total,
            skipped: run.skipped,
            saved: run.saved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::MacroStep;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakePort {
        closed: bool,
        reject_settings: bool,
        fail_persist: bool,
        trigger: Option<TriggerPath>,
        /// Scripted extraction results; empty means ready
        extractions: VecDeque<bool>,
        applied: Vec<(u32, u16)>,
        extract_calls: u32,
        written: Vec<PathBuf>,
        progress: Vec<(u32, u32)>,
    }

    impl MacroPort for FakePort {
        type Error = String;

        fn session_available(&self) -> bool {
            !self.closed
        }

        fn apply_step_settings(&mut self, step: &ResolvedStep) -> Result<(), String> {
            if self.reject_settings {
                return Err("put_ExpoTime failed".to_string());
            }
            self.applied.push((step.exposure_us, step.gain_percent));
            Ok(())
        }

        fn trigger_capture(&mut self) -> TriggerPath {
            self.trigger.unwrap_or(TriggerPath::SoftwareTrigger)
        }

        fn extract_capture(&mut self, _path: TriggerPath) -> Result<Extraction, String> {
            self.extract_calls += 1;
            match self.extractions.pop_front() {
                Some(false) => Ok(Extraction::Pending),
                _ => Ok(Extraction::Ready(SampleArray::from_u8(2, 2, vec![1, 2, 3, 4]).unwrap())),
            }
        }

        fn persist_capture(&mut self, _samples: &SampleArray, _step: &ResolvedStep, destination: &Path) -> Result<(), String> {
            if self.fail_persist {
                return Err("disk full".to_string());
            }
            self.written.push(destination.to_path_buf());
            Ok(())
        }

        fn report_progress(&mut self, completed: u32, total: u32) {
            self.progress.push((completed, total));
        }
    }

    /// Feed every scheduled wake straight back, recording the delays
    fn drive(sequencer: &mut MacroSequencer, first: Directive, port: &mut FakePort) -> (MacroSummary, Vec<Duration>) {
        let mut delays = Vec::new();
        let mut directive = first;
        loop {
            match directive {
                Directive::Schedule { after, ticket } => {
                    delays.push(after);
                    directive = sequencer.on_wake(ticket, port);
                }
                Directive::Finished(summary) => return (summary, delays),
                Directive::Idle => panic!("sequencer went idle without finishing"),
            }
        }
    }

    fn two_step_plan() -> MacroPlan {
        MacroPlan::new(vec![
            MacroStep::new(2, 1000, 100, "a_").with_directory("/tmp"),
            MacroStep::new(1, 2000, 150, "b_").with_directory("/tmp"),
        ])
    }

    #[test]
    fn test_full_run_names_files_in_order() {
        let mut sequencer = MacroSequencer::default();
        let mut port = FakePort::default();

        let first = sequencer.start(&two_step_plan(), Path::new("/global"), &mut port).unwrap();
        assert_eq!(sequencer.phase(), MacroPhase::AwaitingCapture);
        let (summary, delays) = drive(&mut sequencer, first, &mut port);

        assert_eq!(summary.outcome, MacroOutcome::Completed);
        assert_eq!((summary.completed, summary.total, summary.skipped), (3, 3, 0));
        assert_eq!(
            port.written,
            vec![
                PathBuf::from("/tmp/a_1.fits"),
                PathBuf::from("/tmp/a_2.fits"),
                PathBuf::from("/tmp/b_3.fits"),
            ]
        );
        assert_eq!(summary.saved, port.written);
        assert_eq!(port.applied, vec![(1000, 100), (1000, 100), (2000, 150)]);
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(501),
                Duration::from_millis(500),
                Duration::from_millis(501),
                Duration::from_millis(500),
                Duration::from_millis(502),
            ]
        );
        assert_eq!(port.progress, vec![(0, 3), (1, 3), (2, 3), (3, 3)]);
        assert_eq!(sequencer.phase(), MacroPhase::Idle);
        assert!(!sequencer.is_running());
    }

    #[test]
    fn test_unset_directory_inherits_global() {
        let mut sequencer = MacroSequencer::default();
        let mut port = FakePort::default();
        let plan = MacroPlan::new(vec![MacroStep::new(1, 1000, 100, "g_")]);

        let first = sequencer.start(&plan, Path::new("/data/run"), &mut port).unwrap();
        drive(&mut sequencer, first, &mut port);
        assert_eq!(port.written, vec![PathBuf::from("/data/run/g_1.fits")]);
    }

    #[test]
    fn test_retry_bound_then_skip() {
        let mut sequencer = MacroSequencer::default();
        let mut port = FakePort {
            extractions: VecDeque::from(vec![false; 5]),
            ..Default::default()
        };
        let plan = MacroPlan::new(vec![MacroStep::new(2, 1000, 100, "r_").with_directory("/tmp")]);

        let first = sequencer.start(&plan, Path::new("/global"), &mut port).unwrap();
        let (summary, delays) = drive(&mut sequencer, first, &mut port);

        // Five failed attempts for the first capture, one for the second
        assert_eq!(port.extract_calls, 6);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(port.written, vec![PathBuf::from("/tmp/r_1.fits")]);
        assert_eq!(delays.iter().filter(|d| **d == Duration::from_millis(500)).count(), 5);
    }

    #[test]
    fn test_retry_recovers_before_bound() {
        let mut sequencer = MacroSequencer::default();
        let mut port = FakePort {
            extractions: VecDeque::from(vec![false, false]),
            ..Default::default()
        };
        let plan = MacroPlan::new(vec![MacroStep::new(1, 1000, 100, "r_").with_directory("/tmp")]);

        let first = sequencer.start(&plan, Path::new("/global"), &mut port).unwrap();
        let (summary, _) = drive(&mut sequencer, first, &mut port);
        assert_eq!(port.extract_calls, 3);
        assert_eq!(summary.skipped, 0);
        assert_eq!(port.written.len(), 1);
    }

    #[test]
    fn test_configuration_failure_aborts() {
        let mut sequencer = MacroSequencer::default();
        let mut port = FakePort {
            reject_settings: true,
            ..Default::default()
        };

        let directive = sequencer.start(&two_step_plan(), Path::new("/global"), &mut port).unwrap();
        match directive {
            Directive::Finished(summary) => {
                assert!(matches!(summary.outcome, MacroOutcome::Aborted(_)));
                assert_eq!(summary.completed, 0);
            }
            other => panic!("expected abort, got {:?}", other),
        }
        assert!(!sequencer.is_running());
        assert_eq!(port.extract_calls, 0);
    }

    #[test]
    fn test_persist_failure_does_not_consume_counter() {
        let mut sequencer = MacroSequencer::default();
        let mut port = FakePort {
            fail_persist: true,
            ..Default::default()
        };
        let plan = MacroPlan::new(vec![MacroStep::new(1, 1000, 100, "p_").with_directory("/tmp")]);

        let first = sequencer.start(&plan, Path::new("/global"), &mut port).unwrap();
        let Directive::Schedule { ticket, .. } = first else {
            panic!("expected a scheduled extraction");
        };
        let directive = sequencer.on_wake(ticket, &mut port);
        let Directive::Finished(summary) = directive else {
            panic!("expected the run to finish");
        };
        assert_eq!((summary.completed, summary.skipped), (1, 1));
        assert!(summary.saved.is_empty());
    }

    #[test]
    fn test_empty_plan_finishes_immediately() {
        let mut sequencer = MacroSequencer::default();
        let mut port = FakePort::default();

        let directive = sequencer.start(&MacroPlan::default(), Path::new("/global"), &mut port).unwrap();
        match directive {
            Directive::Finished(summary) => {
                assert_eq!(summary.outcome, MacroOutcome::Completed);
                assert_eq!((summary.completed, summary.total), (0, 0));
            }
            other => panic!("expected immediate finish, got {:?}", other),
        }
        assert_eq!(sequencer.phase(), MacroPhase::Idle);
    }

    #[test]
    fn test_second_start_rejected_while_running() {
        let mut sequencer = MacroSequencer::default();
        let mut port = FakePort::default();

        sequencer.start(&two_step_plan(), Path::new("/global"), &mut port).unwrap();
        assert!(matches!(
            sequencer.start(&two_step_plan(), Path::new("/global"), &mut port),
            Err(MacroError::AlreadyRunning)
        ));
    }

    #[test]
    fn test_stale_ticket_ignored() {
        let mut sequencer = MacroSequencer::default();
        let mut port = FakePort::default();

        let Directive::Schedule { ticket: old, .. } =
            sequencer.start(&two_step_plan(), Path::new("/global"), &mut port).unwrap()
        else {
            panic!("expected a scheduled extraction");
        };
        sequencer.abort("user request").unwrap();

        sequencer.start(&two_step_plan(), Path::new("/global"), &mut port).unwrap();
        assert_eq!(sequencer.on_wake(old, &mut port), Directive::Idle);
        assert_eq!(port.extract_calls, 0);
        assert_eq!(sequencer.progress().unwrap().phase, MacroPhase::AwaitingCapture);
    }

    #[test]
    fn test_cancel_token_observed_on_wake() {
        let mut sequencer = MacroSequencer::default();
        let mut port = FakePort::default();

        let Directive::Schedule { ticket, .. } =
            sequencer.start(&two_step_plan(), Path::new("/global"), &mut port).unwrap()
        else {
            panic!("expected a scheduled extraction");
        };
        sequencer.cancel_token().unwrap().cancel();

        let Directive::Finished(summary) = sequencer.on_wake(ticket, &mut port) else {
            panic!("expected the run to finish");
        };
        assert_eq!(summary.outcome, MacroOutcome::Cancelled);
        assert_eq!(port.extract_calls, 0);
    }

    #[test]
    fn test_cancel_finishes_run() {
        let mut sequencer = MacroSequencer::default();
        let mut port = FakePort::default();
        assert!(sequencer.cancel().is_none());

        sequencer.start(&two_step_plan(), Path::new("/global"), &mut port).unwrap();
        let summary = sequencer.cancel().unwrap();
        assert_eq!(summary.outcome, MacroOutcome::Cancelled);
        assert_eq!(summary.completed, 0);
        assert!(!sequencer.is_running());
    }

    #[test]
    fn test_closed_session_aborts_on_wake() {
        let mut sequencer = MacroSequencer::default();
        let mut port = FakePort::default();

        let Directive::Schedule { ticket, .. } =
            sequencer.start(&two_step_plan(), Path::new("/global"), &mut port).unwrap()
        else {
            panic!("expected a scheduled extraction");
        };
        port.closed = true;

        let Directive::Finished(summary) = sequencer.on_wake(ticket, &mut port) else {
            panic!("expected the run to finish");
        };
        assert!(matches!(summary.outcome, MacroOutcome::Aborted(_)));
    }

    #[test]
    fn test_progress_snapshot() {
        let mut sequencer = MacroSequencer::default();
        let mut port = FakePort {
            trigger: Some(TriggerPath::Snap),
            ..Default::default()
        };
        assert!(sequencer.progress().is_none());

        sequencer.start(&two_step_plan(), Path::new("/global"), &mut port).unwrap();
        let progress = sequencer.progress().unwrap();
        assert_eq!(progress.step_index, 0);
        assert_eq!(progress.total, 3);
        assert_eq!(progress.completed, 0);
    }
}
