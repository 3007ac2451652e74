//! Camera controller task
//!
//! A single tokio task owns the camera, the macro sequencer, the burst state
//! and all timers. Device events, user commands and timer expiries are
//! handled one at a time from one `select!` loop, so no handler ever runs
//! concurrently with another. A macro run, a burst and a single snap are
//! mutually exclusive on the open camera. `ControllerHandle` is the
//! cloneable front.

use crate::capture::CaptureRig;
use crate::config::AppSettings;
use crate::controls::ControlSurface;
use crate::error::{ControllerError, ControllerResult};
use crate::event::{AppEvent, EventBus, EventSeverity, PhotsatEvent, ProgressKind, SharedEventBus};
use crate::timers::TimerQueue;
use photsat_imaging::SaveFormats;
use photsat_native::{CameraDriver, DeviceDescriptor, DeviceMessage, FatalLatch, Resolution};
use photsat_sequencer::{Directive, MacroError, MacroPlan, MacroSequencer, MacroTicket};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Capacity of the command channel
const COMMAND_CHANNEL_CAPACITY: usize = 32;

type Reply<T> = oneshot::Sender<ControllerResult<T>>;

/// Requests accepted by the controller task
#[derive(Debug)]
pub enum Command {
    OpenCamera { device_id: Option<String>, reply: Reply<DeviceDescriptor> },
    CloseCamera { reply: Reply<()> },
    SetResolution { index: u32, reply: Reply<Resolution> },
    SetAutoExposure { enabled: bool, reply: Reply<()> },
    /// Exposure time typed by the user, in microseconds
    EditExposure { micros: u32, reply: Reply<()> },
    EditGain { percent: u16, reply: Reply<()> },
    SetOutputDirectory(PathBuf),
    SetFilePrefix(String),
    SetSaveFormats(SaveFormats),
    Snap { reply: Reply<()> },
    Burst { count: u32, reply: Reply<()> },
    /// Replies with the total number of captures
    StartMacro { plan: MacroPlan, reply: Reply<u32> },
    AbortMacro,
    InspectPixel { x: u32, y: u32, reply: oneshot::Sender<Option<u16>> },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Macro(MacroTicket),
    Burst { session: u64 },
    StatusPoll { session: u64 },
}

#[derive(Debug)]
struct BurstState {
    session: u64,
    total: u32,
    /// Snaps issued so far
    requested: u32,
    saved: u32,
    failed: u32,
}

impl BurstState {
    fn is_settled(&self) -> bool {
        self.saved + self.failed >= self.total
    }
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cloneable handle for talking to the controller task
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    events: SharedEventBus,
}

impl ControllerHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> ControllerResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ControllerError::ControllerGone)?;
        response.await.map_err(|_| ControllerError::ControllerGone)?
    }

    async fn send(&self, command: Command) -> ControllerResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ControllerError::ControllerGone)
    }

    /// Open a camera by id, or the first one found
    pub async fn open_camera(&self, device_id: Option<String>) -> ControllerResult<DeviceDescriptor> {
        self.request(|reply| Command::OpenCamera { device_id, reply }).await
    }

    pub async fn close_camera(&self) -> ControllerResult<()> {
        self.request(|reply| Command::CloseCamera { reply }).await
    }

    pub async fn set_resolution(&self, index: u32) -> ControllerResult<Resolution> {
        self.request(|reply| Command::SetResolution { index, reply }).await
    }

    pub async fn set_auto_exposure(&self, enabled: bool) -> ControllerResult<()> {
        self.request(|reply| Command::SetAutoExposure { enabled, reply }).await
    }

    pub async fn edit_exposure(&self, micros: u32) -> ControllerResult<()> {
        self.request(|reply| Command::EditExposure { micros, reply }).await
    }

    pub async fn edit_gain(&self, percent: u16) -> ControllerResult<()> {
        self.request(|reply| Command::EditGain { percent, reply }).await
    }

    pub async fn set_output_directory(&self, directory: impl Into<PathBuf>) -> ControllerResult<()> {
        self.send(Command::SetOutputDirectory(directory.into())).await
    }

    pub async fn set_file_prefix(&self, prefix: impl Into<String>) -> ControllerResult<()> {
        self.send(Command::SetFilePrefix(prefix.into())).await
    }

    pub async fn set_save_formats(&self, formats: SaveFormats) -> ControllerResult<()> {
        self.send(Command::SetSaveFormats(formats)).await
    }

    pub async fn snap(&self) -> ControllerResult<()> {
        self.request(|reply| Command::Snap { reply }).await
    }

    /// Capture `count` images spaced by the exposure time plus a margin
    pub async fn burst(&self, count: u32) -> ControllerResult<()> {
        self.request(|reply| Command::Burst { count, reply }).await
    }

    /// Start a macro run. Completion is reported as `AppEvent::MacroFinished`.
    pub async fn start_macro(&self, plan: MacroPlan) -> ControllerResult<u32> {
        self.request(|reply| Command::StartMacro { plan, reply }).await
    }

    pub async fn abort_macro(&self) -> ControllerResult<()> {
        self.send(Command::AbortMacro).await
    }

    /// Value of the latest frame at (x, y)
    pub async fn inspect_pixel(&self, x: u32, y: u32) -> ControllerResult<Option<u16>> {
        let (reply, response) = oneshot::channel();
        self.send(Command::InspectPixel { x, y, reply }).await?;
        response.await.map_err(|_| ControllerError::ControllerGone)
    }

    /// Close the camera and stop the task
    pub async fn shutdown(&self) -> ControllerResult<()> {
        self.send(Command::Shutdown).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PhotsatEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> SharedEventBus {
        Arc::clone(&self.events)
    }
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// Owner of the camera and everything scheduled against it
pub struct CameraController {
    rig: CaptureRig,
    sequencer: MacroSequencer,
    burst: Option<BurstState>,
    timers: TimerQueue<TimerKind>,
    commands: mpsc::Receiver<Command>,
    device_rx: mpsc::Receiver<DeviceMessage>,
    fatal: Arc<FatalLatch>,
}

impl CameraController {
    /// # Arguments
    /// * `driver` - Driver used to enumerate and open cameras
    /// * `settings` - Output, timing and channel settings
    /// * `controls` - Exposure controls the controller keeps in sync
    pub fn new(
        driver: Arc<dyn CameraDriver>,
        settings: AppSettings,
        controls: Box<dyn ControlSurface>,
    ) -> (Self, ControllerHandle) {
        let events: SharedEventBus = Arc::new(EventBus::new(settings.event_bus_capacity.max(1)));
        let (command_tx, commands) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (device_tx, device_rx) = mpsc::channel(settings.event_channel_capacity.max(1));
        let fatal = Arc::new(FatalLatch::new());
        let sequencer = MacroSequencer::new(settings.macro_timing);

        let controller = Self {
            rig: CaptureRig::new(
                driver,
                settings,
                controls,
                Arc::clone(&events),
                device_tx,
                Arc::clone(&fatal),
            ),
            sequencer,
            burst: None,
            timers: TimerQueue::new(),
            commands,
            device_rx,
            fatal,
        };
        let handle = ControllerHandle {
            commands: command_tx,
            events,
        };
        (controller, handle)
    }

    /// Create the controller and run it on the current tokio runtime
    pub fn spawn(
        driver: Arc<dyn CameraDriver>,
        settings: AppSettings,
        controls: Box<dyn ControlSurface>,
    ) -> (ControllerHandle, JoinHandle<()>) {
        let (controller, handle) = Self::new(driver, settings, controls);
        (handle, tokio::spawn(controller.run()))
    }

    pub async fn run(mut self) {
        tracing::info!("Camera controller started");
        loop {
            let deadline = self.timers.next_deadline();
            // Fatal events that overflowed the channel come first, then device
            // events, so a command sees every event raised before it
            tokio::select! {
                biased;
                message = self.fatal.raised() => self.on_device_message(message),
                Some(message) = self.device_rx.recv() => self.on_device_message(message),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                _ = sleep_until(deadline) => self.on_timers_due(),
            }
        }
        self.close_camera(Some("controller shut down"));
        tracing::info!("Camera controller stopped");
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    fn on_command(&mut self, command: Command) {
        match command {
            Command::OpenCamera { device_id, reply } => {
                let result = self.open_camera(device_id.as_deref());
                let _ = reply.send(result);
            }
            Command::CloseCamera { reply } => {
                self.close_camera(None);
                let _ = reply.send(Ok(()));
            }
            Command::SetResolution { index, reply } => {
                let result = self.set_resolution(index);
                let _ = reply.send(result);
            }
            Command::SetAutoExposure { enabled, reply } => {
                let _ = reply.send(self.rig.set_auto_exposure(enabled));
            }
            Command::EditExposure { micros, reply } => {
                let _ = reply.send(self.rig.edit_exposure(micros));
            }
            Command::EditGain { percent, reply } => {
                let _ = reply.send(self.rig.edit_gain(percent));
            }
            Command::SetOutputDirectory(directory) => {
                tracing::info!("Output directory set to {}", directory.display());
                self.rig.settings.output_directory = directory;
            }
            Command::SetFilePrefix(prefix) => self.rig.settings.file_prefix = prefix,
            Command::SetSaveFormats(formats) => self.rig.settings.save_formats = formats,
            Command::Snap { reply } => {
                let result = self.ensure_idle().and_then(|()| self.rig.snap().map(|_| ()));
                if let Err(e) = &result {
                    self.rig.notify(EventSeverity::Warning, format!("Error capturing image: {}", e));
                }
                let _ = reply.send(result);
            }
            Command::Burst { count, reply } => {
                let _ = reply.send(self.start_burst(count));
            }
            Command::StartMacro { plan, reply } => {
                let _ = reply.send(self.start_macro(plan));
            }
            Command::AbortMacro => {
                if let Some(summary) = self.sequencer.cancel() {
                    self.rig.unbind_macro();
                    self.timers.retain(|kind| !matches!(kind, TimerKind::Macro(_)));
                    self.rig.publish(AppEvent::MacroFinished(summary));
                }
            }
            Command::InspectPixel { x, y, reply } => {
                let _ = reply.send(self.rig.inspect_pixel(x, y));
            }
            Command::Shutdown => {}
        }
    }

    fn open_camera(&mut self, device_id: Option<&str>) -> ControllerResult<DeviceDescriptor> {
        let descriptor = self.rig.open_camera(device_id)?;
        self.schedule_status_poll();
        Ok(descriptor)
    }

    /// Fails with `Busy` while a macro run or burst owns the camera
    fn ensure_idle(&self) -> ControllerResult<()> {
        if self.sequencer.is_running() {
            return Err(ControllerError::Busy("macro running".to_string()));
        }
        if self.burst.is_some() {
            return Err(ControllerError::Busy("burst running".to_string()));
        }
        Ok(())
    }

    fn set_resolution(&mut self, index: u32) -> ControllerResult<Resolution> {
        self.ensure_idle()?;
        let result = self.rig.set_resolution(index);
        if !self.rig.is_open() {
            self.close_camera(None);
        }
        result
    }

    /// Close the camera, ending any macro run or burst bound to it
    fn close_camera(&mut self, reason: Option<&str>) {
        if let Some(summary) = self.sequencer.abort("camera closed") {
            self.rig.publish(AppEvent::MacroFinished(summary));
        }
        self.rig.unbind_macro();
        self.burst = None;
        self.timers.clear();
        self.rig.close_camera(reason);
    }

    fn start_macro(&mut self, plan: MacroPlan) -> ControllerResult<u32> {
        if !self.rig.is_open() {
            return Err(ControllerError::NoCamera);
        }
        if self.sequencer.is_running() {
            return Err(MacroError::AlreadyRunning.into());
        }
        self.ensure_idle()?;
        if plan.is_empty() {
            self.rig.notify(EventSeverity::Warning, "No macro steps defined.");
        }

        let directory = self.rig.settings.output_directory.clone();
        self.sequencer.set_timing(self.rig.settings.macro_timing);
        self.rig.bind_macro();
        match self.sequencer.start(&plan, &directory, &mut self.rig) {
            Ok(directive) => {
                self.apply_directive(directive);
                Ok(plan.total_captures())
            }
            Err(e) => {
                self.rig.unbind_macro();
                Err(e.into())
            }
        }
    }

    fn apply_directive(&mut self, directive: Directive) {
        match directive {
            Directive::Schedule { after, ticket } => self.timers.schedule(after, TimerKind::Macro(ticket)),
            Directive::Finished(summary) => {
                self.rig.unbind_macro();
                self.rig.publish(AppEvent::MacroFinished(summary));
            }
            Directive::Idle => {}
        }
    }

    // =========================================================================
    // BURST
    // =========================================================================

    fn start_burst(&mut self, count: u32) -> ControllerResult<()> {
        if count == 0 {
            return Err(ControllerError::InvalidParameter("burst count must be positive".to_string()));
        }
        let session = self.rig.session_id().ok_or(ControllerError::NoCamera)?;
        self.ensure_idle()?;

        tracing::info!("Starting burst of {} captures", count);
        self.burst = Some(BurstState {
            session,
            total: count,
            requested: 0,
            saved: 0,
            failed: 0,
        });
        self.rig.publish(AppEvent::Progress {
            kind: ProgressKind::Burst,
            completed: 0,
            total: count,
        });
        self.burst_step();
        Ok(())
    }

    /// Issue the next snap, or end a burst whose snaps are all issued
    fn burst_step(&mut self) {
        let Some(burst) = self.burst.as_mut() else {
            return;
        };
        if burst.requested == burst.total {
            self.finish_burst();
            return;
        }
        burst.requested += 1;
        let session = burst.session;

        match self.rig.snap() {
            Ok(true) => self.on_snaps_saved(1),
            Ok(false) => {}
            Err(e) => {
                tracing::error!("Error during trigger capture: {}", e);
                self.rig.notify(EventSeverity::Warning, format!("Error capturing image: {}", e));
                if let Some(burst) = self.burst.as_mut() {
                    burst.failed += 1;
                }
                if self.burst.as_ref().is_some_and(BurstState::is_settled) {
                    self.finish_burst();
                }
            }
        }

        // After the last snap this wake bounds the wait for its image
        if self.burst.is_some() {
            let spacing = self
                .rig
                .settings
                .burst_timing
                .spacing(self.rig.manual_exposure().unwrap_or(0));
            self.timers.schedule(spacing, TimerKind::Burst { session });
        }
    }

    /// Count snap images written since the last call
    fn on_snaps_saved(&mut self, saved: u32) {
        let Some(burst) = self.burst.as_mut() else {
            return;
        };
        if saved == 0 {
            return;
        }
        burst.saved = (burst.saved + saved).min(burst.total);
        let (completed, total) = (burst.saved, burst.total);
        let settled = burst.is_settled();
        self.rig.publish(AppEvent::Progress {
            kind: ProgressKind::Burst,
            completed,
            total,
        });
        if settled {
            self.finish_burst();
        }
    }

    fn finish_burst(&mut self) {
        let Some(burst) = self.burst.take() else {
            return;
        };
        self.timers.retain(|kind| !matches!(kind, TimerKind::Burst { .. }));
        if burst.saved == burst.total {
            tracing::info!("Burst finished ({} captures)", burst.total);
        } else {
            self.rig.notify(
                EventSeverity::Warning,
                format!("Burst finished with {} of {} captures saved.", burst.saved, burst.total),
            );
        }
    }

    // =========================================================================
    // EVENTS AND TIMERS
    // =========================================================================

    fn on_device_message(&mut self, message: DeviceMessage) {
        if self.rig.session_id() != Some(message.session) {
            tracing::trace!("Dropping {:?} from closed session {}", message.event, message.session);
            return;
        }
        match message.event {
            photsat_native::DeviceEvent::Error => {
                self.close_camera(Some("Generic Error."));
                self.rig.notify(EventSeverity::Warning, "Generic Error.");
            }
            photsat_native::DeviceEvent::Disconnected => {
                self.close_camera(Some("Camera disconnect."));
                self.rig.notify(EventSeverity::Warning, "Camera disconnect.");
            }
            event => {
                let saved = self.rig.on_device_event(event);
                self.on_snaps_saved(saved);
            }
        }
    }

    fn on_timers_due(&mut self) {
        let now = Instant::now();
        while let Some(kind) = self.timers.pop_due(now) {
            self.on_timer(kind);
        }
    }

    fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Macro(ticket) => {
                let directive = self.sequencer.on_wake(ticket, &mut self.rig);
                self.apply_directive(directive);
            }
            TimerKind::Burst { session } => {
                if self.rig.session_id() == Some(session) {
                    self.burst_step();
                }
            }
            TimerKind::StatusPoll { session } => {
                if self.rig.session_id() != Some(session) {
                    return;
                }
                match self.rig.status() {
                    Ok(status) => self.rig.publish(AppEvent::Status(status)),
                    Err(e) => tracing::debug!("Status poll failed: {}", e),
                }
                self.schedule_status_poll();
            }
        }
    }

    fn schedule_status_poll(&mut self) {
        if let Some(session) = self.rig.session_id() {
            let interval = Duration::from_millis(self.rig.settings.status_poll_ms.max(1));
            self.timers.schedule(interval, TimerKind::StatusPoll { session });
        }
    }
}

/// Sleep until `deadline`, or forever when there is none
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
