use photsat_bridge::{
    AppEvent, AppSettings, CameraController, ControlId, ControllerError, ControllerHandle, ControlSurface,
    HeadlessControls, PhotsatEvent, ProgressKind,
};
use photsat_imaging::fits::read_fits;
use photsat_native::{CameraDriver, DeviceEvent, NativeError, SimulatedCameraModel, SimulatedDriver, SimulatorControl};
use photsat_sequencer::{MacroOutcome, MacroPlan, MacroStep, MacroSummary};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Rig {
    handle: ControllerHandle,
    sim: SimulatorControl,
    controls: HeadlessControls,
    events: broadcast::Receiver<PhotsatEvent>,
    _dir: tempfile::TempDir,
    dir: std::path::PathBuf,
}

async fn rig_with(model: SimulatedCameraModel) -> Rig {
    rig_configured(model, |_| {}).await
}

async fn rig_configured(model: SimulatedCameraModel, configure: impl FnOnce(&mut AppSettings)) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = AppSettings {
        output_directory: dir.path().to_path_buf(),
        ..Default::default()
    };
    configure(&mut settings);
    let driver = Arc::new(SimulatedDriver::new(model));
    let sim = driver.control();
    let controls = HeadlessControls::new();
    let (handle, _task) = CameraController::spawn(
        driver as Arc<dyn CameraDriver>,
        settings,
        Box::new(controls.clone()),
    );
    let events = handle.subscribe();
    handle.open_camera(None).await.unwrap();
    Rig {
        handle,
        sim,
        controls,
        events,
        dir: dir.path().to_path_buf(),
        _dir: dir,
    }
}

async fn rig() -> Rig {
    rig_with(SimulatedCameraModel::default()).await
}

async fn wait_for<T>(
    events: &mut broadcast::Receiver<PhotsatEvent>,
    mut select: impl FnMut(&AppEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            let event = events.recv().await.unwrap();
            if let Some(found) = select(&event.payload) {
                return found;
            }
        }
    })
    .await
    .unwrap()
}

async fn macro_finished(events: &mut broadcast::Receiver<PhotsatEvent>) -> MacroSummary {
    wait_for(events, |event| match event {
        AppEvent::MacroFinished(summary) => Some(summary.clone()),
        _ => None,
    })
    .await
}

async fn camera_closed(events: &mut broadcast::Receiver<PhotsatEvent>) -> Option<String> {
    wait_for(events, |event| match event {
        AppEvent::CameraClosed { reason, .. } => Some(reason.clone()),
        _ => None,
    })
    .await
}

async fn file_saved(events: &mut broadcast::Receiver<PhotsatEvent>, path: &Path) {
    wait_for(events, |event| match event {
        AppEvent::FileSaved { path: saved } if saved == path => Some(()),
        _ => None,
    })
    .await
}

async fn burst_progress(events: &mut broadcast::Receiver<PhotsatEvent>, done: u32) {
    wait_for(events, |event| match event {
        AppEvent::Progress {
            kind: ProgressKind::Burst,
            completed,
            ..
        } if *completed == done => Some(()),
        _ => None,
    })
    .await
}

fn still_model() -> SimulatedCameraModel {
    SimulatedCameraModel {
        still_resolutions: 1,
        ..Default::default()
    }
}

fn two_step_plan() -> MacroPlan {
    MacroPlan::new(vec![
        MacroStep::new(2, 1000, 100, "a_"),
        MacroStep::new(1, 2000, 150, "b_"),
    ])
}

#[tokio::test(start_paused = true)]
async fn test_macro_run_writes_numbered_files() {
    let mut rig = rig().await;

    assert_eq!(rig.handle.start_macro(two_step_plan()).await.unwrap(), 3);
    let summary = macro_finished(&mut rig.events).await;

    assert_eq!(summary.outcome, MacroOutcome::Completed);
    assert_eq!((summary.completed, summary.skipped), (3, 0));
    assert_eq!(
        summary.saved,
        vec![rig.dir.join("a_1.fits"), rig.dir.join("a_2.fits"), rig.dir.join("b_3.fits")]
    );

    let (image, header) = read_fits(&rig.dir.join("b_3.fits")).unwrap();
    assert_eq!((image.width(), image.height()), (30, 4));
    assert_eq!(header.get_int("GAIN"), Some(150));
    assert!((header.get_float("EXPTIME").unwrap() - 0.002).abs() < 1e-12);
    assert_eq!(header.get_int("BITDEPTH"), Some(12));
    assert_eq!(header.get_string("CAMERA"), Some("Simulated CMOS"));

    assert_eq!(rig.sim.call_count("Trigger(1)"), 3);
    assert_eq!(rig.sim.exposure_us(), 2000);
    assert_eq!(rig.controls.value(ControlId::Gain), 150);
}

#[tokio::test(start_paused = true)]
async fn test_macro_progress_reported() {
    let mut rig = rig().await;
    rig.handle.start_macro(two_step_plan()).await.unwrap();

    let mut progress = Vec::new();
    while progress.last() != Some(&(3, 3)) {
        let step = wait_for(&mut rig.events, |event| match event {
            AppEvent::Progress {
                kind: ProgressKind::Macro,
                completed,
                total,
            } => Some((*completed, *total)),
            _ => None,
        })
        .await;
        progress.push(step);
    }
    assert_eq!(progress, vec![(0, 3), (1, 3), (2, 3), (3, 3)]);
}

#[tokio::test(start_paused = true)]
async fn test_macro_skips_capture_after_retries() {
    let mut rig = rig().await;
    rig.sim.set_always_pending(true);

    rig.handle
        .start_macro(MacroPlan::new(vec![MacroStep::new(1, 1000, 100, "p_")]))
        .await
        .unwrap();
    let summary = macro_finished(&mut rig.events).await;

    assert_eq!(summary.outcome, MacroOutcome::Completed);
    assert_eq!((summary.completed, summary.skipped), (1, 1));
    assert!(summary.saved.is_empty());
    assert!(!rig.dir.join("p_1.fits").exists());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_aborts_macro_and_closes_camera() {
    let mut rig = rig().await;
    rig.handle.start_macro(two_step_plan()).await.unwrap();
    rig.sim.emit(DeviceEvent::Disconnected);

    let summary = macro_finished(&mut rig.events).await;
    assert!(matches!(summary.outcome, MacroOutcome::Aborted(_)));

    let reason = wait_for(&mut rig.events, |event| match event {
        AppEvent::CameraClosed { reason, .. } => Some(reason.clone()),
        _ => None,
    })
    .await;
    assert_eq!(reason.as_deref(), Some("Camera disconnect."));
    assert!(rig.sim.is_closed());
    assert!(matches!(rig.handle.snap().await, Err(ControllerError::NoCamera)));
}

#[tokio::test(start_paused = true)]
async fn test_abort_macro_by_user() {
    let mut rig = rig().await;
    rig.handle.start_macro(two_step_plan()).await.unwrap();
    rig.handle.abort_macro().await.unwrap();

    let summary = macro_finished(&mut rig.events).await;
    assert_eq!(summary.outcome, MacroOutcome::Cancelled);
    assert!(!rig.dir.join("a_1.fits").exists());
}

#[tokio::test(start_paused = true)]
async fn test_snap_saves_latest_live_frame() {
    let rig = rig().await;
    rig.sim.push_live_frame();
    rig.handle.snap().await.unwrap();

    for ext in ["jpg", "raw", "fits"] {
        assert!(rig.dir.join(format!("capture_1.{}", ext)).exists(), "missing {}", ext);
    }
    let raw = std::fs::read(rig.dir.join("capture_1.raw")).unwrap();
    assert_eq!(raw.len(), 60 * 4);
    assert_eq!(rig.handle.inspect_pixel(1, 0).await.unwrap(), Some(8));
}

#[tokio::test(start_paused = true)]
async fn test_snap_in_still_mode() {
    let model = SimulatedCameraModel {
        still_resolutions: 1,
        ..Default::default()
    };
    let mut rig = rig_with(model).await;
    rig.handle.snap().await.unwrap();

    let mut saved = Vec::new();
    while saved.len() < 3 {
        let path = wait_for(&mut rig.events, |event| match event {
            AppEvent::FileSaved { path } => Some(path.clone()),
            _ => None,
        })
        .await;
        saved.push(path);
    }
    assert_eq!(rig.sim.call_count("Snap(0)"), 1);
    assert!(saved.contains(&rig.dir.join("capture_1.fits")));
}

#[tokio::test(start_paused = true)]
async fn test_burst_saves_each_capture() {
    let mut rig = rig().await;
    rig.sim.push_live_frame();
    rig.handle.burst(3).await.unwrap();

    wait_for(&mut rig.events, |event| match event {
        AppEvent::Progress {
            kind: ProgressKind::Burst,
            completed: 3,
            total: 3,
        } => Some(()),
        _ => None,
    })
    .await;
    for n in 1..=3 {
        assert!(rig.dir.join(format!("capture_{}.fits", n)).exists());
    }
    assert!(matches!(rig.handle.burst(0).await, Err(ControllerError::InvalidParameter(_))));
}

#[tokio::test(start_paused = true)]
async fn test_exposure_events_respect_focus() {
    let rig = rig().await;
    rig.handle.set_auto_exposure(true).await.unwrap();
    rig.controls.set_focus(ControlId::ExposureTime, true);

    rig.sim.auto_adjust(25_000, 400);
    rig.handle.inspect_pixel(0, 0).await.unwrap();

    assert_eq!(rig.controls.value(ControlId::ExposureTime), 10_000);
    assert_eq!(rig.controls.value(ControlId::Gain), 400);
    assert_eq!(rig.controls.notifications(ControlId::ExposureTime), 0);
    assert_eq!(rig.controls.notifications(ControlId::Gain), 0);

    // Edits are ignored while auto exposure is on
    rig.handle.edit_exposure(5000).await.unwrap();
    assert_eq!(rig.sim.exposure_us(), 25_000);

    rig.handle.set_auto_exposure(false).await.unwrap();
    rig.handle.edit_exposure(5000).await.unwrap();
    assert_eq!(rig.sim.exposure_us(), 5000);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_gain_reverts_control() {
    let rig = rig().await;
    rig.handle.edit_gain(300).await.unwrap();
    rig.sim.fail_settings(true);

    assert!(rig.handle.edit_gain(400).await.is_err());
    assert_eq!(rig.controls.value(ControlId::Gain), 300);
    assert_eq!(rig.sim.gain(), 300);
}

#[tokio::test(start_paused = true)]
async fn test_second_open_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let settings = AppSettings {
        output_directory: dir.path().to_path_buf(),
        ..Default::default()
    };
    let driver: Arc<dyn CameraDriver> = Arc::new(SimulatedDriver::new(SimulatedCameraModel::default()));
    let (first, _) = CameraController::spawn(Arc::clone(&driver), settings.clone(), Box::new(HeadlessControls::new()));
    let (second, _) = CameraController::spawn(driver, settings, Box::new(HeadlessControls::new()));

    first.open_camera(None).await.unwrap();
    assert!(matches!(
        first.open_camera(None).await,
        Err(ControllerError::Native(NativeError::AlreadyOpen))
    ));
    assert!(matches!(
        second.open_camera(None).await,
        Err(ControllerError::Native(NativeError::AlreadyOpen))
    ));

    first.close_camera().await.unwrap();
    second.open_camera(Some("sim-0".to_string())).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_status_poll_reports_temperature() {
    let mut rig = rig().await;
    let status = wait_for(&mut rig.events, |event| match event {
        AppEvent::Status(status) => Some(status.clone()),
        _ => None,
    })
    .await;
    assert_eq!(status.temperature_c, Some(21.5));
    assert!((status.exposure_secs - 0.01).abs() < 1e-12);
    assert_eq!(status.clock_ms, 1000);
}

#[tokio::test(start_paused = true)]
async fn test_resolution_switch_restarts_camera() {
    let rig = rig().await;
    let resolution = rig.handle.set_resolution(1).await.unwrap();
    assert_eq!((resolution.width, resolution.height), (15, 2));
    assert_eq!(rig.sim.resolution_index(), 1);
    assert!(rig.sim.is_running());

    rig.sim.push_live_frame();
    rig.handle.snap().await.unwrap();
    let (image, _) = read_fits(&rig.dir.join("capture_1.fits")).unwrap();
    assert_eq!((image.width(), image.height()), (15, 2));
    assert!(Path::new(&rig.dir).join("capture_1.jpg").exists());
}

#[tokio::test(start_paused = true)]
async fn test_fatal_event_survives_full_event_channel() {
    let mut rig = rig_configured(SimulatedCameraModel::default(), |s| s.event_channel_capacity = 1).await;
    rig.handle.start_macro(two_step_plan()).await.unwrap();

    for _ in 0..64 {
        rig.sim.push_live_frame();
    }
    rig.sim.emit(DeviceEvent::Disconnected);

    let summary = macro_finished(&mut rig.events).await;
    assert!(matches!(summary.outcome, MacroOutcome::Aborted(_)));
    assert_eq!(camera_closed(&mut rig.events).await.as_deref(), Some("Camera disconnect."));
    assert!(rig.sim.is_closed());
    assert!(!rig.controls.is_enabled());
    assert!(matches!(rig.handle.snap().await, Err(ControllerError::NoCamera)));
}

#[tokio::test(start_paused = true)]
async fn test_capture_operations_are_exclusive() {
    let mut rig = rig().await;
    rig.sim.push_live_frame();
    rig.handle.burst(3).await.unwrap();

    assert!(matches!(rig.handle.start_macro(two_step_plan()).await, Err(ControllerError::Busy(_))));
    assert!(matches!(rig.handle.snap().await, Err(ControllerError::Busy(_))));
    assert!(matches!(rig.handle.burst(2).await, Err(ControllerError::Busy(_))));
    burst_progress(&mut rig.events, 3).await;

    rig.handle.start_macro(two_step_plan()).await.unwrap();
    assert!(matches!(rig.handle.burst(2).await, Err(ControllerError::Busy(_))));
    assert!(matches!(rig.handle.snap().await, Err(ControllerError::Busy(_))));
    assert!(matches!(rig.handle.set_resolution(1).await, Err(ControllerError::Busy(_))));
    let summary = macro_finished(&mut rig.events).await;
    assert_eq!(summary.completed, 3);

    rig.handle.snap().await.unwrap();
    assert!(rig.dir.join("capture_4.fits").exists());
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_still_snaps_are_all_saved() {
    let mut rig = rig_with(still_model()).await;
    rig.sim.hold_stills(true);
    rig.handle.snap().await.unwrap();
    rig.handle.snap().await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!rig.dir.join("capture_1.fits").exists());

    assert!(rig.sim.release_still());
    file_saved(&mut rig.events, &rig.dir.join("capture_1.fits")).await;
    assert!(rig.sim.release_still());
    file_saved(&mut rig.events, &rig.dir.join("capture_2.fits")).await;
    assert_eq!(rig.sim.call_count("Snap(0)"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_burst_progress_counts_saved_images() {
    let mut rig = rig_with(still_model()).await;
    rig.sim.hold_stills(true);
    rig.handle.burst(2).await.unwrap();

    // Spacing is 10 ms exposure plus 100 ms margin
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!rig.dir.join("capture_1.fits").exists());
    assert!(rig.sim.release_still());
    burst_progress(&mut rig.events, 1).await;
    assert!(rig.dir.join("capture_1.fits").exists());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.sim.call_count("Snap(0)"), 2);
    assert!(rig.sim.release_still());
    burst_progress(&mut rig.events, 2).await;
    assert!(rig.dir.join("capture_2.fits").exists());

    rig.handle.start_macro(two_step_plan()).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_restart_closes_camera() {
    let mut rig = rig().await;
    rig.sim.fail_configure(true);

    assert!(rig.handle.set_resolution(1).await.is_err());
    assert_eq!(camera_closed(&mut rig.events).await.as_deref(), Some("Failed to start camera."));
    assert!(rig.sim.is_closed());
    assert!(!rig.controls.is_enabled());
    assert!(matches!(rig.handle.snap().await, Err(ControllerError::NoCamera)));

    rig.sim.fail_configure(false);
    rig.handle.open_camera(None).await.unwrap();
    assert!(rig.sim.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_overflowing_plan_rejected() {
    let rig = rig().await;
    let plan = MacroPlan::new(vec![
        MacroStep::new(u32::MAX, 1000, 100, "a_"),
        MacroStep::new(1, 1000, 100, "b_"),
    ]);
    assert!(matches!(rig.handle.start_macro(plan).await, Err(ControllerError::Macro(_))));

    rig.sim.push_live_frame();
    rig.handle.snap().await.unwrap();
    assert!(rig.dir.join("capture_1.fits").exists());
}
