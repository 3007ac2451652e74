//! Headless capture front end
//!
//! Opens a camera, then runs a macro plan, a burst or a single snap and
//! exits once the work is done.

use anyhow::{bail, Context};
use clap::Parser;
use photsat_bridge::{
    init_logging, AppEvent, AppSettings, CameraController, ControllerHandle, EventSeverity, HeadlessControls,
};
use photsat_native::vendor::{NncamDriver, SimulatedCameraModel, SimulatedDriver};
use photsat_native::CameraDriver;
use photsat_sequencer::{MacroOutcome, MacroPlan};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// Interval between frames delivered by the simulated camera
const SIMULATED_FRAME_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(name = "photsat", version, about = "Astronomy CMOS capture")]
struct Args {
    /// Settings file (JSON); defaults are used when it does not exist
    #[arg(long, default_value = "photsat.json")]
    settings: PathBuf,

    /// Macro plan to run (.csv or .json)
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Number of captures to take as a burst
    #[arg(long, conflicts_with = "plan")]
    burst: Option<u32>,

    /// Output directory, overriding the settings file
    #[arg(long)]
    output: Option<PathBuf>,

    /// Camera id; the first camera found when omitted
    #[arg(long)]
    device: Option<String>,

    /// Use the simulated camera instead of the nncam SDK
    #[arg(long)]
    simulate: bool,

    /// Also write daily log files into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_dir.as_deref())?;

    let mut settings = AppSettings::load(&args.settings)?;
    if let Some(output) = &args.output {
        settings.output_directory = output.clone();
    }

    let plan = match &args.plan {
        Some(path) => Some(MacroPlan::load(path).with_context(|| format!("loading plan {}", path.display()))?),
        None => None,
    };

    let formats = settings.save_formats;
    let files_per_capture = [formats.fits, formats.preview, formats.raw].iter().filter(|on| **on).count();

    let (driver, simulated) = if args.simulate {
        let driver = Arc::new(SimulatedDriver::new(SimulatedCameraModel::default()));
        (driver.clone() as Arc<dyn CameraDriver>, Some(driver))
    } else {
        if !NncamDriver::is_available() {
            bail!("nncam SDK library not found; use --simulate to run without a camera");
        }
        (Arc::new(NncamDriver::new()) as Arc<dyn CameraDriver>, None)
    };

    let (handle, task) = CameraController::spawn(driver, settings, Box::new(HeadlessControls::new()));
    let mut events = handle.subscribe();

    let descriptor = handle.open_camera(args.device.clone()).await?;
    tracing::info!("Using camera '{}' ({})", descriptor.display_name, descriptor.id);

    if let Some(driver) = simulated {
        let sim = driver.control();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SIMULATED_FRAME_INTERVAL);
            loop {
                interval.tick().await;
                sim.push_live_frame();
            }
        });
    }

    let result = run(&handle, &mut events, plan, args.burst, files_per_capture).await;

    handle.shutdown().await.ok();
    task.await.ok();
    result
}

async fn run(
    handle: &ControllerHandle,
    events: &mut tokio::sync::broadcast::Receiver<photsat_bridge::PhotsatEvent>,
    plan: Option<MacroPlan>,
    burst: Option<u32>,
    files_per_capture: usize,
) -> anyhow::Result<()> {
    if let Some(plan) = plan {
        let total = handle.start_macro(plan).await?;
        tracing::info!("Macro started with {} captures", total);
        return match wait_for(events, |event| match event {
            AppEvent::MacroFinished(summary) => Some(summary.clone()),
            _ => None,
        })
        .await?
        {
            summary if summary.outcome == MacroOutcome::Completed => {
                println!(
                    "Macro completed: {} captures, {} saved, {} skipped",
                    summary.completed,
                    summary.saved.len(),
                    summary.skipped
                );
                Ok(())
            }
            summary => bail!("Macro did not complete: {:?}", summary.outcome),
        };
    }

    let count = burst.unwrap_or(1);
    let expected = count as usize * files_per_capture;
    if count == 1 {
        handle.snap().await?;
    } else {
        handle.burst(count).await?;
    }

    let mut saved = 0usize;
    while saved < expected {
        let path = wait_for(events, |event| match event {
            AppEvent::FileSaved { path } => Some(path.clone()),
            _ => None,
        })
        .await?;
        println!("Saved {}", path.display());
        saved += 1;
    }
    Ok(())
}

/// Wait for the first event `select` accepts, failing on camera loss
async fn wait_for<T>(
    events: &mut tokio::sync::broadcast::Receiver<photsat_bridge::PhotsatEvent>,
    mut select: impl FnMut(&AppEvent) -> Option<T>,
) -> anyhow::Result<T> {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Missed {} events", skipped);
                continue;
            }
            Err(RecvError::Closed) => bail!("controller stopped"),
        };
        if let Some(found) = select(&event.payload) {
            return Ok(found);
        }
        match &event.payload {
            AppEvent::Progress { completed, total, .. } => tracing::info!("Progress {}/{}", completed, total),
            AppEvent::CameraClosed { reason, .. } => bail!("camera closed: {}", reason.as_deref().unwrap_or("unknown")),
            AppEvent::Notice { severity: EventSeverity::Warning | EventSeverity::Error, message } => {
                eprintln!("{}", message)
            }
            _ => {}
        }
    }
}
