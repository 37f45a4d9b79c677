//! Timed collection binary, records a finite movie at a fixed interval.
use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use microcam::{
    components::prelude::*,
    devices::{
        hardware::camera::{CommandChannel, ProcessUpdater, Updater},
        simulated::{SimulatedGrabber, SimulatedUpdater},
        software::parameters::{ParameterRegistry, RegistrySnapshot},
    },
    logging,
};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{error, info, warn};

type Camera = AcquisitionController<SimulatedGrabber, Box<dyn Updater + Send>>;

/// Arguments required for starting the program from the command line.
#[derive(Parser, Debug)]
struct Args {
    /// Path to the controller config file, defaults are used without one.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Answer commands with the simulated head instead of the updater.
    #[arg(long)]
    simulate: bool,
    /// Number of movies to collect.
    #[arg(short, long, default_value_t = 10)]
    movies: u32,
    /// Frames per movie.
    #[arg(short, long, default_value_t = 100)]
    frames: u64,
    /// Seconds between the start of consecutive movies.
    #[arg(short, long, default_value_t = 60)]
    interval: u64,
    /// Parent directory of the per movie export directories.
    #[arg(short, long)]
    output: PathBuf,
}

fn build_camera(args: &Args) -> Result<Camera> {
    let config = match &args.config {
        Some(path) => CameraControlConfig::from_file(path)
            .with_context(|| format!("failed to read config {path:?}"))?,
        None => CameraControlConfig::default(),
    };
    let updater: Box<dyn Updater + Send> = if args.simulate {
        Box::new(SimulatedUpdater::new())
    } else {
        Box::new(ProcessUpdater::new(
            &config.updater.program,
            config.updater.args.clone(),
        ))
    };
    let mut registry = ParameterRegistry::defaults();
    if let Some(path) = config.parameter_file.as_ref().filter(|p| p.is_file()) {
        registry.restore(RegistrySnapshot::load(path)?);
    }
    let channel = CommandChannel::new(updater, &config.updater.command_file);
    let mut camera = AcquisitionController::new(SimulatedGrabber::new(), channel, registry, &config);
    camera.set_autosave(Some(args.output.clone()));
    Ok(camera)
}

/// One movie, blocking until the finite target is reached.
fn collect(camera: &mut Camera, frames: u64) -> microcam::Result<Option<ExportSummary>> {
    camera.grab(frames)?;
    camera.run()
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("microcam=info");
    let args = Args::parse();
    if args.frames == 0 {
        anyhow::bail!("a timed collection needs a finite frame count");
    }
    let mut camera = build_camera(&args)?;
    camera.initialise()?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let stop = camera.stop_signal();
    let flag = interrupted.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag.store(true, Ordering::SeqCst);
            stop.store(true, Ordering::SeqCst);
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval));
    for movie in 1..=args.movies {
        ticker.tick().await;
        if interrupted.load(Ordering::SeqCst) {
            info!("interrupted, stopping collection");
            break;
        }
        info!(movie, started = %Local::now().format("%H:%M:%S"), "collecting");
        let frames = args.frames;
        let (returned, result) = tokio::task::spawn_blocking(move || {
            let result = collect(&mut camera, frames);
            (camera, result)
        })
        .await?;
        camera = returned;
        match result {
            Ok(Some(summary)) => {
                info!(movie, dest = ?summary.dest, frames = summary.frames(), "movie saved")
            }
            Ok(None) => warn!(movie, "movie ended without frames"),
            Err(e) if e.is_recoverable() => warn!(movie, "movie skipped: {e}"),
            Err(e) => error!(movie, "movie failed: {e}"),
        }
    }

    camera.cleanup()?;
    Ok(())
}
