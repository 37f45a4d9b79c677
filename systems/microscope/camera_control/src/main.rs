//! Camera control binary.
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use microcam::{
    components::prelude::*,
    devices::{
        hardware::camera::{CommandChannel, ProcessUpdater, Updater},
        simulated::{SimulatedGrabber, SimulatedUpdater},
        software::parameters::{ParameterRegistry, RegistrySnapshot, ValidRange},
    },
    logging,
    messages::control::parameter::ParameterMessage,
};
use std::{
    path::PathBuf,
    sync::atomic::Ordering,
    thread,
    time::{Duration, Instant},
};
use tracing::{info, warn};

type Camera = AcquisitionController<SimulatedGrabber, Box<dyn Updater>>;

/// Arguments required for starting the program from the command line.
#[derive(Parser, Debug)]
struct Args {
    /// Path to the controller config file, defaults are used without one.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Answer commands with the simulated head instead of the updater.
    #[arg(long)]
    simulate: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture frames; 0 runs until Ctrl-C.
    Grab {
        #[arg(short, long, default_value_t = 0)]
        frames: u64,
        /// Export the captured frames into a timestamped directory here.
        #[arg(short, long)]
        autosave: Option<PathBuf>,
    },
    /// Capture a few frames and write the last one as a still image.
    Snap {
        path: PathBuf,
        #[arg(short, long, default_value_t = 1)]
        frames: u64,
    },
    /// Change a parameter, geometry as `x,y,w,h`.
    Set {
        #[arg(required_unless_present = "json")]
        name: Option<String>,
        #[arg(default_value = "")]
        value: String,
        /// Parameter message such as `{"name": "framerate", "value": 250}`.
        #[arg(long, conflicts_with = "name")]
        json: Option<String>,
    },
    /// Capture continuously, trigger after a delay and keep the post
    /// trigger frames.
    Trigger {
        #[arg(short, long, default_value_t = 1000)]
        delay_ms: u64,
        #[arg(short, long)]
        autosave: Option<PathBuf>,
    },
    /// Query the head for its frame rate and exposure maxima.
    Limits,
    SaveConfig { path: PathBuf },
    LoadConfig { path: PathBuf },
    ResetConfig,
    /// Print the parameter table.
    Show,
}

fn main() -> Result<()> {
    logging::init("microcam=info");
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => CameraControlConfig::from_file(path)
            .with_context(|| format!("failed to read config {path:?}"))?,
        None => CameraControlConfig::default(),
    };
    let updater: Box<dyn Updater> = if args.simulate {
        Box::new(SimulatedUpdater::new())
    } else {
        Box::new(ProcessUpdater::new(
            &config.updater.program,
            config.updater.args.clone(),
        ))
    };
    // TODO: link the vendor board driver behind FrameGrabber; until then
    //       frames always come from the simulated board.
    if !args.simulate {
        warn!("no board driver linked, capturing from the simulated board");
    }

    let mut registry = ParameterRegistry::defaults();
    if let Some(path) = config.parameter_file.as_ref().filter(|p| p.is_file()) {
        registry.restore(
            RegistrySnapshot::load(path)
                .with_context(|| format!("failed to load parameter table {path:?}"))?,
        );
    }
    let channel = CommandChannel::new(updater, &config.updater.command_file);
    let mut camera: Camera =
        AcquisitionController::new(SimulatedGrabber::new(), channel, registry, &config);

    let stop = camera.stop_signal();
    ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
        .context("failed to install Ctrl-C handler")?;

    let result = execute(&mut camera, args.command, &config);
    camera.cleanup()?;
    result
}

fn execute(camera: &mut Camera, command: Command, config: &CameraControlConfig) -> Result<()> {
    match command {
        Command::Grab { frames, autosave } => {
            if autosave.is_some() {
                camera.set_autosave(autosave);
            }
            camera.grab(frames)?;
            report_export(camera.run()?);
        }
        Command::Snap { path, frames } => {
            camera.set_autosave(None);
            camera.grab(frames.max(1))?;
            camera.run()?;
            let index = camera.snap(&path)?;
            println!("frame {index} written to {path:?}");
        }
        Command::Set { name, value, json } => {
            let (name, report) = match (json, name) {
                (Some(raw), _) => {
                    let message = ParameterMessage::from_json(&raw)
                        .with_context(|| format!("malformed parameter message {raw}"))?;
                    let report = camera.reconfigure_message(&message)?;
                    (message.name, report)
                }
                (None, Some(name)) => {
                    let report = camera.reconfigure_text(&name, &value)?;
                    (name, report)
                }
                (None, None) => anyhow::bail!("set needs a parameter name or --json"),
            };
            println!("{name}: {report}");
            persist(camera, config)?;
        }
        Command::Trigger { delay_ms, autosave } => {
            if autosave.is_some() {
                camera.set_autosave(autosave);
            }
            camera.grab(0)?;
            let deadline = Instant::now() + Duration::from_millis(delay_ms);
            while Instant::now() < deadline && camera.state().is_running() {
                if camera.poll()? == PollOutcome::Cancelled {
                    break;
                }
                thread::sleep(config.poll_interval());
            }
            if camera.stop_signal().load(Ordering::SeqCst) {
                info!("interrupted before trigger");
                report_export(camera.stop()?);
            } else {
                report_export(camera.trigger()?);
            }
        }
        Command::Limits => {
            for (name, max) in camera.refresh_limits()? {
                println!("{name}: max {max}");
            }
            persist(camera, config)?;
        }
        Command::SaveConfig { path } => camera.save_config(&path)?,
        Command::LoadConfig { path } => {
            let report = camera.load_config(&path)?;
            println!("loaded {path:?}: {report}");
            persist(camera, config)?;
        }
        Command::ResetConfig => {
            let report = camera.reset_config()?;
            println!("reset: {report}");
            persist(camera, config)?;
        }
        Command::Show => {
            for spec in camera.registry().specs() {
                println!(
                    "{:<20} {:<4} {:<20} {}",
                    spec.name,
                    spec.code.as_deref().unwrap_or("-"),
                    spec.value.to_string(),
                    describe_range(&spec.range)
                );
            }
        }
    }
    Ok(())
}

/// Keep the configured parameter file in step with what the head runs.
fn persist(camera: &Camera, config: &CameraControlConfig) -> Result<()> {
    if let Some(path) = &config.parameter_file {
        camera
            .save_config(path)
            .with_context(|| format!("failed to write parameter table {path:?}"))?;
    }
    Ok(())
}

fn report_export(summary: Option<ExportSummary>) {
    match summary {
        Some(summary) => println!("{} frames exported to {:?}", summary.frames(), summary.dest),
        None => info!("acquisition finished without export"),
    }
}

fn describe_range(range: &ValidRange) -> String {
    match range {
        ValidRange::Scalar(bounds) => bounds.to_string(),
        ValidRange::Components(bounds) => bounds
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(" "),
        ValidRange::Unconstrained => "-".to_string(),
    }
}
