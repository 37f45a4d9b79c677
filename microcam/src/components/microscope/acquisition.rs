use crate::{
    components::microscope::{
        buffers::{AcquisitionBufferManager, AcquisitionSession},
        export::{save_still, timestamped_dir, ExportSummary, FrameExporter, PngSequenceExporter},
        reconfigure::{ReconfigurationReport, ReconfigurationSequencer},
    },
    devices::{
        hardware::{
            camera::{CommandBatch, CommandChannel, UpdaterConfig, UploadOutcome, Updater},
            framegrabber::{FrameGrabber, FrameTarget, FRAME_WAIT_TIMEOUT},
        },
        software::parameters::{
            names, ParameterRegistry, ParameterSpec, ParameterValue, RegistrySnapshot,
        },
    },
    error::{CameraError, Result},
    messages::control::parameter::ParameterMessage,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{
    env,
    ffi::OsStr,
    fmt::Display,
    fs::create_dir_all,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Device queries whose answers tighten scalar ranges, as
/// `(query code, parameter)`.
pub const LIMIT_QUERIES: [(&str, &str); 2] = [
    ("#A", names::FRAME_RATE),
    ("#a", names::EXPOSURE_TIME),
];

/// Controller settings. Read from YAML, any field can be overridden from
/// the environment, e.g. `MICROCAM_POLL_INTERVAL_MS=2` or
/// `MICROCAM_UPDATER__PROGRAM=/usr/local/bin/clser_updater`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct CameraControlConfig {
    pub updater: UpdaterConfig,
    /// Parameter table loaded at start up instead of the factory defaults.
    #[serde(default)]
    pub parameter_file: Option<PathBuf>,
    pub poll_interval_ms: u64,
    /// Bounded wait for the next frame of a finite acquisition.
    pub frame_timeout_ms: u64,
    pub display_bit_depth: u8,
    /// Arms autosave on start up when set.
    #[serde(default)]
    pub autosave_dir: Option<PathBuf>,
}

impl Default for CameraControlConfig {
    fn default() -> Self {
        Self {
            updater: UpdaterConfig {
                program: PathBuf::from("clser_updater"),
                args: Vec::new(),
                command_file: env::temp_dir().join("microcam_commands.txt"),
            },
            parameter_file: None,
            poll_interval_ms: 5,
            frame_timeout_ms: 5000,
            display_bit_depth: 8,
            autosave_dir: None,
        }
    }
}

impl CameraControlConfig {
    /// Read the controller settings from a YAML file.
    ///
    /// * `filepath`: path to the controller config.
    pub fn from_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self> {
        let file = Path::new(&filepath);
        if !file.is_file() {
            return Err(config::ConfigError::NotFound(file.to_string_lossy().into_owned()).into());
        }
        let config_file = config::Config::builder()
            .add_source(config::File::new(
                &file.to_string_lossy(),
                config::FileFormat::Yaml,
            ))
            .add_source(
                config::Environment::with_prefix("MICROCAM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config_file.try_deserialize::<CameraControlConfig>()?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

/// Where the controller is in its acquisition lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CameraState {
    Idle,
    Acquiring(FrameTarget),
    /// Trigger received, still capturing until the settle time elapses.
    Triggered,
    Stopped,
}

impl CameraState {
    /// The board is capturing.
    pub fn is_running(&self) -> bool {
        matches!(self, CameraState::Acquiring(_) | CameraState::Triggered)
    }
}

impl Display for CameraState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraState::Idle => write!(f, "idle"),
            CameraState::Acquiring(target) => write!(f, "acquiring ({target})"),
            CameraState::Triggered => write!(f, "triggered"),
            CameraState::Stopped => write!(f, "stopped"),
        }
    }
}

/// What a single poll tick observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// A new frame was drawn.
    Frame(i64),
    /// Nothing new since the previous tick.
    Pending,
    /// The finite target was reached and acquisition stopped.
    Completed(Option<ExportSummary>),
    /// The stop signal is raised or nothing is being captured.
    Cancelled,
}

/// Time to keep capturing after a trigger, `frames_after / frame_rate`
/// seconds.
pub fn settle_time(frames_after: i64, frame_rate: i64) -> Duration {
    if frames_after <= 0 || frame_rate <= 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(frames_after as f64 / frame_rate as f64)
}

/// Drives one camera: owns the board, the command channel, the parameter
/// table and at most one acquisition session.
///
/// All operations run on the caller's thread. The only thing shared is the
/// stop signal, which another thread (a Ctrl-C handler for instance) may
/// raise to end a running poll loop at its next tick.
pub struct AcquisitionController<G: FrameGrabber, U: Updater> {
    uuid: Uuid,
    grabber: G,
    channel: CommandChannel<U>,
    registry: ParameterRegistry,
    exporter: Box<dyn FrameExporter + Send>,
    session: Option<AcquisitionSession>,
    state: CameraState,
    stop_signal: Arc<AtomicBool>,
    autosave: Option<PathBuf>,
    poll_interval: Duration,
    frame_timeout: Duration,
    bit_depth: u8,
}

impl<G: FrameGrabber, U: Updater> AcquisitionController<G, U> {
    /// * `grabber`: acquisition board.
    /// * `channel`: command path to the camera head.
    /// * `registry`: parameter table the head currently runs with.
    /// * `config`: timing, display and autosave settings.
    pub fn new(
        grabber: G,
        channel: CommandChannel<U>,
        registry: ParameterRegistry,
        config: &CameraControlConfig,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            grabber,
            channel,
            registry,
            exporter: Box::new(PngSequenceExporter),
            session: None,
            state: CameraState::Idle,
            stop_signal: Arc::new(AtomicBool::new(false)),
            autosave: config.autosave_dir.clone(),
            poll_interval: config.poll_interval(),
            frame_timeout: config.frame_timeout(),
            bit_depth: config.display_bit_depth,
        }
    }

    /// Replace the PNG sequence exporter used by `export` and autosave.
    pub fn with_exporter<E: FrameExporter + Send + 'static>(mut self, exporter: E) -> Self {
        self.exporter = Box::new(exporter);
        self
    }

    pub fn get_uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn state(&self) -> CameraState {
        self.state
    }

    pub fn registry(&self) -> &ParameterRegistry {
        &self.registry
    }

    pub fn grabber(&self) -> &G {
        &self.grabber
    }

    pub fn grabber_mut(&mut self) -> &mut G {
        &mut self.grabber
    }

    pub fn channel(&self) -> &CommandChannel<U> {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut CommandChannel<U> {
        &mut self.channel
    }

    pub fn session(&self) -> Option<&AcquisitionSession> {
        self.session.as_ref()
    }

    /// Shared cancellation token for the poll loop.
    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        self.stop_signal.clone()
    }

    pub fn autosave_dir(&self) -> Option<&Path> {
        self.autosave.as_deref()
    }

    /// Arm autosave into `dir`, or disarm it with `None`.
    pub fn set_autosave(&mut self, dir: Option<PathBuf>) {
        info!(camera = %self.uuid, ?dir, "autosave");
        self.autosave = dir;
    }

    fn state_error(&self, operation: &'static str) -> CameraError {
        CameraError::State {
            operation,
            state: self.state.to_string(),
        }
    }

    /// Push every board-mirrored value and allocate a session sized to the
    /// current geometry and buffer depth. A live session is kept as is.
    pub fn initialise(&mut self) -> Result<()> {
        if self.state.is_running() {
            return Err(self.state_error("initialise"));
        }
        if self.session.is_some() {
            debug!(camera = %self.uuid, "session already live");
            return Ok(());
        }
        self.sync_board()?;
        self.open_session()
    }

    /// Write every registry value that has board fields into the board.
    pub(crate) fn sync_board(&mut self) -> Result<()> {
        let specs: Vec<ParameterSpec> = self.registry.specs().cloned().collect();
        for spec in &specs {
            self.mirror(spec, &spec.value)?;
        }
        Ok(())
    }

    /// Allocate buffer and display without touching board parameters.
    pub(crate) fn open_session(&mut self) -> Result<()> {
        let geometry = self.registry.frame_format()?;
        let depth = u32::try_from(self.registry.scalar(names::BUFFER_DEPTH)?)
            .map_err(|_| CameraError::Validation("buffer depth does not fit the board".to_string()))?;
        match AcquisitionBufferManager::open_session(&mut self.grabber, geometry, depth, self.bit_depth)
        {
            Ok(session) => {
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                self.teardown();
                Err(e)
            }
        }
    }

    /// Start capturing `count` frames, `0` meaning until stopped. Refused
    /// while a stop request raised through the stop signal is pending.
    pub fn grab(&mut self, count: u64) -> Result<()> {
        if self.state.is_running() {
            return Err(self.state_error("grab"));
        }
        if self.stop_signal.load(Ordering::SeqCst) {
            return Err(CameraError::State {
                operation: "grab",
                state: "stop requested".to_string(),
            });
        }
        if self.session.is_none() {
            self.initialise()?;
        }
        self.start(FrameTarget::from_count(count))
    }

    pub(crate) fn start(&mut self, target: FrameTarget) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| CameraError::Resource("no acquisition session".to_string()))?;
        let buffer = session
            .buffer
            .ok_or_else(|| CameraError::Resource("no frame buffer allocated".to_string()))?;
        session.target = target;
        session.frame_counter = 0;
        let session_id = session.get_uuid();
        if let Err(e) = self.grabber.acquire_start(buffer, target) {
            error!(camera = %self.uuid, "failed to start acquisition: {e}");
            self.teardown();
            return Err(e);
        }
        self.state = CameraState::Acquiring(target);
        info!(camera = %self.uuid, session = %session_id, %target, "acquisition started");
        Ok(())
    }

    /// One poll tick: read the latest frame index, draw a new frame, stop
    /// once a finite target is reached. Board failures and wait timeouts
    /// tear the session down before the error is returned.
    pub fn poll(&mut self) -> Result<PollOutcome> {
        if !self.state.is_running() || self.stop_signal.load(Ordering::SeqCst) {
            return Ok(PollOutcome::Cancelled);
        }
        let handles = self
            .session
            .as_ref()
            .map(|s| (s.buffer, s.display, s.frame_counter, s.target));
        let Some((Some(buffer), Some(display), previous, target)) = handles else {
            self.teardown();
            return Err(CameraError::Resource(
                "acquisition running without a live session".to_string(),
            ));
        };

        let index = match target {
            FrameTarget::Finite(_) => {
                self.grabber
                    .wait_frame_index(buffer, previous + 1, self.frame_timeout)
            }
            FrameTarget::Continuous => self.grabber.last_frame_index(buffer),
        };
        if index == FRAME_WAIT_TIMEOUT {
            self.teardown();
            let err = CameraError::Timeout {
                frame: previous + 1,
                waited_ms: self.frame_timeout.as_millis(),
            };
            error!(camera = %self.uuid, "{err}");
            return Err(err);
        }
        if index < 0 {
            self.teardown();
            let err = CameraError::Board(format!("frame grabber reported index {index}"));
            error!(camera = %self.uuid, "{err}");
            return Err(err);
        }

        if let Some(session) = self.session.as_mut() {
            session.frame_counter = index;
        }
        if index > previous {
            if let Err(e) = self.grabber.draw_frame(display, buffer, index) {
                error!(camera = %self.uuid, "failed to draw frame {index}: {e}");
                self.teardown();
                return Err(e);
            }
            debug!(frame = index, "drew frame");
        }

        if let FrameTarget::Finite(n) = target {
            if index >= i64::try_from(n).unwrap_or(i64::MAX) {
                let summary = self.stop()?;
                return Ok(PollOutcome::Completed(summary));
            }
        }
        Ok(if index > previous {
            PollOutcome::Frame(index)
        } else {
            PollOutcome::Pending
        })
    }

    /// Tick until the acquisition completes or the stop signal is raised.
    pub fn run(&mut self) -> Result<Option<ExportSummary>> {
        while self.state.is_running() {
            match self.poll()? {
                PollOutcome::Completed(summary) => return Ok(summary),
                PollOutcome::Cancelled => {
                    return if self.state.is_running() {
                        self.stop()
                    } else {
                        Ok(None)
                    };
                }
                PollOutcome::Frame(_) | PollOutcome::Pending => thread::sleep(self.poll_interval),
            }
        }
        Ok(None)
    }

    /// Keep capturing for `framesaftertrigger / framerate` seconds, then
    /// stop.
    pub fn trigger(&mut self) -> Result<Option<ExportSummary>> {
        if !matches!(self.state, CameraState::Acquiring(_)) {
            return Err(self.state_error("trigger"));
        }
        let frames_after = self.registry.scalar(names::FRAMES_AFTER_TRIGGER)?;
        let frame_rate = self.registry.scalar(names::FRAME_RATE)?;
        let settle = settle_time(frames_after, frame_rate);
        self.state = CameraState::Triggered;
        info!(camera = %self.uuid, ?settle, frames_after, "trigger received");

        let deadline = Instant::now() + settle;
        while Instant::now() < deadline {
            match self.poll()? {
                PollOutcome::Completed(summary) => return Ok(summary),
                PollOutcome::Cancelled => break,
                PollOutcome::Frame(_) | PollOutcome::Pending => {
                    thread::sleep(
                        self.poll_interval
                            .min(deadline.saturating_duration_since(Instant::now())),
                    );
                }
            }
        }
        if self.state.is_running() {
            self.stop()
        } else {
            Ok(None)
        }
    }

    /// Stop capturing. With autosave armed the buffered frames are exported
    /// and the session released; otherwise the frames stay available for
    /// `snap` and `export`.
    pub fn stop(&mut self) -> Result<Option<ExportSummary>> {
        self.halt()?;
        let Some(base) = self.autosave.clone() else {
            return Ok(None);
        };
        let Some((last, depth)) = self
            .session
            .as_ref()
            .map(|s| (s.frame_counter, i64::from(s.buffer_depth)))
        else {
            return Ok(None);
        };
        if last < 1 {
            info!(camera = %self.uuid, "nothing captured, autosave skipped");
            return Ok(None);
        }
        let first = (last - depth + 1).max(1);
        let exported = self.export_frames(first, last, &timestamped_dir(&base, Utc::now()));
        let released = self.release_resources();
        let summary = exported?;
        released?;
        Ok(Some(summary))
    }

    /// Stop the board without autosaving. Used by `stop` and before a
    /// reconfiguration.
    pub(crate) fn halt(&mut self) -> Result<()> {
        if !self.state.is_running() {
            return Err(self.state_error("stop"));
        }
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Err(e) = self.grabber.acquire_stop() {
            error!(camera = %self.uuid, "failed to stop acquisition: {e}");
            self.teardown();
            return Err(e);
        }
        self.state = CameraState::Stopped;
        self.stop_signal.store(false, Ordering::SeqCst);
        let frames = self.session.as_ref().map_or(0, |s| s.frame_counter);
        info!(camera = %self.uuid, frames, "acquisition stopped");
        Ok(())
    }

    /// Free buffer and display. A failure is fatal for the session.
    pub(crate) fn release_resources(&mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        if let Err(e) = AcquisitionBufferManager::release_session(&mut self.grabber, &mut session) {
            error!(camera = %self.uuid, "failed to release session: {e}");
            self.teardown();
            return Err(e);
        }
        Ok(())
    }

    /// Write the most recently captured frame as a still image. Returns the
    /// frame index written.
    pub fn snap(&mut self, path: &Path) -> Result<i64> {
        let Some(session) = self.session.as_ref() else {
            return Err(self.state_error("snap"));
        };
        let (Some(buffer), index, geometry) = (session.buffer, session.frame_counter, session.geometry)
        else {
            return Err(self.state_error("snap"));
        };
        if index < 1 {
            return Err(CameraError::State {
                operation: "snap",
                state: "no frame captured yet".to_string(),
            });
        }
        let data = self.grabber.frame(buffer, index)?;
        save_still(path, &geometry, data)?;
        info!(camera = %self.uuid, frame = index, ?path, "snapped");
        Ok(index)
    }

    /// Export frames `first..=last` of a stopped acquisition into `dest`.
    pub fn export(&mut self, first: i64, last: i64, dest: &Path) -> Result<ExportSummary> {
        if self.state.is_running() {
            return Err(self.state_error("export"));
        }
        self.export_frames(first, last, dest)
    }

    fn export_frames(&mut self, first: i64, last: i64, dest: &Path) -> Result<ExportSummary> {
        let Some(session) = self.session.as_ref() else {
            return Err(self.state_error("export"));
        };
        let Some(buffer) = session.buffer else {
            return Err(self.state_error("export"));
        };
        let captured = session.frame_counter;
        let oldest = (captured - i64::from(session.buffer_depth) + 1).max(1);
        if first > last || first < oldest || last > captured {
            return Err(CameraError::Validation(format!(
                "frames {first}..={last} not held in buffer (holding {oldest}..={captured})"
            )));
        }
        let geometry = session.geometry;
        create_dir_all(dest)?;
        for index in first..=last {
            let data = self.grabber.frame(buffer, index)?;
            self.exporter.write_frame(dest, &geometry, index, data)?;
        }
        info!(camera = %self.uuid, ?dest, first, last, "exported frames");
        Ok(ExportSummary {
            dest: dest.to_path_buf(),
            first,
            last,
        })
    }

    /// Stop if running and release the session. Ends in `Idle`.
    pub fn cleanup(&mut self) -> Result<()> {
        self.stop_signal.store(true, Ordering::SeqCst);
        let stopped = if self.state.is_running() {
            self.grabber.acquire_stop()
        } else {
            Ok(())
        };
        let released = match self.session.take() {
            Some(mut session) => {
                AcquisitionBufferManager::release_session(&mut self.grabber, &mut session)
            }
            None => Ok(()),
        };
        self.state = CameraState::Idle;
        self.stop_signal.store(false, Ordering::SeqCst);
        info!(camera = %self.uuid, "cleaned up");
        stopped.and(released)
    }

    /// Best effort release after a fatal error. Always ends in `Idle` with
    /// no live handles.
    fn teardown(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if self.state.is_running() {
            if let Err(e) = self.grabber.acquire_stop() {
                warn!(camera = %self.uuid, "acquire stop during teardown failed: {e}");
            }
        }
        if let Some(mut session) = self.session.take() {
            if let Err(e) = AcquisitionBufferManager::release_session(&mut self.grabber, &mut session) {
                warn!(camera = %self.uuid, "release during teardown failed: {e}");
            }
        }
        self.state = CameraState::Idle;
        self.stop_signal.store(false, Ordering::SeqCst);
        warn!(camera = %self.uuid, "acquisition session torn down");
    }

    /// Change one parameter, rebuilding buffers when the change requires it.
    pub fn reconfigure(&mut self, name: &str, value: ParameterValue) -> Result<ReconfigurationReport> {
        ReconfigurationSequencer::apply(self, name, value)
    }

    /// Parse user text for `name` and reconfigure with it.
    pub fn reconfigure_text(&mut self, name: &str, text: &str) -> Result<ReconfigurationReport> {
        let value = self.registry.validate_text(name, text)?;
        self.reconfigure(name, value)
    }

    /// Reconfigure from a message sent by another process, shaping its value
    /// after the named parameter.
    pub fn reconfigure_message(&mut self, message: &ParameterMessage) -> Result<ReconfigurationReport> {
        let kind = self.registry.spec(&message.name)?.kind();
        let value = message.to_value(kind)?;
        self.reconfigure(&message.name, value)
    }

    /// Ask the head for its current frame rate and exposure maxima and
    /// apply them to the registry ranges. Returns the limits applied.
    pub fn refresh_limits(&mut self) -> Result<Vec<(&'static str, i64)>> {
        let mut applied = Vec::new();
        for (code, name) in LIMIT_QUERIES {
            if let Some(max) = self.channel.query(code)? {
                self.registry.set_upper_bound(name, max)?;
                applied.push((name, max));
            }
        }
        Ok(applied)
    }

    /// Load a parameter table and apply it to the head and board.
    pub fn load_config<F: AsRef<OsStr>>(&mut self, filepath: F) -> Result<ReconfigurationReport> {
        let snapshot = RegistrySnapshot::load(filepath)?;
        ReconfigurationSequencer::apply_snapshot(self, snapshot)
    }

    pub fn save_config<F: AsRef<OsStr>>(&self, filepath: F) -> Result<()> {
        self.registry.snapshot().save(filepath)?;
        info!(camera = %self.uuid, "saved parameter table");
        Ok(())
    }

    /// Apply the factory parameter table.
    pub fn reset_config(&mut self) -> Result<ReconfigurationReport> {
        ReconfigurationSequencer::apply_snapshot(self, ParameterRegistry::defaults().snapshot())
    }

    pub(crate) fn registry_mut(&mut self) -> &mut ParameterRegistry {
        &mut self.registry
    }

    pub(crate) fn write(&mut self, spec: &ParameterSpec, value: &ParameterValue) -> Result<UploadOutcome> {
        self.channel.write_single(spec, value)
    }

    pub(crate) fn upload(&mut self, batch: &CommandBatch) -> Result<UploadOutcome> {
        self.channel.upload(batch)
    }

    pub(crate) fn mirror(&mut self, spec: &ParameterSpec, value: &ParameterValue) -> Result<usize> {
        self.channel.mirror_to_board(&mut self.grabber, spec, value)
    }
}

impl<G: FrameGrabber, U: Updater> Drop for AcquisitionController<G, U> {
    fn drop(&mut self) {
        if self.session.is_some() || self.state.is_running() {
            if let Err(e) = self.cleanup() {
                warn!(camera = %self.uuid, "cleanup on drop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        devices::{
            hardware::framegrabber::BoardField,
            simulated::{BoardCall, SimulatedGrabber, SimulatedUpdater},
        },
        utils::image::FrameFormat,
    };
    use rstest::rstest;
    use serial_test::serial;
    use std::sync::Mutex;

    type Controller = AcquisitionController<SimulatedGrabber, SimulatedUpdater>;

    /// Records frame indices instead of writing files.
    #[derive(Clone, Default)]
    struct RecordingExporter {
        written: Arc<Mutex<Vec<(PathBuf, i64)>>>,
    }

    impl FrameExporter for RecordingExporter {
        fn write_frame(&mut self, dest: &Path, geometry: &FrameFormat, index: i64, data: &[u8]) -> Result<()> {
            assert_eq!(data.len() as u64, geometry.pixel_count());
            self.written
                .lock()
                .unwrap()
                .push((dest.to_path_buf(), index));
            Ok(())
        }
    }

    fn test_config() -> CameraControlConfig {
        CameraControlConfig {
            poll_interval_ms: 1,
            frame_timeout_ms: 20,
            ..Default::default()
        }
    }

    fn controller(dir: &tempfile::TempDir) -> Controller {
        let channel = CommandChannel::new(SimulatedUpdater::new(), dir.path().join("commands.txt"));
        AcquisitionController::new(
            SimulatedGrabber::new(),
            channel,
            ParameterRegistry::defaults(),
            &test_config(),
        )
    }

    #[test]
    fn test_grab_fifty_frames_autosaves_after_fifty_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = RecordingExporter::default();
        let mut camera = controller(&dir).with_exporter(exporter.clone());
        camera.set_autosave(Some(dir.path().join("videos")));
        camera.initialise().unwrap();
        assert_eq!(camera.session().unwrap().buffer_depth, 1000);

        camera.grab(50).unwrap();
        assert_eq!(camera.state(), CameraState::Acquiring(FrameTarget::Finite(50)));
        for tick in 1..50 {
            assert_eq!(camera.poll().unwrap(), PollOutcome::Frame(tick));
        }
        let PollOutcome::Completed(Some(summary)) = camera.poll().unwrap() else {
            panic!("acquisition did not complete on the fiftieth tick");
        };
        assert_eq!(camera.state(), CameraState::Stopped);
        assert_eq!((summary.first, summary.last), (1, 50));
        assert!(summary.dest.starts_with(dir.path().join("videos")));

        let written = exporter.written.lock().unwrap();
        let indices: Vec<i64> = written.iter().map(|(_, i)| *i).collect();
        assert_eq!(indices, (1..=50).collect::<Vec<_>>());
        assert!(camera.session().is_none());
        assert_eq!(camera.grabber().live_buffers(), 0);
        assert_eq!(camera.grabber().live_displays(), 0);
        assert_eq!(camera.grabber().frames_drawn(), 50);
    }

    #[test]
    fn test_stop_without_autosave_keeps_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = controller(&dir);
        camera.grab(0).unwrap();
        for _ in 0..5 {
            camera.poll().unwrap();
        }
        assert_eq!(camera.stop().unwrap(), None);
        assert_eq!(camera.state(), CameraState::Stopped);
        assert_eq!(camera.session().unwrap().frame_counter, 5);
        assert_eq!(camera.grabber().live_buffers(), 1);

        let still = dir.path().join("still.png");
        assert_eq!(camera.snap(&still).unwrap(), 5);
        assert!(still.is_file());

        let dest = dir.path().join("manual");
        let summary = camera.export(2, 4, &dest).unwrap();
        assert_eq!(summary.frames(), 3);
        assert!(dest.join("frame_000003.png").is_file());
        assert!(matches!(
            camera.export(4, 9, &dest),
            Err(CameraError::Validation(_))
        ));
    }

    #[test]
    fn test_grab_initialises_and_syncs_board() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = controller(&dir);
        camera.grab(10).unwrap();
        let grabber = camera.grabber();
        assert_eq!(grabber.parameter(BoardField::Width), Some(1280));
        assert_eq!(grabber.parameter(BoardField::FramesPerSec), Some(100));
        assert!(grabber.calls().contains(&BoardCall::AllocateBuffer {
            size_bytes: 1_310_720_000,
            frames: 1000
        }));
        assert!(grabber.is_acquiring());
    }

    #[test]
    fn test_wait_timeout_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = controller(&dir);
        camera.grabber_mut().stall_at_frame(Some(3));
        camera.grab(10).unwrap();
        camera.poll().unwrap();
        camera.poll().unwrap();
        let err = camera.poll().unwrap_err();
        assert!(matches!(err, CameraError::Timeout { frame: 3, waited_ms: 20 }));
        assert_eq!(camera.state(), CameraState::Idle);
        assert!(camera.session().is_none());
        assert_eq!(camera.grabber().live_buffers(), 0);
        assert!(!camera.grabber().is_acquiring());
    }

    #[test]
    fn test_negative_index_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = controller(&dir);
        camera.grabber_mut().fail_at_frame(Some(4));
        camera.grab(0).unwrap();
        let err = camera.run().unwrap_err();
        assert!(matches!(err, CameraError::Board(_)));
        assert!(!err.is_recoverable());
        assert_eq!(camera.state(), CameraState::Idle);
        assert_eq!(camera.grabber().live_displays(), 0);
    }

    #[test]
    fn test_allocation_failure_is_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = controller(&dir);
        camera.grabber_mut().fail_allocation(true);
        assert!(matches!(camera.grab(5), Err(CameraError::Resource(_))));
        assert_eq!(camera.state(), CameraState::Idle);
        assert!(camera.session().is_none());
    }

    #[test]
    fn test_stop_signal_ends_run_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = controller(&dir);
        camera.grab(0).unwrap();
        camera.poll().unwrap();
        camera.stop_signal().store(true, Ordering::SeqCst);
        assert_eq!(camera.poll().unwrap(), PollOutcome::Cancelled);
        assert_eq!(camera.run().unwrap(), None);
        assert_eq!(camera.state(), CameraState::Stopped);
        assert!(!camera.stop_signal().load(Ordering::SeqCst));
        camera.grab(0).unwrap();
    }

    #[test]
    fn test_stop_request_before_grab_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = controller(&dir);
        camera.stop_signal().store(true, Ordering::SeqCst);
        assert!(matches!(
            camera.grab(0),
            Err(CameraError::State { operation: "grab", .. })
        ));
        assert!(camera.stop_signal().load(Ordering::SeqCst));
        assert_eq!(camera.state(), CameraState::Idle);
        assert!(!camera
            .grabber()
            .calls()
            .iter()
            .any(|c| matches!(c, BoardCall::AcquireStart(..))));
    }

    #[rstest]
    #[case(r#"{"name": "framerate", "value": 250}"#, names::FRAME_RATE, ParameterValue::Scalar(250))]
    #[case(
        r#"{"name": "frameformat", "value": [0, 0, 640, 480]}"#,
        names::FRAME_FORMAT,
        ParameterValue::Geometry(FrameFormat::new(0, 0, 640, 480))
    )]
    fn test_reconfigure_from_message(
        #[case] raw: &str,
        #[case] name: &str,
        #[case] expected: ParameterValue,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = controller(&dir);
        let message = ParameterMessage::from_json(raw).unwrap();
        camera.reconfigure_message(&message).unwrap();
        assert_eq!(camera.registry().spec(name).unwrap().value, expected);
    }

    #[rstest]
    #[case(r#"{"name": "framerate", "value": [0, 0, 640, 480]}"#)]
    #[case(r#"{"name": "frameformat", "value": [0, 0, 640]}"#)]
    #[case(r#"{"name": "framerate"}"#)]
    fn test_reconfigure_from_mismatched_message(#[case] raw: &str) {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = controller(&dir);
        let before = camera.registry().snapshot();
        let message = ParameterMessage::from_json(raw).unwrap();
        assert!(matches!(
            camera.reconfigure_message(&message),
            Err(CameraError::Validation(_))
        ));
        assert_eq!(camera.registry().snapshot(), before);
    }

    #[test]
    fn test_trigger_stops_after_settle_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = controller(&dir);
        camera
            .reconfigure(names::FRAMES_AFTER_TRIGGER, ParameterValue::Scalar(5))
            .unwrap();
        camera
            .reconfigure(names::FRAME_RATE, ParameterValue::Scalar(500))
            .unwrap();
        camera.grab(0).unwrap();
        assert_eq!(camera.trigger().unwrap(), None);
        assert_eq!(camera.state(), CameraState::Stopped);
        assert!(camera.session().unwrap().frame_counter >= 1);
        assert!(!camera.grabber().is_acquiring());
    }

    #[rstest]
    #[case(100, 100, Duration::from_secs(1))]
    #[case(5, 500, Duration::from_millis(10))]
    #[case(0, 100, Duration::ZERO)]
    fn test_settle_time(#[case] frames_after: i64, #[case] rate: i64, #[case] expected: Duration) {
        assert_eq!(settle_time(frames_after, rate), expected);
    }

    #[test]
    fn test_illegal_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = controller(&dir);
        assert!(matches!(camera.stop(), Err(CameraError::State { .. })));
        assert!(matches!(camera.trigger(), Err(CameraError::State { .. })));
        assert!(matches!(
            camera.snap(&dir.path().join("x.png")),
            Err(CameraError::State { .. })
        ));
        camera.grab(0).unwrap();
        assert!(matches!(camera.grab(10), Err(CameraError::State { .. })));
        assert!(matches!(
            camera.export(1, 1, dir.path()),
            Err(CameraError::State { .. })
        ));
        assert_eq!(camera.state(), CameraState::Acquiring(FrameTarget::Continuous));
    }

    #[test]
    fn test_cleanup_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = controller(&dir);
        camera.grab(0).unwrap();
        camera.poll().unwrap();
        camera.cleanup().unwrap();
        assert_eq!(camera.state(), CameraState::Idle);
        assert_eq!(camera.grabber().live_buffers(), 0);
        assert_eq!(camera.grabber().live_displays(), 0);
        camera.cleanup().unwrap();
    }

    #[test]
    fn test_refresh_limits_updates_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = controller(&dir);
        camera.channel_mut().updater_mut().answer_query("#A", 2400);
        let applied = camera.refresh_limits().unwrap();
        assert_eq!(applied, vec![(names::FRAME_RATE, 2400)]);
        assert!(!camera
            .registry()
            .validate(names::FRAME_RATE, &ParameterValue::Scalar(2401))
            .is_accepted());
    }

    #[test]
    fn test_save_and_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parameters.yaml");
        let mut camera = controller(&dir);
        camera.reconfigure(names::GAIN, ParameterValue::Scalar(3)).unwrap();
        camera.save_config(&path).unwrap();

        camera.reset_config().unwrap();
        assert_eq!(camera.registry().scalar(names::GAIN).unwrap(), 1);
        camera.load_config(&path).unwrap();
        assert_eq!(camera.registry().scalar(names::GAIN).unwrap(), 3);
    }

    #[test]
    #[serial]
    fn test_config_from_file() {
        let config = CameraControlConfig::from_file(crate::test_file_path!(
            "/config/components/microscope/camera_control.yaml"
        ))
        .unwrap();
        assert_eq!(config.updater.args, Vec::<String>::new());
        assert_eq!(config.poll_interval(), Duration::from_millis(5));
        assert_eq!(config.frame_timeout(), Duration::from_secs(5));
        assert_eq!(config.display_bit_depth, 8);
        assert_eq!(config.autosave_dir, None);
    }

    #[test]
    #[serial]
    fn test_config_environment_override() {
        env::set_var("MICROCAM_POLL_INTERVAL_MS", "2");
        let config = CameraControlConfig::from_file(crate::test_file_path!(
            "/config/components/microscope/camera_control.yaml"
        ));
        env::remove_var("MICROCAM_POLL_INTERVAL_MS");
        assert_eq!(config.unwrap().poll_interval_ms, 2);
    }

    #[test]
    fn test_config_missing_file() {
        assert!(matches!(
            CameraControlConfig::from_file("/does/not/exist.yaml"),
            Err(CameraError::Config(_))
        ));
    }
}
