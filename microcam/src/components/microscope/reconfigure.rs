use crate::{
    components::microscope::acquisition::{AcquisitionController, CameraState},
    devices::{
        hardware::{
            camera::{CommandCodec, UploadOutcome, Updater},
            framegrabber::{FrameGrabber, FrameTarget},
        },
        software::parameters::{names, ParameterSpec, ParameterValue, RegistrySnapshot},
    },
    error::{CameraError, Result},
};
use std::fmt::Display;
use tracing::{info, warn};

/// Parameters whose change invalidates the allocated frame buffer.
pub const BUFFER_INVALIDATING: [&str; 4] = [
    names::FRAME_FORMAT,
    names::FRAME_RATE,
    names::EXPOSURE_TIME,
    names::BUFFER_DEPTH,
];

/// Parameters the controller reads itself; a table must carry all of them.
pub const REQUIRED: [&str; 4] = [
    names::FRAME_FORMAT,
    names::BUFFER_DEPTH,
    names::FRAME_RATE,
    names::FRAMES_AFTER_TRIGGER,
];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReconfigurationStep {
    /// Device acknowledged the command batch.
    Written,
    Stopped,
    Freed,
    Committed,
    /// Number of board fields written.
    Mirrored(usize),
    Allocated,
    Resumed(FrameTarget),
}

impl Display for ReconfigurationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconfigurationStep::Written => write!(f, "written"),
            ReconfigurationStep::Stopped => write!(f, "stopped"),
            ReconfigurationStep::Freed => write!(f, "freed"),
            ReconfigurationStep::Committed => write!(f, "committed"),
            ReconfigurationStep::Mirrored(n) => write!(f, "mirrored({n})"),
            ReconfigurationStep::Allocated => write!(f, "allocated"),
            ReconfigurationStep::Resumed(target) => write!(f, "resumed({target})"),
        }
    }
}

/// Steps performed by one reconfiguration, in order.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ReconfigurationReport {
    pub steps: Vec<ReconfigurationStep>,
}

impl ReconfigurationReport {
    fn push(&mut self, step: ReconfigurationStep) {
        self.steps.push(step);
    }

    /// Buffers were released and rebuilt.
    pub fn rebuilt_buffers(&self) -> bool {
        self.steps.contains(&ReconfigurationStep::Freed)
    }
}

impl Display for ReconfigurationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let steps: Vec<String> = self.steps.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", steps.join(" -> "))
    }
}

/// Unit struct holding the ordering rules for parameter changes. A change
/// is written to the head first; only after the head accepted it is the
/// acquisition stopped, the buffers dropped, the value committed and the
/// board updated, before buffers are rebuilt and capture resumes.
pub struct ReconfigurationSequencer;

impl ReconfigurationSequencer {
    pub fn invalidates_buffers(name: &str) -> bool {
        BUFFER_INVALIDATING.contains(&name)
    }

    /// Apply one parameter change.
    ///
    /// * `controller`: camera to reconfigure.
    /// * `name`: registry name of the parameter.
    /// * `value`: new value, validated before anything is sent.
    pub fn apply<G: FrameGrabber, U: Updater>(
        controller: &mut AcquisitionController<G, U>,
        name: &str,
        value: ParameterValue,
    ) -> Result<ReconfigurationReport> {
        let spec = controller.registry().spec(name)?.clone();
        spec.validate(&value).into_result()?;

        let mut report = ReconfigurationReport::default();
        if let UploadOutcome::Rejected { reason } = controller.write(&spec, &value)? {
            return Err(CameraError::Protocol(reason));
        }
        report.push(ReconfigurationStep::Written);

        if !Self::invalidates_buffers(name) {
            controller.registry_mut().commit(name, value.clone())?;
            report.push(ReconfigurationStep::Committed);
            let mirrored = controller.mirror(&spec, &value)?;
            if mirrored > 0 {
                report.push(ReconfigurationStep::Mirrored(mirrored));
            }
            info!(parameter = name, %value, "reconfigured");
            return Ok(report);
        }

        let resume = Self::suspend(controller, &mut report)?;
        controller.registry_mut().commit(name, value.clone())?;
        report.push(ReconfigurationStep::Committed);
        let mirrored = controller.mirror(&spec, &value)?;
        report.push(ReconfigurationStep::Mirrored(mirrored));
        Self::rebuild(controller, resume, &mut report)?;
        info!(parameter = name, %value, steps = %report, "reconfigured");
        Ok(report)
    }

    /// Apply a whole parameter table in one batch. A rejected batch leaves
    /// the registry and the acquisition untouched.
    pub fn apply_snapshot<G: FrameGrabber, U: Updater>(
        controller: &mut AcquisitionController<G, U>,
        snapshot: RegistrySnapshot,
    ) -> Result<ReconfigurationReport> {
        snapshot.validate()?;
        for name in REQUIRED {
            if snapshot.get(name).is_none() {
                return Err(CameraError::Validation(format!(
                    "parameter table is missing '{name}'"
                )));
            }
        }
        let batch = CommandCodec::encode_batch(snapshot.specs())?;

        let mut report = ReconfigurationReport::default();
        if let UploadOutcome::Rejected { reason } = controller.upload(&batch)? {
            warn!("parameter table rejected, keeping current values");
            return Err(CameraError::Protocol(reason));
        }
        report.push(ReconfigurationStep::Written);

        let resume = Self::suspend(controller, &mut report)?;
        let specs: Vec<ParameterSpec> = snapshot.specs().cloned().collect();
        controller.registry_mut().restore(snapshot);
        report.push(ReconfigurationStep::Committed);
        let mut mirrored = 0;
        for spec in &specs {
            mirrored += controller.mirror(spec, &spec.value)?;
        }
        report.push(ReconfigurationStep::Mirrored(mirrored));
        Self::rebuild(controller, resume, &mut report)?;
        info!(parameters = specs.len(), steps = %report, "applied parameter table");
        Ok(report)
    }

    /// Stop a running acquisition and free the session. Returns whether a
    /// session was live and the target to resume with.
    fn suspend<G: FrameGrabber, U: Updater>(
        controller: &mut AcquisitionController<G, U>,
        report: &mut ReconfigurationReport,
    ) -> Result<(bool, Option<FrameTarget>)> {
        let resume = match controller.state() {
            CameraState::Acquiring(target) => Some(target),
            _ => None,
        };
        if controller.state().is_running() {
            controller.halt()?;
            report.push(ReconfigurationStep::Stopped);
        }
        let had_session = controller.session().is_some();
        if had_session {
            controller.release_resources()?;
            report.push(ReconfigurationStep::Freed);
        }
        Ok((had_session, resume))
    }

    fn rebuild<G: FrameGrabber, U: Updater>(
        controller: &mut AcquisitionController<G, U>,
        (had_session, resume): (bool, Option<FrameTarget>),
        report: &mut ReconfigurationReport,
    ) -> Result<()> {
        if had_session {
            controller.open_session()?;
            report.push(ReconfigurationStep::Allocated);
        }
        if let Some(target) = resume {
            controller.start(target)?;
            report.push(ReconfigurationStep::Resumed(target));
        }
        Ok(())
    }
}
