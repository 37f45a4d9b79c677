use crate::{
    devices::{
        hardware::framegrabber::{BoardField, FrameGrabber},
        software::parameters::{ParameterKind, ParameterSpec, ParameterValue},
    },
    error::{CameraError, Result},
    utils::image::FrameFormat,
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};
use tracing::{debug, warn};

/// First line of every command file, asks the head for its serial number
/// so the updater can confirm which sensor it is talking to.
pub const IDENTIFY_COMMAND: &str = "#N";
/// Last line of every command file, ends the updater session.
pub const QUIT_SENTINEL: &str = "##quit";
/// Two byte marker the updater prints when the head refused a command.
pub const ERROR_MARKER: &[u8; 2] = b"!E";

/// Where the external updater lives and which file it consumes.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct UpdaterConfig {
    /// Updater executable, invoked as `<program> <args..> <command_file>`.
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Protocol file the command batch is written to before each upload.
    pub command_file: PathBuf,
}

/// The process boundary that carries a command file to the camera head
/// and returns whatever the head answered, one entry per response line.
pub trait Updater {
    fn run(&mut self, command_file: &Path) -> Result<Vec<String>>;
}

impl<U: Updater + ?Sized> Updater for Box<U> {
    fn run(&mut self, command_file: &Path) -> Result<Vec<String>> {
        (**self).run(command_file)
    }
}

/// Runs the vendor's serial updater executable.
pub struct ProcessUpdater {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessUpdater {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Updater for ProcessUpdater {
    fn run(&mut self, command_file: &Path) -> Result<Vec<String>> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(command_file)
            .output()?;
        if !output.status.success() {
            return Err(CameraError::Protocol(format!(
                "updater {:?} exited with {}",
                self.program, output.status
            )));
        }
        Ok(split_response(&output.stdout))
    }
}

/// Split updater output into lines on CRLF, dropping the empty tail.
pub fn split_response(stdout: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(stdout)
        .split("\r\n")
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Ordered command lines framed by the identification and quit sentinels.
/// One batch is one upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandBatch {
    lines: Vec<String>,
}

impl CommandBatch {
    pub fn new(commands: impl IntoIterator<Item = String>) -> Self {
        let mut lines = vec![IDENTIFY_COMMAND.to_string()];
        lines.extend(commands);
        lines.push(QUIT_SENTINEL.to_string());
        Self { lines }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Command lines between the sentinels.
    pub fn commands(&self) -> &[String] {
        &self.lines[1..self.lines.len() - 1]
    }

    pub fn is_empty(&self) -> bool {
        self.commands().is_empty()
    }

    /// File contents as consumed by the updater.
    pub fn contents(&self) -> String {
        let mut contents = self.lines.join("\n");
        contents.push('\n');
        contents
    }
}

/// Result of uploading a batch. Device rejection is an ordinary outcome
/// for the caller to inspect, not an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    Accepted { responses: Vec<String> },
    Rejected { reason: String },
}

impl UploadOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, UploadOutcome::Accepted { .. })
    }

    /// Map a rejection onto [`CameraError::Protocol`].
    pub fn into_result(self) -> Result<Vec<String>> {
        match self {
            UploadOutcome::Accepted { responses } => Ok(responses),
            UploadOutcome::Rejected { reason } => Err(CameraError::Protocol(reason)),
        }
    }
}

/// Pure encoding rules of the head's `#code(values)` protocol, usable
/// without an updater.
pub struct CommandCodec;

impl CommandCodec {
    /// Encode one parameter write. Parameters without a device code live
    /// only on the board side and produce no line.
    pub fn encode(spec: &ParameterSpec, value: &ParameterValue) -> Result<Option<String>> {
        let Some(code) = spec.code.as_deref() else {
            return Ok(None);
        };
        if value.kind() != spec.kind() {
            return Err(CameraError::Validation(format!(
                "cannot encode {:?} value for {}",
                value.kind(),
                spec.name
            )));
        }
        let line = match value {
            ParameterValue::Scalar(v) => format!("{code}({v})"),
            ParameterValue::Geometry(g) => {
                let [a, b, c, d] = g.device_order();
                format!("{code}({a},{b},{c},{d})")
            }
            ParameterValue::Unit => code.to_string(),
        };
        Ok(Some(line))
    }

    /// Parse a command line back into its code and value. Four values are
    /// read as geometry in device order.
    pub fn decode(line: &str) -> Result<(String, ParameterValue)> {
        let line = line.trim();
        let malformed = || CameraError::Validation(format!("malformed command line '{line}'"));
        if !line.starts_with('#') {
            return Err(malformed());
        }
        let Some(open) = line.find('(') else {
            return Ok((line.to_string(), ParameterValue::Unit));
        };
        let args = line[open + 1..].strip_suffix(')').ok_or_else(malformed)?;
        let values = args
            .split(',')
            .map(|v| v.trim().parse::<i64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| malformed())?;
        let value = match values.as_slice() {
            [v] => ParameterValue::Scalar(*v),
            [a, b, c, d] => ParameterValue::Geometry(FrameFormat::from_device_order([*a, *b, *c, *d])),
            _ => return Err(malformed()),
        };
        Ok((line[..open].to_string(), value))
    }

    /// One line per settable parameter that has a device code, using each
    /// parameter's current value. Code-only commands are actions rather
    /// than settings and never appear in a table batch.
    pub fn encode_batch<'a>(specs: impl IntoIterator<Item = &'a ParameterSpec>) -> Result<CommandBatch> {
        let mut lines = Vec::new();
        for spec in specs {
            if spec.kind() == ParameterKind::CodeOnly {
                continue;
            }
            if let Some(line) = Self::encode(spec, &spec.value)? {
                lines.push(line);
            }
        }
        Ok(CommandBatch::new(lines))
    }
}

/// Runs encoded parameter writes through the updater.
pub struct CommandChannel<U: Updater> {
    updater: U,
    command_file: PathBuf,
}

impl<U: Updater> CommandChannel<U> {
    /// * `updater`: process boundary to the camera head.
    /// * `command_file`: protocol file written before each upload.
    pub fn new(updater: U, command_file: impl Into<PathBuf>) -> Self {
        Self {
            updater,
            command_file: command_file.into(),
        }
    }

    pub fn updater(&self) -> &U {
        &self.updater
    }

    pub fn updater_mut(&mut self) -> &mut U {
        &mut self.updater
    }

    pub fn command_file(&self) -> &Path {
        &self.command_file
    }

    /// Write the batch to the command file, run the updater and check its
    /// answer for the error marker.
    pub fn upload(&mut self, batch: &CommandBatch) -> Result<UploadOutcome> {
        fs::write(&self.command_file, batch.contents())?;
        debug!(file = ?self.command_file, commands = ?batch.commands(), "uploading command batch");
        let responses = self.updater.run(&self.command_file)?;
        let rejected = responses
            .iter()
            .any(|line| line.as_bytes().windows(2).any(|w| w == ERROR_MARKER));
        if rejected {
            let reason = format!(
                "{} rejected by device: {}",
                batch.commands().join(" "),
                responses.join(" | ")
            );
            warn!("{reason}");
            Ok(UploadOutcome::Rejected { reason })
        } else {
            Ok(UploadOutcome::Accepted { responses })
        }
    }

    /// Send a single parameter write. Board only parameters are accepted
    /// without involving the device. The caller commits the value into the
    /// registry when the outcome is accepted.
    pub fn write_single(&mut self, spec: &ParameterSpec, value: &ParameterValue) -> Result<UploadOutcome> {
        match CommandCodec::encode(spec, value)? {
            Some(line) => self.upload(&CommandBatch::new([line])),
            None => {
                debug!(parameter = %spec.name, "board only parameter, nothing sent to device");
                Ok(UploadOutcome::Accepted { responses: Vec::new() })
            }
        }
    }

    /// Ask the head for a value, e.g. `#A` for the maximum frame rate at the
    /// current geometry. Returns the first answer line carrying that code.
    pub fn query(&mut self, code: &str) -> Result<Option<i64>> {
        let responses = self
            .upload(&CommandBatch::new([code.to_string()]))?
            .into_result()?;
        Ok(responses.iter().find_map(|line| match CommandCodec::decode(line) {
            Ok((answered, ParameterValue::Scalar(v))) if answered == code => Some(v),
            _ => None,
        }))
    }

    /// Push a value into the board fields that mirror it. Geometry writes
    /// all four components. Returns the number of board writes.
    pub fn mirror_to_board<G: FrameGrabber + ?Sized>(
        &self,
        grabber: &mut G,
        spec: &ParameterSpec,
        value: &ParameterValue,
    ) -> Result<usize> {
        let writes: Vec<(BoardField, i64)> = match value {
            ParameterValue::Scalar(v) => spec.board_fields.iter().map(|f| (*f, *v)).collect(),
            ParameterValue::Geometry(g) if spec.board_fields.len() == 4 => spec
                .board_fields
                .iter()
                .copied()
                .zip(g.components())
                .collect(),
            ParameterValue::Geometry(_) if spec.board_fields.is_empty() => Vec::new(),
            ParameterValue::Geometry(_) => {
                return Err(CameraError::Validation(format!(
                    "{} mirrors geometry into {} board fields, expected four",
                    spec.name,
                    spec.board_fields.len()
                )))
            }
            ParameterValue::Unit => Vec::new(),
        };
        for (field, v) in &writes {
            grabber.set_parameter(*field, *v)?;
        }
        if !writes.is_empty() {
            debug!(parameter = %spec.name, ?writes, "mirrored to board");
        }
        Ok(writes.len())
    }
}
