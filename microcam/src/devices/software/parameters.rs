use crate::{
    devices::hardware::framegrabber::BoardField,
    error::{CameraError, Result},
    utils::image::FrameFormat,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    ffi::OsStr,
    fmt::Display,
    fs::File,
    path::Path,
};
use tracing::{debug, info};

/// Parameter names used by the acquisition core. The registry accepts any
/// name loaded from a file, these are the ones the core reads itself.
pub mod names {
    pub const FRAME_FORMAT: &str = "frameformat";
    pub const FRAME_RATE: &str = "framerate";
    pub const EXPOSURE_TIME: &str = "exptime";
    pub const GAIN: &str = "gain";
    pub const FPN: &str = "fpn";
    pub const BLACK_LEVEL: &str = "blacklevel";
    pub const DUAL_SLOPE: &str = "dualslope";
    pub const TRIPLE_SLOPE: &str = "tripleslope";
    pub const BUFFER_DEPTH: &str = "bufferdepth";
    pub const FRAMES_AFTER_TRIGGER: &str = "framesaftertrigger";
    pub const RESET_CAMERA: &str = "resetcamera";
}

/// Inclusive `[min, max]` range, written as a two element list in the
/// parameter file.
#[derive(Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(from = "[i64; 2]", into = "[i64; 2]")]
pub struct Bounds {
    pub min: i64,
    pub max: i64,
}

impl Bounds {
    pub const fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: i64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

impl From<[i64; 2]> for Bounds {
    fn from(b: [i64; 2]) -> Self {
        Self::new(b[0], b[1])
    }
}

impl From<Bounds> for [i64; 2] {
    fn from(b: Bounds) -> Self {
        [b.min, b.max]
    }
}

impl Display for Bounds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Shape of a parameter; each shape carries its own parse and range rule.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParameterKind {
    /// One integer value, e.g. frame rate in Hz.
    Scalar,
    /// The four component region of interest.
    Geometry4,
    /// A bare command with no value, e.g. a camera reset.
    CodeOnly,
}

impl ParameterKind {
    /// Parse user supplied text into a value of this shape. Geometry takes
    /// four comma separated integers in `x, y, w, h` order.
    pub fn parse(&self, text: &str) -> std::result::Result<ParameterValue, String> {
        let text = text.trim();
        match self {
            ParameterKind::Scalar => text
                .parse::<i64>()
                .map(ParameterValue::Scalar)
                .map_err(|_| format!("'{text}' is not an integer")),
            ParameterKind::Geometry4 => {
                let parts = text
                    .split(',')
                    .map(|p| p.trim().parse::<i64>())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|_| format!("'{text}' is not a list of integers"))?;
                let components: [i64; 4] = parts
                    .try_into()
                    .map_err(|_| format!("'{text}' needs exactly four components"))?;
                Ok(ParameterValue::Geometry(FrameFormat::from_components(
                    components,
                )))
            }
            ParameterKind::CodeOnly if text.is_empty() => Ok(ParameterValue::Unit),
            ParameterKind::CodeOnly => Err(format!("command takes no value, got '{text}'")),
        }
    }

    /// Check `value` against `range` for this shape.
    fn check(&self, value: &ParameterValue, range: &ValidRange) -> std::result::Result<(), String> {
        match (self, value, range) {
            (_, _, ValidRange::Unconstrained) => Ok(()),
            (ParameterKind::Scalar, ParameterValue::Scalar(v), ValidRange::Scalar(b)) => {
                if b.contains(*v) {
                    Ok(())
                } else {
                    Err(format!("{v} outside {b}"))
                }
            }
            (ParameterKind::Geometry4, ParameterValue::Geometry(g), ValidRange::Components(bounds)) => {
                const LABELS: [&str; 4] = ["x", "y", "w", "h"];
                for ((v, b), label) in g.components().iter().zip(bounds).zip(LABELS) {
                    if !b.contains(*v) {
                        return Err(format!("{label}={v} outside {b}"));
                    }
                }
                Ok(())
            }
            (kind, _, range) => Err(format!("range {range:?} does not apply to {kind:?} values")),
        }
    }
}

/// Committed or requested value of a parameter.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(untagged)]
pub enum ParameterValue {
    Scalar(i64),
    Geometry(FrameFormat),
    #[default]
    Unit,
}

impl ParameterValue {
    pub fn kind(&self) -> ParameterKind {
        match self {
            ParameterValue::Scalar(_) => ParameterKind::Scalar,
            ParameterValue::Geometry(_) => ParameterKind::Geometry4,
            ParameterValue::Unit => ParameterKind::CodeOnly,
        }
    }

    pub fn as_scalar(&self) -> Option<i64> {
        match self {
            ParameterValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_geometry(&self) -> Option<FrameFormat> {
        match self {
            ParameterValue::Geometry(g) => Some(*g),
            _ => None,
        }
    }
}

impl Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParameterValue::Scalar(v) => write!(f, "{v}"),
            ParameterValue::Geometry(g) => write!(f, "{},{},{},{}", g.x, g.y, g.w, g.h),
            ParameterValue::Unit => write!(f, "-"),
        }
    }
}

/// Valid values for a parameter. Geometry ranges are per component in
/// `x, y, w, h` order.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(untagged)]
pub enum ValidRange {
    Scalar(Bounds),
    Components([Bounds; 4]),
    #[default]
    Unconstrained,
}

/// Outcome of validating a requested value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Validation {
    Accepted,
    Rejected(String),
}

impl Validation {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Validation::Accepted)
    }

    /// Turn a rejection into a [`CameraError::Validation`].
    pub fn into_result(self) -> Result<()> {
        match self {
            Validation::Accepted => Ok(()),
            Validation::Rejected(reason) => Err(CameraError::Validation(reason)),
        }
    }
}

/// One controllable device parameter.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ParameterSpec {
    /// Key in the registry; filled from the map key when loading a file.
    #[serde(skip)]
    pub name: String,
    /// Two character sensor command token, absent for board only
    /// parameters such as the buffer depth.
    pub code: Option<String>,
    /// Board identifiers the value is mirrored into.
    #[serde(default)]
    pub board_fields: Vec<BoardField>,
    #[serde(default)]
    pub value: ParameterValue,
    #[serde(default)]
    pub range: ValidRange,
}

impl ParameterSpec {
    fn new(
        name: &str,
        code: Option<&str>,
        board_fields: &[BoardField],
        value: ParameterValue,
        range: ValidRange,
    ) -> Self {
        Self {
            name: name.to_string(),
            code: code.map(str::to_string),
            board_fields: board_fields.to_vec(),
            value,
            range,
        }
    }

    pub fn kind(&self) -> ParameterKind {
        self.value.kind()
    }

    /// Check `value` against this parameter's shape and range.
    pub fn validate(&self, value: &ParameterValue) -> Validation {
        if value.kind() != self.kind() {
            return Validation::Rejected(format!(
                "{} expects a {:?} value, got {:?}",
                self.name,
                self.kind(),
                value.kind()
            ));
        }
        match self.kind().check(value, &self.range) {
            Ok(()) => Validation::Accepted,
            Err(reason) => Validation::Rejected(format!("{}: {reason}", self.name)),
        }
    }
}

/// Whole-table copy of the registry used for save, load and reset flows.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(transparent)]
pub struct RegistrySnapshot {
    params: BTreeMap<String, ParameterSpec>,
}

impl RegistrySnapshot {
    pub fn get(&self, name: &str) -> Option<&ParameterSpec> {
        self.params.get(name)
    }

    pub fn specs(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.params.values()
    }

    /// Every stored value must sit inside its own range.
    pub fn validate(&self) -> Result<()> {
        for spec in self.params.values() {
            spec.validate(&spec.value).into_result()?;
        }
        Ok(())
    }

    /// Write the table to a YAML file.
    ///
    /// * `filepath`: destination, overwritten if it exists.
    pub fn save<F: AsRef<OsStr>>(&self, filepath: F) -> Result<()> {
        let file = File::create(Path::new(&filepath))?;
        serde_yaml::to_writer(file, self)?;
        Ok(())
    }

    /// Read a table from a YAML file and check every value against its
    /// range.
    ///
    /// * `filepath`: path to the parameter file.
    pub fn load<F: AsRef<OsStr>>(filepath: F) -> Result<Self> {
        let file = File::open(Path::new(&filepath))?;
        let mut snapshot: RegistrySnapshot = serde_yaml::from_reader(file)?;
        for (name, spec) in snapshot.params.iter_mut() {
            spec.name = name.clone();
        }
        snapshot.validate()?;
        Ok(snapshot)
    }
}

/// Table of device parameters and their committed values. Values change
/// only through [`ParameterRegistry::commit`], which callers use after the
/// device acknowledged the matching command, so the table always reflects
/// what the hardware runs with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParameterRegistry {
    params: BTreeMap<String, ParameterSpec>,
}

impl Default for ParameterRegistry {
    fn default() -> Self {
        Self::defaults()
    }
}

impl ParameterRegistry {
    /// Factory table for the CL600x2 sensor on a full-sensor readout.
    pub fn defaults() -> Self {
        use names::*;
        let scalar = |v| ParameterValue::Scalar(v);
        let bounds = |min, max| ValidRange::Scalar(Bounds::new(min, max));
        let specs = [
            ParameterSpec::new(
                FRAME_FORMAT,
                Some("#R"),
                &BoardField::GEOMETRY,
                ParameterValue::Geometry(FrameFormat::FULL_SENSOR),
                ValidRange::Components([
                    Bounds::new(0, 1264),
                    Bounds::new(0, 1023),
                    Bounds::new(16, 1280),
                    Bounds::new(1, 1024),
                ]),
            ),
            ParameterSpec::new(
                FRAME_RATE,
                Some("#r"),
                &[BoardField::FramesPerSec],
                scalar(100),
                bounds(20, 500_000),
            ),
            ParameterSpec::new(
                EXPOSURE_TIME,
                Some("#e"),
                &[BoardField::Exposure],
                scalar(100),
                bounds(1, 10_000_000),
            ),
            ParameterSpec::new(GAIN, Some("#G"), &[], scalar(1), bounds(1, 4)),
            ParameterSpec::new(FPN, Some("#F"), &[], scalar(0), bounds(0, 1)),
            ParameterSpec::new(BLACK_LEVEL, Some("#z"), &[], scalar(0), bounds(0, 100)),
            ParameterSpec::new(DUAL_SLOPE, Some("#D"), &[], scalar(0), bounds(0, 100)),
            ParameterSpec::new(TRIPLE_SLOPE, Some("#T"), &[], scalar(0), bounds(0, 100)),
            ParameterSpec::new(BUFFER_DEPTH, None, &[], scalar(1000), bounds(1, 10_000)),
            ParameterSpec::new(FRAMES_AFTER_TRIGGER, None, &[], scalar(100), bounds(0, 10_000)),
            ParameterSpec::new(
                RESET_CAMERA,
                Some("#o"),
                &[],
                ParameterValue::Unit,
                ValidRange::Unconstrained,
            ),
        ];
        Self {
            params: specs.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParameterSpec> {
        self.params.get(name)
    }

    /// Look a parameter up, failing with a validation error if unknown.
    pub fn spec(&self, name: &str) -> Result<&ParameterSpec> {
        self.params
            .get(name)
            .ok_or_else(|| CameraError::Validation(format!("unknown parameter '{name}'")))
    }

    pub fn specs(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.params.values()
    }

    /// Current value of a scalar parameter.
    pub fn scalar(&self, name: &str) -> Result<i64> {
        self.spec(name)?
            .value
            .as_scalar()
            .ok_or_else(|| CameraError::Validation(format!("'{name}' is not a scalar parameter")))
    }

    /// Current region of interest.
    pub fn frame_format(&self) -> Result<FrameFormat> {
        self.spec(names::FRAME_FORMAT)?
            .value
            .as_geometry()
            .ok_or_else(|| CameraError::Validation("'frameformat' is not a geometry".to_string()))
    }

    /// Check whether `value` may be written to `name`. Never mutates.
    pub fn validate(&self, name: &str, value: &ParameterValue) -> Validation {
        match self.params.get(name) {
            Some(spec) => spec.validate(value),
            None => Validation::Rejected(format!("unknown parameter '{name}'")),
        }
    }

    /// Parse and validate text typed by a user. Returns the parsed value on
    /// acceptance.
    pub fn validate_text(&self, name: &str, text: &str) -> Result<ParameterValue> {
        let spec = self.spec(name)?;
        let value = spec
            .kind()
            .parse(text)
            .map_err(|reason| CameraError::Validation(format!("{name}: {reason}")))?;
        spec.validate(&value).into_result()?;
        Ok(value)
    }

    /// Store a value the device has acknowledged.
    pub fn commit(&mut self, name: &str, value: ParameterValue) -> Result<()> {
        self.validate(name, &value).into_result()?;
        if let Some(spec) = self.params.get_mut(name) {
            debug!(parameter = name, %value, "committed");
            spec.value = value;
        }
        Ok(())
    }

    /// Apply a device reported maximum to a scalar parameter's range. The
    /// new maximum is refused if the committed value would fall outside it.
    pub fn set_upper_bound(&mut self, name: &str, max: i64) -> Result<()> {
        let spec = self
            .params
            .get_mut(name)
            .ok_or_else(|| CameraError::Validation(format!("unknown parameter '{name}'")))?;
        let ValidRange::Scalar(bounds) = spec.range else {
            return Err(CameraError::Validation(format!(
                "'{name}' has no scalar range to update"
            )));
        };
        let updated = Bounds::new(bounds.min, max);
        if let ParameterValue::Scalar(v) = spec.value {
            if !updated.contains(v) {
                return Err(CameraError::Validation(format!(
                    "{name}: committed value {v} outside reported range {updated}"
                )));
            }
        }
        info!(parameter = name, range = %updated, "updated range from device");
        spec.range = ValidRange::Scalar(updated);
        Ok(())
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            params: self.params.clone(),
        }
    }

    /// Replace the whole table.
    pub fn restore(&mut self, snapshot: RegistrySnapshot) {
        self.params = snapshot.params;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_file_path;
    use rstest::rstest;
    use serial_test::serial;

    fn scalar(v: i64) -> ParameterValue {
        ParameterValue::Scalar(v)
    }

    fn roi(x: i64, y: i64, w: i64, h: i64) -> ParameterValue {
        ParameterValue::Geometry(FrameFormat::new(x, y, w, h))
    }

    #[rstest]
    #[case(names::FRAME_RATE, 20, true)]
    #[case(names::FRAME_RATE, 500_000, true)]
    #[case(names::FRAME_RATE, 19, false)]
    #[case(names::FRAME_RATE, 500_001, false)]
    #[case(names::GAIN, 1, true)]
    #[case(names::GAIN, 4, true)]
    #[case(names::GAIN, 0, false)]
    #[case(names::GAIN, 5, false)]
    #[case(names::BUFFER_DEPTH, 1, true)]
    #[case(names::BUFFER_DEPTH, 10_000, true)]
    #[case(names::BUFFER_DEPTH, 0, false)]
    #[case(names::BUFFER_DEPTH, 10_001, false)]
    fn test_scalar_boundaries(#[case] name: &str, #[case] value: i64, #[case] accepted: bool) {
        let registry = ParameterRegistry::defaults();
        assert_eq!(registry.validate(name, &scalar(value)).is_accepted(), accepted);
    }

    #[rstest]
    #[case(roi(0, 0, 1280, 1024), true)]
    #[case(roi(1264, 1023, 16, 1), true)]
    #[case(roi(-1, 0, 1280, 1024), false)]
    #[case(roi(1265, 0, 16, 1024), false)]
    #[case(roi(0, -1, 1280, 1024), false)]
    #[case(roi(0, 1024, 1280, 1024), false)]
    #[case(roi(0, 0, 15, 1024), false)]
    #[case(roi(0, 0, 1281, 1024), false)]
    #[case(roi(0, 0, 1280, 0), false)]
    #[case(roi(0, 0, 1280, 1025), false)]
    fn test_geometry_boundaries(#[case] value: ParameterValue, #[case] accepted: bool) {
        let registry = ParameterRegistry::defaults();
        assert_eq!(
            registry.validate(names::FRAME_FORMAT, &value).is_accepted(),
            accepted
        );
    }

    #[test]
    fn test_validate_rejects_unknown_and_wrong_shape() {
        let registry = ParameterRegistry::defaults();
        assert!(!registry.validate("shutterangle", &scalar(1)).is_accepted());
        assert!(!registry.validate(names::FRAME_FORMAT, &scalar(1)).is_accepted());
        assert!(!registry.validate(names::GAIN, &roi(0, 0, 16, 1)).is_accepted());
        assert!(registry
            .validate(names::RESET_CAMERA, &ParameterValue::Unit)
            .is_accepted());
    }

    #[rstest]
    #[case(names::GAIN, "abc")]
    #[case(names::GAIN, "2.5")]
    #[case(names::GAIN, "")]
    #[case(names::FRAME_FORMAT, "0,0,1280")]
    #[case(names::FRAME_FORMAT, "0,0,wide,1024")]
    #[case(names::RESET_CAMERA, "1")]
    fn test_validate_text_rejects_non_numeric(#[case] name: &str, #[case] text: &str) {
        let registry = ParameterRegistry::defaults();
        assert!(matches!(
            registry.validate_text(name, text),
            Err(CameraError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_text_parses() {
        let registry = ParameterRegistry::defaults();
        assert_eq!(registry.validate_text(names::GAIN, " 3 ").unwrap(), scalar(3));
        assert_eq!(
            registry
                .validate_text(names::FRAME_FORMAT, "16, 8, 640, 480")
                .unwrap(),
            roi(16, 8, 640, 480)
        );
    }

    #[test]
    fn test_commit_refuses_out_of_range() {
        let mut registry = ParameterRegistry::defaults();
        assert!(registry.commit(names::GAIN, scalar(9)).is_err());
        assert_eq!(registry.scalar(names::GAIN).unwrap(), 1);

        registry.commit(names::GAIN, scalar(2)).unwrap();
        assert_eq!(registry.scalar(names::GAIN).unwrap(), 2);
    }

    #[test]
    fn test_set_upper_bound() {
        let mut registry = ParameterRegistry::defaults();
        registry.set_upper_bound(names::FRAME_RATE, 2000).unwrap();
        assert!(!registry
            .validate(names::FRAME_RATE, &scalar(2001))
            .is_accepted());
        // Committed value 100 would fall outside.
        assert!(registry.set_upper_bound(names::FRAME_RATE, 50).is_err());
        assert!(registry.set_upper_bound(names::FRAME_FORMAT, 50).is_err());
    }

    #[test]
    fn test_snapshot_restore() {
        let mut registry = ParameterRegistry::defaults();
        let snapshot = registry.snapshot();
        registry.commit(names::GAIN, scalar(4)).unwrap();
        registry.restore(snapshot);
        assert_eq!(registry, ParameterRegistry::defaults());
    }

    #[test]
    fn test_save_and_load_parameter_file() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("parameters.yaml");
        let mut registry = ParameterRegistry::defaults();
        registry
            .commit(names::FRAME_FORMAT, roi(16, 0, 640, 512))
            .unwrap();
        registry.snapshot().save(&path).unwrap();

        let read = RegistrySnapshot::load(&path).unwrap();
        assert_eq!(read, registry.snapshot());
        assert_eq!(read.get(names::FRAME_FORMAT).unwrap().name, "frameformat");
    }

    #[test]
    #[serial]
    fn test_load_fixture_parameter_file() {
        let file = test_file_path!("/config/devices/microscope/parameters.yaml");
        let snapshot = RegistrySnapshot::load(file).expect("Failed to load fixture");
        let mut registry = ParameterRegistry::defaults();
        registry.restore(snapshot);
        assert_eq!(registry.frame_format().unwrap(), FrameFormat::FULL_SENSOR);
        assert_eq!(registry.scalar(names::BUFFER_DEPTH).unwrap(), 1000);
        assert_eq!(
            registry.get(names::RESET_CAMERA).unwrap().kind(),
            ParameterKind::CodeOnly
        );
    }

    #[test]
    fn test_load_rejects_out_of_range_file() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("parameters.yaml");
        std::fs::write(
            &path,
            "gain:\n  code: '#G'\n  board_fields: []\n  value: 7\n  range: [1, 4]\n",
        )
        .unwrap();
        assert!(matches!(
            RegistrySnapshot::load(&path),
            Err(CameraError::Validation(_))
        ));
    }
}
