use crate::{
    devices::software::parameters::{ParameterKind, ParameterValue},
    error::{CameraError, Result},
    utils::image::FrameFormat,
};
use serde::Deserialize;

/// Value carried by a message: a single integer or a list of components.
#[derive(Deserialize, Debug, PartialEq, Clone)]
#[serde(untagged)]
pub enum MessageValue {
    Scalar(i64),
    Components(Vec<i64>),
}

/// Parameter change requested by another process.
#[derive(Deserialize, Debug, PartialEq, Clone)]
pub struct ParameterMessage {
    /// Registry name, e.g. `framerate`.
    pub name: String,
    /// Absent for code-only commands such as `resetcamera`. Geometry is
    /// given as `[x, y, w, h]`.
    #[serde(default)]
    pub value: Option<MessageValue>,
}

impl ParameterMessage {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Shape the message value for a parameter of `kind`.
    pub fn to_value(&self, kind: ParameterKind) -> Result<ParameterValue> {
        let mismatch = || {
            CameraError::Validation(format!(
                "message value {:?} does not fit {} ({kind:?})",
                self.value, self.name
            ))
        };
        match (kind, &self.value) {
            (ParameterKind::Scalar, Some(MessageValue::Scalar(v))) => Ok(ParameterValue::Scalar(*v)),
            (ParameterKind::Geometry4, Some(MessageValue::Components(c))) => {
                let components: [i64; 4] = c.as_slice().try_into().map_err(|_| mismatch())?;
                Ok(ParameterValue::Geometry(FrameFormat::from_components(components)))
            }
            (ParameterKind::CodeOnly, None) => Ok(ParameterValue::Unit),
            _ => Err(mismatch()),
        }
    }
}
