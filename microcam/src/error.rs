//! Error taxonomy for the camera control core.
//!
//! Errors fall into two groups. Validation and protocol errors are
//! recoverable: the caller rejects the edit and the registry still holds the
//! last committed value. Resource, timeout and board errors are fatal to the
//! current acquisition session; by the time they reach the caller the board
//! memory and display surface have already been released.

use thiserror::Error;

/// Convenience alias for results using the camera error type.
pub type Result<T> = std::result::Result<T, CameraError>;

#[derive(Error, Debug)]
pub enum CameraError {
    /// Value outside a parameter's range, unknown parameter or wrong shape.
    /// Raised before any device interaction.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The device rejected a command batch (error marker in the response).
    #[error("Device rejected command: {0}")]
    Protocol(String),

    /// Buffer or display allocation failed.
    #[error("Resource error: {0}")]
    Resource(String),

    /// Bounded wait for the next frame expired.
    #[error("Timed out waiting for frame {frame} after {waited_ms} ms")]
    Timeout { frame: i64, waited_ms: u128 },

    /// The board reported a failure, e.g. a negative frame index.
    #[error("Frame grabber error: {0}")]
    Board(String),

    /// The requested operation is not allowed in the current camera state.
    #[error("Operation '{operation}' not allowed while {state}")]
    State {
        operation: &'static str,
        state: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl CameraError {
    /// Recoverable errors leave the session untouched and only require the
    /// caller to revert the displayed value.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CameraError::Validation(_) | CameraError::Protocol(_))
    }
}
