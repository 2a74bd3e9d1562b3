//! Error type shared by configuration, session lifecycle and device backends

use thiserror::Error;

/// Errors surfaced synchronously to whoever configures or tears down a loopback.
///
/// The real-time paths never produce these; they degrade to "nothing
/// available" instead.
#[derive(Error, Debug)]
pub enum LoopbackError {
    #[error("Missing required argument: {0}")]
    MissingArgument(&'static str),

    #[error("Invalid value for {key}: {value}")]
    InvalidArgument { key: String, value: String },

    #[error("Unknown argument: {0}")]
    UnknownArgument(String),

    #[error("Argument given more than once: {0}")]
    DuplicateArgument(String),

    #[error("Invalid sample specification: {0}")]
    InvalidSampleSpec(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LoopbackError {
    pub(crate) fn invalid(key: &str, value: impl ToString) -> Self {
        Self::InvalidArgument {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, LoopbackError>;
