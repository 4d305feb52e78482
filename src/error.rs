// Lapse Cam Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LapseError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Security error: {0}")]
    Security(String),

    #[error("Resource limit exceeded: {message} (limit: {limit})")]
    Resource { message: String, limit: String },

    #[error("Process error: {0}")]
    Process(String),

    #[error("Process timed out: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("{0}")]
    State(String),

    #[error("{0}")]
    Other(String),
}

/// Coarse error category carried on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Validation,
    Security,
    Resource,
    Process,
    Filesystem,
    State,
    Cancelled,
}

impl LapseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LapseError::Validation(_) | LapseError::Json(_) => ErrorKind::Validation,
            LapseError::Security(_) => ErrorKind::Security,
            LapseError::Resource { .. } => ErrorKind::Resource,
            LapseError::Process(_) | LapseError::Timeout(_) => ErrorKind::Process,
            LapseError::Cancelled(_) => ErrorKind::Cancelled,
            LapseError::Io(_) | LapseError::Config(_) => ErrorKind::Filesystem,
            LapseError::State(_) => ErrorKind::State,
            LapseError::Other(_) => ErrorKind::Process,
        }
    }

    pub fn resource(message: impl Into<String>, limit: impl ToString) -> Self {
        LapseError::Resource {
            message: message.into(),
            limit: limit.to_string(),
        }
    }

    /// State errors are informational and are surfaced as notifications.
    pub fn is_informational(&self) -> bool {
        matches!(self, LapseError::State(_))
    }
}

impl From<anyhow::Error> for LapseError {
    fn from(err: anyhow::Error) -> Self {
        LapseError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LapseError>;
