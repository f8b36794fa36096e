//! Error types and handling
//!
//! Top-level error type for the command line, with stable codes and exit
//! statuses.

use crate::capture::ConnectError;
use crate::recorder::{ConfigError, RecordingError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Recording error: {0}")]
    Recording(#[from] RecordingError),
}

impl AppError {
    /// Stable identifier for machine-readable output
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Connect(_) => "DEVICE_ERROR",
            AppError::Recording(RecordingError::Aborted(_)) => "RECORDING_ABORTED",
            AppError::Recording(_) => "RECORDING_ERROR",
        }
    }

    /// Process exit status
    ///
    /// 2 for bad configuration, 3 when no device could be reached, 4 when a
    /// session aborted after recording had begun, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Config(_) => 2,
            AppError::Connect(_) => 3,
            AppError::Recording(RecordingError::Aborted(_) | RecordingError::StopTimeout(_)) => 4,
            AppError::Recording(RecordingError::Config(_)) => 2,
            _ => 1,
        }
    }
}

/// Error response for JSON output
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&AppError> for ErrorResponse {
    fn from(error: &AppError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_exit_statuses() {
        let aborted =
            AppError::from(RecordingError::Aborted("4 consecutive write failures".into()));
        assert_eq!(aborted.code(), "RECORDING_ABORTED");
        assert_eq!(aborted.exit_code(), 4);

        let missing = AppError::from(ConnectError::NotFound("no headset on the network".into()));
        assert_eq!(missing.exit_code(), 3);

        let invalid = AppError::from(ConfigError::Invalid("fps must be positive".into()));
        assert_eq!(invalid.exit_code(), 2);

        let response = ErrorResponse::from(&invalid);
        assert_eq!(response.code, "CONFIG_ERROR");
        assert!(response.message.contains("fps must be positive"));
    }
}
