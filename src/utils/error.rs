//! Error types and handling
//!
//! Common error types used across the crate. Each subsystem owns its own
//! error enum; `AppError` aggregates them for callers that drive the whole
//! pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::CaptureError;
use crate::config::ConfigError;
use crate::export::{ExportError, MuxError};
use crate::upload::UploadError;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("Mux error: {0}")]
    Mux(#[from] MuxError),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("Session error: {0}")]
    Session(String),
}

/// Error report suitable for diagnostics sinks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        let code = match &error {
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Capture(_) => "CAPTURE_ERROR",
            AppError::Export(_) => "EXPORT_ERROR",
            AppError::Mux(_) => "MUX_ERROR",
            AppError::Upload(_) => "UPLOAD_ERROR",
            AppError::Session(_) => "SESSION_ERROR",
        };

        ErrorResponse {
            code: code.to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
