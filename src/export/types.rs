//! Export types
//!
//! Errors and progress stages for a single export attempt, plus the error
//! type of the container writer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Container produced by an export
pub const CONTAINER_EXTENSION: &str = "mp4";

/// Media type reported to the transport
pub const CONTAINER_MEDIA_TYPE: &str = "video/mp4";

/// Passthrough identifiers attached to one export
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    /// Caller-supplied timestamp correlating the clip with a remote event
    pub correlation_timestamp: Option<String>,
    /// Remote session the clip belongs to
    pub session_id: Option<String>,
}

impl ExportRequest {
    pub fn new(correlation_timestamp: Option<String>) -> Self {
        Self {
            correlation_timestamp,
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Stages an export passes through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ExportStage {
    /// Copying the buffer contents
    Snapshotting,
    /// Writing samples into the container
    Muxing,
    /// Writing the index and closing the file
    Finalizing,
    /// Artifact handed to the completion sink
    Complete,
    /// Export abandoned
    Error { message: String },
}

/// Export errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No video track format has been captured")]
    MissingVideoFormat,

    #[error("Snapshot contains no frames")]
    EmptySnapshot,

    #[error("Container error: {0}")]
    Mux(#[from] MuxError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Export task failed: {0}")]
    Task(String),
}

impl From<ExportError> for String {
    fn from(e: ExportError) -> String {
        e.to_string()
    }
}

/// Container writer errors
#[derive(Error, Debug)]
pub enum MuxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid track or codec configuration
    #[error("Invalid muxer config: {0}")]
    InvalidConfig(String),

    /// Unknown track, or a sample for a track of the wrong kind
    #[error("Track error: {0}")]
    TrackError(String),

    /// A call arrived in the wrong writer state
    #[error("Invalid writer state: {0}")]
    InvalidState(String),

    /// A box or table outgrew its field width
    #[error("Size overflow: {0}")]
    Overflow(String),
}

pub type MuxResult<T> = Result<T, MuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mux_error_display() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = MuxError::from(io_err);
        assert!(err.to_string().contains("IO error"));
        assert!(err.to_string().contains("file not found"));

        let err = MuxError::TrackError("track 5 not found".into());
        assert_eq!(err.to_string(), "Track error: track 5 not found");
    }

    #[test]
    fn export_error_wraps_mux_error() {
        let err: ExportError = MuxError::InvalidState("already stopped".into()).into();
        assert!(matches!(err, ExportError::Mux(_)));
        assert_eq!(
            String::from(err),
            "Container error: Invalid writer state: already stopped"
        );
    }

    #[test]
    fn stage_serializes_tagged() {
        let json = serde_json::to_string(&ExportStage::Error {
            message: "disk full".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"error","message":"disk full"}"#);
    }
}
