//! Artifact hand-off
//!
//! An exported clip is an [`Artifact`]. The [`CompletionSink`] passes it to a
//! [`Transport`] along with a [`Completion`]; the transport fires the
//! completion once it no longer needs the file, and only then is the local
//! copy deleted.

pub mod completion;
pub mod local;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use completion::{Completion, CompletionSink};
pub use local::LocalDirTransport;

/// A finished clip on local disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Local file path
    pub path: PathBuf,
    /// File name to use at the destination
    pub remote_name: String,
    pub media_type: String,
    pub size_bytes: u64,
    /// Approximate wall-clock start of the clip
    pub start_epoch_ms: i64,
    /// Wall-clock time of the export
    pub end_epoch_ms: i64,
    pub has_audio: bool,
    pub correlation_timestamp: Option<String>,
    pub session_id: Option<String>,
}

/// Outcome reported by a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub success: bool,
    pub message: Option<String>,
    /// Where the clip can be found after a successful upload
    pub event_url: Option<String>,
}

impl UploadStatus {
    pub fn succeeded(event_url: impl Into<String>) -> Self {
        Self {
            success: true,
            message: None,
            event_url: Some(event_url.into()),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            event_url: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Moves an artifact to its destination.
///
/// Implementations must call [`Completion::complete`] when they are done
/// reading the file, whether or not the transfer succeeded. Extra calls
/// are ignored.
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    fn send(&self, artifact: Artifact, completion: Completion);
}
