//! Capture session state management
//!
//! Defines the session state machine, per-session bookkeeping and the
//! events broadcast to observers.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::export::ExportStage;
use crate::upload::UploadStatus;

/// Current state of the capture session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No producers running
    #[default]
    Idle,
    /// Video and audio producers running
    Running,
    /// Video producer running, audio failed to start
    Degraded,
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Idle)
    }
}

/// Why a running session was torn down and started again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RestartReason {
    /// Device rotation changed the clip orientation
    Orientation,
    /// Encoder output format changed
    FormatChange,
    /// Screen on/off with restart-on-screen-change enabled
    ScreenPolicy,
}

/// Information about one capture session
///
/// A new session is created on every start and restart. Frames from
/// different sessions are never mixed in one buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Session index (0, 1, 2, ...)
    pub index: usize,

    /// Clip rotation computed at session start
    pub rotation_degrees: u16,

    /// Whether the audio producer started
    pub has_audio: bool,

    /// Unix timestamp when the session started
    pub unix_start_ms: i64,

    /// Unix timestamp when the session ended
    pub unix_end_ms: Option<i64>,
}

impl SessionInfo {
    pub fn new(index: usize, rotation_degrees: u16, has_audio: bool) -> Self {
        Self {
            index,
            rotation_degrees,
            has_audio,
            unix_start_ms: Utc::now().timestamp_millis(),
            unix_end_ms: None,
        }
    }

    /// End the session
    pub fn end(&mut self) {
        self.unix_end_ms = Some(Utc::now().timestamp_millis());
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.unix_end_ms.map(|end| end - self.unix_start_ms)
    }
}

/// Events broadcast by the session and the export path
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ReplayEvent {
    SessionStarted { index: usize, has_audio: bool },
    SessionStopped { index: usize },
    SessionRestarted { reason: RestartReason },
    /// Audio pipeline failed; the session runs video-only
    AudioUnavailable { message: String },
    ExportProgress { stage: ExportStage },
    /// Trigger arrived inside the debounce window
    ExportDebounced,
    /// Trigger found nothing buffered
    ExportEmpty,
    ExportCompleted {
        remote_name: String,
        size_bytes: u64,
        has_audio: bool,
    },
    ExportFailed { message: String },
    UploadFinished { remote_name: String, status: UploadStatus },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_info_duration() {
        let mut info = SessionInfo::new(3, 90, false);
        assert_eq!(info.duration_ms(), None);
        info.end();
        assert!(info.duration_ms().unwrap() >= 0);
    }

    #[test]
    fn state_activity() {
        assert!(!SessionState::default().is_active());
        assert!(SessionState::Degraded.is_active());
    }

    #[test]
    fn event_serializes_tagged() {
        let json = serde_json::to_string(&ReplayEvent::SessionRestarted {
            reason: RestartReason::FormatChange,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"sessionRestarted","reason":"formatChange"}"#);
    }
}
