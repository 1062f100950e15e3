//! Debounced export entry point
//!
//! Remote commands, manual actions and retried network messages can all ask
//! for the same clip within moments of each other. The trigger accepts the
//! first and drops any other request that lands inside the cooldown.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::muxer::ContainerMuxer;
use super::types::{ExportError, ExportRequest, ExportStage};
use crate::buffer::RingBuffer;
use crate::recorder::ReplayEvent;
use crate::upload::{Artifact, CompletionSink};

/// Result of one trigger call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    /// Inside the cooldown of an earlier trigger
    Debounced,
    /// Nothing buffered
    Empty,
    /// Artifact written and handed to the completion sink
    Exported(Artifact),
    /// Export abandoned
    Failed(String),
}

impl ExportOutcome {
    pub fn artifact(&self) -> Option<&Artifact> {
        match self {
            ExportOutcome::Exported(artifact) => Some(artifact),
            _ => None,
        }
    }
}

impl fmt::Display for ExportOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportOutcome::Debounced => write!(f, "Ignored: inside the export cooldown"),
            ExportOutcome::Empty => write!(f, "Nothing buffered yet"),
            ExportOutcome::Exported(artifact) => write!(f, "Clip ready: {}", artifact.remote_name),
            ExportOutcome::Failed(message) => write!(f, "Export failed: {}", message),
        }
    }
}

pub struct ExportTrigger {
    buffer: Arc<RingBuffer>,
    debounce: Duration,
    last_trigger: Mutex<Option<Instant>>,
    muxer: ContainerMuxer,
    sink: CompletionSink,
    events: Option<broadcast::Sender<ReplayEvent>>,
}

impl ExportTrigger {
    pub fn new(
        buffer: Arc<RingBuffer>,
        muxer: ContainerMuxer,
        sink: CompletionSink,
        debounce: Duration,
    ) -> Self {
        Self {
            buffer,
            debounce,
            last_trigger: Mutex::new(None),
            muxer,
            sink,
            events: None,
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<ReplayEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    fn emit(&self, event: ReplayEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn progress(&self, stage: ExportStage) {
        self.emit(ReplayEvent::ExportProgress { stage });
    }

    /// Claim the trigger slot. The check and the update happen under one
    /// lock, so concurrent callers cannot both pass.
    fn claim(&self) -> bool {
        let mut last = self.last_trigger.lock();
        let now = Instant::now();
        if let Some(previous) = *last {
            if now.duration_since(previous) < self.debounce {
                return false;
            }
        }
        *last = Some(now);
        true
    }

    /// Export the buffered window.
    ///
    /// Blocks for the duration of the mux. Failures are reported through the
    /// outcome and events; they never touch the buffer or the producers.
    pub fn trigger_export(&self, request: ExportRequest) -> ExportOutcome {
        if !self.claim() {
            debug!("Export trigger debounced");
            self.emit(ReplayEvent::ExportDebounced);
            return ExportOutcome::Debounced;
        }

        // The rotation hint comes with the snapshot, as recorded when the
        // session started, never from the live orientation inputs
        self.progress(ExportStage::Snapshotting);
        let snapshot = self.buffer.snapshot();
        if snapshot.is_empty() {
            info!("Export triggered with an empty buffer, nothing to do");
            self.emit(ReplayEvent::ExportEmpty);
            return ExportOutcome::Empty;
        }

        info!(
            "Exporting {} frames ({} ms, rotation {}, correlation {:?})",
            snapshot.len(),
            snapshot.span_us() / 1000,
            snapshot.rotation().degrees(),
            request.correlation_timestamp
        );

        match self.muxer.export(snapshot, &request, |stage| self.progress(stage)) {
            Ok(artifact) => {
                self.progress(ExportStage::Complete);
                self.emit(ReplayEvent::ExportCompleted {
                    remote_name: artifact.remote_name.clone(),
                    size_bytes: artifact.size_bytes,
                    has_audio: artifact.has_audio,
                });
                self.sink.accept(artifact.clone());
                ExportOutcome::Exported(artifact)
            }
            Err(e) => self.fail(e),
        }
    }

    fn fail(&self, e: ExportError) -> ExportOutcome {
        error!("Export failed: {}", e);
        let message = String::from(e);
        self.progress(ExportStage::Error {
            message: message.clone(),
        });
        self.emit(ReplayEvent::ExportFailed {
            message: message.clone(),
        });
        ExportOutcome::Failed(message)
    }

    /// [`trigger_export`](Self::trigger_export) on the blocking pool, for
    /// callers running on an async executor.
    pub async fn trigger_export_async(self: Arc<Self>, request: ExportRequest) -> ExportOutcome {
        let trigger = self.clone();
        match tokio::task::spawn_blocking(move || trigger.trigger_export(request)).await {
            Ok(outcome) => outcome,
            Err(e) => self.fail(ExportError::Task(e.to_string())),
        }
    }
}
