//! Exactly-once artifact deletion

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{Artifact, Transport, UploadError, UploadStatus};
use crate::recorder::ReplayEvent;

struct CompletionInner {
    path: PathBuf,
    remote_name: String,
    fired: AtomicBool,
    events: Option<broadcast::Sender<ReplayEvent>>,
}

/// Continuation handed to a transport along with an artifact.
///
/// Cloning shares the same one-shot state: whichever clone fires first
/// deletes the file, every later call is a no-op.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

impl Completion {
    pub fn new(artifact: &Artifact, events: Option<broadcast::Sender<ReplayEvent>>) -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                path: artifact.path.clone(),
                remote_name: artifact.remote_name.clone(),
                fired: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn is_complete(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Report the transport outcome and delete the local artifact.
    ///
    /// Returns `Ok(false)` when the completion had already fired. A file
    /// that is already gone counts as deleted.
    pub fn complete(&self, status: UploadStatus) -> Result<bool, UploadError> {
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            debug!("Completion for {} already fired", self.inner.remote_name);
            return Ok(false);
        }

        if status.success {
            info!("Upload of {} finished", self.inner.remote_name);
        } else {
            warn!(
                "Upload of {} failed: {}",
                self.inner.remote_name,
                status.message.as_deref().unwrap_or("unknown error")
            );
        }

        if let Some(events) = &self.inner.events {
            let _ = events.send(ReplayEvent::UploadFinished {
                remote_name: self.inner.remote_name.clone(),
                status,
            });
        }

        match std::fs::remove_file(&self.inner.path) {
            Ok(()) => {
                debug!("Deleted artifact {:?}", self.inner.path);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Artifact {:?} already removed", self.inner.path);
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Receives finished artifacts and hands them to the transport
pub struct CompletionSink {
    transport: Arc<dyn Transport>,
    events: Option<broadcast::Sender<ReplayEvent>>,
}

impl CompletionSink {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            events: None,
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<ReplayEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Hand `artifact` to the transport. The returned completion is the same
    /// one the transport received.
    pub fn accept(&self, artifact: Artifact) -> Completion {
        let completion = Completion::new(&artifact, self.events.clone());
        info!(
            "Handing {} ({} bytes) to {}",
            artifact.remote_name,
            artifact.size_bytes,
            self.transport.name()
        );
        self.transport.send(artifact, completion.clone());
        completion
    }
}
