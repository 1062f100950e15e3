//! Transport that copies artifacts into a local outbox directory

use std::path::{Path, PathBuf};

use tokio::runtime::Handle;
use tracing::{error, info};

use super::{Artifact, Completion, Transport, UploadError, UploadStatus};

pub struct LocalDirTransport {
    outbox: PathBuf,
    runtime: Handle,
}

impl LocalDirTransport {
    /// Copies run on `runtime`, so `send` may be called from any thread.
    pub fn new(outbox: impl Into<PathBuf>, runtime: Handle) -> Self {
        Self {
            outbox: outbox.into(),
            runtime,
        }
    }

    pub fn outbox(&self) -> &Path {
        &self.outbox
    }
}

async fn copy_to_outbox(artifact: &Artifact, outbox: &Path) -> Result<PathBuf, UploadError> {
    tokio::fs::create_dir_all(outbox).await?;
    let dest = outbox.join(&artifact.remote_name);
    let copied = tokio::fs::copy(&artifact.path, &dest).await?;
    if copied != artifact.size_bytes {
        return Err(UploadError::Transport(format!(
            "copied {} of {} bytes",
            copied, artifact.size_bytes
        )));
    }
    Ok(dest)
}

impl Transport for LocalDirTransport {
    fn name(&self) -> &str {
        "local outbox"
    }

    fn send(&self, artifact: Artifact, completion: Completion) {
        let outbox = self.outbox.clone();
        self.runtime.spawn(async move {
            let status = match copy_to_outbox(&artifact, &outbox).await {
                Ok(dest) => {
                    info!("Copied {} to {:?}", artifact.remote_name, dest);
                    UploadStatus::succeeded(format!("file://{}", dest.display()))
                }
                Err(e) => UploadStatus::failed(e.to_string()),
            };
            if let Err(e) = completion.complete(status) {
                error!("Failed to delete artifact {:?}: {}", artifact.path, e);
            }
        });
    }
}
