//! Instant Replay - the last few seconds of audio and video, on demand.
//!
//! This is the main library crate. It keeps a rolling window of compressed
//! frames in memory and, when triggered, writes that window to an MP4 file
//! and hands it to a transport.

pub mod buffer;
pub mod capture;
pub mod config;
pub mod export;
pub mod recorder;
pub mod upload;
pub mod utils;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use capture::synthetic::SyntheticSources;
use capture::SourceFactory;
use config::ReplayConfig;
use export::{ContainerMuxer, ExportOutcome, ExportRequest, ExportTrigger};
use recorder::{CaptureSession, ReplayEvent};
use upload::{CompletionSink, LocalDirTransport, Transport};

/// Initialize tracing/logging. Call once, from the binary.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "instant_replay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// A capture session wired to an export trigger
pub struct Replay {
    pub session: CaptureSession,
    pub trigger: Arc<ExportTrigger>,
}

impl Replay {
    pub fn new(
        config: &ReplayConfig,
        sources: Box<dyn SourceFactory>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let session = CaptureSession::new(&config.capture, config.retention(), sources);
        let sink = CompletionSink::new(transport).with_events(session.events());
        let muxer = ContainerMuxer::new(&config.export.output_dir, &config.export.device_id);
        let trigger = ExportTrigger::new(session.buffer(), muxer, sink, config.debounce())
            .with_events(session.events());

        Self {
            session,
            trigger: Arc::new(trigger),
        }
    }
}

/// Wait until every exported artifact has been released by the transport.
async fn drain_uploads(events: &mut broadcast::Receiver<ReplayEvent>, mut pending: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while pending > 0 {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(ReplayEvent::UploadFinished { .. })) => pending -= 1,
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                tracing::warn!("{} uploads still pending at shutdown", pending);
                return;
            }
        }
    }
}

/// Forward stdin lines from a detached thread, so a pending read never
/// holds up shutdown.
fn stdin_lines() -> mpsc::UnboundedReceiver<std::io::Result<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Run with synthetic sources and a local outbox.
///
/// Every line on stdin triggers an export; a non-empty line is used as the
/// correlation timestamp. `q`, end of input or Ctrl-C stop the session.
pub async fn run(config: ReplayConfig) -> anyhow::Result<()> {
    tracing::info!("Starting Instant Replay v{}", env!("CARGO_PKG_VERSION"));

    let sources = SyntheticSources::new(config.video.clone(), config.audio.clone());
    let transport = Arc::new(LocalDirTransport::new(
        &config.upload.outbox_dir,
        tokio::runtime::Handle::current(),
    ));
    let mut replay = Replay::new(&config, Box::new(sources), transport);
    let mut uploads = replay.session.subscribe();

    replay.session.start()?;
    tracing::info!(
        "Buffering the last {}s; press Enter to export, q to quit",
        config.buffer.retention_secs
    );

    let mut lines = stdin_lines();
    let mut health = tokio::time::interval(Duration::from_secs(1));
    let mut exported = 0usize;

    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line.transpose()? else { break };
                let line = line.trim();
                if line == "q" {
                    break;
                }
                let request = ExportRequest::new((!line.is_empty()).then(|| line.to_string()));
                let outcome = replay.trigger.clone().trigger_export_async(request).await;
                match &outcome {
                    ExportOutcome::Exported(_) => {
                        exported += 1;
                        tracing::info!("{}", outcome);
                    }
                    ExportOutcome::Failed(_) => tracing::error!("{}", outcome),
                    ExportOutcome::Debounced | ExportOutcome::Empty => tracing::info!("{}", outcome),
                }
            }
            _ = health.tick() => {
                replay.session.poll()?;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    replay.session.stop()?;
    drain_uploads(&mut uploads, exported).await;
    tracing::info!("Instant Replay stopped");
    Ok(())
}
