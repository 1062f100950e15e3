//! Video frame producer
//!
//! Owns a dedicated thread that polls a video [`Encoder`] with a bounded
//! timeout and copies every output unit into the ring buffer. The poll
//! timeout bounds how long `stop` waits for the thread to notice.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::frame::TrackKind;
use super::traits::{CaptureError, CaptureResult, Encoder, EncoderOutput, PcmSource};
use crate::buffer::RingBuffer;

/// Stops the wrapped encoder when dropped, on every exit path of a
/// producer thread including panics.
pub(crate) struct EncoderGuard<E: Encoder + ?Sized>(pub Box<E>);

impl<E: Encoder + ?Sized> Deref for EncoderGuard<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.0
    }
}

impl<E: Encoder + ?Sized> DerefMut for EncoderGuard<E> {
    fn deref_mut(&mut self) -> &mut E {
        &mut self.0
    }
}

impl<E: Encoder + ?Sized> Drop for EncoderGuard<E> {
    fn drop(&mut self) {
        tracing::debug!("Releasing encoder {}", self.0.name());
        self.0.stop();
    }
}

/// Same as [`EncoderGuard`] for PCM sources
pub(crate) struct PcmGuard(pub Box<dyn PcmSource>);

impl Deref for PcmGuard {
    type Target = dyn PcmSource;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl DerefMut for PcmGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.0
    }
}

impl Drop for PcmGuard {
    fn drop(&mut self) {
        self.0.stop();
    }
}

/// Route one encoder output into the buffer.
pub(crate) fn store_output(buffer: &RingBuffer, kind: TrackKind, output: EncoderOutput<'_>) {
    match output {
        EncoderOutput::FormatChanged(format) => {
            if format.kind() != kind {
                tracing::warn!(
                    "Ignoring {} format reported by the {} encoder",
                    format.kind(),
                    kind
                );
                return;
            }
            buffer.set_format(format);
        }
        EncoderOutput::Data {
            payload,
            timestamp_us,
            flags,
        } => {
            if payload.is_empty() {
                return;
            }
            buffer.add_frame(payload, timestamp_us, flags, kind);
        }
    }
}

/// Running producer thread with its stop flag.
#[derive(Debug)]
pub(crate) struct ProducerThread {
    name: &'static str,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProducerThread {
    /// Spawn `body` on a named thread and wait for it to report startup.
    ///
    /// `body` must send exactly one startup result before entering its
    /// polling loop, then return once `running` is cleared.
    pub(crate) fn spawn<F>(name: &'static str, body: F) -> CaptureResult<Self>
    where
        F: FnOnce(Arc<AtomicBool>, mpsc::SyncSender<CaptureResult<()>>) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let (started_tx, started_rx) = mpsc::sync_channel(1);

        let thread_running = running.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(thread_running, started_tx))
            .map_err(|e| CaptureError::ThreadSpawn(e.to_string()))?;

        let started = started_rx
            .recv()
            .unwrap_or_else(|_| Err(CaptureError::Encoder(format!("{} exited during start", name))));

        let mut thread = Self {
            name,
            running,
            handle: Some(handle),
        };
        if let Err(e) = started {
            thread.stop();
            return Err(e);
        }
        Ok(thread)
    }

    /// False once the thread has exited, whether asked to or not.
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("{} thread panicked", self.name);
            }
        }
    }
}

impl Drop for ProducerThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Video producer: one thread, one encoder, one ring buffer.
#[derive(Debug)]
pub struct VideoProducer {
    thread: ProducerThread,
}

impl VideoProducer {
    /// Start `encoder` on a new thread and begin feeding `buffer`.
    ///
    /// Returns once the encoder has started, or with its start error.
    pub fn start(
        encoder: Box<dyn Encoder>,
        buffer: Arc<RingBuffer>,
        poll_timeout: Duration,
    ) -> CaptureResult<Self> {
        let thread = ProducerThread::spawn("replay-video", move |running, started| {
            let mut encoder = EncoderGuard(encoder);
            let name = encoder.name().to_string();

            if let Err(e) = encoder.start() {
                tracing::error!("Failed to start video encoder {}: {}", name, e);
                let _ = started.send(Err(e));
                return;
            }
            let _ = started.send(Ok(()));
            tracing::info!("Video producer started ({})", name);

            while running.load(Ordering::Acquire) {
                match encoder.poll_output(poll_timeout) {
                    Ok(Some(output)) => store_output(&buffer, TrackKind::Video, output),
                    Ok(None) => {}
                    Err(e) if e.is_transient() => {
                        tracing::debug!("Video poll failed, retrying: {}", e);
                    }
                    Err(e) => {
                        tracing::error!("Video encoder {} failed: {}", name, e);
                        break;
                    }
                }
            }

            running.store(false, Ordering::Release);
            tracing::info!("Video producer stopped ({})", name);
        })?;

        Ok(Self { thread })
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_running()
    }

    /// Signal the thread and wait for it to release the encoder.
    pub fn stop(mut self) {
        self.thread.stop();
    }
}
