//! Audio frame producer
//!
//! Reads raw PCM from a [`PcmSource`], stamps each chunk from the running
//! byte count and feeds it to an [`AudioEncoder`]. Encoded output is drained
//! without blocking after every chunk and stored in the ring buffer.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::clock::{MediaClock, PtsAccumulator};
use super::frame::TrackKind;
use super::traits::{AudioEncoder, CaptureResult, PcmSource};
use super::video::{store_output, EncoderGuard, PcmGuard, ProducerThread};
use crate::buffer::RingBuffer;

/// Audio producer: PCM source, encoder and thread.
#[derive(Debug)]
pub struct AudioProducer {
    thread: ProducerThread,
}

impl AudioProducer {
    /// Start the PCM source and encoder on a new thread.
    ///
    /// Returns once both have started, or with the first start error.
    pub fn start(
        source: Box<dyn PcmSource>,
        encoder: Box<dyn AudioEncoder>,
        clock: MediaClock,
        buffer: Arc<RingBuffer>,
        read_timeout: Duration,
    ) -> CaptureResult<Self> {
        let thread = ProducerThread::spawn("replay-audio", move |running, started| {
            let mut source = PcmGuard(source);
            let mut encoder = EncoderGuard(encoder);
            let name = encoder.name().to_string();

            let startup = source.start().and_then(|_| encoder.start());
            if let Err(e) = startup {
                tracing::error!("Failed to start audio pipeline {}: {}", name, e);
                let _ = started.send(Err(e));
                return;
            }
            let _ = started.send(Ok(()));

            let format = source.format();
            tracing::info!(
                "Audio producer started ({}, {} Hz, {} ch)",
                name,
                format.sample_rate,
                format.channels
            );

            let mut pts = PtsAccumulator::new(format);
            let mut pcm = Vec::new();

            'capture: while running.load(Ordering::Acquire) {
                match source.read(&mut pcm, read_timeout) {
                    Ok(0) => {}
                    Ok(read) => {
                        let chunk = &pcm[..read.min(pcm.len())];
                        let timestamp_us = pts.next_pts(chunk.len(), clock.now_us());
                        match encoder.queue_input(chunk, timestamp_us) {
                            Ok(()) => {}
                            Err(e) if e.is_transient() => {
                                tracing::debug!("Audio input dropped: {}", e);
                            }
                            Err(e) => {
                                tracing::error!("Audio encoder {} rejected input: {}", name, e);
                                break 'capture;
                            }
                        }
                    }
                    Err(e) if e.is_transient() => {
                        tracing::debug!("PCM read failed, retrying: {}", e);
                    }
                    Err(e) => {
                        tracing::error!("PCM source failed: {}", e);
                        break 'capture;
                    }
                }

                loop {
                    match encoder.poll_output(Duration::ZERO) {
                        Ok(Some(output)) => store_output(&buffer, TrackKind::Audio, output),
                        Ok(None) => break,
                        Err(e) if e.is_transient() => break,
                        Err(e) => {
                            tracing::error!("Audio encoder {} failed: {}", name, e);
                            break 'capture;
                        }
                    }
                }
            }

            running.store(false, Ordering::Release);
            tracing::info!("Audio producer stopped ({})", name);
        })?;

        Ok(Self { thread })
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_running()
    }

    /// Signal the thread and wait for it to release source and encoder.
    pub fn stop(mut self) {
        self.thread.stop();
    }
}
