//! Capture trait definitions
//!
//! Platform-agnostic interfaces for the encoders and PCM sources that feed
//! the ring buffer. Real camera/microphone adapters live outside this crate;
//! they implement these traits and are handed to a session through a
//! [`SourceFactory`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::clock::MediaClock;
use super::frame::{FrameFlags, TrackFormat};

/// Producer-side errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Encoder error: {0}")]
    Encoder(String),

    /// A poll failed but the encoder is still usable
    #[error("Transient encoder error: {0}")]
    Transient(String),

    #[error("Producer already running")]
    AlreadyRunning,

    #[error("Failed to spawn producer thread: {0}")]
    ThreadSpawn(String),
}

impl CaptureError {
    /// Whether a polling loop should keep going after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, CaptureError::Transient(_))
    }
}

pub type CaptureResult<T> = Result<T, CaptureError>;

/// One event pulled from an encoder.
///
/// `Data` borrows the encoder's output buffer, which the encoder is free to
/// reuse on the next poll; consumers must copy what they keep.
#[derive(Debug)]
pub enum EncoderOutput<'a> {
    /// The output format stabilized (or changed)
    FormatChanged(TrackFormat),
    /// A compressed unit of output
    Data {
        payload: &'a [u8],
        timestamp_us: i64,
        flags: FrameFlags,
    },
}

/// A compressed-output source polled by a producer thread.
pub trait Encoder: Send {
    /// Human-readable name for logs
    fn name(&self) -> &str;

    /// Allocate the encoder. Called once, on the producer thread.
    fn start(&mut self) -> CaptureResult<()>;

    /// Wait up to `timeout` for the next output. `Ok(None)` is a transient
    /// empty poll, not end of stream.
    fn poll_output(&mut self, timeout: Duration) -> CaptureResult<Option<EncoderOutput<'_>>>;

    /// Release the encoder. Must be safe to call after a failed `start`.
    fn stop(&mut self);
}

/// An encoder fed with raw PCM by the audio producer.
pub trait AudioEncoder: Encoder {
    /// Queue a PCM chunk whose first sample is presented at `timestamp_us`.
    fn queue_input(&mut self, pcm: &[u8], timestamp_us: i64) -> CaptureResult<()>;
}

/// Raw PCM layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bytes_per_sample: u16,
}

impl PcmFormat {
    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.channels as u64 * self.bytes_per_sample as u64
    }
}

/// Raw PCM input (microphone). PCM carries no timestamps of its own.
pub trait PcmSource: Send {
    fn format(&self) -> PcmFormat;

    fn start(&mut self) -> CaptureResult<()>;

    /// Replace `buf` with the next chunk, waiting up to `timeout`.
    /// Returns the number of bytes read; zero means nothing was ready.
    fn read(&mut self, buf: &mut Vec<u8>, timeout: Duration) -> CaptureResult<usize>;

    fn stop(&mut self);
}

/// Builds fresh encoders for every capture session.
///
/// A restart always asks for new instances so that one exported file never
/// mixes two encoder configurations.
pub trait SourceFactory: Send + Sync {
    fn video_encoder(&self, clock: &MediaClock) -> CaptureResult<Box<dyn Encoder>>;

    /// `Ok(None)` when audio capture is disabled.
    fn audio_pipeline(
        &self,
        clock: &MediaClock,
    ) -> CaptureResult<Option<(Box<dyn PcmSource>, Box<dyn AudioEncoder>)>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_bytes_per_second() {
        let format = PcmFormat {
            sample_rate: 48_000,
            channels: 2,
            bytes_per_sample: 2,
        };
        assert_eq!(format.bytes_per_second(), 192_000);
    }

    #[test]
    fn only_transient_errors_keep_loops_alive() {
        assert!(CaptureError::Transient("busy".into()).is_transient());
        assert!(!CaptureError::Encoder("dead".into()).is_transient());
        assert!(!CaptureError::AlreadyRunning.is_transient());
    }
}
