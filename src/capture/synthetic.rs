//! Synthetic capture sources
//!
//! Stand-ins for camera and microphone hardware: a paced test-pattern video
//! encoder, a silent PCM source and a passthrough PCM "encoder". Together
//! with [`AnnexBFileEncoder`] they make up the default [`SourceFactory`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::clock::MediaClock;
use super::frame::{AudioCodec, FrameFlags, TrackFormat, VideoCodec};
use super::h264::AnnexBFileEncoder;
use super::traits::{
    AudioEncoder, CaptureError, CaptureResult, Encoder, EncoderOutput, PcmFormat, PcmSource,
    SourceFactory,
};
use crate::config::{AudioConfig, VideoConfig, VideoSourceKind};

/// Fixed-rate fake encoder producing Annex-B shaped access units.
///
/// Emits the track format first, then the parameter sets as a codec-config
/// unit, then one access unit per frame interval with a keyframe every
/// `keyframe_interval` frames.
pub struct TestPatternEncoder {
    codec: VideoCodec,
    width: u32,
    height: u32,
    frame_interval: Duration,
    keyframe_interval: u32,
    clock: MediaClock,
    stage: PatternStage,
    frame_index: u64,
    next_due: Option<Instant>,
    output: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternStage {
    Stopped,
    Format,
    CodecConfig,
    Frames,
}

impl TestPatternEncoder {
    pub fn new(
        codec: VideoCodec,
        width: u32,
        height: u32,
        fps: u32,
        keyframe_interval: u32,
        clock: MediaClock,
    ) -> Self {
        Self {
            codec,
            width,
            height,
            frame_interval: Duration::from_micros(1_000_000 / fps.max(1) as u64),
            keyframe_interval: keyframe_interval.max(1),
            clock,
            stage: PatternStage::Stopped,
            frame_index: 0,
            next_due: None,
            output: Vec::new(),
        }
    }

    /// Annex-B parameter sets for the configured codec
    fn parameter_sets(&self) -> Vec<u8> {
        let nals: &[&[u8]] = match self.codec {
            VideoCodec::H264 => &[&[0x67, 0x42, 0xC0, 0x1F, 0xDA], &[0x68, 0xCE, 0x3C, 0x80]],
            VideoCodec::H265 => &[
                &[0x40, 0x01, 0x0C, 0x01],
                &[0x42, 0x01, 0x01, 0x01],
                &[0x44, 0x01, 0xC1, 0x72],
            ],
        };
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(nal);
        }
        out
    }

    fn render_frame(&mut self, keyframe: bool) {
        let header: [u8; 2] = match (self.codec, keyframe) {
            // first_mb_in_slice = 0 sets the top bit of the second byte
            (VideoCodec::H264, true) => [0x65, 0x88],
            (VideoCodec::H264, false) => [0x41, 0x9A],
            (VideoCodec::H265, true) => [0x26, 0x01],
            (VideoCodec::H265, false) => [0x02, 0x01],
        };
        self.output.clear();
        self.output.extend_from_slice(&[0, 0, 0, 1]);
        self.output.extend_from_slice(&header);
        // Keyframes are larger, as in real streams
        let body = if keyframe { 512 } else { 64 };
        // Never zero, so the body cannot contain a start code
        let fill = (self.frame_index % 251) as u8 | 0x01;
        self.output.resize(self.output.len() + body, fill);
    }
}

impl Encoder for TestPatternEncoder {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn start(&mut self) -> CaptureResult<()> {
        self.stage = PatternStage::Format;
        self.frame_index = 0;
        self.next_due = None;
        Ok(())
    }

    fn poll_output(&mut self, timeout: Duration) -> CaptureResult<Option<EncoderOutput<'_>>> {
        match self.stage {
            PatternStage::Stopped => {
                return Err(CaptureError::Encoder("encoder not started".to_string()));
            }
            PatternStage::Format => {
                self.stage = PatternStage::CodecConfig;
                return Ok(Some(EncoderOutput::FormatChanged(TrackFormat::video(
                    self.codec,
                    self.width,
                    self.height,
                    Bytes::new(),
                ))));
            }
            PatternStage::CodecConfig => {
                self.stage = PatternStage::Frames;
                self.output = self.parameter_sets();
                return Ok(Some(EncoderOutput::Data {
                    payload: &self.output,
                    timestamp_us: self.clock.now_us(),
                    flags: FrameFlags::codec_config(),
                }));
            }
            PatternStage::Frames => {}
        }

        let now = Instant::now();
        let due = *self.next_due.get_or_insert(now);
        if due > now {
            let wait = due - now;
            if wait > timeout {
                std::thread::sleep(timeout);
                return Ok(None);
            }
            std::thread::sleep(wait);
        }
        self.next_due = Some(due + self.frame_interval);

        let keyframe = self.frame_index % self.keyframe_interval as u64 == 0;
        self.render_frame(keyframe);
        self.frame_index += 1;

        Ok(Some(EncoderOutput::Data {
            payload: &self.output,
            timestamp_us: self.clock.now_us(),
            flags: if keyframe {
                FrameFlags::keyframe()
            } else {
                FrameFlags::empty()
            },
        }))
    }

    fn stop(&mut self) {
        self.stage = PatternStage::Stopped;
    }
}

/// PCM source that delivers silence in real time.
pub struct SilenceSource {
    format: PcmFormat,
    chunk: Duration,
    chunk_bytes: usize,
    next_due: Option<Instant>,
    started: bool,
}

impl SilenceSource {
    pub fn new(format: PcmFormat, chunk: Duration) -> Self {
        let frame_bytes = format.channels as u64 * format.bytes_per_sample as u64;
        let samples = format.sample_rate as u64 * chunk.as_micros() as u64 / 1_000_000;
        Self {
            format,
            chunk,
            chunk_bytes: (samples.max(1) * frame_bytes) as usize,
            next_due: None,
            started: false,
        }
    }
}

impl PcmSource for SilenceSource {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn start(&mut self) -> CaptureResult<()> {
        self.started = true;
        self.next_due = None;
        Ok(())
    }

    fn read(&mut self, buf: &mut Vec<u8>, timeout: Duration) -> CaptureResult<usize> {
        if !self.started {
            return Err(CaptureError::Encoder("PCM source not started".to_string()));
        }

        let now = Instant::now();
        let due = *self.next_due.get_or_insert(now);
        if due > now {
            let wait = due - now;
            if wait > timeout {
                std::thread::sleep(timeout);
                return Ok(0);
            }
            std::thread::sleep(wait);
        }
        self.next_due = Some(due + self.chunk);

        buf.clear();
        buf.resize(self.chunk_bytes, 0);
        Ok(self.chunk_bytes)
    }

    fn stop(&mut self) {
        self.started = false;
    }
}

/// Emits queued PCM unchanged as 16-bit PCM output.
pub struct PcmPassthroughEncoder {
    format: PcmFormat,
    format_sent: bool,
    queue: VecDeque<(Vec<u8>, i64)>,
    current: Vec<u8>,
}

impl PcmPassthroughEncoder {
    pub fn new(format: PcmFormat) -> Self {
        Self {
            format,
            format_sent: false,
            queue: VecDeque::new(),
            current: Vec::new(),
        }
    }
}

impl Encoder for PcmPassthroughEncoder {
    fn name(&self) -> &str {
        "pcm-passthrough"
    }

    fn start(&mut self) -> CaptureResult<()> {
        if self.format.bytes_per_sample != 2 {
            return Err(CaptureError::ConfigurationError(format!(
                "passthrough needs 16-bit PCM, got {} bytes per sample",
                self.format.bytes_per_sample
            )));
        }
        self.format_sent = false;
        self.queue.clear();
        Ok(())
    }

    fn poll_output(&mut self, _timeout: Duration) -> CaptureResult<Option<EncoderOutput<'_>>> {
        if !self.format_sent {
            self.format_sent = true;
            return Ok(Some(EncoderOutput::FormatChanged(TrackFormat::audio(
                AudioCodec::Pcm16,
                self.format.sample_rate,
                self.format.channels,
                Bytes::new(),
            ))));
        }

        match self.queue.pop_front() {
            Some((pcm, timestamp_us)) => {
                self.current = pcm;
                Ok(Some(EncoderOutput::Data {
                    payload: &self.current,
                    timestamp_us,
                    flags: FrameFlags::empty(),
                }))
            }
            None => Ok(None),
        }
    }

    fn stop(&mut self) {
        self.queue.clear();
    }
}

impl AudioEncoder for PcmPassthroughEncoder {
    fn queue_input(&mut self, pcm: &[u8], timestamp_us: i64) -> CaptureResult<()> {
        self.queue.push_back((pcm.to_vec(), timestamp_us));
        Ok(())
    }
}

/// Builds sources from configuration: test pattern or Annex-B file for
/// video, silence through the passthrough encoder for audio.
#[derive(Debug, Clone)]
pub struct SyntheticSources {
    video: VideoConfig,
    audio: AudioConfig,
}

impl SyntheticSources {
    pub fn new(video: VideoConfig, audio: AudioConfig) -> Self {
        Self { video, audio }
    }
}

impl SourceFactory for SyntheticSources {
    fn video_encoder(&self, clock: &MediaClock) -> CaptureResult<Box<dyn Encoder>> {
        let video = &self.video;
        match video.source {
            VideoSourceKind::TestPattern => Ok(Box::new(TestPatternEncoder::new(
                video.codec,
                video.width,
                video.height,
                video.fps,
                video.keyframe_interval,
                *clock,
            ))),
            VideoSourceKind::AnnexBFile => {
                let path = video.h264_file.clone().ok_or_else(|| {
                    CaptureError::ConfigurationError("no H.264 file configured".to_string())
                })?;
                Ok(Box::new(AnnexBFileEncoder::new(
                    path,
                    video.width,
                    video.height,
                    video.fps,
                    *clock,
                )))
            }
        }
    }

    fn audio_pipeline(
        &self,
        _clock: &MediaClock,
    ) -> CaptureResult<Option<(Box<dyn PcmSource>, Box<dyn AudioEncoder>)>> {
        if !self.audio.enabled {
            return Ok(None);
        }
        let format = PcmFormat {
            sample_rate: self.audio.sample_rate,
            channels: self.audio.channels,
            bytes_per_sample: self.audio.bytes_per_sample,
        };
        let chunk = Duration::from_millis(self.audio.chunk_ms.max(1));
        Ok(Some((
            Box::new(SilenceSource::new(format, chunk)),
            Box::new(PcmPassthroughEncoder::new(format)),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::h264::contains_keyframe;

    fn next_data(encoder: &mut TestPatternEncoder) -> (Vec<u8>, FrameFlags) {
        loop {
            match encoder.poll_output(Duration::from_millis(100)).unwrap() {
                Some(EncoderOutput::Data { payload, flags, .. }) => return (payload.to_vec(), flags),
                Some(EncoderOutput::FormatChanged(_)) => continue,
                None => continue,
            }
        }
    }

    #[test]
    fn test_pattern_sequence() {
        let mut encoder = TestPatternEncoder::new(VideoCodec::H264, 64, 48, 200, 3, MediaClock::new());
        assert!(encoder.poll_output(Duration::ZERO).is_err());
        encoder.start().unwrap();

        match encoder.poll_output(Duration::ZERO).unwrap() {
            Some(EncoderOutput::FormatChanged(format)) => assert!(format.codec_config.is_empty()),
            other => panic!("expected format, got {:?}", other),
        }

        let (config, flags) = next_data(&mut encoder);
        assert!(flags.is_codec_config());
        assert_eq!(&config[..5], &[0, 0, 0, 1, 0x67]);

        let keys: Vec<bool> = (0..6)
            .map(|_| {
                let (payload, flags) = next_data(&mut encoder);
                assert_eq!(flags.is_keyframe(), contains_keyframe(&payload, VideoCodec::H264));
                flags.is_keyframe()
            })
            .collect();
        assert_eq!(keys, vec![true, false, false, true, false, false]);
    }

    #[test]
    fn silence_chunk_size_matches_duration() {
        let format = PcmFormat {
            sample_rate: 48_000,
            channels: 2,
            bytes_per_sample: 2,
        };
        let mut source = SilenceSource::new(format, Duration::from_millis(10));
        source.start().unwrap();
        let mut buf = Vec::new();
        let read = source.read(&mut buf, Duration::from_millis(50)).unwrap();
        assert_eq!(read, 480 * 4);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn passthrough_rejects_non_16_bit() {
        let mut encoder = PcmPassthroughEncoder::new(PcmFormat {
            sample_rate: 48_000,
            channels: 1,
            bytes_per_sample: 4,
        });
        assert!(encoder.start().is_err());
    }

    #[test]
    fn factory_respects_audio_toggle() {
        let clock = MediaClock::new();
        let mut audio = AudioConfig::default();
        audio.enabled = false;
        let factory = SyntheticSources::new(VideoConfig::default(), audio);
        assert!(factory.audio_pipeline(&clock).unwrap().is_none());
        assert_eq!(factory.video_encoder(&clock).unwrap().name(), "test-pattern");
    }
}
