//! Keyframe-aligned retention buffer
//!
//! Holds the most recent frames of both tracks, bounded by retained
//! duration. Two producer threads insert concurrently; the export path takes
//! snapshots. Insert, trim and snapshot all run under one lock.
//!
//! After every insert the buffer is trimmed in two passes:
//! 1. while the oldest frame is older than the retention ceiling (measured
//!    against the newest timestamp seen) and more than one frame remains,
//!    evict it;
//! 2. evict from the front until the front is a video keyframe.
//!
//! The second pass guarantees every export starts at a decodable point, at
//! the cost of dropping audio that precedes the first retained keyframe.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;

use super::snapshot::Snapshot;
use crate::capture::{Frame, FrameFlags, Rotation, TrackFormat, TrackKind};

/// Counters describing current buffer contents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RingStats {
    pub frames: usize,
    pub video_frames: usize,
    pub audio_frames: usize,
    pub bytes: usize,
    /// Oldest-to-newest distance of retained frames
    pub span_us: i64,
    /// Frames evicted since the last clear
    pub evicted: u64,
}

#[derive(Debug, Default)]
struct RingState {
    frames: VecDeque<Frame>,
    video_format: Option<TrackFormat>,
    audio_format: Option<TrackFormat>,
    /// Codec config that arrived before its track format
    pending_video_config: Option<Bytes>,
    pending_audio_config: Option<Bytes>,
    rotation: Rotation,
    /// A track's parameters changed after frames were encoded with the old ones
    format_changed: bool,
    /// Highest timestamp enqueued since the last clear
    newest_us: Option<i64>,
    bytes: usize,
    evicted: u64,
}

impl RingState {
    fn format_slot(&mut self, kind: TrackKind) -> &mut Option<TrackFormat> {
        match kind {
            TrackKind::Video => &mut self.video_format,
            TrackKind::Audio => &mut self.audio_format,
        }
    }

    fn pending_slot(&mut self, kind: TrackKind) -> &mut Option<Bytes> {
        match kind {
            TrackKind::Video => &mut self.pending_video_config,
            TrackKind::Audio => &mut self.pending_audio_config,
        }
    }

    fn pop_front(&mut self) {
        if let Some(frame) = self.frames.pop_front() {
            self.bytes -= frame.len();
            self.evicted += 1;
        }
    }

    fn trim(&mut self, retention_us: i64) {
        let Some(newest) = self.newest_us else {
            return;
        };

        while self.frames.len() > 1 {
            let oldest = match self.frames.front() {
                Some(frame) => frame.timestamp_us,
                None => break,
            };
            if newest - oldest > retention_us {
                self.pop_front();
            } else {
                break;
            }
        }

        while self
            .frames
            .front()
            .is_some_and(|frame| !frame.is_video_keyframe())
        {
            self.pop_front();
        }
    }

    fn clear_frames(&mut self) {
        self.frames.clear();
        self.newest_us = None;
        self.bytes = 0;
        self.evicted = 0;
    }
}

/// Duration-bounded, keyframe-aligned frame buffer for both tracks.
#[derive(Debug)]
pub struct RingBuffer {
    retention_us: i64,
    state: Mutex<RingState>,
}

impl RingBuffer {
    /// Create a buffer retaining roughly `retention` of media
    pub fn new(retention: Duration) -> Self {
        Self {
            retention_us: retention.as_micros().min(i64::MAX as u128) as i64,
            state: Mutex::new(RingState::default()),
        }
    }

    /// Retention ceiling
    pub fn retention(&self) -> Duration {
        Duration::from_micros(self.retention_us as u64)
    }

    /// Copy one unit of encoder output into the buffer.
    ///
    /// Codec-config payloads update the track's format instead of joining
    /// the frame sequence. The payload is copied before the lock is taken,
    /// so the lock is held only for the append and trim.
    pub fn add_frame(&self, payload: &[u8], timestamp_us: i64, flags: FrameFlags, kind: TrackKind) {
        if flags.is_codec_config() {
            self.capture_codec_config(kind, Bytes::copy_from_slice(payload));
            return;
        }

        let frame = Frame::copy_from(kind, payload, timestamp_us, flags);
        self.push(frame);
    }

    /// Append an already-owned frame and trim.
    pub fn push(&self, frame: Frame) {
        let mut state = self.state.lock();
        state.newest_us = Some(match state.newest_us {
            Some(newest) => newest.max(frame.timestamp_us),
            None => frame.timestamp_us,
        });
        state.bytes += frame.len();
        state.frames.push_back(frame);
        state.trim(self.retention_us);
    }

    fn capture_codec_config(&self, kind: TrackKind, config: Bytes) {
        let mut state = self.state.lock();
        let replaced = state
            .format_slot(kind)
            .as_ref()
            .map(|format| format.with_codec_config(config.clone()));
        match replaced {
            Some(format) => {
                *state.format_slot(kind) = Some(format);
                tracing::debug!("Captured {} codec config ({} bytes)", kind, config.len());
            }
            None => {
                tracing::debug!(
                    "Holding {} codec config ({} bytes) until the format arrives",
                    kind,
                    config.len()
                );
                *state.pending_slot(kind) = Some(config);
            }
        }
    }

    /// Install the format reported by an encoder, replacing any previous one.
    pub fn set_format(&self, format: TrackFormat) {
        let kind = format.kind();
        let mut state = self.state.lock();
        let pending = state.pending_slot(kind).take();
        let format = match pending {
            Some(config) if format.codec_config.is_empty() => format.with_codec_config(config),
            _ => format,
        };
        let changed = state
            .format_slot(kind)
            .as_ref()
            .is_some_and(|old| old.params != format.params);
        if changed {
            tracing::warn!("{} track format changed mid-session: {:?}", kind, format.params);
            state.format_changed = true;
        } else {
            tracing::info!("Captured {} track format: {:?}", kind, format.params);
        }
        *state.format_slot(kind) = Some(format);
    }

    /// True once after a track's stream parameters changed. Frames buffered
    /// under the old parameters cannot share a file with the new ones, so
    /// the owner is expected to restart the session.
    pub fn take_format_change(&self) -> bool {
        std::mem::take(&mut self.state.lock().format_changed)
    }

    pub fn format(&self, kind: TrackKind) -> Option<TrackFormat> {
        let mut state = self.state.lock();
        state.format_slot(kind).clone()
    }

    pub fn set_rotation(&self, rotation: Rotation) {
        self.state.lock().rotation = rotation;
    }

    pub fn rotation(&self) -> Rotation {
        self.state.lock().rotation
    }

    /// Independent copy of formats, rotation and every retained frame.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.lock();
        Snapshot::new(
            state.video_format.clone(),
            state.audio_format.clone(),
            state.frames.iter().cloned().collect(),
            state.rotation,
        )
    }

    /// Drop all frames. Track formats survive.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.clear_frames();
    }

    /// Drop frames and track formats, for the end of a capture session.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.clear_frames();
        state.video_format = None;
        state.audio_format = None;
        state.pending_video_config = None;
        state.pending_audio_config = None;
        state.format_changed = false;
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().frames.is_empty()
    }

    pub fn stats(&self) -> RingStats {
        let state = self.state.lock();
        let video_frames = state
            .frames
            .iter()
            .filter(|f| f.kind == TrackKind::Video)
            .count();
        let span_us = match (state.frames.front(), state.newest_us) {
            (Some(front), Some(newest)) => newest - front.timestamp_us,
            _ => 0,
        };
        RingStats {
            frames: state.frames.len(),
            video_frames,
            audio_frames: state.frames.len() - video_frames,
            bytes: state.bytes,
            span_us,
            evicted: state.evicted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{AudioCodec, VideoCodec};
    use std::sync::Arc;

    fn buffer_secs(secs: u64) -> RingBuffer {
        RingBuffer::new(Duration::from_secs(secs))
    }

    fn video(ring: &RingBuffer, ts_ms: i64, key: bool) {
        let flags = if key {
            FrameFlags::keyframe()
        } else {
            FrameFlags::empty()
        };
        ring.add_frame(&[0xAA; 16], ts_ms * 1000, flags, TrackKind::Video);
    }

    fn audio(ring: &RingBuffer, ts_ms: i64) {
        ring.add_frame(&[0x55; 4], ts_ms * 1000, FrameFlags::empty(), TrackKind::Audio);
    }

    fn front_is_keyframe_or_empty(ring: &RingBuffer) -> bool {
        let snapshot = ring.snapshot();
        snapshot
            .frames()
            .first()
            .map(|f| f.is_video_keyframe())
            .unwrap_or(true)
    }

    #[test]
    fn frames_before_first_keyframe_are_dropped() {
        let ring = buffer_secs(10);
        audio(&ring, 0);
        video(&ring, 10, false);
        assert!(ring.is_empty());

        video(&ring, 20, true);
        audio(&ring, 25);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn retention_evicts_whole_gops() {
        let ring = buffer_secs(1);
        // 30 fps, keyframe every 15 frames (500 ms GOP)
        for i in 0..120 {
            video(&ring, i * 33, i % 15 == 0);
            assert!(front_is_keyframe_or_empty(&ring));
        }
        let snapshot = ring.snapshot();
        let first = snapshot.frames()[0].timestamp_us;
        let last = snapshot.frames().last().map(|f| f.timestamp_us).unwrap_or(0);
        assert!(last - first <= 1_000_000);
        assert!(snapshot.frames()[0].is_video_keyframe());
    }

    #[test]
    fn single_frame_is_never_evicted_by_age() {
        let ring = RingBuffer::new(Duration::from_millis(1));
        video(&ring, 0, true);
        video(&ring, 5_000, true);
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.snapshot().frames()[0].timestamp_us, 5_000_000);
    }

    #[test]
    fn out_of_order_cross_track_insert_does_not_shrink_window() {
        let ring = buffer_secs(1);
        video(&ring, 0, true);
        video(&ring, 900, false);
        // Audio for an earlier instant arrives late
        audio(&ring, 500);
        let stats = ring.stats();
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.span_us, 900_000);
    }

    #[test]
    fn codec_config_goes_to_format_not_frames() {
        let ring = buffer_secs(10);
        ring.set_format(TrackFormat::video(VideoCodec::H264, 640, 480, Bytes::new()));
        ring.add_frame(&[0, 0, 0, 1, 0x67, 0x42], 0, FrameFlags::codec_config(), TrackKind::Video);

        assert!(ring.is_empty());
        let format = ring.format(TrackKind::Video).unwrap();
        assert_eq!(&format.codec_config[..], &[0, 0, 0, 1, 0x67, 0x42]);
    }

    #[test]
    fn early_codec_config_is_attached_when_format_arrives() {
        let ring = buffer_secs(10);
        ring.add_frame(&[0x12, 0x10], 0, FrameFlags::codec_config(), TrackKind::Audio);
        assert!(ring.format(TrackKind::Audio).is_none());

        ring.set_format(TrackFormat::audio(AudioCodec::Aac, 44_100, 2, Bytes::new()));
        let format = ring.format(TrackKind::Audio).unwrap();
        assert_eq!(&format.codec_config[..], &[0x12, 0x10]);
    }

    #[test]
    fn parameter_change_is_reported_once() {
        let ring = buffer_secs(10);
        ring.set_format(TrackFormat::video(VideoCodec::H264, 640, 480, Bytes::new()));
        ring.set_format(TrackFormat::video(VideoCodec::H264, 640, 480, Bytes::from_static(&[1])));
        assert!(!ring.take_format_change());

        ring.set_format(TrackFormat::video(VideoCodec::H264, 1280, 720, Bytes::new()));
        assert!(ring.take_format_change());
        assert!(!ring.take_format_change());
    }

    #[test]
    fn clear_keeps_formats_reset_drops_them() {
        let ring = buffer_secs(10);
        ring.set_format(TrackFormat::video(VideoCodec::H264, 640, 480, Bytes::new()));
        video(&ring, 0, true);

        ring.clear();
        assert!(ring.is_empty());
        assert!(ring.format(TrackKind::Video).is_some());

        video(&ring, 0, true);
        ring.reset();
        assert!(ring.is_empty());
        assert!(ring.format(TrackKind::Video).is_none());
    }

    #[test]
    fn snapshot_is_independent_of_later_mutation() {
        let ring = buffer_secs(10);
        ring.set_rotation(Rotation::Deg90);
        video(&ring, 0, true);
        video(&ring, 33, false);

        let snapshot = ring.snapshot();
        ring.clear();
        video(&ring, 100, true);
        ring.set_rotation(Rotation::Deg180);

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.rotation(), Rotation::Deg90);
        assert_eq!(snapshot.frames()[1].timestamp_us, 33_000);
    }

    #[test]
    fn concurrent_producers_never_tear_frames() {
        let ring = Arc::new(RingBuffer::new(Duration::from_millis(200)));

        let video_ring = ring.clone();
        let video_thread = std::thread::spawn(move || {
            for i in 0..2_000i64 {
                let payload = vec![(i % 251) as u8; 64];
                let flags = if i % 10 == 0 {
                    FrameFlags::keyframe()
                } else {
                    FrameFlags::empty()
                };
                video_ring.add_frame(&payload, i * 1_000, flags, TrackKind::Video);
            }
        });

        let audio_ring = ring.clone();
        let audio_thread = std::thread::spawn(move || {
            for i in 0..2_000i64 {
                let payload = vec![(i % 241) as u8; 32];
                audio_ring.add_frame(&payload, i * 1_000 + 500, FrameFlags::empty(), TrackKind::Audio);
            }
        });

        for _ in 0..200 {
            let snapshot = ring.snapshot();
            for frame in snapshot.frames() {
                let expected_len = match frame.kind {
                    TrackKind::Video => 64,
                    TrackKind::Audio => 32,
                };
                assert_eq!(frame.len(), expected_len);
                let first = frame.payload[0];
                assert!(frame.payload.iter().all(|b| *b == first));
            }
            if let Some(front) = snapshot.frames().first() {
                assert!(front.is_video_keyframe());
            }
        }

        video_thread.join().unwrap();
        audio_thread.join().unwrap();

        let stats = ring.stats();
        assert_eq!(stats.frames, stats.video_frames + stats.audio_frames);
        assert!(stats.evicted > 0);
    }
}
