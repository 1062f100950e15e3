//! Frame and track format types for the video and audio tracks

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The two independent tracks a session produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Compressed video (H.264 / H.265 access units)
    Video,
    /// Compressed audio (AAC, Opus or raw 16-bit PCM)
    Audio,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Video => "video",
            TrackKind::Audio => "audio",
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoder output flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    /// Frame is decodable without reference to earlier frames
    pub const KEYFRAME: u8 = 0b0000_0001;
    /// Payload is codec initialization data, not media
    pub const CODEC_CONFIG: u8 = 0b0000_0010;

    pub fn empty() -> Self {
        Self(0)
    }

    /// Create flags with keyframe set
    pub fn keyframe() -> Self {
        Self(Self::KEYFRAME)
    }

    /// Create flags marking codec configuration data
    pub fn codec_config() -> Self {
        Self(Self::CODEC_CONFIG)
    }

    pub fn is_keyframe(&self) -> bool {
        self.0 & Self::KEYFRAME != 0
    }

    pub fn is_codec_config(&self) -> bool {
        self.0 & Self::CODEC_CONFIG != 0
    }

    pub fn set_keyframe(&mut self) {
        self.0 |= Self::KEYFRAME;
    }
}

/// One compressed, timestamped unit of encoder output.
///
/// Frames are immutable once created. The payload is a private copy owned by
/// the frame; it never aliases the encoder's reusable output buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Track this frame belongs to
    pub kind: TrackKind,
    /// Presentation timestamp in microseconds (session clock domain)
    pub timestamp_us: i64,
    /// Keyframe / codec-config flags
    pub flags: FrameFlags,
    /// Compressed payload
    pub payload: Bytes,
}

impl Frame {
    /// Copy `payload` out of a producer-owned buffer into a new frame.
    pub fn copy_from(kind: TrackKind, payload: &[u8], timestamp_us: i64, flags: FrameFlags) -> Self {
        Self {
            kind,
            timestamp_us,
            flags,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    /// Payload size in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn is_keyframe(&self) -> bool {
        self.flags.is_keyframe()
    }

    /// True for a video keyframe, the only valid clip start point.
    pub fn is_video_keyframe(&self) -> bool {
        self.kind == TrackKind::Video && self.flags.is_keyframe()
    }
}

/// Video codecs the container writer understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
}

/// Audio codecs the container writer understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Opus,
    /// Signed 16-bit little-endian PCM
    Pcm16,
}

/// Per-track stream parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MediaParams {
    Video {
        codec: VideoCodec,
        width: u32,
        height: u32,
    },
    Audio {
        codec: AudioCodec,
        sample_rate: u32,
        channels: u16,
    },
}

/// Codec initialization parameters for one track.
///
/// Captured once when the encoder's output format stabilizes and replaced
/// wholesale on every change, never merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackFormat {
    pub params: MediaParams,
    /// Codec-specific data: Annex-B SPS/PPS for H.264/H.265,
    /// AudioSpecificConfig for AAC, empty for PCM
    pub codec_config: Bytes,
}

impl TrackFormat {
    pub fn video(codec: VideoCodec, width: u32, height: u32, codec_config: Bytes) -> Self {
        Self {
            params: MediaParams::Video {
                codec,
                width,
                height,
            },
            codec_config,
        }
    }

    pub fn audio(codec: AudioCodec, sample_rate: u32, channels: u16, codec_config: Bytes) -> Self {
        Self {
            params: MediaParams::Audio {
                codec,
                sample_rate,
                channels,
            },
            codec_config,
        }
    }

    pub fn kind(&self) -> TrackKind {
        match self.params {
            MediaParams::Video { .. } => TrackKind::Video,
            MediaParams::Audio { .. } => TrackKind::Audio,
        }
    }

    /// A new format identical to this one except for its codec config.
    pub fn with_codec_config(&self, codec_config: Bytes) -> Self {
        Self {
            params: self.params.clone(),
            codec_config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_flags() {
        let mut flags = FrameFlags::default();
        assert!(!flags.is_keyframe());
        assert!(!flags.is_codec_config());

        flags.set_keyframe();
        assert!(flags.is_keyframe());

        assert!(FrameFlags::codec_config().is_codec_config());
        assert!(!FrameFlags::codec_config().is_keyframe());
    }

    #[test]
    fn copy_from_detaches_payload_from_source_buffer() {
        let mut producer_buffer = vec![1u8, 2, 3, 4];
        let frame = Frame::copy_from(TrackKind::Video, &producer_buffer, 10, FrameFlags::keyframe());

        producer_buffer.copy_from_slice(&[9, 9, 9, 9]);

        assert_eq!(&frame.payload[..], &[1, 2, 3, 4]);
        assert_eq!(frame.len(), 4);
        assert!(frame.is_video_keyframe());
    }

    #[test]
    fn audio_keyframe_is_not_a_clip_start() {
        let frame = Frame::copy_from(TrackKind::Audio, &[0], 0, FrameFlags::keyframe());
        assert!(frame.is_keyframe());
        assert!(!frame.is_video_keyframe());
    }

    #[test]
    fn track_format_kind_and_config_replacement() {
        let format = TrackFormat::video(VideoCodec::H264, 1280, 720, Bytes::new());
        assert_eq!(format.kind(), TrackKind::Video);

        let replaced = format.with_codec_config(Bytes::from_static(&[0, 0, 0, 1, 0x67]));
        assert_eq!(replaced.params, format.params);
        assert_eq!(replaced.codec_config.len(), 5);
        assert!(format.codec_config.is_empty());

        let audio = TrackFormat::audio(AudioCodec::Aac, 48_000, 2, Bytes::from_static(&[0x11, 0x90]));
        assert_eq!(audio.kind(), TrackKind::Audio);
    }
}
