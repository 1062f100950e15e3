//! H.264 / H.265 bitstream utilities
//!
//! Provides:
//! - Splitting Annex-B byte streams into NAL units
//! - Keyframe and parameter-set detection for both codecs
//! - Annex-B to length-prefixed conversion for the MP4 sample format
//! - [`AnnexBFileEncoder`], which replays a pre-encoded `.h264` elementary
//!   stream as if it were a live hardware encoder

use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use super::clock::MediaClock;
use super::frame::{FrameFlags, TrackFormat, VideoCodec};
use super::traits::{CaptureError, CaptureResult, Encoder, EncoderOutput};

/// H.264 NAL unit types (5 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// Non-IDR slice (P or B frame)
    SliceNonIdr,
    /// IDR slice (keyframe)
    SliceIdr,
    /// Supplemental enhancement information
    Sei,
    /// Sequence parameter set
    Sps,
    /// Picture parameter set
    Pps,
    /// Access unit delimiter
    Aud,
    Other(u8),
}

impl From<u8> for NalUnitType {
    fn from(header: u8) -> Self {
        match header & 0x1F {
            1 => NalUnitType::SliceNonIdr,
            5 => NalUnitType::SliceIdr,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::Aud,
            n => NalUnitType::Other(n),
        }
    }
}

impl NalUnitType {
    pub fn is_keyframe(&self) -> bool {
        matches!(self, NalUnitType::SliceIdr)
    }

    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NalUnitType::Sps | NalUnitType::Pps)
    }

    pub fn is_slice(&self) -> bool {
        matches!(self, NalUnitType::SliceNonIdr | NalUnitType::SliceIdr)
    }
}

/// H.265 NAL type (6 bits after the forbidden bit)
fn hevc_nal_type(header: u8) -> u8 {
    (header >> 1) & 0x3F
}

/// Position and length of the next start code at or after `from`.
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if data[i + 2] == 0 && i + 3 < data.len() && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

/// Whether `data` begins with an Annex-B start code
pub fn is_annexb(data: &[u8]) -> bool {
    data.starts_with(&[0, 0, 1]) || data.starts_with(&[0, 0, 0, 1])
}

/// Split an Annex-B buffer into NAL unit bodies (start codes removed).
///
/// Bytes before the first start code are ignored.
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let Some((mut pos, mut code_len)) = find_start_code(data, 0) else {
        return nals;
    };

    loop {
        let body_start = pos + code_len;
        match find_start_code(data, body_start) {
            Some((next, next_len)) => {
                let body = trim_trailing_zeros(&data[body_start..next]);
                if !body.is_empty() {
                    nals.push(body);
                }
                pos = next;
                code_len = next_len;
            }
            None => {
                if body_start < data.len() {
                    nals.push(&data[body_start..]);
                }
                break;
            }
        }
    }
    nals
}

fn trim_trailing_zeros(nal: &[u8]) -> &[u8] {
    let end = nal.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    &nal[..end]
}

/// Convert an Annex-B access unit into 4-byte big-endian length-prefixed
/// NAL units, the sample layout MP4 expects. Input that is not Annex-B is
/// assumed to be length-prefixed already and returned unchanged.
pub fn annexb_to_length_prefixed(data: &[u8]) -> Vec<u8> {
    if !is_annexb(data) {
        return data.to_vec();
    }
    let nals = split_annexb(data);
    let mut out = Vec::with_capacity(data.len() + nals.len() * 4);
    for nal in nals {
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
    out
}

/// Whether an access unit contains a random access point
pub fn contains_keyframe(data: &[u8], codec: VideoCodec) -> bool {
    split_annexb(data).iter().any(|nal| match codec {
        VideoCodec::H264 => NalUnitType::from(nal[0]).is_keyframe(),
        // BLA / IDR / CRA
        VideoCodec::H265 => (16..=21).contains(&hevc_nal_type(nal[0])),
    })
}

/// Parameter sets pulled from a codec config blob
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSets {
    /// H.265 only
    pub vps: Vec<Bytes>,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl ParameterSets {
    /// Extract parameter sets from Annex-B codec config data.
    pub fn from_annexb(config: &[u8], codec: VideoCodec) -> Self {
        let mut sets = Self::default();
        for nal in split_annexb(config) {
            let bytes = Bytes::copy_from_slice(nal);
            match codec {
                VideoCodec::H264 => match NalUnitType::from(nal[0]) {
                    NalUnitType::Sps => sets.sps.push(bytes),
                    NalUnitType::Pps => sets.pps.push(bytes),
                    _ => {}
                },
                VideoCodec::H265 => match hevc_nal_type(nal[0]) {
                    32 => sets.vps.push(bytes),
                    33 => sets.sps.push(bytes),
                    34 => sets.pps.push(bytes),
                    _ => {}
                },
            }
        }
        sets
    }

    pub fn is_complete(&self, codec: VideoCodec) -> bool {
        let base = !self.sps.is_empty() && !self.pps.is_empty();
        match codec {
            VideoCodec::H264 => base,
            VideoCodec::H265 => base && !self.vps.is_empty(),
        }
    }
}

/// Parsed elementary stream: codec config plus access units
#[derive(Debug, Clone)]
struct ElementaryStream {
    codec_config: Bytes,
    units: Vec<(Bytes, bool)>,
}

impl ElementaryStream {
    /// Group NAL units into access units.
    ///
    /// A slice whose `first_mb_in_slice` is zero opens a new picture;
    /// parameter sets are collected into the codec config rather than the
    /// access units.
    fn parse(data: &[u8]) -> Self {
        let mut config = BytesMut::new();
        let mut units = Vec::new();
        let mut current = BytesMut::new();
        let mut current_key = false;
        let mut current_has_slice = false;

        for nal in split_annexb(data) {
            let nal_type = NalUnitType::from(nal[0]);

            if nal_type.is_parameter_set() {
                if config.len() < 4096 {
                    config.extend_from_slice(&[0, 0, 0, 1]);
                    config.extend_from_slice(nal);
                }
                continue;
            }

            // first_mb_in_slice == 0 is ue(v) "1", the top bit of byte 1
            let starts_picture = nal_type.is_slice() && nal.get(1).is_some_and(|b| b & 0x80 != 0);
            let starts_unit = starts_picture || nal_type == NalUnitType::Aud;
            if starts_unit && current_has_slice {
                units.push((current.split().freeze(), current_key));
                current_key = false;
                current_has_slice = false;
            }

            current.extend_from_slice(&[0, 0, 0, 1]);
            current.extend_from_slice(nal);
            current_key |= nal_type.is_keyframe();
            current_has_slice |= nal_type.is_slice();
        }
        if current_has_slice {
            units.push((current.freeze(), current_key));
        }

        Self {
            codec_config: config.freeze(),
            units,
        }
    }
}

/// Replays a raw H.264 Annex-B file at a fixed frame rate.
///
/// The file is read on `start`. Access units are emitted in order, paced to
/// `fps` and stamped from the shared [`MediaClock`]; playback loops from the
/// first keyframe once the file is exhausted.
pub struct AnnexBFileEncoder {
    path: PathBuf,
    width: u32,
    height: u32,
    frame_interval: Duration,
    clock: MediaClock,
    stream: Option<ElementaryStream>,
    format_sent: bool,
    next_unit: usize,
    loop_start: usize,
    next_due: Option<Instant>,
}

impl AnnexBFileEncoder {
    pub fn new(path: impl Into<PathBuf>, width: u32, height: u32, fps: u32, clock: MediaClock) -> Self {
        Self {
            path: path.into(),
            width,
            height,
            frame_interval: Duration::from_micros(1_000_000 / fps.max(1) as u64),
            clock,
            stream: None,
            format_sent: false,
            next_unit: 0,
            loop_start: 0,
            next_due: None,
        }
    }
}

impl Encoder for AnnexBFileEncoder {
    fn name(&self) -> &str {
        "annexb-file"
    }

    fn start(&mut self) -> CaptureResult<()> {
        let data = std::fs::read(&self.path)?;
        let stream = ElementaryStream::parse(&data);

        if stream.codec_config.is_empty() {
            return Err(CaptureError::ConfigurationError(format!(
                "{} has no SPS/PPS",
                self.path.display()
            )));
        }
        let Some(first_key) = stream.units.iter().position(|(_, key)| *key) else {
            return Err(CaptureError::ConfigurationError(format!(
                "{} has no IDR frame",
                self.path.display()
            )));
        };

        tracing::info!(
            "Loaded {} ({} access units, {} bytes of codec config)",
            self.path.display(),
            stream.units.len(),
            stream.codec_config.len()
        );

        self.next_unit = first_key;
        self.loop_start = first_key;
        self.stream = Some(stream);
        self.format_sent = false;
        self.next_due = None;
        Ok(())
    }

    fn poll_output(&mut self, timeout: Duration) -> CaptureResult<Option<EncoderOutput<'_>>> {
        let Some(stream) = self.stream.as_ref() else {
            return Err(CaptureError::Encoder("encoder not started".to_string()));
        };

        if !self.format_sent {
            self.format_sent = true;
            return Ok(Some(EncoderOutput::FormatChanged(TrackFormat::video(
                VideoCodec::H264,
                self.width,
                self.height,
                stream.codec_config.clone(),
            ))));
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

        let index = self.next_unit;
        self.next_unit += 1;
        if self.next_unit >= stream.units.len() {
            self.next_unit = self.loop_start;
        }

        let (payload, keyframe) = &stream.units[index];
        let flags = if *keyframe {
            FrameFlags::keyframe()
        } else {
            FrameFlags::empty()
        };
        tracing::trace!("Replaying access unit {} ({} bytes)", index, payload.len());

        Ok(Some(EncoderOutput::Data {
            payload: &payload[..],
            timestamp_us: self.clock.now_us(),
            flags,
        }))
    }

    fn stop(&mut self) {
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1E, 0xAB];
    const PPS: &[u8] = &[0x68, 0xCE, 0x38, 0x80];
    const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x21];
    const P1: &[u8] = &[0x41, 0x9A, 0x24, 0x11];
    const P2: &[u8] = &[0x41, 0x9A, 0x02, 0x33];

    fn annexb(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(nal);
        }
        out
    }

    #[test]
    fn test_nal_type_parsing() {
        assert_eq!(NalUnitType::from(0x65), NalUnitType::SliceIdr);
        assert_eq!(NalUnitType::from(0x67), NalUnitType::Sps);
        assert_eq!(NalUnitType::from(0x68), NalUnitType::Pps);
        assert_eq!(NalUnitType::from(0x41), NalUnitType::SliceNonIdr);
    }

    #[test]
    fn split_handles_both_start_code_lengths() {
        let data = [0, 0, 0, 1, 0x67, 0x42, 0, 0, 1, 0x68, 0xCE, 0, 0, 0, 1, 0x65, 0x88];
        let nals = split_annexb(&data);
        assert_eq!(nals, vec![&[0x67, 0x42][..], &[0x68, 0xCE][..], &[0x65, 0x88][..]]);
    }

    #[test]
    fn length_prefixed_conversion() {
        let data = annexb(&[SPS, IDR]);
        let out = annexb_to_length_prefixed(&data);
        assert_eq!(&out[..4], &[0, 0, 0, 5]);
        assert_eq!(&out[4..9], SPS);
        assert_eq!(&out[9..13], &[0, 0, 0, 4]);
        assert_eq!(&out[13..], IDR);

        // Already length-prefixed input passes through
        assert_eq!(annexb_to_length_prefixed(&out), out);
    }

    #[test]
    fn keyframe_detection() {
        assert!(contains_keyframe(&annexb(&[SPS, PPS, IDR]), VideoCodec::H264));
        assert!(!contains_keyframe(&annexb(&[P1]), VideoCodec::H264));
        // H.265 IDR_W_RADL (19) header is 0x26 0x01
        assert!(contains_keyframe(&annexb(&[&[0x26, 0x01, 0xAF]]), VideoCodec::H265));
        // H.265 TRAIL_R (1) header is 0x02 0x01
        assert!(!contains_keyframe(&annexb(&[&[0x02, 0x01, 0xAF]]), VideoCodec::H265));
    }

    #[test]
    fn parameter_set_extraction() {
        let sets = ParameterSets::from_annexb(&annexb(&[SPS, PPS]), VideoCodec::H264);
        assert_eq!(sets.sps, vec![Bytes::from_static(SPS)]);
        assert_eq!(sets.pps, vec![Bytes::from_static(PPS)]);
        assert!(sets.is_complete(VideoCodec::H264));
        assert!(!sets.is_complete(VideoCodec::H265));
    }

    #[test]
    fn elementary_stream_groups_access_units() {
        let stream = ElementaryStream::parse(&annexb(&[SPS, PPS, IDR, P1, P2]));
        assert_eq!(&stream.codec_config[..], &annexb(&[SPS, PPS])[..]);
        assert_eq!(stream.units.len(), 3);
        assert!(stream.units[0].1);
        assert!(!stream.units[1].1);
        assert_eq!(&stream.units[2].0[..], &annexb(&[P2])[..]);
    }

    #[test]
    fn file_encoder_emits_format_then_paced_frames() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&annexb(&[SPS, PPS, IDR, P1, P2])).unwrap();

        let mut encoder = AnnexBFileEncoder::new(file.path(), 320, 240, 100, MediaClock::new());
        encoder.start().unwrap();

        match encoder.poll_output(Duration::from_millis(50)).unwrap() {
            Some(EncoderOutput::FormatChanged(format)) => {
                assert_eq!(&format.codec_config[..], &annexb(&[SPS, PPS])[..]);
            }
            other => panic!("expected format, got {:?}", other),
        }

        let mut keyframes = Vec::new();
        let mut last_ts = -1;
        for _ in 0..4 {
            match encoder.poll_output(Duration::from_millis(50)).unwrap() {
                Some(EncoderOutput::Data {
                    timestamp_us, flags, ..
                }) => {
                    assert!(timestamp_us >= last_ts);
                    last_ts = timestamp_us;
                    keyframes.push(flags.is_keyframe());
                }
                other => panic!("expected data, got {:?}", other),
            }
        }
        // Loops back to the IDR after three units
        assert_eq!(keyframes, vec![true, false, false, true]);
        encoder.stop();
    }

    #[test]
    fn file_without_parameter_sets_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&annexb(&[IDR, P1])).unwrap();

        let mut encoder = AnnexBFileEncoder::new(file.path(), 320, 240, 30, MediaClock::new());
        assert!(matches!(encoder.start(), Err(CaptureError::ConfigurationError(_))));
    }
}
