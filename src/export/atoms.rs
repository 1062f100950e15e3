//! ISO base media box writers
//!
//! MP4 files are nested boxes. Each box has a 4-byte big-endian size
//! (header included) and a 4-byte ASCII type; "full boxes" add a version
//! byte and 24 bits of flags. Sizes that are not known up front are written
//! as placeholders and patched once the box content is complete.
//!
//! This module writes `ftyp` and the whole `moov` tree. Sample data lives in
//! `mdat`, which [`super::mp4::Mp4Writer`] streams separately.

use std::io::{Seek, SeekFrom, Write};

use byteorder::{BigEndian, WriteBytesExt};
use bytes::Bytes;

use super::types::{MuxError, MuxResult};
use crate::capture::h264::ParameterSets;
use crate::capture::{AudioCodec, Rotation, VideoCodec};

/// Video media timescale (90 kHz, as in MPEG-TS)
pub const VIDEO_TIMESCALE: u32 = 90_000;

/// Movie timescale (millisecond precision)
pub const MOVIE_TIMESCALE: u32 = 1000;

/// Seconds between 1904-01-01 (MP4 epoch) and 1970-01-01
pub const MP4_EPOCH_OFFSET: u64 = 2_082_844_800;

/// Current wall-clock time in MP4 epoch seconds
pub fn mp4_time_now() -> u64 {
    MP4_EPOCH_OFFSET + chrono::Utc::now().timestamp().max(0) as u64
}

/// Convert microseconds to `timescale` ticks, rounding to nearest.
pub fn us_to_ticks(us: i64, timescale: u32) -> u64 {
    let us = us.max(0) as u128;
    ((us * timescale as u128 + 500_000) / 1_000_000) as u64
}

/// Rescale ticks between timescales
pub fn rescale(ticks: u64, from: u32, to: u32) -> u64 {
    (ticks as u128 * to as u128 / from.max(1) as u128) as u64
}

pub fn write_box_header<W: Write>(writer: &mut W, box_type: &[u8; 4], size: u32) -> MuxResult<()> {
    writer.write_u32::<BigEndian>(size)?;
    writer.write_all(box_type)?;
    Ok(())
}

pub fn write_full_box_header<W: Write>(
    writer: &mut W,
    box_type: &[u8; 4],
    size: u32,
    version: u8,
    flags: u32,
) -> MuxResult<()> {
    writer.write_u32::<BigEndian>(size)?;
    writer.write_all(box_type)?;
    writer.write_u32::<BigEndian>(((version as u32) << 24) | (flags & 0x00FF_FFFF))?;
    Ok(())
}

/// Start a box of unknown size. Returns the position to patch with
/// [`fill_box_size`].
pub fn begin_box<W: Write + Seek>(writer: &mut W, box_type: &[u8; 4]) -> MuxResult<u64> {
    let pos = writer.stream_position()?;
    writer.write_u32::<BigEndian>(0)?;
    writer.write_all(box_type)?;
    Ok(pos)
}

/// Start a full box of unknown size
pub fn begin_full_box<W: Write + Seek>(
    writer: &mut W,
    box_type: &[u8; 4],
    version: u8,
    flags: u32,
) -> MuxResult<u64> {
    let pos = begin_box(writer, box_type)?;
    writer.write_u32::<BigEndian>(((version as u32) << 24) | (flags & 0x00FF_FFFF))?;
    Ok(pos)
}

/// Patch the 32-bit size at `size_pos` to span up to the current position.
pub fn fill_box_size<W: Write + Seek>(writer: &mut W, size_pos: u64) -> MuxResult<()> {
    let current = writer.stream_position()?;
    let size = current - size_pos;
    if size > u32::MAX as u64 {
        return Err(MuxError::Overflow(format!("box size {} exceeds 32 bits", size)));
    }
    writer.seek(SeekFrom::Start(size_pos))?;
    writer.write_u32::<BigEndian>(size as u32)?;
    writer.seek(SeekFrom::Start(current))?;
    Ok(())
}

/// Start a box with a 64-bit size. Returns the position of the extended
/// size field, to patch with [`fill_large_box_size`].
pub fn begin_large_box<W: Write + Seek>(writer: &mut W, box_type: &[u8; 4]) -> MuxResult<u64> {
    writer.write_u32::<BigEndian>(1)?;
    writer.write_all(box_type)?;
    let size_pos = writer.stream_position()?;
    writer.write_u64::<BigEndian>(0)?;
    Ok(size_pos)
}

pub fn fill_large_box_size<W: Write + Seek>(writer: &mut W, size_pos: u64) -> MuxResult<()> {
    let current = writer.stream_position()?;
    // 8-byte compact header precedes the extended size field
    let total = current - (size_pos - 8);
    writer.seek(SeekFrom::Start(size_pos))?;
    writer.write_u64::<BigEndian>(total)?;
    writer.seek(SeekFrom::Start(current))?;
    Ok(())
}

pub fn write_zeros<W: Write>(writer: &mut W, count: usize) -> MuxResult<()> {
    writer.write_all(&vec![0u8; count])?;
    Ok(())
}

fn write_fixed_16_16<W: Write>(writer: &mut W, value: i32) -> MuxResult<()> {
    writer.write_i32::<BigEndian>(value << 16)?;
    Ok(())
}

fn duration_u32(value: u64, what: &str) -> MuxResult<u32> {
    u32::try_from(value).map_err(|_| MuxError::Overflow(format!("{} duration {}", what, value)))
}

/// ISO 639-2/T code packed into 3x5 bits
pub fn encode_language(lang: &str) -> u16 {
    let bytes = lang.as_bytes();
    if bytes.len() != 3 || !bytes.iter().all(|b| b.is_ascii_lowercase()) {
        return encode_language("und");
    }
    bytes
        .iter()
        .fold(0u16, |acc, b| (acc << 5) | (*b - 0x60) as u16)
}

/// Write the 3x3 transformation matrix for a clockwise display rotation.
///
/// Layout is `a b u / c d v / x y w`, with `u v w` in 2.30 fixed point and
/// the rest in 16.16.
pub fn write_matrix<W: Write>(writer: &mut W, rotation: Rotation) -> MuxResult<()> {
    let (a, b, c, d) = match rotation {
        Rotation::Deg0 => (1, 0, 0, 1),
        Rotation::Deg90 => (0, 1, -1, 0),
        Rotation::Deg180 => (-1, 0, 0, -1),
        Rotation::Deg270 => (0, -1, 1, 0),
    };
    write_fixed_16_16(writer, a)?;
    write_fixed_16_16(writer, b)?;
    writer.write_u32::<BigEndian>(0)?;
    write_fixed_16_16(writer, c)?;
    write_fixed_16_16(writer, d)?;
    writer.write_u32::<BigEndian>(0)?;
    writer.write_u32::<BigEndian>(0)?;
    writer.write_u32::<BigEndian>(0)?;
    writer.write_u32::<BigEndian>(0x4000_0000)?;
    Ok(())
}

/// One sample in the `mdat` box
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    /// Absolute file offset
    pub offset: u64,
    pub size: u32,
    /// Duration in media timescale ticks
    pub duration: u32,
    pub is_sync: bool,
}

/// Per-track codec description
#[derive(Debug, Clone)]
pub enum TrackHandler {
    Video {
        codec: VideoCodec,
        width: u32,
        height: u32,
        parameter_sets: ParameterSets,
    },
    Audio {
        codec: AudioCodec,
        sample_rate: u32,
        channels: u16,
        /// AudioSpecificConfig for AAC, unused otherwise
        config: Bytes,
    },
}

impl TrackHandler {
    fn is_video(&self) -> bool {
        matches!(self, TrackHandler::Video { .. })
    }
}

/// Everything needed to write one `trak` box
#[derive(Debug, Clone)]
pub struct TrackInfo {
    /// 1-based track id
    pub track_id: u32,
    pub timescale: u32,
    /// Sum of sample durations, in media ticks
    pub duration: u64,
    /// Presentation time of the first sample, in media ticks
    pub start_offset: u64,
    pub rotation: Rotation,
    pub handler: TrackHandler,
    pub samples: Vec<SampleInfo>,
}

impl TrackInfo {
    /// Presentation end in movie ticks, including any leading gap
    fn movie_end(&self) -> u64 {
        rescale(self.start_offset + self.duration, self.timescale, MOVIE_TIMESCALE)
    }
}

/// `ftyp`: major brand isom, compatible isom/iso2/avc1/mp41
pub fn write_ftyp<W: Write>(writer: &mut W) -> MuxResult<()> {
    write_box_header(writer, b"ftyp", 8 + 4 + 4 + 4 * 4)?;
    writer.write_all(b"isom")?;
    writer.write_u32::<BigEndian>(0x200)?;
    writer.write_all(b"isom")?;
    writer.write_all(b"iso2")?;
    writer.write_all(b"avc1")?;
    writer.write_all(b"mp41")?;
    Ok(())
}

pub fn write_mvhd<W: Write + Seek>(
    writer: &mut W,
    duration: u64,
    creation_time: u64,
    next_track_id: u32,
) -> MuxResult<()> {
    let size_pos = begin_full_box(writer, b"mvhd", 0, 0)?;
    writer.write_u32::<BigEndian>(creation_time as u32)?;
    writer.write_u32::<BigEndian>(creation_time as u32)?;
    writer.write_u32::<BigEndian>(MOVIE_TIMESCALE)?;
    writer.write_u32::<BigEndian>(duration_u32(duration, "movie")?)?;
    writer.write_u32::<BigEndian>(0x0001_0000)?; // rate 1.0
    writer.write_u16::<BigEndian>(0x0100)?; // volume 1.0
    write_zeros(writer, 10)?;
    write_matrix(writer, Rotation::Deg0)?;
    write_zeros(writer, 24)?; // pre_defined
    writer.write_u32::<BigEndian>(next_track_id)?;
    fill_box_size(writer, size_pos)
}

pub fn write_tkhd<W: Write + Seek>(
    writer: &mut W,
    track: &TrackInfo,
    creation_time: u64,
) -> MuxResult<()> {
    // flags: enabled | in_movie | in_preview
    let size_pos = begin_full_box(writer, b"tkhd", 0, 0x000007)?;
    writer.write_u32::<BigEndian>(creation_time as u32)?;
    writer.write_u32::<BigEndian>(creation_time as u32)?;
    writer.write_u32::<BigEndian>(track.track_id)?;
    write_zeros(writer, 4)?;
    writer.write_u32::<BigEndian>(duration_u32(track.movie_end(), "track")?)?;
    write_zeros(writer, 8)?;
    writer.write_i16::<BigEndian>(0)?; // layer

    let (group, volume, width, height, rotation) = match &track.handler {
        TrackHandler::Video { width, height, .. } => (0, 0, *width, *height, track.rotation),
        TrackHandler::Audio { .. } => (1, 0x0100, 0, 0, Rotation::Deg0),
    };
    writer.write_i16::<BigEndian>(group)?;
    writer.write_u16::<BigEndian>(volume)?;
    write_zeros(writer, 2)?;
    write_matrix(writer, rotation)?;
    write_fixed_16_16(writer, width as i32)?;
    write_fixed_16_16(writer, height as i32)?;
    fill_box_size(writer, size_pos)
}

/// `edts/elst` with an empty edit covering the gap before the first sample.
pub fn write_edts<W: Write + Seek>(writer: &mut W, track: &TrackInfo) -> MuxResult<()> {
    let gap = rescale(track.start_offset, track.timescale, MOVIE_TIMESCALE);
    let media = rescale(track.duration, track.timescale, MOVIE_TIMESCALE);

    let edts_pos = begin_box(writer, b"edts")?;
    let elst_pos = begin_full_box(writer, b"elst", 0, 0)?;
    writer.write_u32::<BigEndian>(2)?;
    // Empty edit: media_time -1
    writer.write_u32::<BigEndian>(duration_u32(gap, "edit")?)?;
    writer.write_i32::<BigEndian>(-1)?;
    writer.write_u32::<BigEndian>(0x0001_0000)?;
    // Whole media from its start
    writer.write_u32::<BigEndian>(duration_u32(media, "edit")?)?;
    writer.write_i32::<BigEndian>(0)?;
    writer.write_u32::<BigEndian>(0x0001_0000)?;
    fill_box_size(writer, elst_pos)?;
    fill_box_size(writer, edts_pos)
}

pub fn write_mdhd<W: Write + Seek>(
    writer: &mut W,
    timescale: u32,
    duration: u64,
    creation_time: u64,
) -> MuxResult<()> {
    let size_pos = begin_full_box(writer, b"mdhd", 0, 0)?;
    writer.write_u32::<BigEndian>(creation_time as u32)?;
    writer.write_u32::<BigEndian>(creation_time as u32)?;
    writer.write_u32::<BigEndian>(timescale)?;
    writer.write_u32::<BigEndian>(duration_u32(duration, "media")?)?;
    writer.write_u16::<BigEndian>(encode_language("und"))?;
    writer.write_u16::<BigEndian>(0)?;
    fill_box_size(writer, size_pos)
}

pub fn write_hdlr<W: Write + Seek>(writer: &mut W, handler_type: &[u8; 4]) -> MuxResult<()> {
    let name: &[u8] = match handler_type {
        b"vide" => b"VideoHandler\0",
        b"soun" => b"SoundHandler\0",
        _ => b"DataHandler\0",
    };
    let size_pos = begin_full_box(writer, b"hdlr", 0, 0)?;
    write_zeros(writer, 4)?;
    writer.write_all(handler_type)?;
    write_zeros(writer, 12)?;
    writer.write_all(name)?;
    fill_box_size(writer, size_pos)
}

fn write_nal_list<W: Write>(writer: &mut W, nals: &[Bytes]) -> MuxResult<()> {
    for nal in nals {
        let len = u16::try_from(nal.len())
            .map_err(|_| MuxError::Overflow(format!("parameter set of {} bytes", nal.len())))?;
        writer.write_u16::<BigEndian>(len)?;
        writer.write_all(nal)?;
    }
    Ok(())
}

/// `avcC`: AVCDecoderConfigurationRecord with 4-byte NAL lengths
fn write_avcc<W: Write + Seek>(writer: &mut W, sets: &ParameterSets) -> MuxResult<()> {
    let sps = sets
        .sps
        .first()
        .ok_or_else(|| MuxError::InvalidConfig("H.264 track without SPS".into()))?;
    if sets.pps.is_empty() {
        return Err(MuxError::InvalidConfig("H.264 track without PPS".into()));
    }

    let size_pos = begin_box(writer, b"avcC")?;
    writer.write_u8(1)?;
    writer.write_u8(sps.get(1).copied().unwrap_or(0x42))?; // profile
    writer.write_u8(sps.get(2).copied().unwrap_or(0x00))?; // compatibility
    writer.write_u8(sps.get(3).copied().unwrap_or(0x1F))?; // level
    writer.write_u8(0xFF)?; // lengthSizeMinusOne = 3
    writer.write_u8(0xE0 | (sets.sps.len().min(31) as u8))?;
    write_nal_list(writer, &sets.sps[..sets.sps.len().min(31)])?;
    writer.write_u8(sets.pps.len().min(255) as u8)?;
    write_nal_list(writer, &sets.pps[..sets.pps.len().min(255)])?;
    fill_box_size(writer, size_pos)
}

/// `hvcC`: HEVCDecoderConfigurationRecord.
///
/// Profile/tier/level are copied from the SPS when it is long enough;
/// otherwise Main profile, level 3.1 is declared.
fn write_hvcc<W: Write + Seek>(writer: &mut W, sets: &ParameterSets) -> MuxResult<()> {
    if !sets.is_complete(VideoCodec::H265) {
        return Err(MuxError::InvalidConfig("H.265 track needs VPS, SPS and PPS".into()));
    }

    let size_pos = begin_box(writer, b"hvcC")?;
    writer.write_u8(1)?;

    // profile_tier_level follows the 2-byte NAL header and 1 byte of
    // vps/max_sub_layers fields in the SPS
    match sets.sps[0].get(3..15) {
        Some(ptl) => writer.write_all(ptl)?,
        None => {
            writer.write_u8(0x01)?;
            writer.write_u32::<BigEndian>(0x6000_0000)?;
            write_zeros(writer, 6)?;
            writer.write_u8(93)?;
        }
    }

    writer.write_u16::<BigEndian>(0xF000)?; // min_spatial_segmentation_idc
    writer.write_u8(0xFC)?; // parallelismType
    writer.write_u8(0xFD)?; // chroma 4:2:0
    writer.write_u8(0xF8)?; // luma bit depth 8
    writer.write_u8(0xF8)?; // chroma bit depth 8
    writer.write_u16::<BigEndian>(0)?; // avgFrameRate
    writer.write_u8(0x0F)?; // lengthSizeMinusOne = 3

    writer.write_u8(3)?;
    for (nal_type, nals) in [(32u8, &sets.vps), (33, &sets.sps), (34, &sets.pps)] {
        writer.write_u8(0x80 | nal_type)?; // array_completeness
        writer.write_u16::<BigEndian>(nals.len() as u16)?;
        write_nal_list(writer, nals)?;
    }
    fill_box_size(writer, size_pos)
}

fn write_visual_sample_entry<W: Write + Seek>(
    writer: &mut W,
    codec: VideoCodec,
    width: u32,
    height: u32,
    sets: &ParameterSets,
) -> MuxResult<()> {
    let entry_type = match codec {
        VideoCodec::H264 => b"avc1",
        VideoCodec::H265 => b"hvc1",
    };
    let width = u16::try_from(width).map_err(|_| MuxError::InvalidConfig(format!("width {}", width)))?;
    let height =
        u16::try_from(height).map_err(|_| MuxError::InvalidConfig(format!("height {}", height)))?;

    let size_pos = begin_box(writer, entry_type)?;
    write_zeros(writer, 6)?;
    writer.write_u16::<BigEndian>(1)?; // data_reference_index
    write_zeros(writer, 16)?;
    writer.write_u16::<BigEndian>(width)?;
    writer.write_u16::<BigEndian>(height)?;
    writer.write_u32::<BigEndian>(0x0048_0000)?; // 72 dpi
    writer.write_u32::<BigEndian>(0x0048_0000)?;
    write_zeros(writer, 4)?;
    writer.write_u16::<BigEndian>(1)?; // frame_count
    write_zeros(writer, 32)?; // compressorname
    writer.write_u16::<BigEndian>(0x0018)?;
    writer.write_i16::<BigEndian>(-1)?;

    match codec {
        VideoCodec::H264 => write_avcc(writer, sets)?,
        VideoCodec::H265 => write_hvcc(writer, sets)?,
    }
    fill_box_size(writer, size_pos)
}

fn write_audio_sample_entry<W: Write + Seek>(
    writer: &mut W,
    codec: AudioCodec,
    sample_rate: u32,
    channels: u16,
    config: &[u8],
) -> MuxResult<()> {
    let entry_type = match codec {
        AudioCodec::Aac => b"mp4a",
        AudioCodec::Opus => b"Opus",
        // Little-endian signed PCM
        AudioCodec::Pcm16 => b"sowt",
    };
    if sample_rate > u16::MAX as u32 && codec != AudioCodec::Opus {
        return Err(MuxError::InvalidConfig(format!("sample rate {}", sample_rate)));
    }

    let size_pos = begin_box(writer, entry_type)?;
    write_zeros(writer, 6)?;
    writer.write_u16::<BigEndian>(1)?; // data_reference_index
    write_zeros(writer, 8)?;
    writer.write_u16::<BigEndian>(channels)?;
    writer.write_u16::<BigEndian>(16)?; // samplesize
    write_zeros(writer, 4)?;
    // 16.16 sample rate; Opus always declares 48 kHz
    let declared_rate = if codec == AudioCodec::Opus { 48_000 } else { sample_rate };
    writer.write_u32::<BigEndian>(declared_rate << 16)?;

    match codec {
        AudioCodec::Aac => write_esds(writer, config)?,
        AudioCodec::Opus => write_dops(writer, sample_rate, channels)?,
        AudioCodec::Pcm16 => {}
    }
    fill_box_size(writer, size_pos)
}

/// MPEG-4 descriptor length, expandable form
fn write_descriptor_length<W: Write>(writer: &mut W, len: usize) -> MuxResult<()> {
    if len >= 1 << 28 {
        return Err(MuxError::Overflow(format!("descriptor length {}", len)));
    }
    let mut shift = 21;
    while shift > 0 && len >> shift == 0 {
        shift -= 7;
    }
    while shift > 0 {
        writer.write_u8(0x80 | ((len >> shift) & 0x7F) as u8)?;
        shift -= 7;
    }
    writer.write_u8((len & 0x7F) as u8)?;
    Ok(())
}

/// `esds` for AAC: ES, DecoderConfig, DecoderSpecificInfo and SL descriptors
fn write_esds<W: Write + Seek>(writer: &mut W, config: &[u8]) -> MuxResult<()> {
    if config.is_empty() {
        return Err(MuxError::InvalidConfig("AAC track without AudioSpecificConfig".into()));
    }
    let specific_len = config.len();
    let decoder_len = 13 + 1 + descriptor_length_size(specific_len) + specific_len;
    let sl_len = 1;
    let es_len = 3
        + 1
        + descriptor_length_size(decoder_len)
        + decoder_len
        + 1
        + descriptor_length_size(sl_len)
        + sl_len;

    let size_pos = begin_full_box(writer, b"esds", 0, 0)?;
    writer.write_u8(0x03)?;
    write_descriptor_length(writer, es_len)?;
    writer.write_u16::<BigEndian>(0)?; // ES_ID
    writer.write_u8(0)?;

    writer.write_u8(0x04)?;
    write_descriptor_length(writer, decoder_len)?;
    writer.write_u8(0x40)?; // MPEG-4 audio
    writer.write_u8(0x15)?; // audio stream
    write_zeros(writer, 3)?; // bufferSizeDB
    writer.write_u32::<BigEndian>(0)?; // maxBitrate
    writer.write_u32::<BigEndian>(0)?; // avgBitrate

    writer.write_u8(0x05)?;
    write_descriptor_length(writer, specific_len)?;
    writer.write_all(config)?;

    writer.write_u8(0x06)?;
    write_descriptor_length(writer, sl_len)?;
    writer.write_u8(0x02)?;
    fill_box_size(writer, size_pos)
}

fn descriptor_length_size(len: usize) -> usize {
    match len {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        _ => 4,
    }
}

/// `dOps`: Opus specific box
fn write_dops<W: Write + Seek>(writer: &mut W, input_rate: u32, channels: u16) -> MuxResult<()> {
    let size_pos = begin_box(writer, b"dOps")?;
    writer.write_u8(0)?;
    writer.write_u8(channels.min(255) as u8)?;
    writer.write_u16::<BigEndian>(312)?; // pre-skip
    writer.write_u32::<BigEndian>(input_rate)?;
    writer.write_i16::<BigEndian>(0)?;
    writer.write_u8(0)?; // mapping family
    fill_box_size(writer, size_pos)
}

/// Run-length encode a sequence of values into `(count, value)` pairs
fn run_lengths<T: PartialEq + Copy>(values: impl Iterator<Item = T>) -> Vec<(u32, T)> {
    let mut runs: Vec<(u32, T)> = Vec::new();
    for value in values {
        match runs.last_mut() {
            Some((count, last)) if *last == value => *count += 1,
            _ => runs.push((1, value)),
        }
    }
    runs
}

fn write_stbl<W: Write + Seek>(writer: &mut W, track: &TrackInfo) -> MuxResult<()> {
    let samples = &track.samples;
    let stbl_pos = begin_box(writer, b"stbl")?;

    let stsd_pos = begin_full_box(writer, b"stsd", 0, 0)?;
    writer.write_u32::<BigEndian>(1)?;
    match &track.handler {
        TrackHandler::Video {
            codec,
            width,
            height,
            parameter_sets,
        } => write_visual_sample_entry(writer, *codec, *width, *height, parameter_sets)?,
        TrackHandler::Audio {
            codec,
            sample_rate,
            channels,
            config,
        } => write_audio_sample_entry(writer, *codec, *sample_rate, *channels, config)?,
    }
    fill_box_size(writer, stsd_pos)?;

    let stts = run_lengths(samples.iter().map(|s| s.duration));
    let pos = begin_full_box(writer, b"stts", 0, 0)?;
    writer.write_u32::<BigEndian>(stts.len() as u32)?;
    for (count, duration) in stts {
        writer.write_u32::<BigEndian>(count)?;
        writer.write_u32::<BigEndian>(duration)?;
    }
    fill_box_size(writer, pos)?;

    // One sample per chunk
    let pos = begin_full_box(writer, b"stsc", 0, 0)?;
    if samples.is_empty() {
        writer.write_u32::<BigEndian>(0)?;
    } else {
        writer.write_u32::<BigEndian>(1)?;
        writer.write_u32::<BigEndian>(1)?;
        writer.write_u32::<BigEndian>(1)?;
        writer.write_u32::<BigEndian>(1)?;
    }
    fill_box_size(writer, pos)?;

    let pos = begin_full_box(writer, b"stsz", 0, 0)?;
    let uniform = samples.first().map(|s| s.size).filter(|size| samples.iter().all(|s| s.size == *size));
    writer.write_u32::<BigEndian>(uniform.unwrap_or(0))?;
    writer.write_u32::<BigEndian>(samples.len() as u32)?;
    if uniform.is_none() {
        for sample in samples {
            writer.write_u32::<BigEndian>(sample.size)?;
        }
    }
    fill_box_size(writer, pos)?;

    if samples.iter().any(|s| s.offset > u32::MAX as u64) {
        let pos = begin_full_box(writer, b"co64", 0, 0)?;
        writer.write_u32::<BigEndian>(samples.len() as u32)?;
        for sample in samples {
            writer.write_u64::<BigEndian>(sample.offset)?;
        }
        fill_box_size(writer, pos)?;
    } else {
        let pos = begin_full_box(writer, b"stco", 0, 0)?;
        writer.write_u32::<BigEndian>(samples.len() as u32)?;
        for sample in samples {
            writer.write_u32::<BigEndian>(sample.offset as u32)?;
        }
        fill_box_size(writer, pos)?;
    }

    // Absent stss means every sample is a sync sample
    if track.handler.is_video() {
        let sync: Vec<u32> = samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_sync)
            .map(|(i, _)| i as u32 + 1)
            .collect();
        let pos = begin_full_box(writer, b"stss", 0, 0)?;
        writer.write_u32::<BigEndian>(sync.len() as u32)?;
        for number in sync {
            writer.write_u32::<BigEndian>(number)?;
        }
        fill_box_size(writer, pos)?;
    }

    fill_box_size(writer, stbl_pos)
}

fn write_minf<W: Write + Seek>(writer: &mut W, track: &TrackInfo) -> MuxResult<()> {
    let minf_pos = begin_box(writer, b"minf")?;

    if track.handler.is_video() {
        write_full_box_header(writer, b"vmhd", 20, 0, 0x000001)?;
        write_zeros(writer, 8)?; // graphicsmode + opcolor
    } else {
        write_full_box_header(writer, b"smhd", 16, 0, 0)?;
        write_zeros(writer, 4)?; // balance + reserved
    }

    let dinf_pos = begin_box(writer, b"dinf")?;
    let dref_pos = begin_full_box(writer, b"dref", 0, 0)?;
    writer.write_u32::<BigEndian>(1)?;
    // Self-contained: data is in this file
    write_full_box_header(writer, b"url ", 12, 0, 0x000001)?;
    fill_box_size(writer, dref_pos)?;
    fill_box_size(writer, dinf_pos)?;

    write_stbl(writer, track)?;
    fill_box_size(writer, minf_pos)
}

fn write_trak<W: Write + Seek>(writer: &mut W, track: &TrackInfo, creation_time: u64) -> MuxResult<()> {
    let trak_pos = begin_box(writer, b"trak")?;
    write_tkhd(writer, track, creation_time)?;
    if track.start_offset > 0 {
        write_edts(writer, track)?;
    }

    let mdia_pos = begin_box(writer, b"mdia")?;
    write_mdhd(writer, track.timescale, track.duration, creation_time)?;
    write_hdlr(writer, if track.handler.is_video() { b"vide" } else { b"soun" })?;
    write_minf(writer, track)?;
    fill_box_size(writer, mdia_pos)?;

    fill_box_size(writer, trak_pos)
}

/// Write the complete `moov` box.
pub fn write_moov<W: Write + Seek>(
    writer: &mut W,
    tracks: &[TrackInfo],
    creation_time: u64,
) -> MuxResult<()> {
    let moov_pos = begin_box(writer, b"moov")?;
    let duration = tracks.iter().map(TrackInfo::movie_end).max().unwrap_or(0);
    let next_track_id = tracks.iter().map(|t| t.track_id).max().unwrap_or(0) + 1;
    write_mvhd(writer, duration, creation_time, next_track_id)?;
    for track in tracks {
        write_trak(writer, track, creation_time)?;
    }
    fill_box_size(writer, moov_pos)
}
