//! MP4 file writer
//!
//! Layout is `ftyp`, one large `mdat` holding every sample in write order,
//! then `moov`. The `mdat` size is patched when the writer stops, so the
//! sample index never has to be known up front.
//!
//! Closing is two-phase: [`Mp4Writer::stop`] finalizes the container and
//! [`Mp4Writer::release`] closes the file. `release` is valid in every
//! state, so callers can always run it after a failed `stop`.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::atoms::{self, SampleInfo, TrackHandler, TrackInfo, VIDEO_TIMESCALE};
use super::types::{MuxError, MuxResult};
use crate::capture::h264::{self, ParameterSets};
use crate::capture::{AudioCodec, MediaParams, Rotation, TrackFormat, TrackKind};

/// Writer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Tracks may be added
    Configuring,
    /// Samples may be written
    Writing,
    /// Container finalized, file still open
    Stopped,
    /// File closed
    Released,
}

/// Fallback duration for a track holding a single video sample (1/30 s)
const DEFAULT_VIDEO_SAMPLE_TICKS: u64 = VIDEO_TIMESCALE as u64 / 30;

struct TrackState {
    kind: TrackKind,
    timescale: u32,
    rotation: Rotation,
    handler: TrackHandler,
    /// Sample timestamps in media ticks
    timestamps: Vec<u64>,
    samples: Vec<SampleInfo>,
}

impl TrackState {
    /// Duration of the final sample, which has no successor to measure
    /// against.
    fn last_sample_ticks(&self) -> u64 {
        if let [.., prev, last] = self.timestamps.as_slice() {
            return last - prev;
        }
        match &self.handler {
            TrackHandler::Video { .. } => DEFAULT_VIDEO_SAMPLE_TICKS,
            TrackHandler::Audio { codec, channels, .. } => match codec {
                AudioCodec::Aac => 1024,
                AudioCodec::Opus => 960,
                AudioCodec::Pcm16 => self
                    .samples
                    .last()
                    .map(|s| s.size as u64 / (*channels as u64 * 2).max(1))
                    .unwrap_or(0),
            },
        }
    }

    fn finish(mut self, track_id: u32) -> MuxResult<TrackInfo> {
        let count = self.samples.len();
        let last = self.last_sample_ticks();
        for i in 0..count {
            let ticks = if i + 1 < count {
                self.timestamps[i + 1] - self.timestamps[i]
            } else {
                last
            };
            self.samples[i].duration = u32::try_from(ticks)
                .map_err(|_| MuxError::Overflow(format!("sample duration {}", ticks)))?;
        }

        let duration = self.samples.iter().map(|s| s.duration as u64).sum();
        Ok(TrackInfo {
            track_id,
            timescale: self.timescale,
            duration,
            start_offset: self.timestamps.first().copied().unwrap_or(0),
            rotation: self.rotation,
            handler: self.handler,
            samples: self.samples,
        })
    }
}

/// Streaming MP4 writer
pub struct Mp4Writer {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    state: WriterState,
    tracks: Vec<TrackState>,
    /// Position of the 64-bit `mdat` size field
    mdat_size_pos: u64,
    /// Current write position
    position: u64,
    creation_time: u64,
}

impl Mp4Writer {
    /// Create the output file. Nothing is written until [`start`](Self::start).
    ///
    /// Fails with `AlreadyExists` rather than truncating an existing file.
    pub fn create(path: impl AsRef<Path>) -> MuxResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        debug!("Opened container {:?}", path);

        Ok(Self {
            path,
            file: Some(BufWriter::new(file)),
            state: WriterState::Configuring,
            tracks: Vec::new(),
            mdat_size_pos: 0,
            position: 0,
            creation_time: atoms::mp4_time_now(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn sample_count(&self, track: usize) -> usize {
        self.tracks.get(track).map(|t| t.samples.len()).unwrap_or(0)
    }

    fn expect_state(&self, expected: WriterState, action: &str) -> MuxResult<()> {
        if self.state != expected {
            return Err(MuxError::InvalidState(format!(
                "cannot {} while {:?}",
                action, self.state
            )));
        }
        Ok(())
    }

    /// Add the video track. `rotation` becomes the track's display matrix.
    pub fn add_video_track(&mut self, format: &TrackFormat, rotation: Rotation) -> MuxResult<usize> {
        self.expect_state(WriterState::Configuring, "add a track")?;
        let MediaParams::Video {
            codec,
            width,
            height,
        } = format.params
        else {
            return Err(MuxError::TrackError("video track needs a video format".into()));
        };

        let parameter_sets = ParameterSets::from_annexb(&format.codec_config, codec);
        if !parameter_sets.is_complete(codec) {
            return Err(MuxError::InvalidConfig(format!(
                "{:?} codec config is missing parameter sets",
                codec
            )));
        }

        self.tracks.push(TrackState {
            kind: TrackKind::Video,
            timescale: VIDEO_TIMESCALE,
            rotation,
            handler: TrackHandler::Video {
                codec,
                width,
                height,
                parameter_sets,
            },
            timestamps: Vec::new(),
            samples: Vec::new(),
        });
        Ok(self.tracks.len() - 1)
    }

    pub fn add_audio_track(&mut self, format: &TrackFormat) -> MuxResult<usize> {
        self.expect_state(WriterState::Configuring, "add a track")?;
        let MediaParams::Audio {
            codec,
            sample_rate,
            channels,
        } = format.params
        else {
            return Err(MuxError::TrackError("audio track needs an audio format".into()));
        };
        if sample_rate == 0 || channels == 0 {
            return Err(MuxError::InvalidConfig(format!(
                "audio format {} Hz x {} channels",
                sample_rate, channels
            )));
        }

        let timescale = match codec {
            AudioCodec::Opus => 48_000,
            AudioCodec::Aac | AudioCodec::Pcm16 => sample_rate,
        };
        self.tracks.push(TrackState {
            kind: TrackKind::Audio,
            timescale,
            rotation: Rotation::Deg0,
            handler: TrackHandler::Audio {
                codec,
                sample_rate,
                channels,
                config: format.codec_config.clone(),
            },
            timestamps: Vec::new(),
            samples: Vec::new(),
        });
        Ok(self.tracks.len() - 1)
    }

    /// Write `ftyp` and open the `mdat` box.
    pub fn start(&mut self) -> MuxResult<()> {
        self.expect_state(WriterState::Configuring, "start")?;
        if self.tracks.is_empty() {
            return Err(MuxError::InvalidState("no tracks added".into()));
        }
        let file = self.file_mut()?;

        let mut header = Cursor::new(Vec::with_capacity(48));
        atoms::write_ftyp(&mut header)?;
        let mdat_size_pos = atoms::begin_large_box(&mut header, b"mdat")?;
        let header = header.into_inner();
        file.write_all(&header)?;

        self.mdat_size_pos = mdat_size_pos;
        self.position = header.len() as u64;
        self.state = WriterState::Writing;
        Ok(())
    }

    /// Append one sample to `track`.
    ///
    /// `timestamp_us` must not go backwards within a track. Video payloads
    /// in Annex-B form are rewritten with 4-byte length prefixes.
    pub fn write_sample(
        &mut self,
        track: usize,
        timestamp_us: i64,
        keyframe: bool,
        data: &[u8],
    ) -> MuxResult<()> {
        self.expect_state(WriterState::Writing, "write a sample")?;
        let (kind, timescale, last) = {
            let state = self
                .tracks
                .get(track)
                .ok_or_else(|| MuxError::TrackError(format!("track {} not found", track)))?;
            (state.kind, state.timescale, state.timestamps.last().copied())
        };

        let ticks = atoms::us_to_ticks(timestamp_us, timescale);
        if let Some(last) = last {
            if ticks < last {
                return Err(MuxError::TrackError(format!(
                    "track {} timestamp went backwards ({} < {})",
                    track, ticks, last
                )));
            }
        }

        let converted;
        let payload = match kind {
            TrackKind::Video if h264::is_annexb(data) => {
                converted = h264::annexb_to_length_prefixed(data);
                converted.as_slice()
            }
            _ => data,
        };
        let size = u32::try_from(payload.len())
            .map_err(|_| MuxError::Overflow(format!("sample of {} bytes", payload.len())))?;

        let offset = self.position;
        self.file_mut()?.write_all(payload)?;
        self.position += size as u64;

        let state = &mut self.tracks[track];
        state.timestamps.push(ticks);
        state.samples.push(SampleInfo {
            offset,
            size,
            duration: 0,
            is_sync: kind == TrackKind::Audio || keyframe,
        });
        Ok(())
    }

    /// Close `mdat` and write `moov`.
    ///
    /// The writer leaves the `Writing` state even on failure; the file is
    /// then incomplete and only [`release`](Self::release) remains useful.
    pub fn stop(&mut self) -> MuxResult<()> {
        self.expect_state(WriterState::Writing, "stop")?;
        self.state = WriterState::Stopped;

        let tracks: Vec<TrackInfo> = std::mem::take(&mut self.tracks)
            .into_iter()
            .enumerate()
            .map(|(i, t)| t.finish(i as u32 + 1))
            .collect::<MuxResult<_>>()?;

        let mut moov = Cursor::new(Vec::new());
        atoms::write_moov(&mut moov, &tracks, self.creation_time)?;
        let moov = moov.into_inner();

        let mdat_size = self.position - (self.mdat_size_pos - 8);
        let mdat_size_pos = self.mdat_size_pos;
        let file = self.file_mut()?;
        atoms::fill_large_box_size(file, mdat_size_pos)?;
        file.write_all(&moov)?;
        file.flush()?;

        debug!(
            "Finalized {:?}: {} tracks, {} bytes of media",
            self.path,
            tracks.len(),
            mdat_size
        );
        Ok(())
    }

    /// Flush and close the file. Safe to call in any state and more than
    /// once.
    pub fn release(&mut self) -> MuxResult<()> {
        self.state = WriterState::Released;
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.flush()?;
        let file = file.into_inner().map_err(|e| MuxError::Io(e.into_error()))?;
        file.sync_all()?;
        Ok(())
    }

    fn file_mut(&mut self) -> MuxResult<&mut BufWriter<File>> {
        self.file
            .as_mut()
            .ok_or_else(|| MuxError::InvalidState("writer already released".into()))
    }
}

impl Drop for Mp4Writer {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(e) = self.release() {
                warn!("Failed to release container {:?}: {}", self.path, e);
            }
        }
    }
}
