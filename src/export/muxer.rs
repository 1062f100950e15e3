//! Snapshot to container conversion
//!
//! The ring buffer keeps per-track order only, so the muxer sorts every frame
//! by timestamp before writing and rebases the clip to start at zero.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::mp4::Mp4Writer;
use super::types::{
    ExportError, ExportRequest, ExportStage, MuxError, CONTAINER_EXTENSION, CONTAINER_MEDIA_TYPE,
};
use crate::buffer::Snapshot;
use crate::capture::{Frame, Rotation, TrackFormat, TrackKind};
use crate::upload::Artifact;

const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Stable-sort `frames` by timestamp and rebase them so the earliest frame
/// sits at zero. Rebased timestamps are clamped to be non-negative.
pub fn sort_and_rebase(mut frames: Vec<Frame>) -> Vec<Frame> {
    frames.sort_by_key(|f| f.timestamp_us);
    let Some(t0) = frames.first().map(|f| f.timestamp_us) else {
        return frames;
    };
    for frame in &mut frames {
        frame.timestamp_us = (frame.timestamp_us - t0).max(0);
    }
    frames
}

/// `{device_id}-{start_ms}-{end_ms}.mp4`
pub fn artifact_name(device_id: &str, start_epoch_ms: i64, end_epoch_ms: i64) -> String {
    format!(
        "{}-{}-{}.{}",
        device_id, start_epoch_ms, end_epoch_ms, CONTAINER_EXTENSION
    )
}

/// `name.mp4` -> `name-{n}.mp4`
fn numbered_name(name: &str, n: u32) -> String {
    let stem = name
        .strip_suffix(CONTAINER_EXTENSION)
        .and_then(|stem| stem.strip_suffix('.'))
        .unwrap_or(name);
    format!("{}-{}.{}", stem, n, CONTAINER_EXTENSION)
}

/// Writes snapshots into MP4 files under one output directory
#[derive(Debug, Clone)]
pub struct ContainerMuxer {
    output_dir: PathBuf,
    device_id: String,
}

impl ContainerMuxer {
    pub fn new(output_dir: impl Into<PathBuf>, device_id: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            device_id: device_id.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Open a writer on a name no other artifact holds. Exports landing in
    /// the same millisecond get a `-1`, `-2`, ... suffix.
    fn open_unique(
        &self,
        start_epoch_ms: i64,
        end_epoch_ms: i64,
    ) -> Result<(String, PathBuf, Mp4Writer), ExportError> {
        let base = artifact_name(&self.device_id, start_epoch_ms, end_epoch_ms);
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let remote_name = if attempt == 0 {
                base.clone()
            } else {
                numbered_name(&base, attempt)
            };
            let path = self.output_dir.join(&remote_name);
            match Mp4Writer::create(&path) {
                Ok(writer) => return Ok((remote_name, path, writer)),
                Err(MuxError::Io(e)) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!("{} already exists", remote_name);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ExportError::Io(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free artifact name for {}", base),
        )))
    }

    /// Write `snapshot` to a new file and describe it as an [`Artifact`].
    ///
    /// The clip's wall-clock start is approximated as export time minus the
    /// media span; it is not reconciled against any external clock. A failed
    /// export removes its partial file.
    pub fn export<F>(
        &self,
        snapshot: Snapshot,
        request: &ExportRequest,
        progress_callback: F,
    ) -> Result<Artifact, ExportError>
    where
        F: Fn(ExportStage),
    {
        if snapshot.is_empty() {
            return Err(ExportError::EmptySnapshot);
        }
        let (video_format, audio_format, frames, rotation) = snapshot.into_parts();
        let video_format = video_format.ok_or(ExportError::MissingVideoFormat)?;

        let frames = sort_and_rebase(frames);
        let span_us = frames.last().map(|f| f.timestamp_us).unwrap_or(0);
        let end_epoch_ms = Utc::now().timestamp_millis();
        let start_epoch_ms = end_epoch_ms - span_us / 1000;

        std::fs::create_dir_all(&self.output_dir)?;
        let (remote_name, path, mut writer) = self.open_unique(start_epoch_ms, end_epoch_ms)?;

        let audio_format = audio_format.filter(|_| frames.iter().any(|f| f.kind == TrackKind::Audio));
        if audio_format.is_none() {
            info!("Exporting {} video-only", remote_name);
        }

        progress_callback(ExportStage::Muxing);
        let written = write_tracks(
            &mut writer,
            &video_format,
            audio_format.as_ref(),
            rotation,
            &frames,
            &progress_callback,
        );
        let released = writer.release();

        let result = written.and_then(|()| released.map_err(ExportError::from));
        if let Err(e) = result {
            warn!("Export of {} failed: {}", remote_name, e);
            if let Err(remove_err) = std::fs::remove_file(&path) {
                debug!("Could not remove partial file {:?}: {}", path, remove_err);
            }
            return Err(e);
        }

        let size_bytes = std::fs::metadata(&path)?.len();
        info!(
            "Exported {} ({} frames, {} ms, {} bytes, rotation {})",
            remote_name,
            frames.len(),
            span_us / 1000,
            size_bytes,
            rotation.degrees()
        );

        Ok(Artifact {
            path,
            remote_name,
            media_type: CONTAINER_MEDIA_TYPE.to_string(),
            size_bytes,
            start_epoch_ms,
            end_epoch_ms,
            has_audio: audio_format.is_some(),
            correlation_timestamp: request.correlation_timestamp.clone(),
            session_id: request.session_id.clone(),
        })
    }
}

fn write_tracks<F>(
    writer: &mut Mp4Writer,
    video_format: &TrackFormat,
    audio_format: Option<&TrackFormat>,
    rotation: Rotation,
    frames: &[Frame],
    progress_callback: &F,
) -> Result<(), ExportError>
where
    F: Fn(ExportStage),
{
    let video_track = writer.add_video_track(video_format, rotation)?;
    let audio_track = audio_format
        .map(|format| writer.add_audio_track(format))
        .transpose()?;

    writer.start()?;
    for frame in frames {
        if frame.flags.is_codec_config() || frame.is_empty() {
            continue;
        }
        let track = match frame.kind {
            TrackKind::Video => video_track,
            TrackKind::Audio => match audio_track {
                Some(track) => track,
                None => continue,
            },
        };
        writer.write_sample(track, frame.timestamp_us, frame.is_keyframe(), &frame.payload)?;
    }

    progress_callback(ExportStage::Finalizing);
    writer.stop()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{AudioCodec, FrameFlags, VideoCodec};
    use crate::export::atoms::tests::find_box;
    use bytes::Bytes;
    use parking_lot::Mutex;

    const CONFIG: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0xC0, 0x1F, 0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80];

    fn video_format() -> TrackFormat {
        TrackFormat::video(VideoCodec::H264, 320, 240, Bytes::from_static(CONFIG))
    }

    fn video(ts: i64, keyframe: bool) -> Frame {
        let flags = if keyframe { FrameFlags::keyframe() } else { FrameFlags::empty() };
        let payload: &[u8] = if keyframe { &[0, 0, 0, 1, 0x65, 0x88, 0x80] } else { &[0, 0, 0, 1, 0x41, 0x9A] };
        Frame::copy_from(TrackKind::Video, payload, ts, flags)
    }

    fn audio(ts: i64) -> Frame {
        Frame::copy_from(TrackKind::Audio, &[7u8; 64], ts, FrameFlags::empty())
    }

    #[test]
    fn sorts_across_tracks_and_rebases() {
        // Audio at 50 ms enqueued after video at 80 ms
        let frames = vec![
            video(1_000_000, true),
            video(1_080_000, false),
            audio(1_050_000),
        ];
        let sorted = sort_and_rebase(frames);
        let order: Vec<(TrackKind, i64)> = sorted.iter().map(|f| (f.kind, f.timestamp_us)).collect();
        assert_eq!(
            order,
            vec![
                (TrackKind::Video, 0),
                (TrackKind::Audio, 50_000),
                (TrackKind::Video, 80_000),
            ]
        );
    }

    #[test]
    fn rebase_is_stable_and_non_negative() {
        let frames = vec![audio(-500), video(-500, true), audio(200)];
        let sorted = sort_and_rebase(frames);
        assert_eq!(sorted[0].kind, TrackKind::Audio);
        assert_eq!(sorted[1].kind, TrackKind::Video);
        assert!(sorted.windows(2).all(|w| w[0].timestamp_us <= w[1].timestamp_us));
        assert!(sorted.iter().all(|f| f.timestamp_us >= 0));
        assert_eq!(sorted[2].timestamp_us, 700);
    }

    #[test]
    fn artifact_naming() {
        assert_eq!(artifact_name("dev-1", 1000, 4000), "dev-1-1000-4000.mp4");
        assert_eq!(numbered_name("dev-1-1000-4000.mp4", 2), "dev-1-1000-4000-2.mp4");
    }

    #[test]
    fn same_millisecond_exports_get_their_own_files() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = ContainerMuxer::new(dir.path(), "device");
        let snapshot = || {
            Snapshot::new(
                Some(video_format()),
                None,
                vec![video(0, true), video(33_000, false)],
                Rotation::Deg0,
            )
        };

        for _ in 0..20 {
            let first = muxer.export(snapshot(), &ExportRequest::default(), |_| {}).unwrap();
            let second = muxer.export(snapshot(), &ExportRequest::default(), |_| {}).unwrap();
            assert_ne!(first.path, second.path);
            assert_ne!(first.remote_name, second.remote_name);
            assert_eq!(std::fs::metadata(&first.path).unwrap().len(), first.size_bytes);
            assert_eq!(std::fs::metadata(&second.path).unwrap().len(), second.size_bytes);
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 40);
    }

    #[test]
    fn video_only_export() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = ContainerMuxer::new(dir.path(), "device");
        let snapshot = Snapshot::new(
            Some(video_format()),
            None,
            vec![video(0, true), video(33_000, false), video(66_000, false)],
            Rotation::Deg90,
        );

        let stages = Mutex::new(Vec::new());
        let request = ExportRequest::new(Some("1700000000".into())).with_session("s-1");
        let artifact = muxer
            .export(snapshot, &request, |stage| stages.lock().push(stage))
            .unwrap();

        assert!(!artifact.has_audio);
        assert_eq!(artifact.end_epoch_ms - artifact.start_epoch_ms, 66);
        assert_eq!(artifact.correlation_timestamp.as_deref(), Some("1700000000"));
        assert_eq!(artifact.session_id.as_deref(), Some("s-1"));
        assert!(artifact.remote_name.starts_with("device-"));
        assert_eq!(*stages.lock(), vec![ExportStage::Muxing, ExportStage::Finalizing]);

        let buf = std::fs::read(&artifact.path).unwrap();
        assert_eq!(buf.len() as u64, artifact.size_bytes);
        assert_eq!(buf.windows(4).filter(|w| w == b"trak").count(), 1);
    }

    #[test]
    fn audio_format_without_frames_is_video_only() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = ContainerMuxer::new(dir.path(), "device");
        let snapshot = Snapshot::new(
            Some(video_format()),
            Some(TrackFormat::audio(AudioCodec::Pcm16, 48_000, 1, Bytes::new())),
            vec![video(0, true)],
            Rotation::Deg0,
        );
        let artifact = muxer.export(snapshot, &ExportRequest::default(), |_| {}).unwrap();
        assert!(!artifact.has_audio);
    }

    #[test]
    fn audio_and_video_export() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = ContainerMuxer::new(dir.path(), "device");
        let snapshot = Snapshot::new(
            Some(video_format()),
            Some(TrackFormat::audio(AudioCodec::Pcm16, 48_000, 1, Bytes::new())),
            vec![video(0, true), video(33_000, false), audio(10_000), audio(30_000)],
            Rotation::Deg0,
        );
        let artifact = muxer.export(snapshot, &ExportRequest::default(), |_| {}).unwrap();
        assert!(artifact.has_audio);

        let buf = std::fs::read(&artifact.path).unwrap();
        assert_eq!(buf.windows(4).filter(|w| w == b"trak").count(), 2);
        assert!(find_box(&buf, b"sowt").is_some());
    }

    #[test]
    fn missing_video_format_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = ContainerMuxer::new(dir.path(), "device");
        let snapshot = Snapshot::new(None, None, vec![video(0, true)], Rotation::Deg0);
        let result = muxer.export(snapshot, &ExportRequest::default(), |_| {});
        assert!(matches!(result, Err(ExportError::MissingVideoFormat)));
    }

    #[test]
    fn failed_export_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = ContainerMuxer::new(dir.path(), "device");
        // Codec config without PPS cannot describe the track
        let format = TrackFormat::video(
            VideoCodec::H264,
            320,
            240,
            Bytes::from_static(&[0, 0, 0, 1, 0x67, 0x42]),
        );
        let snapshot = Snapshot::new(Some(format), None, vec![video(0, true)], Rotation::Deg0);
        let result = muxer.export(snapshot, &ExportRequest::default(), |_| {});

        assert!(matches!(result, Err(ExportError::Mux(_))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
