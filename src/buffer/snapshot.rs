//! Point-in-time copy of the ring buffer taken for export

use crate::capture::{Frame, Rotation, TrackFormat, TrackKind};

/// An atomic, independent copy of buffer contents.
///
/// Owned solely by the export that took it. Frames keep the ring buffer's
/// insertion order; cross-track ordering is the muxer's job.
#[derive(Debug, Clone)]
pub struct Snapshot {
    video_format: Option<TrackFormat>,
    audio_format: Option<TrackFormat>,
    frames: Vec<Frame>,
    rotation: Rotation,
}

impl Snapshot {
    pub fn new(
        video_format: Option<TrackFormat>,
        audio_format: Option<TrackFormat>,
        frames: Vec<Frame>,
        rotation: Rotation,
    ) -> Self {
        Self {
            video_format,
            audio_format,
            frames,
            rotation,
        }
    }

    pub fn video_format(&self) -> Option<&TrackFormat> {
        self.video_format.as_ref()
    }

    pub fn audio_format(&self) -> Option<&TrackFormat> {
        self.audio_format.as_ref()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn count(&self, kind: TrackKind) -> usize {
        self.frames.iter().filter(|f| f.kind == kind).count()
    }

    pub fn has_audio_frames(&self) -> bool {
        self.frames.iter().any(|f| f.kind == TrackKind::Audio)
    }

    /// Distance between the earliest and latest timestamps, in microseconds
    pub fn span_us(&self) -> i64 {
        let min = self.frames.iter().map(|f| f.timestamp_us).min();
        let max = self.frames.iter().map(|f| f.timestamp_us).max();
        match (min, max) {
            (Some(min), Some(max)) => max - min,
            _ => 0,
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.frames.iter().map(Frame::len).sum()
    }

    /// Take ownership of the parts for muxing
    pub fn into_parts(self) -> (Option<TrackFormat>, Option<TrackFormat>, Vec<Frame>, Rotation) {
        (self.video_format, self.audio_format, self.frames, self.rotation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FrameFlags;

    #[test]
    fn span_uses_extremes_not_insertion_order() {
        let frames = vec![
            Frame::copy_from(TrackKind::Video, &[1], 80_000, FrameFlags::keyframe()),
            Frame::copy_from(TrackKind::Audio, &[2], 50_000, FrameFlags::empty()),
            Frame::copy_from(TrackKind::Video, &[3, 4], 113_000, FrameFlags::empty()),
        ];
        let snapshot = Snapshot::new(None, None, frames, Rotation::Deg0);
        assert_eq!(snapshot.span_us(), 63_000);
        assert_eq!(snapshot.count(TrackKind::Video), 2);
        assert!(snapshot.has_audio_frames());
        assert_eq!(snapshot.total_bytes(), 4);
    }

    #[test]
    fn empty_snapshot() {
        let snapshot = Snapshot::new(None, None, Vec::new(), Rotation::Deg90);
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.span_us(), 0);
        assert_eq!(snapshot.rotation(), Rotation::Deg90);
    }
}
