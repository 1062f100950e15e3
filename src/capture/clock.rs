//! Presentation clock shared by the video and audio tracks
//!
//! Both producers stamp frames in one monotonic microsecond domain. Video
//! encoders read [`MediaClock`] directly; raw PCM has no timestamps, so the
//! audio producer derives them with a [`PtsAccumulator`].

use std::time::Instant;

use super::traits::PcmFormat;

/// Monotonic microsecond clock anchored at session start.
#[derive(Debug, Clone, Copy)]
pub struct MediaClock {
    origin: Instant,
}

impl MediaClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Microseconds elapsed since the clock was created
    pub fn now_us(&self) -> i64 {
        self.origin.elapsed().as_micros() as i64
    }
}

impl Default for MediaClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Running presentation-time accumulator for PCM chunks.
///
/// The first chunk is anchored to the media clock; every later chunk starts
/// exactly where the previous one ended, at
/// `bytes * 1_000_000 / (sample_rate * channels * bytes_per_sample)`.
/// The offset is recomputed from the cumulative byte count so integer
/// truncation never accumulates.
#[derive(Debug, Clone)]
pub struct PtsAccumulator {
    bytes_per_second: u64,
    base_us: Option<i64>,
    total_bytes: u64,
}

impl PtsAccumulator {
    pub fn new(format: PcmFormat) -> Self {
        Self {
            bytes_per_second: format.bytes_per_second().max(1),
            base_us: None,
            total_bytes: 0,
        }
    }

    /// Timestamp of a chunk of `len` bytes, then advance past it.
    ///
    /// `now_us` is only consulted for the very first chunk.
    pub fn next_pts(&mut self, len: usize, now_us: i64) -> i64 {
        let base = *self.base_us.get_or_insert(now_us);
        let pts = base + self.offset_us(self.total_bytes);
        self.total_bytes += len as u64;
        pts
    }

    /// Timestamp the next chunk will receive
    pub fn peek_pts(&self) -> Option<i64> {
        self.base_us.map(|base| base + self.offset_us(self.total_bytes))
    }

    /// Duration covered by `bytes` of PCM
    pub fn duration_us(&self, bytes: u64) -> i64 {
        self.offset_us(bytes)
    }

    pub fn reset(&mut self) {
        self.base_us = None;
        self.total_bytes = 0;
    }

    fn offset_us(&self, bytes: u64) -> i64 {
        (bytes as u128 * 1_000_000 / self.bytes_per_second as u128) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono_16bit_48k() -> PcmFormat {
        PcmFormat {
            sample_rate: 48_000,
            channels: 1,
            bytes_per_sample: 2,
        }
    }

    #[test]
    fn first_chunk_anchors_to_clock() {
        let mut acc = PtsAccumulator::new(mono_16bit_48k());
        assert_eq!(acc.peek_pts(), None);
        assert_eq!(acc.next_pts(1920, 5_000), 5_000);
        // 1920 bytes of 16-bit mono at 48 kHz is 20 ms
        assert_eq!(acc.peek_pts(), Some(25_000));
    }

    #[test]
    fn later_chunks_ignore_wall_clock() {
        let mut acc = PtsAccumulator::new(mono_16bit_48k());
        acc.next_pts(1920, 1_000);
        let second = acc.next_pts(1920, 999_999);
        assert_eq!(second, 21_000);
    }

    #[test]
    fn no_truncation_drift() {
        // 44.1 kHz stereo: 441 bytes is not a whole number of microseconds
        let format = PcmFormat {
            sample_rate: 44_100,
            channels: 2,
            bytes_per_sample: 2,
        };
        let mut acc = PtsAccumulator::new(format);
        for _ in 0..1000 {
            acc.next_pts(441, 0);
        }
        // 441_000 bytes at 176_400 B/s = 2.5 s exactly
        assert_eq!(acc.peek_pts(), Some(2_500_000));
    }

    #[test]
    fn reset_reanchors() {
        let mut acc = PtsAccumulator::new(mono_16bit_48k());
        acc.next_pts(960, 0);
        acc.reset();
        assert_eq!(acc.next_pts(960, 7), 7);
    }

    #[test]
    fn media_clock_is_monotonic() {
        let clock = MediaClock::new();
        let a = clock.now_us();
        let b = clock.now_us();
        assert!(b >= a);
    }
}
