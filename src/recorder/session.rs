//! Capture session
//!
//! Owns the ring buffer, the orientation inputs and the two producer
//! threads. Every start builds fresh encoders and empties the buffer, so
//! frames from different encoder configurations never end up in one clip.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::state::{ReplayEvent, RestartReason, SessionInfo, SessionState};
use crate::buffer::RingBuffer;
use crate::capture::{
    AudioProducer, CaptureError, MediaClock, OrientationState, SourceFactory, VideoProducer,
};
use crate::config::CaptureConfig;
use crate::utils::{AppError, AppResult};

/// Manages one capture session at a time
pub struct CaptureSession {
    /// Current session state
    state: Arc<RwLock<SessionState>>,

    buffer: Arc<RingBuffer>,
    orientation: Arc<OrientationState>,
    factory: Box<dyn SourceFactory>,

    video: Option<VideoProducer>,
    audio: Option<AudioProducer>,

    /// Finished and current sessions
    sessions: Vec<SessionInfo>,

    poll_timeout: Duration,
    restart_on_screen_change: bool,
    screen_on: bool,

    /// Event broadcaster
    event_tx: broadcast::Sender<ReplayEvent>,
}

impl CaptureSession {
    pub fn new(config: &CaptureConfig, retention: Duration, factory: Box<dyn SourceFactory>) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            state: Arc::new(RwLock::new(SessionState::Idle)),
            buffer: Arc::new(RingBuffer::new(retention)),
            orientation: Arc::new(OrientationState::new(
                config.sensor_orientation,
                config.device_rotation,
                config.lens_facing,
            )),
            factory,
            video: None,
            audio: None,
            sessions: Vec::new(),
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            restart_on_screen_change: config.restart_on_screen_change,
            screen_on: true,
            event_tx,
        }
    }

    /// Get the current session state
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn buffer(&self) -> Arc<RingBuffer> {
        self.buffer.clone()
    }

    pub fn orientation(&self) -> Arc<OrientationState> {
        self.orientation.clone()
    }

    /// Sender shared with the export trigger and completion sink
    pub fn events(&self) -> broadcast::Sender<ReplayEvent> {
        self.event_tx.clone()
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<ReplayEvent> {
        self.event_tx.subscribe()
    }

    pub fn current(&self) -> Option<&SessionInfo> {
        self.sessions.last().filter(|_| self.state().is_active())
    }

    pub fn sessions(&self) -> &[SessionInfo] {
        &self.sessions
    }

    /// Start producers on a freshly reset buffer.
    ///
    /// A video failure aborts the start. An audio failure is logged and the
    /// session runs video-only.
    pub fn start(&mut self) -> AppResult<SessionInfo> {
        if self.state().is_active() {
            return Err(CaptureError::AlreadyRunning.into());
        }

        self.buffer.reset();
        let rotation = self.orientation.rotation();
        self.buffer.set_rotation(rotation);

        let clock = MediaClock::new();
        let encoder = self.factory.video_encoder(&clock)?;
        let video = VideoProducer::start(encoder, self.buffer.clone(), self.poll_timeout)?;

        let mut audio_failed = false;
        let audio = match self.factory.audio_pipeline(&clock) {
            Ok(Some((source, encoder))) => {
                match AudioProducer::start(source, encoder, clock, self.buffer.clone(), self.poll_timeout) {
                    Ok(producer) => Some(producer),
                    Err(e) => {
                        audio_failed = true;
                        self.audio_unavailable(e);
                        None
                    }
                }
            }
            Ok(None) => {
                tracing::info!("Audio capture disabled");
                None
            }
            Err(e) => {
                audio_failed = true;
                self.audio_unavailable(e);
                None
            }
        };

        let info = SessionInfo::new(self.sessions.len(), rotation.degrees(), audio.is_some());
        self.video = Some(video);
        self.audio = audio;
        self.sessions.push(info.clone());

        *self.state.write() = if audio_failed {
            SessionState::Degraded
        } else {
            SessionState::Running
        };
        let _ = self.event_tx.send(ReplayEvent::SessionStarted {
            index: info.index,
            has_audio: info.has_audio,
        });

        tracing::info!(
            "Capture session {} started (rotation {}, audio {})",
            info.index,
            info.rotation_degrees,
            info.has_audio
        );
        Ok(info)
    }

    fn audio_unavailable(&self, error: CaptureError) {
        tracing::warn!("Audio unavailable, continuing video-only: {}", error);
        let _ = self.event_tx.send(ReplayEvent::AudioUnavailable {
            message: error.to_string(),
        });
    }

    /// Stop both producers, release their encoders and empty the buffer.
    ///
    /// Exports already holding a snapshot are unaffected.
    pub fn stop(&mut self) -> AppResult<SessionInfo> {
        if !self.state().is_active() {
            return Err(AppError::Session("no capture session running".into()));
        }

        tracing::info!("Stopping capture session");
        if let Some(video) = self.video.take() {
            video.stop();
        }
        if let Some(audio) = self.audio.take() {
            audio.stop();
        }
        self.buffer.reset();

        let info = match self.sessions.last_mut() {
            Some(info) => {
                info.end();
                info.clone()
            }
            None => return Err(AppError::Session("session history is empty".into())),
        };

        *self.state.write() = SessionState::Idle;
        let _ = self.event_tx.send(ReplayEvent::SessionStopped { index: info.index });

        tracing::info!(
            "Capture session {} stopped after {}ms",
            info.index,
            info.duration_ms().unwrap_or(0)
        );
        Ok(info)
    }

    /// Tear the session down and start a new one.
    pub fn restart(&mut self, reason: RestartReason) -> AppResult<SessionInfo> {
        self.restart_with(reason, |_| {})
    }

    /// Stop, apply `between` while no producer runs, then start again.
    fn restart_with<F>(&mut self, reason: RestartReason, between: F) -> AppResult<SessionInfo>
    where
        F: FnOnce(&Self),
    {
        tracing::info!("Restarting capture session: {:?}", reason);
        if self.state().is_active() {
            self.stop()?;
        }
        between(&*self);
        let info = self.start()?;
        let _ = self.event_tx.send(ReplayEvent::SessionRestarted { reason });
        Ok(info)
    }

    /// Record a device rotation. Restarts the session if the clip rotation
    /// changes while capturing; returns whether it did.
    ///
    /// The new rotation only becomes visible once the old producers have
    /// been joined and the buffer cleared.
    pub fn set_device_rotation(&mut self, degrees: i32) -> AppResult<bool> {
        let changed = self.orientation.rotation_for_device(degrees) != self.orientation.rotation();
        if !changed || !self.state().is_active() {
            self.orientation.set_device_rotation(degrees);
            if changed {
                tracing::debug!("Rotation changed to {} while idle", degrees);
            }
            return Ok(false);
        }
        self.restart_with(RestartReason::Orientation, |session| {
            session.orientation.set_device_rotation(degrees);
        })?;
        Ok(true)
    }

    /// Record a screen on/off transition. Restarts the session when the
    /// screen policy asks for it; returns whether it did.
    pub fn set_screen_on(&mut self, on: bool) -> AppResult<bool> {
        if self.screen_on == on {
            return Ok(false);
        }
        self.screen_on = on;
        if !self.restart_on_screen_change || !self.state().is_active() {
            return Ok(false);
        }
        self.restart(RestartReason::ScreenPolicy)?;
        Ok(true)
    }

    /// Periodic health check. Restarts the session when an encoder changed
    /// its stream parameters mid-session; returns whether it did.
    pub fn poll(&mut self) -> AppResult<bool> {
        if !self.state().is_active() {
            return Ok(false);
        }
        if self.video.as_ref().is_some_and(|v| !v.is_running()) {
            tracing::warn!("Video producer is no longer running");
        }
        if !self.buffer.take_format_change() {
            return Ok(false);
        }
        self.restart(RestartReason::FormatChange)?;
        Ok(true)
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if self.state().is_active() {
            if let Err(e) = self.stop() {
                tracing::error!("Failed to stop capture session: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{
        AudioEncoder, CaptureResult, Encoder, EncoderOutput, FrameFlags, LensFacing, PcmFormat,
        PcmSource, Rotation, TrackKind,
    };
    use crate::capture::synthetic::{PcmPassthroughEncoder, SilenceSource, TestPatternEncoder};
    use crate::capture::VideoCodec;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestSources {
        audio: bool,
        /// Number of audio pipelines that fail to build
        audio_failures: AtomicUsize,
        builds: Arc<AtomicUsize>,
        /// Orientation read back whenever a video encoder is released
        watched: Arc<Mutex<Option<Arc<OrientationState>>>>,
        released_at: Arc<Mutex<Vec<Rotation>>>,
    }

    /// Reports the live rotation at the moment it is released
    struct WatchedEncoder {
        inner: TestPatternEncoder,
        watched: Arc<Mutex<Option<Arc<OrientationState>>>>,
        released_at: Arc<Mutex<Vec<Rotation>>>,
    }

    impl Encoder for WatchedEncoder {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn start(&mut self) -> CaptureResult<()> {
            self.inner.start()
        }

        fn poll_output(&mut self, timeout: Duration) -> CaptureResult<Option<EncoderOutput<'_>>> {
            self.inner.poll_output(timeout)
        }

        fn stop(&mut self) {
            if let Some(orientation) = self.watched.lock().as_ref() {
                self.released_at.lock().push(orientation.rotation());
            }
            self.inner.stop();
        }
    }

    impl TestSources {
        fn new(audio: bool) -> Self {
            Self {
                audio,
                audio_failures: AtomicUsize::new(0),
                builds: Arc::new(AtomicUsize::new(0)),
                watched: Arc::new(Mutex::new(None)),
                released_at: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl SourceFactory for TestSources {
        fn video_encoder(&self, clock: &MediaClock) -> CaptureResult<Box<dyn Encoder>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(WatchedEncoder {
                inner: TestPatternEncoder::new(VideoCodec::H264, 320, 240, 30, 10, *clock),
                watched: self.watched.clone(),
                released_at: self.released_at.clone(),
            }))
        }

        fn audio_pipeline(
            &self,
            _clock: &MediaClock,
        ) -> CaptureResult<Option<(Box<dyn PcmSource>, Box<dyn AudioEncoder>)>> {
            if !self.audio {
                return Ok(None);
            }
            if self.audio_failures.load(Ordering::SeqCst) > 0 {
                self.audio_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(CaptureError::DeviceNotFound("mic0".into()));
            }
            let format = PcmFormat {
                sample_rate: 48_000,
                channels: 1,
                bytes_per_sample: 2,
            };
            Ok(Some((
                Box::new(SilenceSource::new(format, Duration::from_millis(20))),
                Box::new(PcmPassthroughEncoder::new(format)),
            )))
        }
    }

    fn config() -> CaptureConfig {
        CaptureConfig {
            poll_timeout_ms: 20,
            sensor_orientation: 90,
            lens_facing: LensFacing::Back,
            device_rotation: 0,
            restart_on_screen_change: true,
        }
    }

    fn session(sources: TestSources) -> CaptureSession {
        CaptureSession::new(&config(), Duration::from_secs(5), Box::new(sources))
    }

    fn wait_for_frames(buffer: &RingBuffer, kind: TrackKind) {
        for _ in 0..200 {
            if buffer.snapshot().count(kind) > 0 {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("no {} frames arrived", kind);
    }

    #[test]
    fn start_and_stop() {
        let mut session = session(TestSources::new(true));
        let mut events = session.subscribe();

        let info = session.start().unwrap();
        assert_eq!(info.rotation_degrees, 90);
        assert!(info.has_audio);
        assert_eq!(session.state(), SessionState::Running);

        let buffer = session.buffer();
        wait_for_frames(&buffer, TrackKind::Video);
        wait_for_frames(&buffer, TrackKind::Audio);
        assert!(buffer.format(TrackKind::Video).is_some());

        assert!(matches!(
            session.start(),
            Err(AppError::Capture(CaptureError::AlreadyRunning))
        ));

        session.stop().unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(buffer.is_empty());
        assert!(buffer.format(TrackKind::Video).is_none());
        assert!(session.stop().is_err());

        assert!(matches!(events.try_recv().unwrap(), ReplayEvent::SessionStarted { .. }));
        assert!(matches!(events.try_recv().unwrap(), ReplayEvent::SessionStopped { .. }));
    }

    #[test]
    fn audio_failure_degrades_to_video_only() {
        let sources = TestSources::new(true);
        sources.audio_failures.store(1, Ordering::SeqCst);
        let mut session = session(sources);

        let info = session.start().unwrap();
        assert!(!info.has_audio);
        assert_eq!(session.state(), SessionState::Degraded);
        wait_for_frames(&session.buffer(), TrackKind::Video);

        // Next session gets audio back
        let info = session.restart(RestartReason::FormatChange).unwrap();
        assert!(info.has_audio);
        assert_eq!(session.state(), SessionState::Running);
    }

    #[test]
    fn rotation_change_restarts_only_when_clip_rotation_changes() {
        let mut session = session(TestSources::new(false));
        session.start().unwrap();

        // 360 is the same rotation as 0
        assert!(!session.set_device_rotation(360).unwrap());
        assert_eq!(session.sessions().len(), 1);

        assert!(session.set_device_rotation(90).unwrap());
        assert_eq!(session.sessions().len(), 2);
        assert_eq!(session.current().unwrap().rotation_degrees, 0);
        assert_eq!(session.buffer().rotation().degrees(), 0);
    }

    #[test]
    fn screen_policy_restarts_once_per_transition() {
        let mut session = session(TestSources::new(false));
        session.start().unwrap();

        assert!(!session.set_screen_on(true).unwrap());
        assert!(session.set_screen_on(false).unwrap());
        assert!(!session.set_screen_on(false).unwrap());
        assert_eq!(session.sessions().len(), 2);
    }

    #[test]
    fn restart_builds_fresh_encoders_and_buffer() {
        let sources = TestSources::new(false);
        let builds = sources.builds.clone();
        let mut session = session(sources);
        session.start().unwrap();
        let buffer = session.buffer();
        wait_for_frames(&buffer, TrackKind::Video);
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        // Audio is disabled, so this frame can only come from before the restart
        buffer.add_frame(&[0xEE; 7], 0, FrameFlags::empty(), TrackKind::Audio);

        session.restart(RestartReason::Orientation).unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);

        wait_for_frames(&buffer, TrackKind::Video);
        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.count(TrackKind::Audio), 0);
        assert!(snapshot.frames()[0].is_video_keyframe());
        assert!(buffer.format(TrackKind::Video).is_some());
        assert!(session.sessions()[0].unix_end_ms.is_some());
        assert!(session.sessions()[1].unix_end_ms.is_none());
    }

    #[test]
    fn new_rotation_is_applied_only_after_old_producers_stop() {
        let sources = TestSources::new(false);
        let watched = sources.watched.clone();
        let released_at = sources.released_at.clone();
        let mut session = session(sources);
        *watched.lock() = Some(session.orientation());

        session.start().unwrap();
        assert_eq!(session.buffer().rotation(), Rotation::Deg90);
        assert!(session.set_device_rotation(90).unwrap());

        // The first encoder was released while the old rotation was live
        assert_eq!(*released_at.lock(), vec![Rotation::Deg90]);
        assert_eq!(session.orientation().rotation(), Rotation::Deg0);
        assert_eq!(session.buffer().rotation(), Rotation::Deg0);

        // While idle the inputs update without a restart
        session.stop().unwrap();
        assert!(!session.set_device_rotation(0).unwrap());
        assert_eq!(session.orientation().rotation(), Rotation::Deg90);
        assert_eq!(session.sessions().len(), 2);
    }

    #[test]
    fn poll_restarts_on_format_change() {
        let mut session = session(TestSources::new(false));
        session.start().unwrap();
        assert!(!session.poll().unwrap());

        // Another encoder reporting different parameters
        let buffer = session.buffer();
        buffer.set_format(crate::capture::TrackFormat::video(
            VideoCodec::H264,
            1920,
            1080,
            bytes::Bytes::new(),
        ));
        assert!(session.poll().unwrap());
        assert_eq!(session.sessions().len(), 2);
    }
}
