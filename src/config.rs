//! Configuration management
//!
//! Settings are resolved in three layers: built-in defaults, an optional
//! JSON file named by `REPLAY_CONFIG`, then individual `REPLAY_*`
//! environment variables (a `.env` file is honoured).

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::{LensFacing, VideoCodec};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("Failed to parse config file {0}: {1}")]
    Parse(PathBuf, serde_json::Error),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplayConfig {
    pub buffer: BufferConfig,
    pub export: ExportConfig,
    pub video: VideoConfig,
    pub audio: AudioConfig,
    pub capture: CaptureConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BufferConfig {
    /// Retention ceiling in seconds
    pub retention_secs: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { retention_secs: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExportConfig {
    /// Minimum spacing between accepted triggers
    pub debounce_ms: u64,
    /// Directory artifacts are written to
    pub output_dir: PathBuf,
    /// Prefix of every artifact name
    pub device_id: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 3000,
            output_dir: env::temp_dir().join("instant-replay"),
            device_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Where video frames come from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VideoSourceKind {
    /// Generated test pattern
    #[default]
    TestPattern,
    /// Pre-encoded Annex-B H.264 file
    AnnexBFile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoConfig {
    pub source: VideoSourceKind,
    pub h264_file: Option<PathBuf>,
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Frames between keyframes
    pub keyframe_interval: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            source: VideoSourceKind::TestPattern,
            h264_file: None,
            codec: VideoCodec::H264,
            width: 1280,
            height: 720,
            fps: 30,
            keyframe_interval: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AudioConfig {
    pub enabled: bool,
    pub sample_rate: u32,
    pub channels: u16,
    pub bytes_per_sample: u16,
    /// Duration of one PCM chunk
    pub chunk_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 48_000,
            channels: 1,
            bytes_per_sample: 2,
            chunk_ms: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureConfig {
    /// Encoder poll timeout; bounds how long a stop can take
    pub poll_timeout_ms: u64,
    /// Camera sensor mounting angle
    pub sensor_orientation: i32,
    pub lens_facing: LensFacing,
    /// Device rotation at startup
    pub device_rotation: i32,
    /// Restart the session when the screen turns on or off
    pub restart_on_screen_change: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 100,
            sensor_orientation: 0,
            lens_facing: LensFacing::Back,
            device_rotation: 0,
            restart_on_screen_change: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadConfig {
    /// Directory the local transport delivers artifacts to
    pub outbox_dir: PathBuf,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            outbox_dir: env::temp_dir().join("instant-replay").join("outbox"),
        }
    }
}

impl ReplayConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolve configuration using `lookup` for variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|s| !s.trim().is_empty());

        let mut config = match lookup("REPLAY_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };

        if let Some(value) = lookup("REPLAY_RETENTION_SECS") {
            config.buffer.retention_secs = parse_var("REPLAY_RETENTION_SECS", &value)?;
        }
        if let Some(value) = lookup("REPLAY_DEBOUNCE_MS") {
            config.export.debounce_ms = parse_var("REPLAY_DEBOUNCE_MS", &value)?;
        }
        if let Some(value) = lookup("REPLAY_OUTPUT_DIR") {
            config.export.output_dir = value.into();
        }
        if let Some(value) = lookup("REPLAY_OUTBOX_DIR") {
            config.upload.outbox_dir = value.into();
        }
        if let Some(value) = lookup("REPLAY_DEVICE_ID") {
            config.export.device_id = value;
        }
        if let Some(value) = lookup("REPLAY_H264_FILE") {
            config.video.source = VideoSourceKind::AnnexBFile;
            config.video.h264_file = Some(value.into());
        }
        if let Some(value) = lookup("REPLAY_AUDIO") {
            config.audio.enabled = parse_bool("REPLAY_AUDIO", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer.retention_secs == 0 {
            return Err(invalid("buffer.retentionSecs", "must be greater than zero"));
        }
        if self.video.fps == 0 {
            return Err(invalid("video.fps", "must be greater than zero"));
        }
        if self.video.source == VideoSourceKind::AnnexBFile && self.video.h264_file.is_none() {
            return Err(invalid("video.h264File", "required for the annexBFile source"));
        }
        if self.audio.enabled {
            if self.audio.sample_rate == 0 {
                return Err(invalid("audio.sampleRate", "must be greater than zero"));
            }
            if self.audio.channels == 0 {
                return Err(invalid("audio.channels", "must be greater than zero"));
            }
            if ![1, 2, 4].contains(&self.audio.bytes_per_sample) {
                return Err(invalid("audio.bytesPerSample", "must be 1, 2 or 4"));
            }
        }
        if self.export.device_id.is_empty() {
            return Err(invalid("export.deviceId", "must not be empty"));
        }
        Ok(())
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.buffer.retention_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.export.debounce_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.capture.poll_timeout_ms.max(1))
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue(key.to_string(), reason.to_string())
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(key.to_string(), value.to_string()))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue(key.to_string(), value.to_string())),
    }
}
