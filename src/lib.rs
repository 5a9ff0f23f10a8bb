pub mod capture;
pub mod error;
pub mod pipeline;
pub mod record;
pub mod rig;
pub mod utils;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use capture::{Frame, FrameSource, PixelFormat, StreamMode};
pub use error::{LoopError, RecordError, RigError, SourceError};
pub use pipeline::{CaptureLoop, LoopOptions, LoopState, StreamHandle};
pub use record::{RecordingSink, RecordingSummary};
pub use rig::Rig;

/// Prefix for environment overrides, e.g. `DELAYCAM__BUFFER__MAX_AGE_SECS=30`
pub const ENV_PREFIX: &str = "DELAYCAM";

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sources: Vec<SourceConfig>,
    pub buffer: BufferConfig,
    pub recording: RecordingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub name: String,
    /// `/dev/videoN`, a bare index, `auto` or `synthetic`
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    pub pin_core: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub initial_delay_secs: f64,
    pub max_age_secs: f64,
    pub miss_sleep_ms: u64,
    pub miss_warn_every: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    Ffmpeg,
    Raw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub encoder: EncoderKind,
    pub ffmpeg_path: PathBuf,
    pub codec: String,
    pub preset: String,
    pub crf: u32,
    pub container: String,
    pub output_dir: PathBuf,
    /// Frames queued between the capture thread and the encoder
    pub queue_depth: usize,
    pub autostart: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: vec![SourceConfig::default()],
            buffer: BufferConfig::default(),
            recording: RecordingConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            name: "camera0".into(),
            device: "/dev/video0".into(),
            width: 1920,
            height: 1080,
            fps: 30,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
            pin_core: None,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 0.0,
            max_age_secs: 45.0,
            miss_sleep_ms: 1,
            miss_warn_every: 500,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            encoder: EncoderKind::Ffmpeg,
            ffmpeg_path: "ffmpeg".into(),
            codec: "libx264".into(),
            preset: "veryfast".into(),
            crf: 18,
            container: "avi".into(),
            output_dir: std::env::temp_dir(),
            queue_depth: 4,
            autostart: false,
        }
    }
}

impl Config {
    /// Load from an optional TOML file layered under `DELAYCAM__*` environment
    /// variables. Missing keys fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}
