//! Several capture loops driven together: one delay for all, record-all.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::{info, instrument, warn};

use crate::capture::{FrameSource, StreamMode, SyntheticSource, V4l2Source};
use crate::error::{RigError, SourceError};
use crate::pipeline::{CaptureLoop, LoopOptions, StreamHandle};
use crate::record::{encoder_factory, EncoderFactory, RecordingSummary};
use crate::utils::auto_detect_device;
use crate::{BufferConfig, Config, RecordingConfig, SourceConfig};

pub struct Rig {
    loops: Vec<CaptureLoop>,
    buffer: BufferConfig,
    recording: RecordingConfig,
    encoders: Arc<dyn EncoderFactory>,
}

/// Open the device described by `config`.
///
/// `synthetic` builds a test-pattern source, `auto` picks the first V4L2
/// device found, anything else is a V4L2 path or index.
pub fn open_source(config: &SourceConfig) -> Result<Box<dyn FrameSource>, SourceError> {
    match config.device.as_str() {
        "synthetic" => Ok(Box::new(SyntheticSource::new(
            config.name.clone(),
            config.width,
            config.height,
            config.fps,
        ))),
        "auto" => {
            let found = auto_detect_device().ok_or_else(|| SourceError::Open {
                device: config.device.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "no suitable capture device found"),
            })?;
            let resolved = SourceConfig {
                device: found.path,
                format: found.format,
                ..config.clone()
            };
            Ok(Box::new(V4l2Source::open(&resolved)?))
        }
        _ => Ok(Box::new(V4l2Source::open(config)?)),
    }
}

/// `record_<timestamp>_camera<index>.<ext>`
pub fn recording_file_name(started: DateTime<Local>, index: usize, extension: &str) -> String {
    format!(
        "record_{}_camera{}.{}",
        started.format("%Y%m%d_%H%M%S"),
        index,
        extension
    )
}

impl Rig {
    /// Open and start every configured source. If one fails, those already
    /// started are released and nothing keeps running.
    #[instrument(skip(config), fields(sources = config.sources.len()))]
    pub fn open(config: &Config) -> Result<Self, RigError> {
        let mut rig = Self::empty(&config.buffer, &config.recording);
        for (index, source_config) in config.sources.iter().enumerate() {
            let source =
                open_source(source_config).map_err(|source| RigError::Source { index, source })?;
            rig.push(source, source_config.pin_core)?;
        }
        Ok(rig)
    }

    /// Start loops on sources that were opened by the caller.
    pub fn from_sources(
        sources: Vec<Box<dyn FrameSource>>,
        buffer: &BufferConfig,
        recording: &RecordingConfig,
    ) -> Result<Self, RigError> {
        let mut rig = Self::empty(buffer, recording);
        for source in sources {
            rig.push(source, None)?;
        }
        Ok(rig)
    }

    fn empty(buffer: &BufferConfig, recording: &RecordingConfig) -> Self {
        Self {
            loops: Vec::new(),
            buffer: buffer.clone(),
            recording: recording.clone(),
            encoders: encoder_factory(recording),
        }
    }

    fn push(&mut self, source: Box<dyn FrameSource>, pin_core: Option<usize>) -> Result<(), RigError> {
        let index = self.loops.len();
        let options = LoopOptions::from_config(&self.buffer, &self.recording, pin_core);
        let mut capture = CaptureLoop::new(source.name().to_string(), options, Arc::clone(&self.encoders));
        capture
            .start(source)
            .map_err(|source| RigError::Loop { index, source })?;
        self.loops.push(capture);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn handle(&self, index: usize) -> Option<&StreamHandle> {
        self.loops.get(index).map(CaptureLoop::handle)
    }

    pub fn handles(&self) -> impl Iterator<Item = &StreamHandle> + '_ {
        self.loops.iter().map(CaptureLoop::handle)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.loops.iter().map(CaptureLoop::name)
    }

    /// Mode negotiated by source `index` when its loop last started.
    pub fn mode(&self, index: usize) -> Option<StreamMode> {
        self.loops.get(index).and_then(CaptureLoop::mode)
    }

    /// Apply one delay to every source; returns the clamped value.
    pub fn set_delay(&self, delay: Duration) -> Duration {
        self.handles()
            .map(|h| h.set_delay(delay))
            .min()
            .unwrap_or(Duration::ZERO)
    }

    pub fn set_delay_secs(&self, seconds: f64) -> Duration {
        self.handles()
            .map(|h| h.set_delay_secs(seconds))
            .min()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_recording(&self) -> bool {
        self.handles().any(StreamHandle::is_recording)
    }

    /// Record every source into `dir`, one file per source with a shared timestamp.
    ///
    /// All or nothing: on failure the sessions started by this call are stopped.
    pub fn start_recording(&self, dir: &Path) -> Result<Vec<PathBuf>, RigError> {
        let started = Local::now();
        let mut paths = Vec::with_capacity(self.loops.len());

        for (index, handle) in self.handles().enumerate() {
            let path = dir.join(recording_file_name(started, index, self.encoders.extension()));
            if let Err(source) = handle.start_recording(&path) {
                for earlier in self.handles().take(index) {
                    if let Err(e) = earlier.stop_recording() {
                        warn!("Rolling back recording failed: {}", e);
                    }
                }
                return Err(RigError::Record { index, source });
            }
            paths.push(path);
        }

        info!("Recording {} sources into {}", paths.len(), dir.display());
        Ok(paths)
    }

    /// Stop every session. All sources are stopped even if one fails; the
    /// first failure is returned.
    pub fn stop_recording(&self) -> Result<Vec<RecordingSummary>, RigError> {
        let mut summaries = Vec::new();
        let mut first_error = None;

        for (index, handle) in self.handles().enumerate() {
            match handle.stop_recording() {
                Ok(Some(summary)) => summaries.push(summary),
                Ok(None) => {}
                Err(source) => {
                    warn!("Stopping recording on source {} failed: {}", index, source);
                    first_error.get_or_insert(RigError::Record { index, source });
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(summaries),
        }
    }

    /// Start recording into the configured output directory, or stop if
    /// already recording. Returns whether recording is now on.
    pub fn toggle_recording(&self) -> Result<bool, RigError> {
        if self.is_recording() {
            self.stop_recording()?;
            Ok(false)
        } else {
            self.start_recording(&self.recording.output_dir)?;
            Ok(true)
        }
    }

    /// Swap the device behind source `index`, keeping its delay settings.
    pub fn replace_source(&mut self, index: usize, source: Box<dyn FrameSource>) -> Result<(), RigError> {
        let capture = self
            .loops
            .get_mut(index)
            .ok_or(RigError::NoSuchSource(index))?;
        capture.release();
        capture
            .start(source)
            .map_err(|source| RigError::Loop { index, source })
    }

    /// Stop all loops; recordings are flushed before their sources close.
    pub fn release(&mut self) {
        for capture in &mut self.loops {
            capture.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn file_names_carry_time_and_index() {
        let started = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            recording_file_name(started, 1, "avi"),
            "record_20240309_140507_camera1.avi"
        );
    }

    #[test]
    fn synthetic_device_needs_no_hardware() {
        let config = SourceConfig {
            name: "fake".into(),
            device: "synthetic".into(),
            width: 8,
            height: 4,
            ..SourceConfig::default()
        };
        let source = open_source(&config).unwrap();
        assert_eq!(source.name(), "fake");
        assert_eq!((source.mode().width, source.mode().height), (8, 4));
    }
}
