//! Error types for capture, recording and loop lifecycle.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a [`FrameSource`](crate::capture::FrameSource).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open capture device {device:?}: {source}")]
    Open {
        device: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported capture mode: {0}")]
    Unsupported(String),

    /// No frame this cycle; the capture loop retries.
    #[error("no frame available")]
    NoFrame,

    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    /// Failures the capture loop absorbs by retrying the next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::NoFrame | SourceError::Io(_))
    }
}

/// Errors reported to whoever starts or feeds a recording session.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("already recording to {0:?}")]
    AlreadyRecording(PathBuf),

    #[error("cannot record to {destination:?}: {reason}")]
    SinkUnavailable { destination: PathBuf, reason: String },

    #[error("encoder failed: {0}")]
    SinkFailed(String),

    #[error("capture loop is not running")]
    CaptureStopped,
}

/// Errors from the capture loop lifecycle.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("capture loop is already running")]
    AlreadyRunning,

    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Errors from multi-source orchestration, tagged with the failing source index.
#[derive(Debug, Error)]
pub enum RigError {
    #[error("source {index}: {source}")]
    Source {
        index: usize,
        #[source]
        source: SourceError,
    },

    #[error("source {index}: {source}")]
    Loop {
        index: usize,
        #[source]
        source: LoopError,
    },

    #[error("source {index}: {source}")]
    Record {
        index: usize,
        #[source]
        source: RecordError,
    },

    #[error("no source at index {0}")]
    NoSuchSource(usize),
}
