//! Test-pattern source for running the pipeline without a camera

use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::source::{FrameSource, StreamMode};
use crate::error::SourceError;

/// Generates RGB24 frames whose pixels encode the frame sequence number,
/// paced to the requested frame rate.
pub struct SyntheticSource {
    name: String,
    mode: StreamMode,
    interval: Duration,
    next_due: Option<Instant>,
    sequence: u64,
    /// Every n-th capture reports `NoFrame` instead of a frame
    miss_every: Option<u64>,
    attempts: u64,
    closed: bool,
}

impl SyntheticSource {
    pub fn new(name: impl Into<String>, width: u32, height: u32, fps: u32) -> Self {
        let fps = fps.max(1);
        Self {
            name: name.into(),
            mode: StreamMode {
                width,
                height,
                fps,
                format: PixelFormat::Rgb24,
            },
            interval: Duration::from_secs(1) / fps,
            next_due: None,
            sequence: 0,
            miss_every: None,
            attempts: 0,
            closed: false,
        }
    }

    /// Simulate a flaky device that misses every `n`-th capture.
    pub fn with_misses(mut self, n: u64) -> Self {
        self.miss_every = (n > 0).then_some(n);
        self
    }

    fn pattern(&self, sequence: u64) -> Bytes {
        let size = self
            .mode
            .format
            .frame_size(self.mode.width, self.mode.height)
            .unwrap_or_default()
            .max(8);
        let mut data = vec![(sequence % 251) as u8; size];
        data[..8].copy_from_slice(&sequence.to_le_bytes());
        Bytes::from(data)
    }

    fn pace(&mut self) {
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            thread::sleep(due - now);
        }
        self.next_due = Some(due.max(now) + self.interval);
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> StreamMode {
        self.mode
    }

    fn capture(&mut self) -> Result<Frame, SourceError> {
        if self.closed {
            return Err(SourceError::NoFrame);
        }
        self.attempts += 1;
        if let Some(n) = self.miss_every {
            if self.attempts % n == 0 {
                return Err(SourceError::NoFrame);
            }
        }

        self.pace();
        self.sequence += 1;

        let meta = FrameMetadata {
            sequence: self.sequence,
            width: self.mode.width,
            height: self.mode.height,
            stride: self.mode.width * 3,
            format: self.mode.format,
            device_timestamp: None,
        };
        Ok(Frame::new(self.pattern(self.sequence), meta))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
