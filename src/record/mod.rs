//! Recording sink fed with real-time frames by the capture loop
//!
//! A session owns a bounded queue and a writer thread that drives an
//! [`Encoder`]. Writing blocks when the queue is full, so a slow encoder slows
//! capture down rather than losing frames.

pub mod ffmpeg;
pub mod file;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use tracing::{debug, error, info};

use crate::capture::StreamMode;
use crate::error::RecordError;
use crate::{EncoderKind, Frame, RecordingConfig};

pub use ffmpeg::FfmpegEncoderFactory;
pub use file::RawFileEncoderFactory;

/// Consumes frames of one recording session
pub trait Encoder: Send {
    fn write_frame(&mut self, frame: &Frame) -> io::Result<()>;

    /// Flush and close, waiting for any encoder process to exit.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Opens encoders bound to a destination
pub trait EncoderFactory: Send + Sync {
    /// File extension of the artifacts this factory produces.
    fn extension(&self) -> &str;

    fn open(&self, destination: &Path, mode: &StreamMode) -> Result<Box<dyn Encoder>, RecordError>;
}

/// Build the factory selected by configuration
pub fn encoder_factory(config: &RecordingConfig) -> Arc<dyn EncoderFactory> {
    match config.encoder {
        EncoderKind::Ffmpeg => Arc::new(FfmpegEncoderFactory::new(config)),
        EncoderKind::Raw => Arc::new(RawFileEncoderFactory),
    }
}

/// Outcome of a finished session
#[derive(Debug, Clone)]
pub struct RecordingSummary {
    pub destination: PathBuf,
    pub frames: u64,
    pub duration: Duration,
}

struct Session {
    destination: PathBuf,
    tx: Sender<Arc<Frame>>,
    writer: JoinHandle<io::Result<u64>>,
    queued: u64,
    started: Instant,
}

/// At most one active recording session, driven from the capture thread
pub struct RecordingSink {
    factory: Arc<dyn EncoderFactory>,
    queue_depth: usize,
    session: Option<Session>,
}

impl RecordingSink {
    pub fn new(factory: Arc<dyn EncoderFactory>, queue_depth: usize) -> Self {
        Self {
            factory,
            queue_depth: queue_depth.max(1),
            session: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn destination(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| s.destination.as_path())
    }

    /// Open an encoder for `destination` and begin accepting frames.
    ///
    /// The destination is created or overwritten. On failure no session exists.
    pub fn start(&mut self, destination: &Path, mode: &StreamMode) -> Result<(), RecordError> {
        if let Some(active) = self.destination() {
            return Err(RecordError::AlreadyRecording(active.to_path_buf()));
        }

        let parent = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        if !parent.is_dir() {
            return Err(RecordError::SinkUnavailable {
                destination: destination.to_path_buf(),
                reason: format!("directory {} does not exist", parent.display()),
            });
        }

        let encoder = self.factory.open(destination, mode)?;
        let (tx, rx) = flume::bounded(self.queue_depth);
        let writer = thread::Builder::new()
            .name("recording-writer".into())
            .spawn(move || drain(rx, encoder))
            .map_err(|e| RecordError::SinkUnavailable {
                destination: destination.to_path_buf(),
                reason: format!("failed to spawn writer: {e}"),
            })?;

        info!(
            "Recording {}x{}@{} {:?} to {}",
            mode.width,
            mode.height,
            mode.fps,
            mode.format,
            destination.display()
        );
        self.session = Some(Session {
            destination: destination.to_path_buf(),
            tx,
            writer,
            queued: 0,
            started: Instant::now(),
        });
        Ok(())
    }

    /// Queue a frame for the encoder. No-op without a session.
    ///
    /// Blocks while the queue is full. If the writer has died the session is
    /// torn down and the failure returned.
    pub fn write(&mut self, frame: &Arc<Frame>) -> Result<(), RecordError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if session.tx.send(Arc::clone(frame)).is_ok() {
            session.queued += 1;
            return Ok(());
        }

        let reason = match self.stop() {
            Err(e) => e.to_string(),
            Ok(_) => "writer exited".to_string(),
        };
        Err(RecordError::SinkFailed(reason))
    }

    /// Finish the session, waiting until every queued frame is written.
    /// Returns `Ok(None)` when nothing was recording.
    pub fn stop(&mut self) -> Result<Option<RecordingSummary>, RecordError> {
        let Some(session) = self.session.take() else {
            return Ok(None);
        };
        let Session {
            destination,
            tx,
            writer,
            queued,
            started,
        } = session;

        // Closing the queue lets the writer drain and finish
        drop(tx);
        let written = writer
            .join()
            .map_err(|_| RecordError::SinkFailed("writer thread panicked".into()))?
            .map_err(|e| {
                error!("Recording to {} failed: {}", destination.display(), e);
                RecordError::SinkFailed(e.to_string())
            })?;

        if written != queued {
            debug!("Queued {} frames but writer reported {}", queued, written);
        }
        let summary = RecordingSummary {
            destination,
            frames: written,
            duration: started.elapsed(),
        };
        info!(
            "Recording finished: {} frames in {:.1}s to {}",
            summary.frames,
            summary.duration.as_secs_f64(),
            summary.destination.display()
        );
        Ok(Some(summary))
    }
}

impl Drop for RecordingSink {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn drain(rx: Receiver<Arc<Frame>>, mut encoder: Box<dyn Encoder>) -> io::Result<u64> {
    let mut written = 0;
    for frame in rx.iter() {
        encoder.write_frame(&frame)?;
        written += 1;
    }
    encoder.finish()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameMetadata, PixelFormat};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    const MODE: StreamMode = StreamMode {
        width: 2,
        height: 1,
        fps: 30,
        format: PixelFormat::Rgb24,
    };

    fn frame(sequence: u64) -> Arc<Frame> {
        Arc::new(Frame::new(
            Bytes::from(vec![sequence as u8; 6]),
            FrameMetadata {
                sequence,
                width: 2,
                height: 1,
                stride: 6,
                format: PixelFormat::Rgb24,
                device_timestamp: None,
            },
        ))
    }

    fn raw_sink() -> RecordingSink {
        RecordingSink::new(Arc::new(RawFileEncoderFactory), 2)
    }

    #[test]
    fn records_every_frame_before_stop_returns() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("clip.raw");
        let mut sink = raw_sink();

        sink.start(&dest, &MODE).unwrap();
        assert!(sink.is_active());
        assert_eq!(sink.destination(), Some(dest.as_path()));
        for seq in 0..50 {
            sink.write(&frame(seq)).unwrap();
        }
        let summary = sink.stop().unwrap().unwrap();

        assert!(!sink.is_active());
        assert_eq!(summary.frames, 50);
        let bytes = std::fs::read(&dest).unwrap();
        assert_eq!(bytes.len(), 50 * 6);
        assert_eq!(&bytes[6 * 49..], &[49u8; 6]);
    }

    #[test]
    fn second_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = raw_sink();
        sink.start(&dir.path().join("a.raw"), &MODE).unwrap();

        let err = sink.start(&dir.path().join("b.raw"), &MODE).unwrap_err();
        assert!(matches!(err, RecordError::AlreadyRecording(p) if p.ends_with("a.raw")));
        assert!(!dir.path().join("b.raw").exists());
        sink.stop().unwrap();
    }

    #[test]
    fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = raw_sink();
        assert!(sink.stop().unwrap().is_none());

        sink.start(&dir.path().join("a.raw"), &MODE).unwrap();
        sink.write(&frame(1)).unwrap();
        assert!(sink.stop().unwrap().is_some());
        assert!(sink.stop().unwrap().is_none());
    }

    #[test]
    fn write_without_session_is_noop() {
        let mut sink = raw_sink();
        sink.write(&frame(1)).unwrap();
        assert!(!sink.is_active());
    }

    #[test]
    fn missing_directory_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nope").join("clip.raw");
        let mut sink = raw_sink();

        let err = sink.start(&dest, &MODE).unwrap_err();
        assert!(matches!(err, RecordError::SinkUnavailable { .. }));
        assert!(!sink.is_active());

        // A valid destination still works afterwards
        sink.start(&dir.path().join("ok.raw"), &MODE).unwrap();
        sink.stop().unwrap();
    }

    struct FailingEncoder {
        writes_left: usize,
        finished: Arc<AtomicBool>,
    }

    impl Encoder for FailingEncoder {
        fn write_frame(&mut self, _frame: &Frame) -> io::Result<()> {
            if self.writes_left == 0 {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "encoder died"));
            }
            self.writes_left -= 1;
            Ok(())
        }

        fn finish(self: Box<Self>) -> io::Result<()> {
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingFactory {
        finished: Arc<AtomicBool>,
        opened: Mutex<Vec<PathBuf>>,
    }

    impl EncoderFactory for FailingFactory {
        fn extension(&self) -> &str {
            "bin"
        }

        fn open(&self, destination: &Path, _mode: &StreamMode) -> Result<Box<dyn Encoder>, RecordError> {
            self.opened.lock().unwrap().push(destination.to_path_buf());
            Ok(Box::new(FailingEncoder {
                writes_left: 2,
                finished: Arc::clone(&self.finished),
            }))
        }
    }

    #[test]
    fn dead_writer_ends_session() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FailingFactory {
            finished: Arc::new(AtomicBool::new(false)),
            opened: Mutex::new(Vec::new()),
        });
        let mut sink = RecordingSink::new(factory.clone(), 1);
        sink.start(&dir.path().join("x.bin"), &MODE).unwrap();

        let mut failure = None;
        for seq in 0..100 {
            if let Err(e) = sink.write(&frame(seq)) {
                failure = Some(e);
                break;
            }
        }

        assert!(matches!(failure, Some(RecordError::SinkFailed(_))));
        assert!(!sink.is_active());
        assert!(!factory.finished.load(Ordering::SeqCst));
        assert_eq!(factory.opened.lock().unwrap().len(), 1);
        assert!(sink.stop().unwrap().is_none());
    }
}
