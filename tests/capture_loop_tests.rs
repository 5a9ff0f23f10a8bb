use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use delaycam::capture::{FrameMetadata, FrameSource, PixelFormat, StreamMode};
use delaycam::record::{Encoder, EncoderFactory};
use delaycam::{CaptureLoop, Frame, LoopOptions, LoopState, RecordError, SourceError};

type Events = Arc<Mutex<Vec<String>>>;

/// Source that logs its teardown and delivers frames every `interval`
struct ScriptedSource {
    events: Events,
    interval: Duration,
    sequence: u64,
}

impl FrameSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn mode(&self) -> StreamMode {
        StreamMode {
            width: 1,
            height: 1,
            fps: 100,
            format: PixelFormat::Rgb24,
        }
    }

    fn capture(&mut self) -> Result<Frame, SourceError> {
        thread::sleep(self.interval);
        self.sequence += 1;
        Ok(Frame::new(
            Bytes::from(vec![0; 3]),
            FrameMetadata {
                sequence: self.sequence,
                width: 1,
                height: 1,
                stride: 3,
                format: PixelFormat::Rgb24,
                device_timestamp: None,
            },
        ))
    }

    fn close(&mut self) {
        self.events.lock().unwrap().push("source closed".into());
    }
}

/// Encoder that is deliberately slower than capture
struct SlowEncoder {
    events: Events,
    written: Arc<Mutex<Vec<u64>>>,
}

impl Encoder for SlowEncoder {
    fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        thread::sleep(Duration::from_millis(4));
        self.written.lock().unwrap().push(frame.sequence());
        Ok(())
    }

    fn finish(self: Box<Self>) -> io::Result<()> {
        self.events.lock().unwrap().push("encoder finished".into());
        Ok(())
    }
}

struct SlowFactory {
    events: Events,
    written: Arc<Mutex<Vec<u64>>>,
}

impl EncoderFactory for SlowFactory {
    fn extension(&self) -> &str {
        "slow"
    }

    fn open(&self, _destination: &Path, _mode: &StreamMode) -> Result<Box<dyn Encoder>, RecordError> {
        self.events.lock().unwrap().push("encoder opened".into());
        Ok(Box::new(SlowEncoder {
            events: Arc::clone(&self.events),
            written: Arc::clone(&self.written),
        }))
    }
}

/// Device that has stopped delivering: every call waits out its poll
/// timeout and reports a miss
struct StalledSource {
    events: Events,
}

impl FrameSource for StalledSource {
    fn name(&self) -> &str {
        "stalled"
    }

    fn mode(&self) -> StreamMode {
        StreamMode {
            width: 1,
            height: 1,
            fps: 30,
            format: PixelFormat::Rgb24,
        }
    }

    fn capture(&mut self) -> Result<Frame, SourceError> {
        thread::sleep(Duration::from_millis(20));
        Err(SourceError::NoFrame)
    }

    fn close(&mut self) {
        self.events.lock().unwrap().push("source closed".into());
    }
}

fn options() -> LoopOptions {
    LoopOptions {
        queue_depth: 1,
        ..LoopOptions::default()
    }
}

#[test]
fn slow_encoder_loses_no_frames_and_finishes_before_source_closes() {
    let dir = tempfile::tempdir().unwrap();
    let events: Events = Arc::default();
    let written = Arc::new(Mutex::new(Vec::new()));
    let factory = Arc::new(SlowFactory {
        events: Arc::clone(&events),
        written: Arc::clone(&written),
    });

    let mut capture = CaptureLoop::new("slow", options(), factory);
    capture
        .start(ScriptedSource {
            events: Arc::clone(&events),
            interval: Duration::from_millis(1),
            sequence: 0,
        })
        .unwrap();
    let handle = capture.handle().clone();

    handle.start_recording(dir.path().join("clip.slow")).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.stats().frames_recorded < 20 {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(2));
    }
    capture.release();

    let recorded = handle.stats().frames_recorded;
    let written = written.lock().unwrap().clone();
    assert_eq!(written.len() as u64, recorded);
    // Consecutive real-time frames, none dropped
    assert!(written.windows(2).all(|w| w[1] == w[0] + 1));

    assert_eq!(
        *events.lock().unwrap(),
        vec!["encoder opened", "encoder finished", "source closed"]
    );
    assert_eq!(capture.state(), LoopState::Stopped);
}

#[test]
fn delayed_frame_lags_by_requested_delay() {
    let events: Events = Arc::default();
    let mut capture = CaptureLoop::new(
        "lag",
        LoopOptions {
            initial_delay: Duration::from_millis(100),
            max_age: Duration::from_secs(1),
            ..LoopOptions::default()
        },
        Arc::new(SlowFactory {
            events: Arc::clone(&events),
            written: Arc::default(),
        }),
    );
    capture
        .start(ScriptedSource {
            events,
            interval: Duration::from_millis(5),
            sequence: 0,
        })
        .unwrap();
    let handle = capture.handle().clone();

    // Right after startup there is nothing 100ms old yet; the oldest frame stands in
    let deadline = Instant::now() + Duration::from_secs(5);
    let first = loop {
        if let Some(frame) = handle.delayed_frame() {
            break frame;
        }
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(1));
    };
    assert_eq!(first.sequence(), 1);

    thread::sleep(Duration::from_millis(400));
    let delayed = handle.delayed_frame().unwrap();
    let raw = handle.raw_frame().unwrap();
    let lag = raw.timestamp.saturating_duration_since(delayed.timestamp);
    assert!(lag >= Duration::from_millis(90), "lag was {lag:?}");
    assert!(lag <= Duration::from_millis(300), "lag was {lag:?}");
}

#[test]
fn stalled_source_keeps_control_responsive() {
    let dir = tempfile::tempdir().unwrap();
    let events: Events = Arc::default();
    let factory = Arc::new(SlowFactory {
        events: Arc::clone(&events),
        written: Arc::default(),
    });
    let mut capture = CaptureLoop::new("stalled", options(), factory);
    capture
        .start(StalledSource {
            events: Arc::clone(&events),
        })
        .unwrap();
    let handle = capture.handle().clone();
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    handle.start_recording(dir.path().join("idle.slow")).unwrap();
    assert!(handle.is_recording());
    let summary = handle.stop_recording().unwrap().unwrap();
    assert_eq!(summary.frames, 0);
    capture.release();
    assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());

    assert!(handle.stats().capture_misses > 0);
    assert!(handle.raw_frame().is_none());
    assert_eq!(capture.state(), LoopState::Stopped);
    assert_eq!(
        *events.lock().unwrap(),
        vec!["encoder opened", "encoder finished", "source closed"]
    );
}
