//! Per-source capture thread: acquire, buffer, select, publish, record
//!
//! The thread owns the source, the [`DelayBuffer`] and the [`RecordingSink`].
//! Everything other threads may touch lives in [`SharedState`]; recording
//! requests travel to the thread as messages and are answered from it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use crossbeam::utils::Backoff;
use flume::{Receiver, Sender};
use metrics::{counter, gauge, Counter, Gauge};
use tracing::{debug, error, info, instrument, warn};

use crate::capture::{FrameSource, StreamMode};
use crate::error::{LoopError, RecordError, SourceError};
use crate::pipeline::delay::DelayBuffer;
use crate::pipeline::shared::{DelayControl, LoopState, SharedState, StatsSnapshot};
use crate::record::{EncoderFactory, RecordingSink, RecordingSummary};
use crate::{BufferConfig, Frame, RecordingConfig};

/// Tuning for one capture loop
#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub initial_delay: Duration,
    pub max_age: Duration,
    /// Sleep once the spin/yield backoff after a missed frame is exhausted
    pub miss_sleep: Duration,
    /// Log a warning every this many consecutive misses
    pub miss_warn_every: u64,
    pub queue_depth: usize,
    pub pin_core: Option<usize>,
}

impl LoopOptions {
    pub fn from_config(
        buffer: &BufferConfig,
        recording: &RecordingConfig,
        pin_core: Option<usize>,
    ) -> Self {
        Self {
            initial_delay: secs(buffer.initial_delay_secs),
            max_age: secs(buffer.max_age_secs),
            miss_sleep: Duration::from_millis(buffer.miss_sleep_ms),
            miss_warn_every: buffer.miss_warn_every.max(1),
            queue_depth: recording.queue_depth,
            pin_core,
        }
    }
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self::from_config(&BufferConfig::default(), &RecordingConfig::default(), None)
    }
}

fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

enum Control {
    StartRecording {
        destination: PathBuf,
        reply: Sender<Result<(), RecordError>>,
    },
    StopRecording {
        reply: Sender<Result<Option<RecordingSummary>, RecordError>>,
    },
}

/// Cloneable view of a capture loop for display and control threads
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<SharedState>,
    control: Arc<ArcSwapOption<Sender<Control>>>,
}

impl StreamHandle {
    /// Most recently captured frame.
    pub fn raw_frame(&self) -> Option<Arc<Frame>> {
        self.shared.raw_frame()
    }

    /// Frame selected for the current delay in the most recent cycle.
    pub fn delayed_frame(&self) -> Option<Arc<Frame>> {
        self.shared.delayed_frame()
    }

    /// Request a delay; returns the clamped value that takes effect next cycle.
    pub fn set_delay(&self, delay: Duration) -> Duration {
        self.shared.delay.set_delay(delay)
    }

    pub fn set_delay_secs(&self, seconds: f64) -> Duration {
        self.shared.delay.set_delay_secs(seconds)
    }

    pub fn delay(&self) -> Duration {
        self.shared.delay.delay()
    }

    /// Change how much history is retained; applied on the next push.
    pub fn set_max_age(&self, max_age: Duration) {
        self.shared.delay.set_max_age(max_age)
    }

    pub fn max_age(&self) -> Duration {
        self.shared.delay.max_age()
    }

    /// Start recording real-time frames to `destination`.
    ///
    /// Blocks until the capture thread has opened the encoder.
    pub fn start_recording(&self, destination: impl AsRef<Path>) -> Result<(), RecordError> {
        let (reply, response) = flume::bounded(1);
        self.send(Control::StartRecording {
            destination: destination.as_ref().to_path_buf(),
            reply,
        })
        .map_err(|_| RecordError::CaptureStopped)?;
        response.recv().map_err(|_| RecordError::CaptureStopped)?
    }

    /// Stop recording, returning once every recorded frame is flushed.
    ///
    /// `Ok(None)` if nothing was recording, including when the loop is stopped
    /// (teardown already closed any session).
    pub fn stop_recording(&self) -> Result<Option<RecordingSummary>, RecordError> {
        let (reply, response) = flume::bounded(1);
        if self.send(Control::StopRecording { reply }).is_err() {
            return Ok(None);
        }
        response.recv().unwrap_or(Ok(None))
    }

    pub fn is_recording(&self) -> bool {
        self.shared.is_recording()
    }

    pub fn state(&self) -> LoopState {
        self.shared.state()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    fn send(&self, message: Control) -> Result<(), Control> {
        match self.control.load_full() {
            Some(tx) => tx.send(message).map_err(|e| e.into_inner()),
            None => Err(message),
        }
    }
}

/// Lifecycle owner of one source's capture thread.
///
/// `Stopped → Running` on [`start`](Self::start), `Running → Stopping →
/// Stopped` on [`release`](Self::release). Dropping releases.
pub struct CaptureLoop {
    name: String,
    options: LoopOptions,
    encoders: Arc<dyn EncoderFactory>,
    handle: StreamHandle,
    mode: Option<StreamMode>,
    thread: Option<JoinHandle<Box<dyn FrameSource>>>,
}

impl CaptureLoop {
    pub fn new(
        name: impl Into<String>,
        options: LoopOptions,
        encoders: Arc<dyn EncoderFactory>,
    ) -> Self {
        let shared = Arc::new(SharedState::new(DelayControl::new(
            options.initial_delay,
            options.max_age,
        )));
        Self {
            name: name.into(),
            options,
            encoders,
            handle: StreamHandle {
                shared,
                control: Arc::new(ArcSwapOption::empty()),
            },
            mode: None,
            thread: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &StreamHandle {
        &self.handle
    }

    pub fn state(&self) -> LoopState {
        self.handle.state()
    }

    /// Negotiated mode of the current (or last) source.
    pub fn mode(&self) -> Option<StreamMode> {
        self.mode
    }

    /// Spawn the capture thread on an already opened source.
    #[instrument(skip(self, source), fields(name = %self.name))]
    pub fn start<S: FrameSource>(&mut self, source: S) -> Result<(), LoopError> {
        let shared = &self.handle.shared;
        if !shared.transition(LoopState::Stopped, LoopState::Running) {
            return Err(LoopError::AlreadyRunning);
        }

        let mode = source.mode();
        let (tx, rx) = flume::unbounded();
        shared.clear_frames();
        self.handle.control.store(Some(Arc::new(tx)));

        let worker = Worker::new(
            &self.name,
            Box::new(source),
            &self.options,
            RecordingSink::new(Arc::clone(&self.encoders), self.options.queue_depth),
            Arc::clone(shared),
            rx,
        );
        let spawned = thread::Builder::new()
            .name(format!("capture-{}", self.name))
            .spawn(move || worker.run());

        match spawned {
            Ok(thread) => {
                info!(
                    "Capture loop {} running: {}x{}@{} {:?}, max age {:?}",
                    self.name, mode.width, mode.height, mode.fps, mode.format, self.options.max_age
                );
                self.mode = Some(mode);
                self.thread = Some(thread);
                Ok(())
            }
            Err(e) => {
                self.handle.control.store(None);
                shared.transition(LoopState::Running, LoopState::Stopping);
                shared.transition(LoopState::Stopping, LoopState::Stopped);
                Err(LoopError::Spawn(e))
            }
        }
    }

    /// Stop capturing and release the source.
    ///
    /// Joins the capture thread first, so when this returns no further frames
    /// are published, any recording is flushed and the source is closed.
    /// No-op unless running.
    pub fn release(&mut self) {
        let shared = &self.handle.shared;
        if !shared.transition(LoopState::Running, LoopState::Stopping) {
            return;
        }
        info!("Stopping capture loop {}", self.name);

        if let Some(thread) = self.thread.take() {
            match thread.join() {
                Ok(mut source) => source.close(),
                Err(_) => error!("Capture thread {} panicked", self.name),
            }
        }
        self.handle.control.store(None);
        shared.set_recording(false);
        shared.transition(LoopState::Stopping, LoopState::Stopped);
        info!("Capture loop {} stopped", self.name);
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.release();
    }
}

struct Worker {
    name: String,
    source: Box<dyn FrameSource>,
    buffer: DelayBuffer,
    sink: RecordingSink,
    shared: Arc<SharedState>,
    control: Receiver<Control>,
    miss_sleep: Duration,
    miss_warn_every: u64,
    pin_core: Option<usize>,
    captured: Counter,
    missed: Counter,
    recorded: Counter,
    buffered: Gauge,
}

impl Worker {
    fn new(
        name: &str,
        source: Box<dyn FrameSource>,
        options: &LoopOptions,
        sink: RecordingSink,
        shared: Arc<SharedState>,
        control: Receiver<Control>,
    ) -> Self {
        let label = name.to_string();
        Self {
            name: label.clone(),
            source,
            buffer: DelayBuffer::new(shared.delay.max_age()),
            sink,
            control,
            miss_sleep: options.miss_sleep,
            miss_warn_every: options.miss_warn_every.max(1),
            pin_core: options.pin_core,
            captured: counter!("delaycam_frames_captured_total", "source" => label.clone()),
            missed: counter!("delaycam_capture_misses_total", "source" => label.clone()),
            recorded: counter!("delaycam_frames_recorded_total", "source" => label.clone()),
            buffered: gauge!("delaycam_buffered_frames", "source" => label),
            shared,
        }
    }

    fn run(mut self) -> Box<dyn FrameSource> {
        if let Some(id) = self.pin_core {
            if core_affinity::set_for_current(core_affinity::CoreId { id }) {
                debug!("Capture thread {} pinned to core {}", self.name, id);
            } else {
                warn!("Failed to pin capture thread {} to core {}", self.name, id);
            }
        }

        let backoff = Backoff::new();
        let mut misses: u64 = 0;

        while self.shared.is_running() {
            self.service_control();

            match self.source.capture() {
                Ok(frame) => {
                    if misses >= self.miss_warn_every {
                        info!("{}: capture recovered after {} misses", self.name, misses);
                    }
                    misses = 0;
                    backoff.reset();
                    self.cycle(frame);
                }
                Err(e) => {
                    misses += 1;
                    self.miss(&e, misses);
                    if backoff.is_completed() {
                        thread::sleep(self.miss_sleep);
                    } else {
                        backoff.snooze();
                    }
                }
            }
        }

        // Requests that raced with shutdown get a definite answer
        self.service_control();
        self.finish_recording();
        self.source
    }

    /// One capture cycle: stamp, buffer, select, publish, record.
    fn cycle(&mut self, mut frame: Frame) {
        frame.timestamp = Instant::now();
        let frame = Arc::new(frame);

        self.buffer.set_max_age(self.shared.delay.max_age());
        self.buffer.push(frame.timestamp, Arc::clone(&frame));
        let delayed = self.buffer.select(self.shared.delay.delay()).cloned();
        self.shared.publish(Arc::clone(&frame), delayed);

        self.shared.stats.record_capture(self.buffer.len());
        self.captured.increment(1);
        self.buffered.set(self.buffer.len() as f64);

        if self.sink.is_active() {
            match self.sink.write(&frame) {
                Ok(()) => {
                    self.shared.stats.record_recorded();
                    self.recorded.increment(1);
                }
                Err(e) => {
                    error!("{}: recording stopped: {}", self.name, e);
                    self.shared.set_recording(false);
                }
            }
        }
    }

    fn miss(&self, error: &SourceError, streak: u64) {
        self.shared.stats.record_miss();
        self.missed.increment(1);
        if streak % self.miss_warn_every == 0 {
            warn!(
                "{}: {} consecutive capture misses (last: {})",
                self.name, streak, error
            );
        } else if !error.is_transient() {
            debug!("{}: capture failed: {}", self.name, error);
        }
    }

    fn service_control(&mut self) {
        while let Ok(message) = self.control.try_recv() {
            match message {
                Control::StartRecording { destination, reply } => {
                    let result = if self.shared.is_running() {
                        let mode = self.source.mode();
                        self.sink.start(&destination, &mode)
                    } else {
                        Err(RecordError::CaptureStopped)
                    };
                    if let Err(e) = &result {
                        warn!("{}: recording not started: {}", self.name, e);
                    }
                    self.shared.set_recording(self.sink.is_active());
                    let _ = reply.send(result);
                }
                Control::StopRecording { reply } => {
                    let result = self.sink.stop();
                    self.shared.set_recording(false);
                    let _ = reply.send(result);
                }
            }
        }
    }

    fn finish_recording(&mut self) {
        if let Err(e) = self.sink.stop() {
            error!("{}: failed to finish recording: {}", self.name, e);
        }
        self.shared.set_recording(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticSource;
    use crate::record::RawFileEncoderFactory;

    fn options() -> LoopOptions {
        LoopOptions {
            initial_delay: Duration::ZERO,
            max_age: Duration::from_secs(5),
            miss_sleep: Duration::from_millis(1),
            miss_warn_every: 1000,
            queue_depth: 4,
            pin_core: None,
        }
    }

    fn capture_loop() -> CaptureLoop {
        CaptureLoop::new("test", options(), Arc::new(RawFileEncoderFactory))
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn publishes_frames_once_running() {
        let mut capture = capture_loop();
        assert_eq!(capture.state(), LoopState::Stopped);
        assert!(capture.handle().raw_frame().is_none());

        capture
            .start(SyntheticSource::new("cam", 4, 4, 500))
            .unwrap();
        assert_eq!(capture.state(), LoopState::Running);
        let handle = capture.handle().clone();
        wait_for(|| handle.raw_frame().is_some() && handle.delayed_frame().is_some());

        capture.release();
        assert_eq!(capture.state(), LoopState::Stopped);
        assert!(handle.stats().frames_captured > 0);
    }

    #[test]
    fn second_start_is_rejected() {
        let mut capture = capture_loop();
        capture.start(SyntheticSource::new("a", 2, 2, 500)).unwrap();
        let err = capture
            .start(SyntheticSource::new("b", 2, 2, 500))
            .unwrap_err();
        assert!(matches!(err, LoopError::AlreadyRunning));
    }

    #[test]
    fn nothing_is_published_after_release() {
        let mut capture = capture_loop();
        capture.start(SyntheticSource::new("cam", 2, 2, 1000)).unwrap();
        let handle = capture.handle().clone();
        wait_for(|| handle.stats().frames_captured >= 5);

        capture.release();
        let frozen = handle.raw_frame().map(|f| f.sequence());
        let count = handle.stats().frames_captured;
        thread::sleep(Duration::from_millis(30));
        assert_eq!(handle.raw_frame().map(|f| f.sequence()), frozen);
        assert_eq!(handle.stats().frames_captured, count);
    }

    #[test]
    fn release_is_idempotent_and_restartable() {
        let mut capture = capture_loop();
        capture.release();
        capture.start(SyntheticSource::new("one", 2, 2, 500)).unwrap();
        capture.release();
        capture.release();
        assert_eq!(capture.state(), LoopState::Stopped);

        capture.start(SyntheticSource::new("two", 2, 2, 500)).unwrap();
        let handle = capture.handle().clone();
        wait_for(|| handle.raw_frame().is_some());
        assert_eq!(capture.state(), LoopState::Running);
    }

    #[test]
    fn capture_misses_are_absorbed() {
        let mut capture = capture_loop();
        capture
            .start(SyntheticSource::new("flaky", 2, 2, 1000).with_misses(2))
            .unwrap();
        let handle = capture.handle().clone();
        wait_for(|| handle.stats().frames_captured >= 10);

        assert!(handle.stats().capture_misses >= 4);
        assert_eq!(handle.state(), LoopState::Running);
    }

    #[test]
    fn delay_holds_back_the_delayed_frame() {
        let mut capture = capture_loop();
        capture.handle().set_delay(Duration::from_millis(200));
        capture.start(SyntheticSource::new("cam", 2, 2, 200)).unwrap();
        let handle = capture.handle().clone();

        wait_for(|| handle.stats().frames_captured >= 80);
        let raw = handle.raw_frame().unwrap();
        let delayed = handle.delayed_frame().unwrap();
        assert!(delayed.sequence() < raw.sequence());
        assert!(raw.timestamp.duration_since(delayed.timestamp) >= Duration::from_millis(150));

        handle.set_delay(Duration::ZERO);
        wait_for(|| {
            let raw = handle.raw_frame().unwrap();
            let delayed = handle.delayed_frame().unwrap();
            raw.sequence() == delayed.sequence()
        });
    }

    #[test]
    fn shrinking_max_age_trims_history_while_running() {
        let mut capture = capture_loop();
        capture.start(SyntheticSource::new("cam", 2, 2, 500)).unwrap();
        let handle = capture.handle().clone();
        wait_for(|| handle.stats().buffered_frames >= 100);

        handle.set_max_age(Duration::from_millis(20));
        assert_eq!(handle.max_age(), Duration::from_millis(20));
        // 20ms at 500fps is about ten frames
        wait_for(|| handle.stats().buffered_frames <= 15);
        assert!(handle.delay() < Duration::from_millis(20));
    }

    #[test]
    fn recording_requires_a_running_loop() {
        let dir = tempfile::tempdir().unwrap();
        let capture = capture_loop();
        let err = capture
            .handle()
            .start_recording(dir.path().join("x.raw"))
            .unwrap_err();
        assert!(matches!(err, RecordError::CaptureStopped));
        assert!(capture.handle().stop_recording().unwrap().is_none());
    }

    #[test]
    fn release_flushes_active_recording() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("live.raw");
        let mut capture = capture_loop();
        capture.start(SyntheticSource::new("cam", 2, 2, 500)).unwrap();
        let handle = capture.handle().clone();

        handle.start_recording(&dest).unwrap();
        assert!(handle.is_recording());
        wait_for(|| handle.stats().frames_recorded >= 10);
        capture.release();

        assert!(!handle.is_recording());
        let recorded = handle.stats().frames_recorded as usize;
        assert_eq!(std::fs::read(&dest).unwrap().len(), recorded * 2 * 2 * 3);
    }
}
