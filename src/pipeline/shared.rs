//! Cross-thread cells published by a capture loop

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;

use crate::Frame;

/// Smallest gap kept between the requested delay and the buffer horizon
pub const DELAY_EPSILON: Duration = Duration::from_millis(1);

/// Lifecycle of a capture loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    Stopped = 0,
    Running = 1,
    Stopping = 2,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LoopState::Running,
            2 => LoopState::Stopping,
            _ => LoopState::Stopped,
        }
    }

    fn can_become(self, next: LoopState) -> bool {
        matches!(
            (self, next),
            (LoopState::Stopped, LoopState::Running)
                | (LoopState::Running, LoopState::Stopping)
                | (LoopState::Stopping, LoopState::Stopped)
        )
    }
}

/// Requested delay and buffer horizon, read once per capture cycle
#[derive(Debug)]
pub struct DelayControl {
    delay_us: AtomicU64,
    max_age_us: AtomicU64,
}

impl DelayControl {
    pub fn new(delay: Duration, max_age: Duration) -> Self {
        let control = Self {
            delay_us: AtomicU64::new(0),
            max_age_us: AtomicU64::new(micros(max_age)),
        };
        control.set_delay(delay);
        control
    }

    /// Store `delay` clamped to `[0, max_age - DELAY_EPSILON]` and return the stored value.
    pub fn set_delay(&self, delay: Duration) -> Duration {
        let requested = micros(delay.min(self.ceiling()));
        self.delay_us.store(requested, Ordering::SeqCst);
        // A concurrent set_max_age may have lowered the ceiling after we read it
        let ceiling = self.reclamp();
        Duration::from_micros(requested.min(ceiling))
    }

    /// Seconds-based setter; negative and NaN requests become zero.
    pub fn set_delay_secs(&self, seconds: f64) -> Duration {
        let delay = if seconds.is_finite() && seconds > 0.0 {
            Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
        } else if seconds == f64::INFINITY {
            Duration::MAX
        } else {
            Duration::ZERO
        };
        self.set_delay(delay)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_micros(self.delay_us.load(Ordering::SeqCst))
    }

    /// Change the horizon; the current delay is re-clamped against it.
    pub fn set_max_age(&self, max_age: Duration) {
        self.max_age_us.store(micros(max_age), Ordering::SeqCst);
        self.reclamp();
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_micros(self.max_age_us.load(Ordering::SeqCst))
    }

    /// Lower the stored delay to the current ceiling in one atomic step.
    /// Returns the ceiling in microseconds.
    fn reclamp(&self) -> u64 {
        let ceiling = micros(self.ceiling());
        self.delay_us.fetch_min(ceiling, Ordering::SeqCst);
        ceiling
    }

    fn ceiling(&self) -> Duration {
        self.max_age().saturating_sub(DELAY_EPSILON)
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

#[derive(Default)]
struct Stats {
    frames_captured: AtomicU64,
    capture_misses: AtomicU64,
    frames_recorded: AtomicU64,
    buffered_frames: AtomicUsize,
}

/// Counters updated by the capture thread
#[derive(Default)]
pub struct CaptureStats {
    stats: CachePadded<Stats>,
}

/// Point-in-time copy of [`CaptureStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub capture_misses: u64,
    pub frames_recorded: u64,
    pub buffered_frames: usize,
}

impl CaptureStats {
    pub(crate) fn record_capture(&self, buffered: usize) {
        self.stats.frames_captured.fetch_add(1, Ordering::Relaxed);
        self.stats.buffered_frames.store(buffered, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.stats.capture_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recorded(&self) {
        self.stats.frames_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_captured: self.stats.frames_captured.load(Ordering::Relaxed),
            capture_misses: self.stats.capture_misses.load(Ordering::Relaxed),
            frames_recorded: self.stats.frames_recorded.load(Ordering::Relaxed),
            buffered_frames: self.stats.buffered_frames.load(Ordering::Relaxed),
        }
    }
}

/// Everything a capture loop exposes to other threads.
///
/// Each frame cell is swapped independently, so a reader holding one frame
/// never delays the writer of the other.
pub struct SharedState {
    latest_raw: ArcSwapOption<Frame>,
    latest_delayed: ArcSwapOption<Frame>,
    pub delay: DelayControl,
    pub stats: CaptureStats,
    state: AtomicU8,
    recording: AtomicBool,
}

impl SharedState {
    pub fn new(delay: DelayControl) -> Self {
        Self {
            latest_raw: ArcSwapOption::empty(),
            latest_delayed: ArcSwapOption::empty(),
            delay,
            stats: CaptureStats::default(),
            state: AtomicU8::new(LoopState::Stopped as u8),
            recording: AtomicBool::new(false),
        }
    }

    pub fn raw_frame(&self) -> Option<Arc<Frame>> {
        self.latest_raw.load_full()
    }

    pub fn delayed_frame(&self) -> Option<Arc<Frame>> {
        self.latest_delayed.load_full()
    }

    pub(crate) fn publish(&self, raw: Arc<Frame>, delayed: Option<Arc<Frame>>) {
        self.latest_delayed.store(delayed);
        self.latest_raw.store(Some(raw));
    }

    pub(crate) fn clear_frames(&self) {
        self.latest_raw.store(None);
        self.latest_delayed.store(None);
    }

    /// Whether a recording session is active on the capture thread.
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub(crate) fn set_recording(&self, active: bool) {
        self.recording.store(active, Ordering::Release);
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    /// The single transition function: moves `from` to `to` if the current state
    /// is `from` and the edge is legal. Returns whether it happened.
    pub(crate) fn transition(&self, from: LoopState, to: LoopState) -> bool {
        from.can_become(to)
            && self
                .state
                .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }
}
