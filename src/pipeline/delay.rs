//! Time-bounded frame history for delayed playback

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::Frame;

struct Entry {
    timestamp: Instant,
    frame: Arc<Frame>,
}

/// Chronological frame history bounded by a maximum age.
///
/// Owned by a single capture thread; other threads only ever see the frame
/// handles it selects.
pub struct DelayBuffer {
    entries: VecDeque<Entry>,
    max_age: Duration,
}

impl DelayBuffer {
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            max_age,
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Change the horizon. Entries beyond it are evicted on the next push.
    pub fn set_max_age(&mut self, max_age: Duration) {
        self.max_age = max_age;
    }

    /// Append a frame, then evict from the front everything older than `max_age`
    /// relative to it.
    ///
    /// A timestamp earlier than the newest entry is clamped to it so the
    /// history stays ordered.
    pub fn push(&mut self, timestamp: Instant, frame: Arc<Frame>) {
        let timestamp = match self.entries.back() {
            Some(newest) if newest.timestamp > timestamp => newest.timestamp,
            _ => timestamp,
        };
        self.entries.push_back(Entry { timestamp, frame });

        while let Some(oldest) = self.entries.front() {
            if timestamp.duration_since(oldest.timestamp) > self.max_age {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Newest frame that is at least `delay` older than the newest entry.
    ///
    /// When nothing is old enough yet, the oldest frame is returned instead,
    /// so a longer delay never yields a newer frame. `None` only when empty.
    pub fn select(&self, delay: Duration) -> Option<&Arc<Frame>> {
        let newest = self.entries.back()?.timestamp;
        // Ages shrink front to back, so qualifying entries form a prefix
        let qualifying = self
            .entries
            .partition_point(|e| newest.duration_since(e.timestamp) >= delay);
        let index = qualifying.saturating_sub(1);
        self.entries.get(index).map(|e| &e.frame)
    }

    /// Time covered from oldest to newest entry.
    pub fn span(&self) -> Duration {
        match (self.entries.front(), self.entries.back()) {
            (Some(oldest), Some(newest)) => newest.timestamp.duration_since(oldest.timestamp),
            _ => Duration::ZERO,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
