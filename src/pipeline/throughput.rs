//! Rolling frames-per-second estimate for the acquisition loop

use std::time::{Duration, Instant};

/// Frames seen since `window_start`. Owned by the acquisition thread only;
/// the computed rate is what gets published.
#[derive(Debug, Clone)]
pub struct ThroughputSample {
    count: u64,
    window_start: Instant,
    window: Duration,
}

impl ThroughputSample {
    pub fn new(window: Duration, now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            window,
        }
    }

    pub fn record_frame(&mut self) {
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Close the window once it has run its full length, returning
    /// `count / elapsed` and starting a new window at `now`.
    pub fn roll(&mut self, now: Instant) -> Option<f64> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window || elapsed.is_zero() {
            return None;
        }

        let rate = self.count as f64 / elapsed.as_secs_f64();
        self.count = 0;
        self.window_start = now;
        Some(rate)
    }
}
