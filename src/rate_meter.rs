//! Sliding-window event-rate meter
use std::collections::VecDeque;

use chrono::Utc;

/// Default trailing window, in seconds, over which rates are computed.
pub const DEFAULT_LAPSE_SECONDS: u64 = 5;

/// Counts event occurrences and reports the average rate over a fixed
/// trailing window. The lifetime index is kept separately and is never
/// affected by window pruning.
///
/// Single-writer; the owner is expected to serialize access (the subscribe
/// loop processes one event at a time).
#[derive(Clone, Debug)]
pub struct RateMeter {
    total: u64,
    stamps: VecDeque<i64>,
    lapse: u64,
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new(DEFAULT_LAPSE_SECONDS)
    }
}

impl RateMeter {
    pub fn new(lapse_seconds: u64) -> Self {
        Self {
            total: 0,
            stamps: VecDeque::new(),
            lapse: lapse_seconds.max(1),
        }
    }

    /// Record one event occurrence at the current time.
    pub fn monitor(&mut self) {
        self.total += 1;
        self.stamps.push_back(Utc::now().timestamp_millis());
    }

    /// Average events per second over the trailing window. Expired stamps are
    /// pruned here rather than on `monitor` so an idle meter decays to 0.0.
    pub fn rate(&mut self) -> f64 {
        let cutoff = Utc::now().timestamp_millis() - (self.lapse as i64) * 1000;
        while let Some(&front) = self.stamps.front() {
            if front < cutoff {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
        self.stamps.len() as f64 / self.lapse as f64
    }

    /// Total lifetime count of `monitor` calls, independent of the window.
    pub fn index(&self) -> u64 {
        self.total
    }
}
