//! Rate-limited logging for warnings raised on every scheduler tick.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Emits at most one log per `interval`, counting what it swallowed.
#[derive(Debug)]
pub struct LogThrottle {
    last_log_time: Option<Instant>,
    suppressed_count: u64,
    interval: Duration,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_log_time: None,
            suppressed_count: 0,
            interval,
        }
    }

    /// True if the interval has passed since the last emitted log.
    /// Otherwise the suppressed counter is incremented.
    pub fn should_log(&mut self) -> bool {
        let now = Instant::now();
        match self.last_log_time {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed_count += 1;
                false
            }
            _ => {
                self.last_log_time = Some(now);
                true
            }
        }
    }

    /// Suppressed logs since the last emitted one; resets the counter.
    pub fn get_and_reset_suppressed_count(&mut self) -> u64 {
        std::mem::take(&mut self.suppressed_count)
    }
}

/// One [`LogThrottle`] per key (symbol, user id, trade id).
#[derive(Debug)]
pub struct KeyedLogThrottle {
    interval: Duration,
    entries: DashMap<String, LogThrottle>,
}

impl KeyedLogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            entries: DashMap::new(),
        }
    }

    /// `Some(suppressed)` when a log for `key` should be emitted now.
    pub fn check(&self, key: &str) -> Option<u64> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| LogThrottle::new(self.interval));
        if entry.should_log() {
            Some(entry.get_and_reset_suppressed_count())
        } else {
            None
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
