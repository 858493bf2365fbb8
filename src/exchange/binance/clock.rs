//! Local estimate of the exchange clock.
//!
//! Signed requests carry a timestamp that must land inside the exchange's
//! `recvWindow`. The offset between local and server time is measured from
//! the server-time endpoint and applied to every signed request.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct ClockSync {
    /// server_time - local_time, in milliseconds
    offset_ms: AtomicI64,
    last_sync: Mutex<Option<Instant>>,
    interval: Duration,
}

impl ClockSync {
    pub fn new(interval: Duration) -> Self {
        Self {
            offset_ms: AtomicI64::new(0),
            last_sync: Mutex::new(None),
            interval,
        }
    }

    /// True if the offset was never measured or is older than the resync interval.
    pub fn needs_sync(&self) -> bool {
        match self.last_sync.lock() {
            Ok(guard) => guard.map_or(true, |at| at.elapsed() >= self.interval),
            Err(_) => true,
        }
    }

    /// Record a server-time sample.
    ///
    /// `sent_ms` and `received_ms` are the local times around the request;
    /// the server timestamp is assumed to correspond to their midpoint.
    pub fn record(&self, server_ms: i64, sent_ms: i64, received_ms: i64) -> i64 {
        let midpoint = sent_ms + (received_ms - sent_ms) / 2;
        let offset = server_ms - midpoint;
        self.offset_ms.store(offset, Ordering::Relaxed);
        if let Ok(mut guard) = self.last_sync.lock() {
            *guard = Some(Instant::now());
        }
        offset
    }

    /// Force the next signed request to resync first.
    pub fn invalidate(&self) {
        if let Ok(mut guard) = self.last_sync.lock() {
            *guard = None;
        }
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    /// Local wall-clock time in milliseconds.
    pub fn local_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Timestamp to put on a signed request.
    pub fn timestamp_ms(&self) -> i64 {
        Self::local_ms() + self.offset_ms()
    }
}
