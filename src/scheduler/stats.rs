//! Run statistics read by the self-healing policy and the health endpoint.
//!
//! Timestamps are stored as milliseconds since a fixed epoch so every field
//! is a plain atomic.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct SchedulerStats {
    epoch: Instant,
    run_started_ms: AtomicU64,
    last_success_ms: AtomicU64,
    ticks: AtomicU64,
    failed_ticks: AtomicU64,
    consecutive_errors: AtomicU32,
    restarts: AtomicU32,
    active_trades: AtomicUsize,
}

/// Point-in-time copy of [`SchedulerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Time since the current run (start or last restart) began
    pub uptime: Duration,
    /// Time since the last successful tick, or since the run began
    pub since_last_success: Duration,
    pub ticks: u64,
    pub failed_ticks: u64,
    pub consecutive_errors: u32,
    pub restarts: u32,
    pub active_trades: usize,
}

impl Default for SchedulerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerStats {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            run_started_ms: AtomicU64::new(0),
            last_success_ms: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            failed_ticks: AtomicU64::new(0),
            consecutive_errors: AtomicU32::new(0),
            restarts: AtomicU32::new(0),
            active_trades: AtomicUsize::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Start a fresh run: uptime, stall timer and error streak restart from zero.
    pub fn reset_run(&self) {
        let now = self.now_ms();
        self.run_started_ms.store(now, Ordering::Release);
        self.last_success_ms.store(now, Ordering::Release);
        self.consecutive_errors.store(0, Ordering::Release);
    }

    pub fn record_success(&self, active_trades: usize) {
        self.ticks.fetch_add(1, Ordering::AcqRel);
        self.consecutive_errors.store(0, Ordering::Release);
        self.last_success_ms.store(self.now_ms(), Ordering::Release);
        self.active_trades.store(active_trades, Ordering::Release);
    }

    /// Returns the new error streak length.
    pub fn record_failure(&self) -> u32 {
        self.ticks.fetch_add(1, Ordering::AcqRel);
        self.failed_ticks.fetch_add(1, Ordering::AcqRel);
        self.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::AcqRel);
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let now = self.now_ms();
        let started = self.run_started_ms.load(Ordering::Acquire);
        let last_success = self.last_success_ms.load(Ordering::Acquire);
        StatsSnapshot {
            uptime: Duration::from_millis(now.saturating_sub(started)),
            since_last_success: Duration::from_millis(now.saturating_sub(last_success)),
            ticks: self.ticks.load(Ordering::Acquire),
            failed_ticks: self.failed_ticks.load(Ordering::Acquire),
            consecutive_errors: self.consecutive_errors.load(Ordering::Acquire),
            restarts: self.restarts.load(Ordering::Acquire),
            active_trades: self.active_trades.load(Ordering::Acquire),
        }
    }
}
