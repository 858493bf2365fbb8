//! # Circuit Breaker
//!
//! Guards the REST pull path of the price feed. After `failure_threshold`
//! consecutive failed lookups the breaker opens and lookups fail immediately
//! until `cooldown` has elapsed; the first call after that is let through as
//! a probe (HalfOpen). A success closes the breaker again.
//!
//! State lives in atomics so `is_open()` can sit on the per-tick hot path
//! without taking a lock.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    state: AtomicU32,
    consecutive_failures: AtomicU32,
    /// Millis since `epoch` at which the breaker last opened
    opened_at_ms: AtomicU64,
    epoch: Instant,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name,
            state: AtomicU32::new(CircuitState::Closed as u32),
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// True while calls must be rejected. Moves Open -> HalfOpen once the
    /// cooldown has passed.
    pub fn is_open(&self) -> bool {
        if self.state() != CircuitState::Open {
            return false;
        }
        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        if self.now_ms().saturating_sub(opened_at) < self.cooldown.as_millis() as u64 {
            return true;
        }
        if self
            .state
            .compare_exchange(
                CircuitState::Open as u32,
                CircuitState::HalfOpen as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            info!(breaker = self.name, "Circuit half-open, probing");
        }
        false
    }

    pub fn record_success(&self) {
        let previous = self.state.swap(CircuitState::Closed as u32, Ordering::AcqRel);
        self.consecutive_failures.store(0, Ordering::Release);
        if previous != CircuitState::Closed as u32 {
            info!(breaker = self.name, "Circuit closed");
        }
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let state = self.state();

        // A failed probe reopens immediately
        let should_open = state == CircuitState::HalfOpen
            || (state == CircuitState::Closed && failures >= self.failure_threshold);
        if should_open {
            self.opened_at_ms.store(self.now_ms(), Ordering::Release);
            self.state.store(CircuitState::Open as u32, Ordering::Release);
            warn!(
                breaker = self.name,
                failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Circuit opened"
            );
        }
    }

    pub fn reset(&self) {
        self.state.store(CircuitState::Closed as u32, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.opened_at_ms.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_count() {
        let breaker = CircuitBreaker::new("test", 2, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(!breaker.is_open());
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_cooldown() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_secs(30));
        breaker.record_failure();
        assert!(breaker.is_open());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!breaker.is_open());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Failed probe reopens
        breaker.record_failure();
        assert!(breaker.is_open());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!breaker.is_open());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_reset() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_secs(30));
        breaker.record_failure();
        breaker.reset();
        assert!(!breaker.is_open());
        assert_eq!(breaker.consecutive_failures(), 0);
    }
}
