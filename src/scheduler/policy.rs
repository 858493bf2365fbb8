//! Self-healing restart policy.

use std::time::Duration;

use super::stats::StatsSnapshot;
use super::SchedulerConfig;

/// Why the scheduler restarted itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// Planned restart after the uptime ceiling
    MaxUptime,
    /// Too many failed ticks in a row
    ConsecutiveErrors,
    /// No successful tick for longer than the stall threshold
    Stalled,
}

impl RestartReason {
    pub fn as_label(self) -> &'static str {
        match self {
            RestartReason::MaxUptime => "max_uptime",
            RestartReason::ConsecutiveErrors => "consecutive_errors",
            RestartReason::Stalled => "stalled",
        }
    }
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfHealPolicy {
    pub max_uptime: Duration,
    pub max_consecutive_errors: u32,
    pub stall_threshold: Duration,
    /// How long a tick blocked on an in-flight close still counts as progress
    pub close_grace: Duration,
}

impl SelfHealPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_uptime: Duration::from_secs(config.max_uptime_secs),
            max_consecutive_errors: config.max_consecutive_errors,
            stall_threshold: config.stall_threshold(),
            close_grace: Duration::from_secs(config.close_wait_secs),
        }
    }

    /// Restart decision for the current run.
    ///
    /// The stall check is suspended while the scheduler sits in its
    /// post-failure pause; the error streak covers that case. A tick waiting
    /// on an exchange close is not stalled until `close_grace` runs out.
    pub fn check(
        &self,
        stats: &StatsSnapshot,
        in_error_pause: bool,
        closing: bool,
    ) -> Option<RestartReason> {
        if stats.uptime >= self.max_uptime {
            return Some(RestartReason::MaxUptime);
        }
        if stats.consecutive_errors >= self.max_consecutive_errors {
            return Some(RestartReason::ConsecutiveErrors);
        }
        let limit = if closing {
            self.stall_threshold.max(self.close_grace)
        } else {
            self.stall_threshold
        };
        if !in_error_pause && stats.since_last_success > limit {
            return Some(RestartReason::Stalled);
        }
        None
    }

    /// `healthy`, `degraded` or `critical`, for the health endpoint.
    pub fn health_status(&self, stats: &StatsSnapshot) -> &'static str {
        if stats.consecutive_errors >= self.max_consecutive_errors
            || stats.since_last_success > self.stall_threshold
        {
            "critical"
        } else if stats.consecutive_errors > 0 {
            "degraded"
        } else {
            "healthy"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SelfHealPolicy {
        SelfHealPolicy::from_config(&SchedulerConfig::default())
    }

    fn snapshot() -> StatsSnapshot {
        StatsSnapshot {
            uptime: Duration::from_secs(60),
            since_last_success: Duration::from_millis(500),
            ticks: 60,
            failed_ticks: 0,
            consecutive_errors: 0,
            restarts: 0,
            active_trades: 1,
        }
    }

    #[test]
    fn test_defaults() {
        let p = policy();
        assert_eq!(p.max_uptime, Duration::from_secs(12 * 3600));
        assert_eq!(p.max_consecutive_errors, 10);
        assert_eq!(p.stall_threshold, Duration::from_secs(3));
    }

    #[test]
    fn test_healthy_run_keeps_going() {
        assert_eq!(policy().check(&snapshot(), false, false), None);
        assert_eq!(policy().health_status(&snapshot()), "healthy");
    }

    #[test]
    fn test_each_trigger() {
        let p = policy();

        let old = StatsSnapshot {
            uptime: Duration::from_secs(12 * 3600),
            ..snapshot()
        };
        assert_eq!(p.check(&old, false, false), Some(RestartReason::MaxUptime));

        let failing = StatsSnapshot {
            consecutive_errors: 10,
            ..snapshot()
        };
        assert_eq!(p.check(&failing, true, false), Some(RestartReason::ConsecutiveErrors));

        let nine = StatsSnapshot {
            consecutive_errors: 9,
            ..snapshot()
        };
        assert_eq!(p.check(&nine, true, false), None);
        assert_eq!(p.health_status(&nine), "degraded");

        let stalled = StatsSnapshot {
            since_last_success: Duration::from_millis(3001),
            ..snapshot()
        };
        assert_eq!(p.check(&stalled, false, false), Some(RestartReason::Stalled));
        assert_eq!(p.health_status(&stalled), "critical");
    }

    #[test]
    fn test_stall_suspended_during_error_pause() {
        let paused = StatsSnapshot {
            since_last_success: Duration::from_secs(5),
            consecutive_errors: 1,
            ..snapshot()
        };
        assert_eq!(policy().check(&paused, true, false), None);
        assert_eq!(
            policy().check(&paused, false, false),
            Some(RestartReason::Stalled)
        );
    }

    #[test]
    fn test_close_in_flight_extends_stall_limit() {
        let p = policy();
        let slow_close = StatsSnapshot {
            since_last_success: Duration::from_secs(20),
            ..snapshot()
        };
        assert_eq!(p.check(&slow_close, false, true), None);
        assert_eq!(p.check(&slow_close, false, false), Some(RestartReason::Stalled));

        let hung = StatsSnapshot {
            since_last_success: Duration::from_secs(61),
            ..snapshot()
        };
        assert_eq!(p.check(&hung, false, true), Some(RestartReason::Stalled));
    }
}
