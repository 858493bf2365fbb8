//! Retry policy and error classification for exchange calls.
//!
//! Exchange error codes are mapped to an [`ErrorClass`] through an explicit
//! table ([`BINANCE_ERROR_TABLE`]) so new codes are added as data, not as
//! scattered `if code == ..` checks. [`RetryExecutor`] applies the class:
//!
//! | Class | Action |
//! |---|---|
//! | `TimestampSkew` | resync clock, retry immediately |
//! | `RateLimited`, `Transient` | sleep `d * 2^(k-1) * jitter(0.8, 1.2)`, retry |
//! | `Unauthorized` | disable the capability for the session, fail |
//! | `InvalidRequest`, `NotFound`, `NoChange` | fail, caller decides |

use async_trait::async_trait;
use dashmap::DashSet;
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

use crate::exchange::{Capability, ErrorClass, ExchangeError};
use crate::metrics;

/// Binance USDT-M futures error codes and how to treat them.
pub const BINANCE_ERROR_TABLE: &[(i64, ErrorClass)] = &[
    // Timestamp for this request is outside of the recvWindow
    (-1021, ErrorClass::TimestampSkew),
    // Too many requests / too many new orders
    (-1003, ErrorClass::RateLimited),
    (-1015, ErrorClass::RateLimited),
    // Not authorized / bad key / missing permission
    (-1002, ErrorClass::Unauthorized),
    (-2014, ErrorClass::Unauthorized),
    (-2015, ErrorClass::Unauthorized),
    // New order rejected / cancel rejected / margin insufficient
    (-2010, ErrorClass::InvalidRequest),
    (-2011, ErrorClass::InvalidRequest),
    (-2019, ErrorClass::InvalidRequest),
    // ReduceOnly order rejected
    (-2022, ErrorClass::InvalidRequest),
    // Parameter problems
    (-1102, ErrorClass::InvalidRequest),
    (-1111, ErrorClass::InvalidRequest),
    (-1121, ErrorClass::InvalidRequest),
    (-4003, ErrorClass::InvalidRequest),
    (-4164, ErrorClass::InvalidRequest),
    // Order does not exist
    (-2013, ErrorClass::NotFound),
    // No need to change margin type / position side
    (-4046, ErrorClass::NoChange),
    (-4059, ErrorClass::NoChange),
];

/// Message fragments checked when the code alone is not conclusive.
const MESSAGE_RULES: &[(&str, ErrorClass)] = &[
    ("not authorized", ErrorClass::Unauthorized),
    ("outside of the recvwindow", ErrorClass::TimestampSkew),
    ("too many requests", ErrorClass::RateLimited),
];

/// Data-driven mapping from exchange errors to retry behaviour.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    codes: HashMap<i64, ErrorClass>,
}

impl ErrorClassifier {
    /// Classifier loaded with [`BINANCE_ERROR_TABLE`].
    pub fn binance() -> Self {
        Self {
            codes: BINANCE_ERROR_TABLE.iter().copied().collect(),
        }
    }

    /// Add or override a code mapping.
    #[must_use]
    pub fn with_code(mut self, code: i64, class: ErrorClass) -> Self {
        self.codes.insert(code, class);
        self
    }

    pub fn classify(&self, err: &ExchangeError) -> ErrorClass {
        match err {
            ExchangeError::Api { code, message } => {
                if let Some(class) = self.codes.get(code) {
                    return *class;
                }
                let lowered = message.to_lowercase();
                MESSAGE_RULES
                    .iter()
                    .find(|(fragment, _)| lowered.contains(fragment))
                    .map(|(_, class)| *class)
                    .unwrap_or(ErrorClass::Transient)
            }
            ExchangeError::Network(_) | ExchangeError::Decode(_) => ErrorClass::Transient,
            ExchangeError::CapabilityDisabled(_) => ErrorClass::Unauthorized,
            ExchangeError::NotFound(_) => ErrorClass::NotFound,
            // Locally generated; retrying cannot change the outcome
            ExchangeError::NotConfigured
            | ExchangeError::Configuration(_)
            | ExchangeError::CircuitOpen(_) => ErrorClass::InvalidRequest,
        }
    }
}

lazy_static::lazy_static! {
    static ref DEFAULT_CLASSIFIER: ErrorClassifier = ErrorClassifier::binance();
}

/// Shared classifier loaded with [`BINANCE_ERROR_TABLE`].
pub fn default_classifier() -> &'static ErrorClassifier {
    &DEFAULT_CLASSIFIER
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::binance()
    }
}

/// Backoff schedule for retried calls.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    /// Base delay `d` in milliseconds
    pub base_delay_ms: u64,
    /// Lower bound of the jitter multiplier
    pub jitter_min: f64,
    /// Upper bound of the jitter multiplier
    pub jitter_max: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            jitter_min: 0.8,
            jitter_max: 1.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt `attempt` (1-based), with a given jitter factor.
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let millis = self.base_delay_ms as f64 * 2f64.powi(exponent) * jitter;
        Duration::from_millis(millis.max(0.0) as u64)
    }

    /// Delay before retrying after failed attempt `attempt` (1-based), with random jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_max > self.jitter_min {
            rand::rng().random_range(self.jitter_min..=self.jitter_max)
        } else {
            self.jitter_min
        };
        self.delay_with_jitter(attempt, jitter)
    }
}

/// Hook invoked when the exchange reports clock skew.
#[async_trait]
pub trait ClockResync: Send + Sync {
    async fn resync_clock(&self) -> Result<(), ExchangeError>;
}

/// Applies [`RetryPolicy`] and [`ErrorClassifier`] to exchange calls for one account.
///
/// Tracks capabilities disabled by authorization failures; once disabled, a
/// capability stays off for the lifetime of the executor (one session).
#[derive(Debug)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    classifier: ErrorClassifier,
    disabled: DashSet<Capability>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, classifier: ErrorClassifier) -> Self {
        Self {
            policy,
            classifier,
            disabled: DashSet::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn is_disabled(&self, capability: Capability) -> bool {
        self.disabled.contains(&capability)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(
        &self,
        capability: Capability,
        operation: &str,
        clock: &dyn ClockResync,
        mut op: F,
    ) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        if self.is_disabled(capability) {
            return Err(ExchangeError::CapabilityDisabled(capability));
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let class = self.classifier.classify(&err);
            metrics::record_api_error(operation, class);

            match class {
                ErrorClass::Unauthorized => {
                    if self.disabled.insert(capability) {
                        error!(
                            capability = %capability,
                            operation,
                            error = %err,
                            "Authorization failure, disabling capability for this session"
                        );
                    }
                    return Err(err);
                }
                ErrorClass::InvalidRequest | ErrorClass::NotFound | ErrorClass::NoChange => {
                    return Err(err);
                }
                ErrorClass::TimestampSkew | ErrorClass::RateLimited | ErrorClass::Transient => {
                    if attempt >= max_attempts {
                        warn!(
                            operation,
                            attempts = attempt,
                            error = %err,
                            "Retry budget exhausted"
                        );
                        return Err(err);
                    }

                    if class == ErrorClass::TimestampSkew {
                        warn!(operation, "Timestamp outside recvWindow, resyncing clock");
                        if let Err(sync_err) = clock.resync_clock().await {
                            warn!(error = %sync_err, "Clock resync failed");
                        }
                    } else {
                        let delay = self.policy.backoff_delay(attempt);
                        warn!(
                            operation,
                            attempt,
                            class = class.as_label(),
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Retrying exchange call"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), ErrorClassifier::binance())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingClock(AtomicU32);

    #[async_trait]
    impl ClockResync for CountingClock {
        async fn resync_clock(&self) -> Result<(), ExchangeError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn api(code: i64, message: &str) -> ExchangeError {
        ExchangeError::Api {
            code,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_classification_table() {
        let c = ErrorClassifier::binance();
        assert_eq!(c.classify(&api(-1021, "")), ErrorClass::TimestampSkew);
        assert_eq!(c.classify(&api(-1003, "")), ErrorClass::RateLimited);
        assert_eq!(c.classify(&api(-1002, "")), ErrorClass::Unauthorized);
        assert_eq!(c.classify(&api(-2019, "Margin is insufficient.")), ErrorClass::InvalidRequest);
        assert_eq!(c.classify(&api(-2013, "Order does not exist.")), ErrorClass::NotFound);
        assert_eq!(c.classify(&api(-4046, "No need to change margin type.")), ErrorClass::NoChange);
        assert_eq!(c.classify(&api(-1000, "unknown")), ErrorClass::Transient);
        assert_eq!(
            c.classify(&api(-9999, "You are not authorized to execute this request.")),
            ErrorClass::Unauthorized
        );
        assert_eq!(
            c.classify(&ExchangeError::Network("reset".into())),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_classifier_extension() {
        let c = ErrorClassifier::binance().with_code(-1000, ErrorClass::RateLimited);
        assert_eq!(c.classify(&api(-1000, "")), ErrorClass::RateLimited);
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_with_jitter(1, 1.0), Duration::from_millis(1000));
        assert_eq!(policy.delay_with_jitter(2, 1.0), Duration::from_millis(2000));
        assert_eq!(policy.delay_with_jitter(3, 1.0), Duration::from_millis(4000));
        assert_eq!(policy.delay_with_jitter(2, 0.8), Duration::from_millis(1600));

        for attempt in 1..=3 {
            let d = policy.backoff_delay(attempt).as_millis() as f64;
            let nominal = 1000.0 * 2f64.powi(attempt as i32 - 1);
            assert!(d >= nominal * 0.8 - 1.0 && d <= nominal * 1.2 + 1.0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_until_budget() {
        let executor = RetryExecutor::default();
        let clock = CountingClock(AtomicU32::new(0));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .run(Capability::Account, "test", &clock, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExchangeError::Network("timeout".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timestamp_skew_resyncs_then_succeeds() {
        let executor = RetryExecutor::default();
        let clock = CountingClock(AtomicU32::new(0));
        let calls = AtomicU32::new(0);

        let result = executor
            .run(Capability::Trading, "test", &clock, || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(api(-1021, "Timestamp for this request is outside of the recvWindow."))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.ok(), Some(42));
        assert_eq!(clock.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_disables_capability() {
        let executor = RetryExecutor::default();
        let clock = CountingClock(AtomicU32::new(0));
        let calls = AtomicU32::new(0);

        let first: Result<(), _> = executor
            .run(Capability::Account, "test", &clock, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(api(-1002, "You are not authorized to execute this request."))
            })
            .await;
        assert!(matches!(first, Err(ExchangeError::Api { code: -1002, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(executor.is_disabled(Capability::Account));

        let second: Result<(), _> = executor
            .run(Capability::Account, "test", &clock, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(
            second,
            Err(ExchangeError::CapabilityDisabled(Capability::Account))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Other capabilities are unaffected
        assert!(!executor.is_disabled(Capability::Trading));
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_retried() {
        let executor = RetryExecutor::default();
        let clock = CountingClock(AtomicU32::new(0));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .run(Capability::Trading, "test", &clock, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(api(-2019, "Margin is insufficient."))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
