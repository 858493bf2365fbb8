//! Exchange error taxonomy.

use thiserror::Error;

/// A group of exchange endpoints that can be disabled for the session.
///
/// When the exchange answers a call with an authorization error the whole
/// capability is switched off, so later calls fail fast instead of
/// repeating a request that can never succeed with these credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// Account balance and margin queries
    Account,
    /// Leverage and margin mode changes
    PositionSettings,
    /// Order placement
    Trading,
    /// Order and fill lookups
    OrderQuery,
    /// Public market data (prices, exchange metadata, server time)
    MarketData,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Capability::Account => "account",
            Capability::PositionSettings => "position_settings",
            Capability::Trading => "trading",
            Capability::OrderQuery => "order_query",
            Capability::MarketData => "market_data",
        };
        f.write_str(s)
    }
}

/// How the retry layer treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Local clock drifted from the exchange: resync, then retry
    TimestampSkew,
    /// Request weight exceeded: back off with jitter, then retry
    RateLimited,
    /// Credentials lack permission: fail fast and disable the capability
    Unauthorized,
    /// Bad parameters or insufficient balance: surface to caller, never retry
    InvalidRequest,
    /// Referenced order or symbol does not exist
    NotFound,
    /// The requested setting is already in effect; treat as success
    NoChange,
    /// Anything else: bounded retry with backoff
    Transient,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::TimestampSkew | ErrorClass::RateLimited | ErrorClass::Transient
        )
    }

    pub fn as_label(self) -> &'static str {
        match self {
            ErrorClass::TimestampSkew => "timestamp_skew",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Unauthorized => "unauthorized",
            ErrorClass::InvalidRequest => "invalid_request",
            ErrorClass::NotFound => "not_found",
            ErrorClass::NoChange => "no_change",
            ErrorClass::Transient => "transient",
        }
    }
}

/// Errors raised by exchange gateways.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Exchange API error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("Failed to decode exchange response: {0}")]
    Decode(String),

    #[error("Capability '{0}' disabled for this session after an authorization failure")]
    CapabilityDisabled(Capability),

    #[error("Exchange credentials not configured")]
    NotConfigured,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Circuit open: {0}")]
    CircuitOpen(String),
}

impl ExchangeError {
    /// Exchange error code, if the failure came back as an API error.
    pub fn code(&self) -> Option<i64> {
        match self {
            ExchangeError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Retry class according to the default exchange classification table.
    pub fn class(&self) -> ErrorClass {
        super::binance::retry::default_classifier().classify(self)
    }
}
