//! Engine configuration.
//!
//! Every section has engine defaults, so an empty (or absent) file is a
//! valid configuration. Environment overrides are applied after the file.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::exchange::binance::{BinanceConfig, RetryPolicy};
use crate::price_feed::PriceFeedConfig;
use crate::scheduler::SchedulerConfig;
use crate::trade::{EvaluationOptions, FeeConfig};
use crate::types::MarginType;

pub const DATA_DIR_VAR: &str = "PAIRTRADER_DATA_DIR";
pub const TESTNET_VAR: &str = "PAIRTRADER_TESTNET";

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_HEALTH_PORT: u16 = 8080;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Defaults applied to trades opened from the CLI, plus evaluation switches.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TradingConfig {
    /// Close with `max_loss` once total PnL reaches -1R
    pub max_loss_guard: bool,
    pub default_leverage: u32,
    pub margin_type: MarginType,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            max_loss_guard: false,
            default_leverage: 1,
            margin_type: MarginType::Isolated,
        }
    }
}

impl TradingConfig {
    pub fn evaluation_options(&self) -> EvaluationOptions {
        EvaluationOptions {
            max_loss_guard: self.max_loss_guard,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub price_feed: PriceFeedConfig,
    pub retry: RetryPolicy,
    pub binance: BinanceConfig,
    pub fees: FeeConfig,
    pub trading: TradingConfig,
    /// Directory of the JSON store
    pub data_dir: PathBuf,
    pub health_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            price_feed: PriceFeedConfig::default(),
            retry: RetryPolicy::default(),
            binance: BinanceConfig::default(),
            fees: FeeConfig::default(),
            trading: TradingConfig::default(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            health_port: DEFAULT_HEALTH_PORT,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON config file. Missing sections keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(data)
    }

    /// File (when given) + environment overrides, validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(
            std::env::var(DATA_DIR_VAR).ok(),
            std::env::var(TESTNET_VAR).ok(),
        );
        config.validate()?;
        Ok(config)
    }

    /// Apply `PAIRTRADER_DATA_DIR` / `PAIRTRADER_TESTNET` values.
    pub fn apply_overrides(&mut self, data_dir: Option<String>, testnet: Option<String>) {
        if let Some(dir) = data_dir.filter(|d| !d.trim().is_empty()) {
            self.data_dir = PathBuf::from(dir.trim());
        }
        if testnet.is_some_and(|v| is_truthy(&v)) {
            self.binance = std::mem::take(&mut self.binance).with_testnet_urls();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.price_feed.stream_staleness_ms == 0 {
            return Err(ConfigError::Invalid(
                "price_feed.stream_staleness_ms must be > 0".to_string(),
            ));
        }
        if self.price_feed.pull_ttl() < self.price_feed.stream_staleness() {
            return Err(ConfigError::Invalid(format!(
                "price_feed.pull_ttl_secs ({}s) must not be shorter than the stream staleness bound ({}ms)",
                self.price_feed.pull_ttl_secs, self.price_feed.stream_staleness_ms
            )));
        }
        if self.price_feed.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "price_feed.channel_capacity must be > 0".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.jitter_min < 0.0 || self.retry.jitter_max < self.retry.jitter_min {
            return Err(ConfigError::Invalid(format!(
                "retry jitter range [{}, {}] is invalid",
                self.retry.jitter_min, self.retry.jitter_max
            )));
        }
        if self.binance.time_sync_interval_secs == 0 || self.binance.requests_per_second == 0 {
            return Err(ConfigError::Invalid(
                "binance.time_sync_interval_secs and binance.requests_per_second must be > 0"
                    .to_string(),
            ));
        }
        if self.fees.entry_rate < Decimal::ZERO || self.fees.exit_rate < Decimal::ZERO {
            return Err(ConfigError::Invalid(
                "fee rates cannot be negative".to_string(),
            ));
        }
        if self.trading.default_leverage == 0
            || self.trading.default_leverage > crate::trade::MAX_LEVERAGE
        {
            return Err(ConfigError::Invalid(format!(
                "trading.default_leverage must be in 1..={} (got {})",
                crate::trade::MAX_LEVERAGE,
                self.trading.default_leverage
            )));
        }
        Ok(())
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.tick_interval_ms, 1000);
        assert_eq!(config.price_feed.pull_ttl_secs, 900);
        assert_eq!(config.fees.exit_rate, dec!(0.0005));
        assert!(!config.trading.max_loss_guard);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "scheduler": {{ "tick_interval_ms": 500 }}, "trading": {{ "max_loss_guard": true, "margin_type": "CROSSED" }} }}"#
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.scheduler.tick_interval_ms, 500);
        assert_eq!(config.scheduler.error_pause_secs, 5);
        assert!(config.trading.max_loss_guard);
        assert_eq!(config.trading.margin_type, MarginType::Crossed);
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(EngineConfig::from_json("  ").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = EngineConfig::from_file(Path::new("/nonexistent/pairtrader.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_overrides() {
        let mut config = EngineConfig::default();
        config.apply_overrides(Some("/var/lib/pairtrader".to_string()), Some("1".to_string()));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/pairtrader"));
        assert_eq!(config.binance, BinanceConfig::testnet());

        let mut untouched = EngineConfig::default();
        untouched.apply_overrides(Some("  ".to_string()), Some("0".to_string()));
        assert_eq!(untouched, EngineConfig::default());
    }

    #[test]
    fn test_validation_rejects() {
        let mut config = EngineConfig::default();
        config.scheduler.tick_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.price_feed.pull_ttl_secs = 1;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.fees.entry_rate = dec!(-0.0001);
        assert!(config.validate().is_err());
    }
}
