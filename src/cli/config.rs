//! CLI configuration structs bridging CLI arguments to domain types.
//!
//! These structs decouple the CLI parsing layer from the trade lifecycle,
//! so command handlers work with validated, typed requests.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::config::TradingConfig;
use crate::trade::{DownsideExit, OpenTradeRequest, RiskSettings, SettingsUpdate};
use crate::types::MarginType;

#[derive(Debug, Error)]
pub enum CliConfigError {
    #[error("{0}")]
    MarginType(String),

    #[error("No settings to change: pass --take-profit, --stop-loss, --trailing-level or --disable-trailing")]
    EmptyUpdate,
}

/// Arguments of the `open` subcommand.
#[derive(Debug, Clone)]
pub struct OpenCliConfig {
    pub user: String,
    pub long: String,
    pub short: String,
    pub max_loss: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub trailing_level: Option<Decimal>,
    pub long_leverage: Option<u32>,
    pub short_leverage: Option<u32>,
    pub margin_type: Option<String>,
    pub name: Option<String>,
    pub test_mode: bool,
}

impl OpenCliConfig {
    /// Fill unset leverage and margin type from `defaults`.
    ///
    /// Range checks on the numbers are left to the trade manager.
    pub fn into_request(self, defaults: &TradingConfig) -> Result<OpenTradeRequest, CliConfigError> {
        let margin_type = match self.margin_type.as_deref() {
            Some(raw) => raw.parse::<MarginType>().map_err(CliConfigError::MarginType)?,
            None => defaults.margin_type,
        };
        let downside = match self.trailing_level {
            Some(level_percent) => DownsideExit::TrailingStop { level_percent },
            None => DownsideExit::StopLoss,
        };
        Ok(OpenTradeRequest {
            user_id: self.user,
            name: self.name,
            long_symbol: self.long,
            short_symbol: self.short,
            risk: RiskSettings {
                max_loss: self.max_loss,
                stop_loss_percent: self.stop_loss,
                take_profit_percent: self.take_profit,
                downside,
            },
            long_leverage: self.long_leverage.unwrap_or(defaults.default_leverage),
            short_leverage: self.short_leverage.unwrap_or(defaults.default_leverage),
            margin_type,
            test_mode: self.test_mode,
        })
    }
}

/// Arguments of the `settings` subcommand.
#[derive(Debug, Clone, Default)]
pub struct SettingsCliConfig {
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub trailing_level: Option<Decimal>,
    pub disable_trailing: bool,
}

impl SettingsCliConfig {
    pub fn into_update(self) -> Result<SettingsUpdate, CliConfigError> {
        let downside = match (self.trailing_level, self.disable_trailing) {
            (Some(level_percent), _) => Some(DownsideExit::TrailingStop { level_percent }),
            (None, true) => Some(DownsideExit::StopLoss),
            (None, false) => None,
        };
        let update = SettingsUpdate {
            take_profit_percent: self.take_profit,
            stop_loss_percent: self.stop_loss,
            downside,
        };
        if update.is_empty() {
            return Err(CliConfigError::EmptyUpdate);
        }
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn open_args() -> OpenCliConfig {
        OpenCliConfig {
            user: "alice".to_string(),
            long: "BTC".to_string(),
            short: "ETH".to_string(),
            max_loss: dec!(100),
            stop_loss: dec!(5),
            take_profit: dec!(10),
            trailing_level: None,
            long_leverage: Some(3),
            short_leverage: None,
            margin_type: None,
            name: None,
            test_mode: false,
        }
    }

    #[test]
    fn test_request_uses_defaults() {
        let defaults = TradingConfig {
            default_leverage: 2,
            ..TradingConfig::default()
        };
        let request = open_args().into_request(&defaults).unwrap();
        assert_eq!(request.long_leverage, 3);
        assert_eq!(request.short_leverage, 2);
        assert_eq!(request.margin_type, MarginType::Isolated);
        assert_eq!(request.risk.downside, DownsideExit::StopLoss);
    }

    #[test]
    fn test_request_trailing_and_margin() {
        let args = OpenCliConfig {
            trailing_level: Some(dec!(2)),
            margin_type: Some("cross".to_string()),
            ..open_args()
        };
        let request = args.into_request(&TradingConfig::default()).unwrap();
        assert_eq!(request.margin_type, MarginType::Crossed);
        assert_eq!(
            request.risk.downside,
            DownsideExit::TrailingStop {
                level_percent: dec!(2)
            }
        );

        let bad = OpenCliConfig {
            margin_type: Some("portfolio".to_string()),
            ..open_args()
        };
        assert!(bad.into_request(&TradingConfig::default()).is_err());
    }

    #[test]
    fn test_settings_update() {
        let update = SettingsCliConfig {
            disable_trailing: true,
            ..Default::default()
        }
        .into_update()
        .unwrap();
        assert_eq!(update.downside, Some(DownsideExit::StopLoss));

        assert!(matches!(
            SettingsCliConfig::default().into_update(),
            Err(CliConfigError::EmptyUpdate)
        ));
    }
}
