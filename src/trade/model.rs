//! Pair trade records.
//!
//! A [`PairTrade`] owns exactly one long and one short [`Leg`]. Quantities
//! and leverage are fixed at open; everything else on the record is running
//! state refreshed by evaluation and frozen at close.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::TradeError;
use crate::orders::OrderId;
use crate::types::{MarginType, PositionSide};

pub type UserId = String;

/// Engine-assigned trade identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TradeId(String);

impl TradeId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TradeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TradeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TradeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    /// Open sequence in progress
    Pending,
    Active,
    Closed,
    /// Open could not complete and compensation failed
    Failed,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TradeStatus::Pending => "pending",
            TradeStatus::Active => "active",
            TradeStatus::Closed => "closed",
            TradeStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    TrailingStop,
    Manual,
    MaxLoss,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::TakeProfit => "take_profit",
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TrailingStop => "trailing_stop",
            CloseReason::Manual => "manual",
            CloseReason::MaxLoss => "max_loss",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Downside exit policy. Exactly one is in effect at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DownsideExit {
    /// Close when the ratio falls `stop_loss_percent` below entry
    #[default]
    StopLoss,
    /// Profit floor: armed once the favourable excursion reaches
    /// `level_percent`, then closes when the ratio change falls back to it
    TrailingStop { level_percent: Decimal },
}

impl DownsideExit {
    pub fn is_trailing(&self) -> bool {
        matches!(self, DownsideExit::TrailingStop { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSettings {
    /// 1R in quote currency
    pub max_loss: Decimal,
    /// Used for sizing, and for the downside exit in stop-loss mode
    pub stop_loss_percent: Decimal,
    pub take_profit_percent: Decimal,
    #[serde(default)]
    pub downside: DownsideExit,
}

impl RiskSettings {
    pub fn validate(&self) -> Result<(), TradeError> {
        if self.max_loss <= Decimal::ZERO {
            return Err(TradeError::InvalidParameters(format!(
                "max loss must be positive (got {})",
                self.max_loss
            )));
        }
        if self.stop_loss_percent <= Decimal::ZERO || self.stop_loss_percent >= Decimal::ONE_HUNDRED
        {
            return Err(TradeError::InvalidParameters(format!(
                "stop loss percent must be in (0, 100) (got {})",
                self.stop_loss_percent
            )));
        }
        if self.take_profit_percent <= Decimal::ZERO {
            return Err(TradeError::InvalidParameters(format!(
                "take profit percent must be positive (got {})",
                self.take_profit_percent
            )));
        }
        if let DownsideExit::TrailingStop { level_percent } = self.downside {
            if level_percent < Decimal::ZERO {
                return Err(TradeError::InvalidParameters(format!(
                    "trailing stop level must be >= 0 (got {})",
                    level_percent
                )));
            }
            if level_percent >= self.take_profit_percent {
                return Err(TradeError::InvalidParameters(format!(
                    "trailing stop level {} must be below take profit {}",
                    level_percent, self.take_profit_percent
                )));
            }
        }
        Ok(())
    }
}

/// Partial update of an active trade's exit settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsUpdate {
    pub take_profit_percent: Option<Decimal>,
    pub stop_loss_percent: Option<Decimal>,
    pub downside: Option<DownsideExit>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.take_profit_percent.is_none()
            && self.stop_loss_percent.is_none()
            && self.downside.is_none()
    }

    /// Settings after applying this update, validated as a whole.
    pub fn apply_to(&self, current: &RiskSettings) -> Result<RiskSettings, TradeError> {
        let mut next = current.clone();
        if let Some(tp) = self.take_profit_percent {
            next.take_profit_percent = tp;
        }
        if let Some(sl) = self.stop_loss_percent {
            next.stop_loss_percent = sl;
        }
        if let Some(downside) = self.downside {
            next.downside = downside;
        }
        next.validate()?;
        Ok(next)
    }
}

/// Parameters for opening a pair trade.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenTradeRequest {
    pub user_id: UserId,
    /// Display name; generated from the symbols when empty
    pub name: Option<String>,
    pub long_symbol: String,
    pub short_symbol: String,
    pub risk: RiskSettings,
    pub long_leverage: u32,
    pub short_leverage: u32,
    pub margin_type: MarginType,
    /// Route through the simulated gateway
    pub test_mode: bool,
}

/// One side of a pair trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub leverage: u32,
    pub entry_price: Decimal,
    pub entry_order_id: OrderId,
    pub entry_fee: Decimal,
    /// Entry price taken from a quote because the fill was not reported
    #[serde(default)]
    pub entry_price_estimated: bool,
    pub current_price: Decimal,
    #[serde(default)]
    pub exit_price: Option<Decimal>,
    #[serde(default)]
    pub exit_order_id: Option<OrderId>,
    #[serde(default)]
    pub exit_fee: Decimal,
    #[serde(default)]
    pub exit_price_estimated: bool,
    pub pnl: Decimal,
    pub pnl_percent: Decimal,
    pub notional: Decimal,
}

impl Leg {
    /// A freshly opened leg, marked at its entry price.
    pub fn opened(
        symbol: impl Into<String>,
        side: PositionSide,
        quantity: Decimal,
        leverage: u32,
        entry_price: Decimal,
        entry_order_id: OrderId,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            leverage,
            entry_price,
            entry_order_id,
            entry_fee: Decimal::ZERO,
            entry_price_estimated: false,
            current_price: entry_price,
            exit_price: None,
            exit_order_id: None,
            exit_fee: Decimal::ZERO,
            exit_price_estimated: false,
            pnl: Decimal::ZERO,
            pnl_percent: Decimal::ZERO,
            notional: quantity * entry_price,
        }
    }

    /// PnL in quote currency if marked at `price`.
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - price) * self.quantity,
        }
    }

    /// Leveraged return on margin, in percent, if marked at `price`.
    pub fn pnl_percent_at(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        let move_pct = match self.side {
            PositionSide::Long => (price / self.entry_price - Decimal::ONE) * Decimal::ONE_HUNDRED,
            PositionSide::Short => {
                (self.entry_price - price) / self.entry_price * Decimal::ONE_HUNDRED
            }
        };
        move_pct * Decimal::from(self.leverage)
    }

    /// Re-mark the leg at `price`.
    pub fn mark(&mut self, price: Decimal) {
        self.current_price = price;
        self.pnl = self.pnl_at(price);
        self.pnl_percent = self.pnl_percent_at(price);
    }

    pub fn is_closed(&self) -> bool {
        self.exit_order_id.is_some()
    }

    pub fn total_fee(&self) -> Decimal {
        self.entry_fee + self.exit_fee
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairTrade {
    pub id: TradeId,
    pub user_id: UserId,
    pub name: String,
    pub status: TradeStatus,
    pub risk: RiskSettings,
    pub long: Leg,
    pub short: Leg,
    #[serde(default)]
    pub margin_type: MarginType,
    #[serde(default)]
    pub test_mode: bool,

    pub entry_ratio: Decimal,
    pub current_ratio: Decimal,
    pub max_ratio: Decimal,
    pub min_ratio: Decimal,
    /// (current_ratio / entry_ratio - 1) * 100 at the last evaluation
    pub ratio_change_percent: Decimal,
    /// Maximum adverse excursion of the ratio, percent of entry ratio
    pub mae: Decimal,
    /// Maximum favourable excursion of the ratio, percent of entry ratio
    pub mfe: Decimal,

    pub total_pnl: Decimal,
    pub total_entry_fee: Decimal,
    pub total_exit_fee: Decimal,
    pub total_fee: Decimal,
    pub net_pnl: Decimal,
    pub risk_reward_ratio: Decimal,
    pub net_risk_reward_ratio: Decimal,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    /// Set when a close starts; a half-closed active trade keeps it for the retry
    #[serde(default)]
    pub close_reason: Option<CloseReason>,
}

impl PairTrade {
    /// Build the `Pending` record for two filled entry legs.
    pub fn new(
        user_id: impl Into<UserId>,
        name: impl Into<String>,
        risk: RiskSettings,
        long: Leg,
        short: Leg,
        now: DateTime<Utc>,
    ) -> Self {
        let entry_ratio = if short.entry_price.is_zero() {
            Decimal::ZERO
        } else {
            long.entry_price / short.entry_price
        };
        let total_entry_fee = long.entry_fee + short.entry_fee;
        Self {
            id: TradeId::generate(),
            user_id: user_id.into(),
            name: name.into(),
            status: TradeStatus::Pending,
            risk,
            long,
            short,
            margin_type: MarginType::default(),
            test_mode: false,
            entry_ratio,
            current_ratio: entry_ratio,
            max_ratio: entry_ratio,
            min_ratio: entry_ratio,
            ratio_change_percent: Decimal::ZERO,
            mae: Decimal::ZERO,
            mfe: Decimal::ZERO,
            total_pnl: Decimal::ZERO,
            total_entry_fee,
            total_exit_fee: Decimal::ZERO,
            total_fee: total_entry_fee,
            net_pnl: -total_entry_fee,
            risk_reward_ratio: Decimal::ZERO,
            net_risk_reward_ratio: Decimal::ZERO,
            created_at: now,
            updated_at: now,
            closed_at: None,
            close_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TradeStatus::Active
    }

    /// One leg has an exit order while the other is still open.
    pub fn is_partially_closed(&self) -> bool {
        self.long.is_closed() != self.short.is_closed()
    }

    pub fn symbols(&self) -> [&str; 2] {
        [self.long.symbol.as_str(), self.short.symbol.as_str()]
    }

    /// True when both legs carry a usable entry.
    pub fn has_valid_entries(&self) -> bool {
        [&self.long, &self.short]
            .iter()
            .all(|leg| !leg.entry_order_id.is_empty() && leg.entry_price > Decimal::ZERO)
    }

    /// Recompute fee totals, net PnL and R multiples from the legs.
    pub fn recompute_totals(&mut self) {
        self.total_pnl = self.long.pnl + self.short.pnl;
        self.total_entry_fee = self.long.entry_fee + self.short.entry_fee;
        self.total_exit_fee = self.long.exit_fee + self.short.exit_fee;
        self.total_fee = self.total_entry_fee + self.total_exit_fee;
        self.net_pnl = self.total_pnl - self.total_fee;
        if self.risk.max_loss > Decimal::ZERO {
            self.risk_reward_ratio = self.total_pnl / self.risk.max_loss;
            self.net_risk_reward_ratio = self.net_pnl / self.risk.max_loss;
        }
    }

    /// Freeze the record as `Closed`.
    pub fn finalize_close(&mut self, reason: CloseReason, now: DateTime<Utc>) {
        self.recompute_totals();
        self.status = TradeStatus::Closed;
        self.close_reason = Some(reason);
        self.closed_at = Some(now);
        self.updated_at = now;
    }
}

/// Default display name, e.g. `BTC/ETH`.
pub fn default_trade_name(long_symbol: &str, short_symbol: &str) -> String {
    let strip = |s: &str| s.strip_suffix(crate::types::QUOTE_ASSET).unwrap_or(s).to_string();
    format!("{}/{}", strip(long_symbol), strip(short_symbol))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn risk() -> RiskSettings {
        RiskSettings {
            max_loss: dec!(100),
            stop_loss_percent: dec!(5),
            take_profit_percent: dec!(10),
            downside: DownsideExit::StopLoss,
        }
    }

    #[test]
    fn test_leg_pnl_signs() {
        let mut long = Leg::opened("BTCUSDT", PositionSide::Long, dec!(2), 5, dec!(100), OrderId::new("1"));
        let mut short = Leg::opened("ETHUSDT", PositionSide::Short, dec!(2), 5, dec!(100), OrderId::new("2"));

        long.mark(dec!(110));
        short.mark(dec!(110));
        assert_eq!(long.pnl, dec!(20));
        assert_eq!(short.pnl, dec!(-20));
        assert_eq!(long.pnl_percent, dec!(50));
        assert_eq!(short.pnl_percent, dec!(-50));

        short.mark(dec!(90));
        assert_eq!(short.pnl, dec!(20));
        assert_eq!(short.pnl_percent, dec!(50));
    }

    #[test]
    fn test_risk_validation() {
        assert!(risk().validate().is_ok());

        let mut bad = risk();
        bad.max_loss = Decimal::ZERO;
        assert!(bad.validate().is_err());

        let mut bad = risk();
        bad.stop_loss_percent = dec!(100);
        assert!(bad.validate().is_err());

        let mut trailing = risk();
        trailing.downside = DownsideExit::TrailingStop { level_percent: dec!(2) };
        assert!(trailing.validate().is_ok());

        trailing.downside = DownsideExit::TrailingStop { level_percent: dec!(10) };
        assert!(trailing.validate().is_err());

        trailing.downside = DownsideExit::TrailingStop { level_percent: dec!(-1) };
        assert!(trailing.validate().is_err());
    }

    #[test]
    fn test_settings_update_switches_mode() {
        let current = RiskSettings {
            downside: DownsideExit::TrailingStop { level_percent: dec!(2) },
            ..risk()
        };
        let update = SettingsUpdate {
            downside: Some(DownsideExit::StopLoss),
            take_profit_percent: Some(dec!(12)),
            ..Default::default()
        };
        let next = update.apply_to(&current).unwrap();
        assert_eq!(next.downside, DownsideExit::StopLoss);
        assert_eq!(next.take_profit_percent, dec!(12));
        assert_eq!(next.stop_loss_percent, dec!(5));

        let invalid = SettingsUpdate {
            take_profit_percent: Some(dec!(1)),
            ..Default::default()
        };
        assert!(invalid.apply_to(&current).is_err());
    }

    #[test]
    fn test_finalize_close_totals() {
        let mut long = Leg::opened("BTCUSDT", PositionSide::Long, dec!(1), 1, dec!(100), OrderId::new("1"));
        let mut short = Leg::opened("ETHUSDT", PositionSide::Short, dec!(1), 1, dec!(50), OrderId::new("2"));
        long.entry_fee = dec!(0.5);
        short.entry_fee = dec!(0.5);
        let mut trade = PairTrade::new("u1", "BTC/ETH", risk(), long, short, Utc::now());
        assert_eq!(trade.entry_ratio, dec!(2));
        assert_eq!(trade.total_fee, dec!(1));

        trade.long.mark(dec!(90));
        trade.short.mark(dec!(40));
        trade.long.exit_fee = dec!(0.25);
        trade.short.exit_fee = dec!(0.25);
        trade.finalize_close(CloseReason::Manual, Utc::now());

        assert_eq!(trade.total_pnl, dec!(0));
        assert_eq!(trade.total_fee, dec!(1.5));
        assert_eq!(trade.net_pnl, dec!(-1.5));
        assert_eq!(trade.net_risk_reward_ratio, dec!(-0.015));
        assert_eq!(trade.status, TradeStatus::Closed);
    }

    #[test]
    fn test_serde_shape() {
        let json = serde_json::to_value(DownsideExit::TrailingStop { level_percent: dec!(2) }).unwrap();
        assert_eq!(json["mode"], "trailing_stop");
        assert_eq!(serde_json::to_value(CloseReason::TakeProfit).unwrap(), "take_profit");
        assert_eq!(default_trade_name("BTCUSDT", "ETHUSDT"), "BTC/ETH");
    }
}
