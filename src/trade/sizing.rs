//! Position sizing and margin requirements.
//!
//! The position is sized so that a move of `stop_loss_percent` against it
//! costs exactly `max_loss`: `size = max_loss / (stop_loss_percent / 100)`.

use rust_decimal::{Decimal, RoundingStrategy};

use super::TradeError;
use crate::exchange::SymbolRules;

/// Quote-currency notional per leg.
pub fn position_size(max_loss: Decimal, stop_loss_percent: Decimal) -> Result<Decimal, TradeError> {
    if max_loss <= Decimal::ZERO {
        return Err(TradeError::InvalidParameters(format!(
            "max loss must be positive (got {})",
            max_loss
        )));
    }
    if stop_loss_percent <= Decimal::ZERO {
        return Err(TradeError::InvalidParameters(format!(
            "stop loss percent must be positive (got {})",
            stop_loss_percent
        )));
    }
    Ok(max_loss / (stop_loss_percent / Decimal::ONE_HUNDRED))
}

/// Truncate toward zero at `precision` decimal places. Never rounds up.
pub fn round_down(quantity: Decimal, precision: u32) -> Decimal {
    quantity.round_dp_with_strategy(precision, RoundingStrategy::ToZero)
}

/// Order quantity for one leg at `price`, checked against the symbol's rules.
pub fn leg_quantity(
    size: Decimal,
    price: Decimal,
    rules: &SymbolRules,
) -> Result<Decimal, TradeError> {
    if price <= Decimal::ZERO {
        return Err(TradeError::InvalidParameters(format!(
            "price for {} must be positive (got {})",
            rules.symbol, price
        )));
    }
    let quantity = round_down(size / price, rules.quantity_precision);
    if quantity <= Decimal::ZERO {
        return Err(TradeError::InvalidParameters(format!(
            "position size {} is too small for {} at {} (precision {})",
            size, rules.symbol, price, rules.quantity_precision
        )));
    }
    let notional = quantity * price;
    if notional < rules.min_notional {
        return Err(TradeError::InvalidParameters(format!(
            "{} notional {} is below the exchange minimum {}",
            rules.symbol, notional, rules.min_notional
        )));
    }
    Ok(quantity)
}

/// Initial margin for one leg.
pub fn leg_margin(quantity: Decimal, price: Decimal, leverage: u32) -> Decimal {
    if leverage == 0 {
        return quantity * price;
    }
    quantity * price / Decimal::from(leverage)
}

/// Margin pre-check result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarginCheck {
    pub available: Decimal,
    pub required: Decimal,
}

impl MarginCheck {
    pub fn is_sufficient(&self) -> bool {
        self.available >= self.required
    }

    pub fn deficit(&self) -> Decimal {
        (self.required - self.available).max(Decimal::ZERO)
    }

    pub fn ensure(self) -> Result<(), TradeError> {
        if self.is_sufficient() {
            Ok(())
        } else {
            Err(TradeError::InsufficientMargin {
                available: self.available,
                required: self.required,
                deficit: self.deficit(),
            })
        }
    }
}
