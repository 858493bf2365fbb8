//! Core types for order management.
//!
//! Typed views of exchange orders. Loosely structured exchange payloads are
//! mapped into these at the gateway boundary so trade logic never touches raw JSON.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::OrderSide;

/// Type-safe order identifier (exchange-assigned).
///
/// # Example
///
/// ```
/// use pairtrader::orders::OrderId;
///
/// let id = OrderId::new("8389765");
/// assert_eq!(id.as_str(), "8389765");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let s: String = id.into();
        if s.is_empty() {
            tracing::warn!("Creating OrderId with empty string - this may cause tracking issues");
        }
        Self(s)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for OrderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<i64> for OrderId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

/// Order lifecycle states as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    /// Accepted, no fills yet
    New,
    /// Some quantity executed
    PartiallyFilled,
    /// All quantity executed
    Filled,
    Cancelled,
    Rejected,
    Expired,
    /// Status string the engine does not recognise
    Unknown,
}

impl OrderState {
    /// Map the exchange's status string (`NEW`, `FILLED`, ...) to a state.
    pub fn from_exchange_status(status: &str) -> Self {
        match status {
            "NEW" => Self::New,
            "PARTIALLY_FILLED" => Self::PartiallyFilled,
            "FILLED" => Self::Filled,
            "CANCELED" | "CANCELLED" => Self::Cancelled,
            "REJECTED" => Self::Rejected,
            "EXPIRED" | "EXPIRED_IN_MATCH" => Self::Expired,
            _ => Self::Unknown,
        }
    }

    /// Returns true if order is in a terminal state (no further updates expected).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired
        )
    }

    /// Returns true if some quantity was executed.
    pub fn has_fills(&self) -> bool {
        matches!(self, Self::Filled | Self::PartiallyFilled)
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "New",
            Self::PartiallyFilled => "PartiallyFilled",
            Self::Filled => "Filled",
            Self::Cancelled => "Cancelled",
            Self::Rejected => "Rejected",
            Self::Expired => "Expired",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Result of placing or polling a market order.
///
/// `avg_price` is `None` when the exchange has not yet reported the fill;
/// callers must then substitute a quote and mark the price as estimated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: OrderId,
    pub symbol: String,
    pub side: OrderSide,
    pub state: OrderState,
    /// Quantity requested at submission
    pub requested_qty: Decimal,
    /// Quantity executed so far
    pub executed_qty: Decimal,
    /// Volume-weighted average fill price
    pub avg_price: Option<Decimal>,
}

impl OrderFill {
    /// Executed quantity, or the requested quantity if the exchange reported none yet.
    pub fn effective_qty(&self) -> Decimal {
        if self.executed_qty > Decimal::ZERO {
            self.executed_qty
        } else {
            self.requested_qty
        }
    }

    /// True when the exchange confirmed a positive average fill price.
    pub fn has_fill_price(&self) -> bool {
        matches!(self.avg_price, Some(p) if p > Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_id_newtype() {
        let id = OrderId::new("abc-123");
        assert_eq!(id.as_str(), "abc-123");
        assert_eq!(id.to_string(), "abc-123");

        let id2: OrderId = 8_389_765_i64.into();
        assert_eq!(id2.as_str(), "8389765");
    }

    #[test]
    fn test_order_state_mapping() {
        assert_eq!(OrderState::from_exchange_status("FILLED"), OrderState::Filled);
        assert_eq!(
            OrderState::from_exchange_status("PARTIALLY_FILLED"),
            OrderState::PartiallyFilled
        );
        assert_eq!(OrderState::from_exchange_status("CANCELED"), OrderState::Cancelled);
        assert_eq!(OrderState::from_exchange_status("???"), OrderState::Unknown);
        assert!(OrderState::Filled.is_terminal());
        assert!(!OrderState::New.is_terminal());
        assert!(OrderState::PartiallyFilled.has_fills());
    }

    #[test]
    fn test_order_fill_effective_qty() {
        let mut fill = OrderFill {
            order_id: OrderId::new("1"),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            state: OrderState::New,
            requested_qty: dec!(0.5),
            executed_qty: Decimal::ZERO,
            avg_price: None,
        };
        assert_eq!(fill.effective_qty(), dec!(0.5));
        assert!(!fill.has_fill_price());

        fill.executed_qty = dec!(0.4);
        fill.avg_price = Some(dec!(50000));
        assert_eq!(fill.effective_qty(), dec!(0.4));
        assert!(fill.has_fill_price());
    }
}
