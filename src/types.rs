//! Common Types Module
//!
//! Shared types used across the codebase to avoid circular dependencies.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Quote asset every pair trade settles in.
pub const QUOTE_ASSET: &str = "USDT";

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side that flattens a position opened with `self`.
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// Wire representation used by the futures REST API.
    pub fn as_api_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// Which side of the pair a leg sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that opens this leg.
    pub fn entry_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Order side that closes this leg.
    pub fn exit_side(self) -> OrderSide {
        self.entry_side().opposite()
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

/// Futures margin mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarginType {
    #[default]
    Isolated,
    Crossed,
}

impl MarginType {
    pub fn as_api_str(self) -> &'static str {
        match self {
            MarginType::Isolated => "ISOLATED",
            MarginType::Crossed => "CROSSED",
        }
    }
}

impl std::str::FromStr for MarginType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ISOLATED" => Ok(Self::Isolated),
            "CROSSED" | "CROSS" => Ok(Self::Crossed),
            other => Err(format!(
                "Unknown margin type: '{}'. Use 'isolated' or 'crossed'",
                other
            )),
        }
    }
}

impl std::fmt::Display for MarginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_api_str())
    }
}

/// Represents a market data update (price tick).
#[derive(Debug, Clone, PartialEq)]
pub struct MarketData {
    /// The trading symbol (e.g., "BTCUSDT").
    pub symbol: String,
    /// The current price.
    pub price: Decimal,
    /// Exchange event time in milliseconds.
    pub timestamp: i64,
}

/// Normalize user input into a quote-margined futures symbol.
///
/// `"btc"` becomes `"BTCUSDT"`; symbols already ending in the quote asset
/// are only upper-cased.
pub fn normalize_symbol(raw: &str) -> String {
    let upper = raw.trim().to_uppercase();
    if upper.ends_with(QUOTE_ASSET) {
        upper
    } else {
        format!("{}{}", upper, QUOTE_ASSET)
    }
}
