//! Typed REST payloads for the USDT-M futures API.
//!
//! Numeric fields arrive as JSON strings; they are parsed with
//! `rust_decimal`'s string deserializer. Missing optional fields default so
//! a sparse response never reaches trade logic as an untyped map.

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::exchange::{SymbolCatalog, SymbolRules};
use crate::orders::{OrderFill, OrderId, OrderState};
use crate::types::OrderSide;

/// Quantity precision assumed when the exchange omits it.
pub const DEFAULT_QUANTITY_PRECISION: u32 = 3;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTime {
    pub server_time: i64,
}

/// `{"code": -2019, "msg": "Margin is insufficient."}`
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeInfo {
    #[serde(default)]
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub quantity_precision: Option<u32>,
    #[serde(default)]
    pub filters: Vec<serde_json::Value>,
}

impl SymbolInfo {
    fn min_notional(&self) -> Decimal {
        self.filters
            .iter()
            .find(|f| f.get("filterType").and_then(|t| t.as_str()) == Some("MIN_NOTIONAL"))
            .and_then(|f| f.get("notional").or_else(|| f.get("minNotional")))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok())
            .unwrap_or(Decimal::ZERO)
    }

    pub fn to_rules(&self) -> SymbolRules {
        SymbolRules {
            symbol: self.symbol.clone(),
            quantity_precision: self
                .quantity_precision
                .unwrap_or(DEFAULT_QUANTITY_PRECISION),
            min_notional: self.min_notional(),
            trading: self.status.is_empty() || self.status == "TRADING",
        }
    }
}

impl ExchangeInfo {
    pub fn into_catalog(self) -> SymbolCatalog {
        self.symbols
            .iter()
            .map(|s| (s.symbol.clone(), s.to_rules()))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    #[serde(with = "rust_decimal::serde::str")]
    pub available_balance: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    pub symbol: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub side: String,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub orig_qty: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub executed_qty: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub avg_price: Option<Decimal>,
}

impl OrderResponse {
    /// Map into the typed fill report. An average price of zero means "not yet
    /// reported" and becomes `None`.
    pub fn into_fill(self, fallback_side: OrderSide, requested_qty: Decimal) -> OrderFill {
        let side = match self.side.as_str() {
            "BUY" => OrderSide::Buy,
            "SELL" => OrderSide::Sell,
            _ => fallback_side,
        };
        OrderFill {
            order_id: OrderId::from(self.order_id),
            symbol: self.symbol,
            side,
            state: OrderState::from_exchange_status(&self.status),
            requested_qty: self.orig_qty.unwrap_or(requested_qty),
            executed_qty: self.executed_qty.unwrap_or(Decimal::ZERO),
            avg_price: self.avg_price.filter(|p| *p > Decimal::ZERO),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTrade {
    pub order_id: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub commission: Decimal,
    #[serde(default)]
    pub commission_asset: String,
}

#[derive(Debug, Deserialize)]
pub struct TickerPrice {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_exchange_info_to_catalog() {
        let raw = r#"{
            "symbols": [
                {"symbol": "BTCUSDT", "status": "TRADING", "quantityPrecision": 3,
                 "filters": [{"filterType": "MIN_NOTIONAL", "notional": "100"}]},
                {"symbol": "OLDUSDT", "status": "SETTLING", "filters": []}
            ]
        }"#;
        let info: ExchangeInfo = serde_json::from_str(raw).unwrap();
        let catalog = info.into_catalog();

        let btc = &catalog["BTCUSDT"];
        assert_eq!(btc.quantity_precision, 3);
        assert_eq!(btc.min_notional, dec!(100));
        assert!(btc.trading);

        let old = &catalog["OLDUSDT"];
        assert_eq!(old.quantity_precision, DEFAULT_QUANTITY_PRECISION);
        assert_eq!(old.min_notional, Decimal::ZERO);
        assert!(!old.trading);
    }

    #[test]
    fn test_order_response_without_fill_price() {
        let raw = r#"{"orderId": 8389765, "symbol": "ETHUSDT", "status": "NEW",
                      "side": "SELL", "origQty": "1.500", "executedQty": "0", "avgPrice": "0.00"}"#;
        let resp: OrderResponse = serde_json::from_str(raw).unwrap();
        let fill = resp.into_fill(OrderSide::Sell, dec!(1.5));

        assert_eq!(fill.order_id.as_str(), "8389765");
        assert_eq!(fill.state, OrderState::New);
        assert_eq!(fill.avg_price, None);
        assert_eq!(fill.effective_qty(), dec!(1.5));
    }

    #[test]
    fn test_order_response_filled() {
        let raw = r#"{"orderId": 1, "symbol": "BTCUSDT", "status": "FILLED",
                      "side": "BUY", "origQty": "0.010", "executedQty": "0.010", "avgPrice": "50123.5"}"#;
        let resp: OrderResponse = serde_json::from_str(raw).unwrap();
        let fill = resp.into_fill(OrderSide::Buy, dec!(0.01));
        assert_eq!(fill.state, OrderState::Filled);
        assert_eq!(fill.avg_price, Some(dec!(50123.5)));
    }
}
