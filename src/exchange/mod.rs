//! Exchange Abstraction Layer
//!
//! Exchange-agnostic traits consumed by the price feed and the trade
//! lifecycle. The Binance USDT-M futures implementation lives in [`binance`];
//! the simulated gateway used for test-mode trades lives in `crate::paper`.

pub mod binance;
mod error;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use crate::orders::{OrderFill, OrderId};
pub use crate::types::{MarginType, MarketData, OrderSide};
pub use error::{Capability, ErrorClass, ExchangeError};

/// Trading rules for one futures symbol, taken from exchange metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolRules {
    pub symbol: String,
    /// Number of decimal places allowed in order quantities
    pub quantity_precision: u32,
    /// Minimum order notional in quote currency
    pub min_notional: Decimal,
    /// False when the symbol is listed but not currently trading
    pub trading: bool,
}

/// Map of symbol -> rules for every symbol the exchange lists.
pub type SymbolCatalog = HashMap<String, SymbolRules>;

/// Authenticated order and account operations for one account.
///
/// Every call goes through the implementation's retry policy; an `Err`
/// means the retry budget is exhausted or the error is not retryable.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    /// Exchange metadata for all listed symbols
    async fn symbol_catalog(&self) -> Result<SymbolCatalog, ExchangeError>;

    /// Margin currently available for new positions (quote currency)
    async fn available_margin(&self) -> Result<Decimal, ExchangeError>;

    /// Set leverage for a symbol. Idempotent.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;

    /// Set margin mode for a symbol. "Already in this mode" is success.
    async fn set_margin_type(&self, symbol: &str, margin_type: MarginType)
        -> Result<(), ExchangeError>;

    /// Submit a market order and poll briefly for the actual fill.
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Result<OrderFill, ExchangeError>;

    /// Look up an existing order
    async fn get_order(&self, symbol: &str, order_id: &OrderId) -> Result<OrderFill, ExchangeError>;

    /// Sum of commissions paid on an order, in quote currency.
    ///
    /// Returns `ExchangeError::NotFound` when the exchange reports no fills.
    async fn get_fee(&self, symbol: &str, order_id: &OrderId) -> Result<Decimal, ExchangeError>;
}

/// Pull-based price lookups.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Latest traded price for a symbol, fetched from the exchange.
    async fn ticker_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;
}

/// Streaming quote channel.
#[async_trait]
pub trait QuoteStream: Send + Sync {
    /// Spawn a background task that streams quotes for `symbols` into `sender`,
    /// reconnecting on its own until aborted or until the receiver is dropped.
    async fn spawn_stream(
        &self,
        symbols: Vec<String>,
        sender: mpsc::Sender<MarketData>,
    ) -> Result<JoinHandle<()>, ExchangeError>;
}
