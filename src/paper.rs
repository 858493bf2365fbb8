//! Simulated execution for test-mode trades.
//!
//! Orders fill immediately at the current quote; the fee is the configured
//! rate on the fill notional. Margin is a fixed simulated balance. Nothing
//! reaches the exchange's order endpoints.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::exchange::{ExchangeError, ExecutionGateway, PriceSource, SymbolCatalog};
use crate::orders::{OrderFill, OrderId, OrderState};
use crate::types::{MarginType, OrderSide};

const DEFAULT_PAPER_BALANCE: Decimal = dec!(1_000_000);

/// Where the paper gateway gets symbol metadata from.
enum CatalogSource {
    /// Exchange metadata from a live (possibly unauthenticated) gateway
    Delegate(Arc<dyn ExecutionGateway>),
    Fixed(SymbolCatalog),
}

struct PaperOrder {
    fill: OrderFill,
    fee: Decimal,
}

pub struct PaperGateway {
    prices: Arc<dyn PriceSource>,
    catalog: CatalogSource,
    fee_rate: Decimal,
    balance: Decimal,
    orders: DashMap<OrderId, PaperOrder>,
    next_id: AtomicI64,
}

impl PaperGateway {
    /// Paper gateway reading symbol metadata from `metadata` (which may be an
    /// unauthenticated live client).
    pub fn new(
        prices: Arc<dyn PriceSource>,
        metadata: Arc<dyn ExecutionGateway>,
        fee_rate: Decimal,
    ) -> Self {
        Self::with_source(prices, CatalogSource::Delegate(metadata), fee_rate)
    }

    pub fn with_fixed_catalog(
        prices: Arc<dyn PriceSource>,
        catalog: SymbolCatalog,
        fee_rate: Decimal,
    ) -> Self {
        Self::with_source(prices, CatalogSource::Fixed(catalog), fee_rate)
    }

    fn with_source(prices: Arc<dyn PriceSource>, catalog: CatalogSource, fee_rate: Decimal) -> Self {
        Self {
            prices,
            catalog,
            fee_rate,
            balance: DEFAULT_PAPER_BALANCE,
            orders: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    #[must_use]
    pub fn with_balance(mut self, balance: Decimal) -> Self {
        self.balance = balance;
        self
    }

    fn lookup(&self, order_id: &OrderId) -> Result<OrderFill, ExchangeError> {
        self.orders
            .get(order_id)
            .map(|o| o.fill.clone())
            .ok_or_else(|| ExchangeError::NotFound(format!("paper order {}", order_id)))
    }
}

#[async_trait]
impl ExecutionGateway for PaperGateway {
    async fn symbol_catalog(&self) -> Result<SymbolCatalog, ExchangeError> {
        match &self.catalog {
            CatalogSource::Delegate(gateway) => gateway.symbol_catalog().await,
            CatalogSource::Fixed(catalog) => Ok(catalog.clone()),
        }
    }

    async fn available_margin(&self) -> Result<Decimal, ExchangeError> {
        Ok(self.balance)
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn set_margin_type(
        &self,
        _symbol: &str,
        _margin_type: MarginType,
    ) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Result<OrderFill, ExchangeError> {
        let price = self.prices.ticker_price(symbol).await?;
        let order_id = OrderId::from(self.next_id.fetch_add(1, Ordering::SeqCst));
        let fill = OrderFill {
            order_id: order_id.clone(),
            symbol: symbol.to_string(),
            side,
            state: OrderState::Filled,
            requested_qty: quantity,
            executed_qty: quantity,
            avg_price: Some(price),
        };
        let fee = quantity * price * self.fee_rate;
        info!(
            symbol,
            %side,
            %quantity,
            %price,
            reduce_only,
            order_id = %order_id,
            "Paper order filled"
        );
        self.orders.insert(
            order_id,
            PaperOrder {
                fill: fill.clone(),
                fee,
            },
        );
        Ok(fill)
    }

    async fn get_order(&self, _symbol: &str, order_id: &OrderId) -> Result<OrderFill, ExchangeError> {
        self.lookup(order_id)
    }

    async fn get_fee(&self, _symbol: &str, order_id: &OrderId) -> Result<Decimal, ExchangeError> {
        self.orders
            .get(order_id)
            .map(|o| o.fee)
            .ok_or_else(|| ExchangeError::NotFound(format!("paper order {}", order_id)))
    }
}
