//! Trade lifecycle manager.
//!
//! Opens a pair trade as one sequence (validate, size, margin check, long
//! leg, short leg, compensation on short failure), re-marks active trades on
//! every tick and executes closes. All exchange access goes through the
//! caller's [`AccountSession`].

use chrono::Utc;
use dashmap::DashSet;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::evaluation::{evaluate, Evaluation, EvaluationOptions};
use super::model::{
    default_trade_name, CloseReason, Leg, OpenTradeRequest, PairTrade, SettingsUpdate, TradeId,
    TradeStatus,
};
use super::sizing::{leg_margin, leg_quantity, position_size, MarginCheck};
use super::TradeError;
use crate::collaborators::{NotificationSink, Persistence, Severity};
use crate::exchange::{
    ExchangeError, ExecutionGateway, OrderFill, OrderId, SymbolCatalog, SymbolRules,
};
use crate::metrics;
use crate::price_feed::PullMode;
use crate::registry::AccountSession;
use crate::types::{normalize_symbol, OrderSide, PositionSide};

/// Highest leverage accepted on a leg.
pub const MAX_LEVERAGE: u32 = 125;

/// Fee-rate estimates used when the realised fee of an order cannot be read.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeeConfig {
    pub entry_rate: Decimal,
    pub exit_rate: Decimal,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            entry_rate: dec!(0.0004),
            exit_rate: dec!(0.0005),
        }
    }
}

/// Exclusive right to close one trade. Released on drop.
#[derive(Debug)]
pub struct CloseClaim {
    id: TradeId,
    closing: Arc<DashSet<TradeId>>,
}

impl CloseClaim {
    pub fn trade_id(&self) -> &TradeId {
        &self.id
    }
}

impl Drop for CloseClaim {
    fn drop(&mut self) {
        self.closing.remove(&self.id);
    }
}

pub struct TradeManager {
    store: Arc<dyn Persistence>,
    notifier: Arc<dyn NotificationSink>,
    fees: FeeConfig,
    options: EvaluationOptions,
    /// Trades with a close in flight; evaluation skips them
    closing: Arc<DashSet<TradeId>>,
}

impl TradeManager {
    pub fn new(store: Arc<dyn Persistence>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            store,
            notifier,
            fees: FeeConfig::default(),
            options: EvaluationOptions::default(),
            closing: Arc::new(DashSet::new()),
        }
    }

    #[must_use]
    pub fn with_fees(mut self, fees: FeeConfig) -> Self {
        self.fees = fees;
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: EvaluationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    pub fn fees(&self) -> &FeeConfig {
        &self.fees
    }

    // --- Open ---

    /// Open a pair trade: long leg first, then short leg.
    ///
    /// A short-leg failure triggers exactly one reduce-only close of the
    /// filled long quantity before this returns. If that close fails as
    /// well the trade is archived as `Failed` and a critical notification
    /// names the position to flatten by hand.
    #[instrument(
        skip(self, session, request),
        fields(user_id = %request.user_id, long = %request.long_symbol, short = %request.short_symbol)
    )]
    pub async fn open_trade(
        &self,
        session: &AccountSession,
        request: OpenTradeRequest,
    ) -> Result<PairTrade, TradeError> {
        let long_symbol = normalize_symbol(&request.long_symbol);
        let short_symbol = normalize_symbol(&request.short_symbol);
        if long_symbol == short_symbol {
            return Err(TradeError::SameSymbol(long_symbol));
        }
        request.risk.validate()?;
        for leverage in [request.long_leverage, request.short_leverage] {
            if !(1..=MAX_LEVERAGE).contains(&leverage) {
                return Err(TradeError::InvalidParameters(format!(
                    "leverage must be between 1 and {} (got {})",
                    MAX_LEVERAGE, leverage
                )));
            }
        }
        if !session.can_execute(request.test_mode) {
            return Err(ExchangeError::NotConfigured.into());
        }
        let gateway = session.gateway_for(request.test_mode).as_ref();

        let catalog = gateway.symbol_catalog().await?;
        let long_rules = tradable(&catalog, &long_symbol)?;
        let short_rules = tradable(&catalog, &short_symbol)?;

        let long_quote = quote(session, &long_symbol).await?;
        let short_quote = quote(session, &short_symbol).await?;

        let size = position_size(request.risk.max_loss, request.risk.stop_loss_percent)?;
        let long_qty = leg_quantity(size, long_quote, long_rules)?;
        let short_qty = leg_quantity(size, short_quote, short_rules)?;

        let required = leg_margin(long_qty, long_quote, request.long_leverage)
            + leg_margin(short_qty, short_quote, request.short_leverage);
        let available = gateway.available_margin().await?;
        MarginCheck {
            available,
            required,
        }
        .ensure()?;

        for (symbol, leverage) in [
            (&long_symbol, request.long_leverage),
            (&short_symbol, request.short_leverage),
        ] {
            gateway.set_margin_type(symbol, request.margin_type).await?;
            gateway.set_leverage(symbol, leverage).await?;
        }

        info!(%size, %long_qty, %short_qty, %required, %available, "Submitting pair entry");

        let long_fill = gateway
            .place_market_order(&long_symbol, OrderSide::Buy, long_qty, false)
            .await
            .map_err(|source| TradeError::LongLegFailed {
                symbol: long_symbol.clone(),
                source,
            })?;

        let short_fill = match gateway
            .place_market_order(&short_symbol, OrderSide::Sell, short_qty, false)
            .await
        {
            Ok(fill) => fill,
            Err(source) => {
                return Err(self
                    .compensate_long(gateway, &request, &long_fill, long_quote, &short_symbol, short_quote, source)
                    .await);
            }
        };

        let long = self
            .entry_leg(gateway, &long_fill, PositionSide::Long, request.long_leverage, long_quote)
            .await;
        let short = self
            .entry_leg(gateway, &short_fill, PositionSide::Short, request.short_leverage, short_quote)
            .await;

        let mut trade = PairTrade::new(
            request.user_id.clone(),
            trade_name(&request, &long_symbol, &short_symbol),
            request.risk.clone(),
            long,
            short,
            Utc::now(),
        );
        trade.margin_type = request.margin_type;
        trade.test_mode = request.test_mode;
        trade.status = TradeStatus::Active;

        if let Err(e) = self.store.save_trade(&trade).await {
            error!(
                trade_id = %trade.id,
                error = %e,
                "CRITICAL: Both legs are open but the trade could not be persisted. MANUAL INTERVENTION REQUIRED."
            );
            self.notify(
                &trade.user_id,
                "Trade not recorded",
                &format!(
                    "Trade {} ({}) is open on the exchange but could not be saved: {}",
                    trade.name, trade.id, e
                ),
                Severity::Critical,
            )
            .await;
            return Err(e.into());
        }

        metrics::record_trade_opened();
        metrics::set_trade_pnl(trade.id.as_str(), trade.net_pnl.to_f64().unwrap_or(0.0));
        info!(
            trade_id = %trade.id,
            entry_ratio = %trade.entry_ratio,
            entry_fee = %trade.total_entry_fee,
            test_mode = trade.test_mode,
            "Pair trade opened"
        );
        self.notify(
            &trade.user_id,
            "Pair trade opened",
            &format!(
                "{}: long {} {} @ {}, short {} {} @ {}",
                trade.name,
                trade.long.quantity,
                trade.long.symbol,
                trade.long.entry_price,
                trade.short.quantity,
                trade.short.symbol,
                trade.short.entry_price
            ),
            Severity::Info,
        )
        .await;
        Ok(trade)
    }

    /// Close the filled long leg after the short leg failed.
    #[allow(clippy::too_many_arguments)]
    async fn compensate_long(
        &self,
        gateway: &dyn ExecutionGateway,
        request: &OpenTradeRequest,
        long_fill: &OrderFill,
        long_quote: Decimal,
        short_symbol: &str,
        short_quote: Decimal,
        short_error: ExchangeError,
    ) -> TradeError {
        let quantity = long_fill.effective_qty();
        let long_symbol = long_fill.symbol.clone();
        error!(
            symbol = %short_symbol,
            error = %short_error,
            long_symbol = %long_symbol,
            %quantity,
            "Short leg failed after long leg filled; closing long leg back"
        );

        match gateway
            .place_market_order(&long_symbol, OrderSide::Sell, quantity, true)
            .await
        {
            Ok(fill) => {
                metrics::record_compensation("closed");
                warn!(
                    order_id = %fill.order_id,
                    symbol = %long_symbol,
                    %quantity,
                    "Long leg closed back, no exposure left"
                );
                self.notify(
                    &request.user_id,
                    "Pair trade not opened",
                    &format!(
                        "Short leg {} failed ({}). The long leg ({} {}) was closed back.",
                        short_symbol, short_error, quantity, long_symbol
                    ),
                    Severity::Warning,
                )
                .await;
                TradeError::ShortLegCompensated {
                    symbol: short_symbol.to_string(),
                    source: short_error,
                }
            }
            Err(compensation_error) => {
                metrics::record_compensation("failed");
                let now = Utc::now();

                let mut long = Leg::opened(
                    long_symbol.clone(),
                    PositionSide::Long,
                    quantity,
                    request.long_leverage,
                    long_fill.avg_price.filter(|p| *p > Decimal::ZERO).unwrap_or(long_quote),
                    long_fill.order_id.clone(),
                );
                long.entry_price_estimated = !long_fill.has_fill_price();
                let short = Leg::opened(
                    short_symbol,
                    PositionSide::Short,
                    Decimal::ZERO,
                    request.short_leverage,
                    short_quote,
                    OrderId::new(""),
                );
                let mut failed = PairTrade::new(
                    request.user_id.clone(),
                    trade_name(request, &long_symbol, short_symbol),
                    request.risk.clone(),
                    long,
                    short,
                    now,
                );
                failed.margin_type = request.margin_type;
                failed.test_mode = request.test_mode;
                failed.status = TradeStatus::Failed;
                failed.closed_at = Some(now);

                error!(
                    trade_id = %failed.id,
                    symbol = %long_symbol,
                    side = %OrderSide::Sell,
                    %quantity,
                    error = %compensation_error,
                    "CRITICAL: Compensating close failed, long leg left open. MANUAL INTERVENTION REQUIRED."
                );
                if let Err(e) = self.store.archive_closed_trade(&failed).await {
                    error!(trade_id = %failed.id, error = %e, "Failed to record failed trade");
                }
                self.notify(
                    &request.user_id,
                    "MANUAL INTERVENTION REQUIRED",
                    &format!(
                        "Trade {} failed: short leg {} was rejected ({}) and closing the long leg \
                         failed ({}). Close manually: SELL {} {} (reduce-only).",
                        failed.id,
                        short_symbol,
                        short_error,
                        compensation_error,
                        quantity,
                        long_symbol
                    ),
                    Severity::Critical,
                )
                .await;

                TradeError::CompensationFailed {
                    trade_id: failed.id.to_string(),
                    long_symbol,
                    quantity,
                    source: compensation_error,
                }
            }
        }
    }

    async fn entry_leg(
        &self,
        gateway: &dyn ExecutionGateway,
        fill: &OrderFill,
        side: PositionSide,
        leverage: u32,
        quote: Decimal,
    ) -> Leg {
        let (price, estimated) = match fill.avg_price {
            Some(price) if price > Decimal::ZERO => (price, false),
            _ => {
                warn!(
                    symbol = %fill.symbol,
                    order_id = %fill.order_id,
                    %quote,
                    "Fill price not reported, using pre-trade quote"
                );
                (quote, true)
            }
        };
        let mut leg = Leg::opened(
            fill.symbol.clone(),
            side,
            fill.effective_qty(),
            leverage,
            price,
            fill.order_id.clone(),
        );
        leg.entry_price_estimated = estimated;
        leg.entry_fee = self
            .resolve_fee(gateway, fill, price, self.fees.entry_rate)
            .await;
        leg
    }

    /// Realised fee of `fill`, or the rate estimate when it cannot be read.
    async fn resolve_fee(
        &self,
        gateway: &dyn ExecutionGateway,
        fill: &OrderFill,
        price: Decimal,
        fallback_rate: Decimal,
    ) -> Decimal {
        match gateway.get_fee(&fill.symbol, &fill.order_id).await {
            Ok(fee) => fee,
            Err(e) => {
                let estimate = fill.effective_qty() * price * fallback_rate;
                debug!(
                    symbol = %fill.symbol,
                    order_id = %fill.order_id,
                    error = %e,
                    %estimate,
                    "Fee lookup failed, using rate estimate"
                );
                estimate
            }
        }
    }

    // --- Evaluate ---

    /// Re-mark `trade` and persist the running fields, whether or not a
    /// close is signalled. The caller acts on the returned decision.
    pub async fn evaluate_and_persist(
        &self,
        mut trade: PairTrade,
        long_price: Decimal,
        short_price: Decimal,
    ) -> Result<(PairTrade, Evaluation), TradeError> {
        if long_price <= Decimal::ZERO || short_price <= Decimal::ZERO {
            return Err(TradeError::InvalidParameters(format!(
                "non-positive price for trade {} ({} / {})",
                trade.id, long_price, short_price
            )));
        }
        let evaluation = evaluate(&mut trade, long_price, short_price, self.options, Utc::now());
        self.store.save_trade(&trade).await?;
        metrics::set_trade_pnl(trade.id.as_str(), trade.net_pnl.to_f64().unwrap_or(0.0));

        if let Some(reason) = evaluation.close_reason {
            info!(
                trade_id = %trade.id,
                %reason,
                change = %evaluation.ratio_change_percent,
                mfe = %trade.mfe,
                "Close condition met"
            );
        }
        Ok((trade, evaluation))
    }

    // --- Close ---

    /// Claim `id` for closing. `None` if a close is already in flight.
    pub fn try_claim_close(&self, id: &TradeId) -> Option<CloseClaim> {
        self.closing.insert(id.clone()).then(|| CloseClaim {
            id: id.clone(),
            closing: Arc::clone(&self.closing),
        })
    }

    pub fn is_closing(&self, id: &TradeId) -> bool {
        self.closing.contains(id)
    }

    pub fn in_flight_closes(&self) -> usize {
        self.closing.len()
    }

    pub async fn close_trade(
        &self,
        session: &AccountSession,
        trade: PairTrade,
        reason: CloseReason,
    ) -> Result<PairTrade, TradeError> {
        let claim = self
            .try_claim_close(&trade.id)
            .ok_or_else(|| TradeError::CloseInProgress(trade.id.to_string()))?;
        self.close_trade_claimed(session, trade, reason, &claim).await
    }

    /// Close both legs (long, then short) and archive the finalized record.
    ///
    /// Legs that already carry an exit order are skipped, so a close retried
    /// after a partial failure only touches the leg still open.
    #[instrument(skip(self, session, trade, _claim), fields(trade_id = %trade.id, %reason))]
    pub async fn close_trade_claimed(
        &self,
        session: &AccountSession,
        mut trade: PairTrade,
        reason: CloseReason,
        _claim: &CloseClaim,
    ) -> Result<PairTrade, TradeError> {
        if !trade.is_active() {
            return Err(TradeError::NotActive(trade.id.to_string()));
        }
        if !session.can_execute(trade.test_mode) {
            return Err(ExchangeError::NotConfigured.into());
        }
        let gateway = session.gateway_for(trade.test_mode).as_ref();
        // Persisted with the first closed leg so a retry keeps the reason
        trade.close_reason = Some(reason);

        for side in [PositionSide::Long, PositionSide::Short] {
            let leg = leg_of(&trade, side);
            if leg.is_closed() {
                continue;
            }
            let symbol = leg.symbol.clone();
            let quantity = leg.quantity;
            let entry_price = leg.entry_price;

            let fill = match gateway
                .place_market_order(&symbol, side.exit_side(), quantity, true)
                .await
            {
                Ok(fill) => fill,
                Err(source) => {
                    if !trade.long.is_closed() && !trade.short.is_closed() {
                        warn!(symbol = %symbol, error = %source, "Close failed, both legs still open");
                        return Err(source.into());
                    }
                    return Err(self.partial_close(&trade, &symbol, source).await);
                }
            };

            let (price, estimated) = self.exit_price(session, &fill, entry_price).await;
            let fee = self
                .resolve_fee(gateway, &fill, price, self.fees.exit_rate)
                .await;

            let leg = leg_of_mut(&mut trade, side);
            leg.mark(price);
            leg.exit_price = Some(price);
            leg.exit_order_id = Some(fill.order_id.clone());
            leg.exit_fee = fee;
            leg.exit_price_estimated = estimated;
            trade.recompute_totals();
            trade.updated_at = Utc::now();

            info!(symbol = %symbol, %side, %price, %fee, estimated, "Leg closed");
            if let Err(e) = self.store.save_trade(&trade).await {
                warn!(error = %e, "Failed to persist closed leg");
            }
        }

        trade.finalize_close(reason, Utc::now());
        if let Err(e) = self.store.archive_closed_trade(&trade).await {
            error!(error = %e, "Trade closed on exchange but archiving failed");
            return Err(e.into());
        }

        metrics::record_trade_closed(reason.as_str());
        metrics::remove_trade_pnl(trade.id.as_str());
        info!(
            total_pnl = %trade.total_pnl,
            total_fee = %trade.total_fee,
            net_pnl = %trade.net_pnl,
            net_r = %trade.net_risk_reward_ratio.round_dp(2),
            mae = %trade.mae,
            mfe = %trade.mfe,
            "Pair trade closed"
        );
        self.notify(
            &trade.user_id,
            "Pair trade closed",
            &format!(
                "{} closed ({}): net PnL {} ({}R)",
                trade.name,
                reason,
                trade.net_pnl.round_dp(2),
                trade.net_risk_reward_ratio.round_dp(2)
            ),
            Severity::Info,
        )
        .await;
        Ok(trade)
    }

    /// Fill price, else a fresh quote, else the entry price. The flag is set
    /// whenever the price did not come from the fill.
    async fn exit_price(
        &self,
        session: &AccountSession,
        fill: &OrderFill,
        entry_price: Decimal,
    ) -> (Decimal, bool) {
        if let Some(price) = fill.avg_price.filter(|p| *p > Decimal::ZERO) {
            return (price, false);
        }
        match session.price_feed.pull(&fill.symbol, PullMode::Fresh).await {
            Ok(price) => {
                warn!(symbol = %fill.symbol, %price, "Exit fill price not reported, using fresh quote");
                (price, true)
            }
            Err(e) => {
                warn!(
                    symbol = %fill.symbol,
                    error = %e,
                    "Exit fill price and quote unavailable, using entry price"
                );
                (entry_price, true)
            }
        }
    }

    async fn partial_close(
        &self,
        trade: &PairTrade,
        open_symbol: &str,
        source: ExchangeError,
    ) -> TradeError {
        error!(
            trade_id = %trade.id,
            open_leg = %open_symbol,
            error = %source,
            "CRITICAL: Close only partially completed, one leg still open. MANUAL INTERVENTION REQUIRED."
        );
        self.notify(
            &trade.user_id,
            "MANUAL INTERVENTION REQUIRED",
            &format!(
                "Trade {} ({}) is half closed: the {} leg could not be closed ({}). \
                 The trade stays active and the close will be retried.",
                trade.name, trade.id, open_symbol, source
            ),
            Severity::Critical,
        )
        .await;
        TradeError::PartialClose {
            trade_id: trade.id.to_string(),
            open_leg: open_symbol.to_string(),
            source,
        }
    }

    /// Manual close of an active trade.
    pub async fn close_by_id(
        &self,
        session: &AccountSession,
        user_id: &str,
        trade_id: &TradeId,
    ) -> Result<PairTrade, TradeError> {
        let trade = self.load_active(user_id, trade_id).await?;
        self.close_trade(session, trade, CloseReason::Manual).await
    }

    // --- Settings ---

    /// Change take-profit, stop-loss percent or the downside mode of an
    /// active trade. Open legs are not resized.
    pub async fn update_settings(
        &self,
        user_id: &str,
        trade_id: &TradeId,
        update: SettingsUpdate,
    ) -> Result<PairTrade, TradeError> {
        if update.is_empty() {
            return Err(TradeError::InvalidParameters(
                "no settings to update".to_string(),
            ));
        }
        let mut trade = self.load_active(user_id, trade_id).await?;
        trade.risk = update.apply_to(&trade.risk)?;
        trade.updated_at = Utc::now();
        self.store.save_trade(&trade).await?;
        info!(
            trade_id = %trade.id,
            take_profit = %trade.risk.take_profit_percent,
            stop_loss = %trade.risk.stop_loss_percent,
            trailing = trade.risk.downside.is_trailing(),
            "Trade settings updated"
        );
        Ok(trade)
    }

    async fn load_active(&self, user_id: &str, trade_id: &TradeId) -> Result<PairTrade, TradeError> {
        let trade = self
            .store
            .load_trade(user_id, trade_id)
            .await?
            .ok_or_else(|| TradeError::NotFound(trade_id.to_string()))?;
        if !trade.is_active() {
            return Err(TradeError::NotActive(trade_id.to_string()));
        }
        Ok(trade)
    }

    async fn notify(&self, user_id: &str, title: &str, message: &str, severity: Severity) {
        if let Err(e) = self.notifier.notify(user_id, title, message, severity).await {
            warn!(user_id, error = %e, "Notification delivery failed");
        }
    }
}

fn tradable<'a>(catalog: &'a SymbolCatalog, symbol: &str) -> Result<&'a SymbolRules, TradeError> {
    catalog
        .get(symbol)
        .filter(|rules| rules.trading)
        .ok_or_else(|| TradeError::UnknownSymbol(symbol.to_string()))
}

async fn quote(session: &AccountSession, symbol: &str) -> Result<Decimal, TradeError> {
    session
        .price_feed
        .get_price(symbol)
        .await
        .map_err(|source| TradeError::PriceUnavailable {
            symbol: symbol.to_string(),
            source,
        })
}

fn trade_name(request: &OpenTradeRequest, long_symbol: &str, short_symbol: &str) -> String {
    request
        .name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| default_trade_name(long_symbol, short_symbol))
}

fn leg_of(trade: &PairTrade, side: PositionSide) -> &Leg {
    match side {
        PositionSide::Long => &trade.long,
        PositionSide::Short => &trade.short,
    }
}

fn leg_of_mut(trade: &mut PairTrade, side: PositionSide) -> &mut Leg {
    match side {
        PositionSide::Long => &mut trade.long,
        PositionSide::Short => &mut trade.short,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{MemoryStore, NotifyError};
    use crate::exchange::PriceSource;
    use crate::orders::OrderState;
    use crate::price_feed::{PriceFeed, PriceFeedConfig};
    use crate::trade::{DownsideExit, RiskSettings};
    use crate::types::MarginType;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    // --- Scripted collaborators ---

    #[derive(Debug, Clone, PartialEq)]
    struct Submitted {
        symbol: String,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    }

    #[derive(Default)]
    struct ScriptedGateway {
        prices: Mutex<HashMap<String, Decimal>>,
        /// (symbol, reduce_only) combinations that get rejected
        reject: Mutex<HashSet<(String, bool)>>,
        orders: Mutex<Vec<Submitted>>,
        margin: Mutex<Decimal>,
        report_fill_price: bool,
    }

    impl ScriptedGateway {
        fn new() -> Self {
            let gateway = Self {
                report_fill_price: true,
                ..Default::default()
            };
            *gateway.margin.lock().unwrap() = dec!(100000);
            gateway.set_price("BTCUSDT", dec!(50000));
            gateway.set_price("ETHUSDT", dec!(3000));
            gateway
        }

        fn set_price(&self, symbol: &str, price: Decimal) {
            self.prices.lock().unwrap().insert(symbol.to_string(), price);
        }

        fn reject(&self, symbol: &str, reduce_only: bool) {
            self.reject
                .lock()
                .unwrap()
                .insert((symbol.to_string(), reduce_only));
        }

        fn orders(&self) -> Vec<Submitted> {
            self.orders.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PriceSource for ScriptedGateway {
        async fn ticker_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
            self.prices
                .lock()
                .unwrap()
                .get(symbol)
                .copied()
                .ok_or_else(|| ExchangeError::NotFound(symbol.to_string()))
        }
    }

    #[async_trait]
    impl ExecutionGateway for ScriptedGateway {
        async fn symbol_catalog(&self) -> Result<SymbolCatalog, ExchangeError> {
            let mut catalog = SymbolCatalog::new();
            for (symbol, precision) in [("BTCUSDT", 3), ("ETHUSDT", 3), ("DELISTEDUSDT", 1)] {
                catalog.insert(
                    symbol.to_string(),
                    SymbolRules {
                        symbol: symbol.to_string(),
                        quantity_precision: precision,
                        min_notional: dec!(5),
                        trading: symbol != "DELISTEDUSDT",
                    },
                );
            }
            Ok(catalog)
        }

        async fn available_margin(&self) -> Result<Decimal, ExchangeError> {
            Ok(*self.margin.lock().unwrap())
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
            let mut orders = self.orders.lock().unwrap();
            orders.push(Submitted {
                symbol: symbol.to_string(),
                side,
                quantity,
                reduce_only,
            });
            if self
                .reject
                .lock()
                .unwrap()
                .contains(&(symbol.to_string(), reduce_only))
            {
                return Err(ExchangeError::Api {
                    code: -2019,
                    message: "Margin is insufficient.".to_string(),
                });
            }
            let price = self.prices.lock().unwrap().get(symbol).copied();
            Ok(OrderFill {
                order_id: OrderId::from(orders.len() as i64),
                symbol: symbol.to_string(),
                side,
                state: OrderState::Filled,
                requested_qty: quantity,
                executed_qty: quantity,
                avg_price: if self.report_fill_price { price } else { None },
            })
        }

        async fn get_order(
            &self,
            _symbol: &str,
            order_id: &OrderId,
        ) -> Result<OrderFill, ExchangeError> {
            Err(ExchangeError::NotFound(order_id.to_string()))
        }

        async fn get_fee(&self, _symbol: &str, order_id: &OrderId) -> Result<Decimal, ExchangeError> {
            Err(ExchangeError::NotFound(order_id.to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, Severity)>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingNotifier {
        async fn notify(
            &self,
            _user_id: &str,
            title: &str,
            _message: &str,
            severity: Severity,
        ) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push((title.to_string(), severity));
            Ok(())
        }
    }

    struct Harness {
        gateway: Arc<ScriptedGateway>,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        manager: TradeManager,
        session: AccountSession,
    }

    fn harness_with(gateway: ScriptedGateway) -> Harness {
        let gateway = Arc::new(gateway);
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let feed = Arc::new(PriceFeed::new(
            PriceFeedConfig::default(),
            gateway.clone(),
            None,
        ));
        let session = AccountSession::new(
            "alice",
            gateway.clone(),
            gateway.clone(),
            feed,
            Some(&crate::collaborators::Credentials::new("k", "s")),
        );
        let manager = TradeManager::new(store.clone(), notifier.clone());
        Harness {
            gateway,
            store,
            notifier,
            manager,
            session,
        }
    }

    fn harness() -> Harness {
        harness_with(ScriptedGateway::new())
    }

    fn request() -> OpenTradeRequest {
        OpenTradeRequest {
            user_id: "alice".to_string(),
            name: None,
            long_symbol: "btc".to_string(),
            short_symbol: "ETHUSDT".to_string(),
            risk: RiskSettings {
                max_loss: dec!(100),
                stop_loss_percent: dec!(5),
                take_profit_percent: dec!(10),
                downside: DownsideExit::StopLoss,
            },
            long_leverage: 10,
            short_leverage: 10,
            margin_type: MarginType::Isolated,
            test_mode: false,
        }
    }

    #[tokio::test]
    async fn test_open_sizes_legs_and_persists_active_trade() {
        let h = harness();
        let trade = h.manager.open_trade(&h.session, request()).await.unwrap();

        // size = 100 / 0.05 = 2000
        assert_eq!(trade.long.symbol, "BTCUSDT");
        assert_eq!(trade.long.quantity, dec!(0.04));
        assert_eq!(trade.short.quantity, dec!(0.666));
        assert_eq!(trade.status, TradeStatus::Active);
        assert_eq!(trade.name, "BTC/ETH");
        // Fee lookups fail, so the entry rate estimate applies
        assert_eq!(trade.long.entry_fee, dec!(0.04) * dec!(50000) * dec!(0.0004));
        assert_eq!(h.store.active(), vec![trade.clone()]);

        let orders = h.gateway.orders();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert_eq!(orders[1].side, OrderSide::Sell);
        assert!(orders.iter().all(|o| !o.reduce_only));
    }

    #[tokio::test]
    async fn test_open_validation_touches_no_orders() {
        let h = harness();

        let mut same = request();
        same.short_symbol = "BTCUSDT".to_string();
        assert!(matches!(
            h.manager.open_trade(&h.session, same).await,
            Err(TradeError::SameSymbol(_))
        ));

        let mut delisted = request();
        delisted.short_symbol = "DELISTED".to_string();
        assert!(matches!(
            h.manager.open_trade(&h.session, delisted).await,
            Err(TradeError::UnknownSymbol(s)) if s == "DELISTEDUSDT"
        ));

        let mut leverage = request();
        leverage.long_leverage = 0;
        assert!(matches!(
            h.manager.open_trade(&h.session, leverage).await,
            Err(TradeError::InvalidParameters(_))
        ));

        assert!(h.gateway.orders().is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_margin_reports_deficit() {
        let h = harness();
        *h.gateway.margin.lock().unwrap() = dec!(150);

        // required = 2000/10 + 1998/10 = 399.8
        match h.manager.open_trade(&h.session, request()).await {
            Err(TradeError::InsufficientMargin {
                available,
                required,
                deficit,
            }) => {
                assert_eq!(available, dec!(150));
                assert_eq!(required, dec!(399.8));
                assert_eq!(deficit, dec!(249.8));
            }
            other => panic!("expected insufficient margin, got {:?}", other),
        }
        assert!(h.gateway.orders().is_empty());
    }

    #[tokio::test]
    async fn test_short_failure_compensates_long_once() {
        let h = harness();
        h.gateway.reject("ETHUSDT", false);

        let result = h.manager.open_trade(&h.session, request()).await;
        assert!(matches!(result, Err(TradeError::ShortLegCompensated { .. })));

        let orders = h.gateway.orders();
        assert_eq!(orders.len(), 3);
        assert_eq!(
            orders[2],
            Submitted {
                symbol: "BTCUSDT".to_string(),
                side: OrderSide::Sell,
                quantity: dec!(0.04),
                reduce_only: true,
            }
        );
        assert!(h.store.active().is_empty());
        assert!(h.store.history().is_empty());
        assert_eq!(
            h.notifier.sent.lock().unwrap().last().map(|n| n.1),
            Some(Severity::Warning)
        );
    }

    #[tokio::test]
    async fn test_compensation_failure_marks_trade_failed() {
        let h = harness();
        h.gateway.reject("ETHUSDT", false);
        h.gateway.reject("BTCUSDT", true);

        match h.manager.open_trade(&h.session, request()).await {
            Err(TradeError::CompensationFailed {
                long_symbol,
                quantity,
                ..
            }) => {
                assert_eq!(long_symbol, "BTCUSDT");
                assert_eq!(quantity, dec!(0.04));
            }
            other => panic!("expected compensation failure, got {:?}", other),
        }

        let history = h.store.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, TradeStatus::Failed);
        let sent = h.notifier.sent.lock().unwrap();
        assert!(sent
            .iter()
            .any(|(title, severity)| title == "MANUAL INTERVENTION REQUIRED"
                && *severity == Severity::Critical));
    }

    #[tokio::test]
    async fn test_evaluate_then_close_on_take_profit() {
        let h = harness();
        let trade = h.manager.open_trade(&h.session, request()).await.unwrap();

        let (trade, evaluation) = h
            .manager
            .evaluate_and_persist(trade, dec!(55500), dec!(3000))
            .await
            .unwrap();
        assert_eq!(evaluation.close_reason, Some(CloseReason::TakeProfit));
        // Running fields are persisted before the close is acted on
        assert_eq!(h.store.active()[0].mfe, trade.mfe);

        h.gateway.set_price("BTCUSDT", dec!(55500));
        let closed = h
            .manager
            .close_trade(&h.session, trade, CloseReason::TakeProfit)
            .await
            .unwrap();

        assert_eq!(closed.status, TradeStatus::Closed);
        assert_eq!(closed.close_reason, Some(CloseReason::TakeProfit));
        assert_eq!(closed.long.pnl, dec!(220));
        assert_eq!(closed.net_pnl, closed.total_pnl - closed.total_fee);
        assert_eq!(closed.net_risk_reward_ratio, closed.net_pnl / dec!(100));
        assert!(h.store.active().is_empty());
        assert_eq!(h.store.history().len(), 1);
        assert_eq!(h.manager.in_flight_closes(), 0);

        let exits: Vec<_> = h.gateway.orders().into_iter().skip(2).collect();
        assert_eq!(exits.len(), 2);
        assert!(exits.iter().all(|o| o.reduce_only));
        assert_eq!(exits[0].symbol, "BTCUSDT");
        assert_eq!(exits[1].side, OrderSide::Buy);
    }

    #[tokio::test]
    async fn test_partial_close_keeps_trade_active_and_retry_closes_open_leg() {
        let h = harness();
        let trade = h.manager.open_trade(&h.session, request()).await.unwrap();
        h.gateway.reject("ETHUSDT", true);

        let result = h
            .manager
            .close_trade(&h.session, trade.clone(), CloseReason::StopLoss)
            .await;
        assert!(matches!(
            result,
            Err(TradeError::PartialClose { ref open_leg, .. }) if open_leg == "ETHUSDT"
        ));

        let stored = h.store.active();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].long.is_closed());
        assert!(!stored[0].short.is_closed());
        assert_eq!(stored[0].status, TradeStatus::Active);
        assert_eq!(stored[0].close_reason, Some(CloseReason::StopLoss));

        h.gateway.reject.lock().unwrap().clear();
        let closed = h
            .manager
            .close_trade(&h.session, stored[0].clone(), CloseReason::StopLoss)
            .await
            .unwrap();
        assert_eq!(closed.status, TradeStatus::Closed);

        let btc_exits = h
            .gateway
            .orders()
            .iter()
            .filter(|o| o.symbol == "BTCUSDT" && o.reduce_only)
            .count();
        assert_eq!(btc_exits, 1);
    }

    #[tokio::test]
    async fn test_first_leg_close_failure_is_plain_error() {
        let h = harness();
        let trade = h.manager.open_trade(&h.session, request()).await.unwrap();
        h.gateway.reject("BTCUSDT", true);

        let result = h
            .manager
            .close_trade(&h.session, trade, CloseReason::Manual)
            .await;
        assert!(matches!(result, Err(TradeError::Exchange(_))));
        assert_eq!(h.store.active()[0].status, TradeStatus::Active);
    }

    #[tokio::test]
    async fn test_missing_exit_fill_price_uses_fresh_quote() {
        let mut gateway = ScriptedGateway::new();
        gateway.report_fill_price = false;
        let h = harness_with(gateway);

        let trade = h.manager.open_trade(&h.session, request()).await.unwrap();
        assert!(trade.long.entry_price_estimated);
        assert_eq!(trade.long.entry_price, dec!(50000));

        h.gateway.set_price("BTCUSDT", dec!(51000));
        let closed = h
            .manager
            .close_trade(&h.session, trade, CloseReason::Manual)
            .await
            .unwrap();
        assert_eq!(closed.long.exit_price, Some(dec!(51000)));
        assert!(closed.long.exit_price_estimated);
    }

    #[tokio::test]
    async fn test_close_claim_is_exclusive() {
        let h = harness();
        let trade = h.manager.open_trade(&h.session, request()).await.unwrap();

        let claim = h.manager.try_claim_close(&trade.id).unwrap();
        assert!(h.manager.is_closing(&trade.id));
        assert!(matches!(
            h.manager
                .close_trade(&h.session, trade.clone(), CloseReason::Manual)
                .await,
            Err(TradeError::CloseInProgress(_))
        ));
        drop(claim);
        assert!(!h.manager.is_closing(&trade.id));
    }

    #[tokio::test]
    async fn test_update_settings_and_manual_close() {
        let h = harness();
        let trade = h.manager.open_trade(&h.session, request()).await.unwrap();

        assert!(matches!(
            h.manager
                .update_settings("alice", &trade.id, SettingsUpdate::default())
                .await,
            Err(TradeError::InvalidParameters(_))
        ));

        let update = SettingsUpdate {
            downside: Some(DownsideExit::TrailingStop {
                level_percent: dec!(2),
            }),
            ..Default::default()
        };
        let updated = h
            .manager
            .update_settings("alice", &trade.id, update)
            .await
            .unwrap();
        assert!(updated.risk.downside.is_trailing());
        assert!(h.store.active()[0].risk.downside.is_trailing());

        let closed = h
            .manager
            .close_by_id(&h.session, "alice", &trade.id)
            .await
            .unwrap();
        assert_eq!(closed.close_reason, Some(CloseReason::Manual));

        assert!(matches!(
            h.manager.close_by_id(&h.session, "alice", &trade.id).await,
            Err(TradeError::NotFound(_))
        ));
    }
}
