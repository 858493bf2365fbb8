//! Signed REST client for Binance USDT-M futures.
//!
//! Every call is funnelled through [`RetryExecutor::run`] and a per-account
//! `governor` rate limiter. Signed requests carry `timestamp` (corrected by
//! [`ClockSync`]), `recvWindow` and an HMAC-SHA256 `signature` over the query.

use async_trait::async_trait;
use governor::{clock::DefaultClock, state::InMemoryState, Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::clock::ClockSync;
use super::models::{
    AccountInfo, ApiErrorBody, ExchangeInfo, OrderResponse, ServerTime, TickerPrice, UserTrade,
};
use super::retry::{ClockResync, RetryExecutor, RetryPolicy};
use super::BinanceConfig;
use crate::collaborators::Credentials;
use crate::exchange::{
    Capability, ErrorClass, ExchangeError, ExecutionGateway, PriceSource, SymbolCatalog,
};
use crate::metrics;
use crate::orders::{OrderFill, OrderId};
use crate::types::{MarginType, OrderSide};

type HmacSha256 = Hmac<Sha256>;
type Params = Vec<(&'static str, String)>;

/// Commission assets counted at face value.
const QUOTE_FEE_ASSETS: &[&str] = &["USDT", "USDC", "BUSD"];
const BNB_ASSET: &str = "BNB";
const BNB_CONVERSION_SYMBOL: &str = "BNBUSDT";

/// REST session for one account.
pub struct BinanceClient {
    http: reqwest::Client,
    config: BinanceConfig,
    credentials: Option<Credentials>,
    clock: ClockSync,
    retry: RetryExecutor,
    rate_limiter: Arc<RateLimiter<governor::state::direct::NotKeyed, InMemoryState, DefaultClock>>,
    catalog: RwLock<Option<SymbolCatalog>>,
}

impl BinanceClient {
    /// Build a client. `credentials = None` gives a market-data-only session;
    /// signed calls then fail with [`ExchangeError::NotConfigured`].
    pub fn new(
        config: BinanceConfig,
        credentials: Option<Credentials>,
        retry_policy: RetryPolicy,
    ) -> Result<Self, ExchangeError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ExchangeError::Configuration(format!("HTTP client: {}", e)))?;

        let per_second = NonZeroU32::new(config.requests_per_second).ok_or_else(|| {
            ExchangeError::Configuration("requests_per_second must be > 0".to_string())
        })?;
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        Ok(Self {
            http,
            clock: ClockSync::new(config.time_sync_interval()),
            config,
            credentials,
            retry: RetryExecutor::new(retry_policy, Default::default()),
            rate_limiter,
            catalog: RwLock::new(None),
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn retry_executor(&self) -> &RetryExecutor {
        &self.retry
    }

    /// Measure the offset against the exchange clock.
    pub async fn sync_time(&self) -> Result<i64, ExchangeError> {
        let sent = ClockSync::local_ms();
        let server: ServerTime = self.send_public("/fapi/v1/time", Vec::new()).await?;
        let received = ClockSync::local_ms();
        let offset = self.clock.record(server.server_time, sent, received);
        debug!(offset_ms = offset, "Exchange clock synchronised");
        Ok(offset)
    }

    fn sign(secret: &str, payload: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| ExchangeError::Configuration(format!("Invalid API secret: {}", e)))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn encode(params: &Params) -> Result<String, ExchangeError> {
        serde_urlencoded::to_string(params).map_err(|e| ExchangeError::Decode(e.to_string()))
    }

    async fn send_public<T: DeserializeOwned>(
        &self,
        path: &str,
        params: Params,
    ) -> Result<T, ExchangeError> {
        self.rate_limiter.until_ready().await;
        let query = Self::encode(&params)?;
        let url = if query.is_empty() {
            format!("{}{}", self.config.rest_url, path)
        } else {
            format!("{}{}?{}", self.config.rest_url, path, query)
        };
        let response = self.http.get(url).send().await.map_err(map_reqwest)?;
        Self::parse_response(response).await
    }

    async fn send_signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Params,
    ) -> Result<T, ExchangeError> {
        let credentials = self.credentials.as_ref().ok_or(ExchangeError::NotConfigured)?;

        if self.clock.needs_sync() {
            if let Err(e) = self.sync_time().await {
                warn!(error = %e, "Clock sync failed, signing with previous offset");
            }
        }

        params.push(("recvWindow", self.config.recv_window_ms.to_string()));
        params.push(("timestamp", self.clock.timestamp_ms().to_string()));
        let query = Self::encode(&params)?;
        let signature = Self::sign(&credentials.api_secret, &query)?;
        let url = format!(
            "{}{}?{}&signature={}",
            self.config.rest_url, path, query, signature
        );

        self.rate_limiter.until_ready().await;
        let response = self
            .http
            .request(method, url)
            .header("X-MBX-APIKEY", &credentials.api_key)
            .send()
            .await
            .map_err(map_reqwest)?;
        Self::parse_response(response).await
    }

    async fn parse_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ExchangeError> {
        let status = response.status();
        let body = response.text().await.map_err(map_reqwest)?;

        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| ExchangeError::Decode(format!("{}: {}", e, truncate(&body))));
        }

        if let Ok(api) = serde_json::from_str::<ApiErrorBody>(&body) {
            return Err(ExchangeError::Api {
                code: api.code,
                message: api.msg,
            });
        }

        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            return Err(ExchangeError::Api {
                code: -1003,
                message: format!("HTTP {}", status),
            });
        }

        Err(ExchangeError::Network(format!(
            "HTTP {}: {}",
            status,
            truncate(&body)
        )))
    }

    async fn query_order(&self, symbol: &str, params: Params) -> Result<OrderResponse, ExchangeError> {
        let mut all = vec![("symbol", symbol.to_string())];
        all.extend(params);
        self.send_signed(Method::GET, "/fapi/v1/order", all).await
    }

    /// Commission of one fill converted to the quote currency.
    async fn commission_in_quote(&self, fill: &UserTrade, bnb_price: &mut Option<Decimal>) -> Decimal {
        let asset = fill.commission_asset.as_str();
        if QUOTE_FEE_ASSETS.contains(&asset) {
            return fill.commission;
        }
        if asset == BNB_ASSET {
            if bnb_price.is_none() {
                match self.ticker_price(BNB_CONVERSION_SYMBOL).await {
                    Ok(price) => *bnb_price = Some(price),
                    Err(e) => {
                        warn!(
                            commission = %fill.commission,
                            error = %e,
                            "BNB conversion failed, counting commission as zero"
                        );
                        return Decimal::ZERO;
                    }
                }
            }
            return bnb_price.map_or(Decimal::ZERO, |p| fill.commission * p);
        }
        warn!(
            asset,
            commission = %fill.commission,
            "Unsupported commission asset, counting as zero"
        );
        Decimal::ZERO
    }
}

#[async_trait]
impl ClockResync for BinanceClient {
    async fn resync_clock(&self) -> Result<(), ExchangeError> {
        self.clock.invalidate();
        self.sync_time().await.map(|_| ())
    }
}

#[async_trait]
impl ExecutionGateway for BinanceClient {
    async fn symbol_catalog(&self) -> Result<SymbolCatalog, ExchangeError> {
        if let Some(catalog) = self.catalog.read().await.as_ref() {
            return Ok(catalog.clone());
        }

        let info: ExchangeInfo = self
            .retry
            .run(Capability::MarketData, "exchange_info", self, || {
                self.send_public("/fapi/v1/exchangeInfo", Vec::new())
            })
            .await?;
        let catalog = info.into_catalog();
        info!(symbols = catalog.len(), "Loaded futures symbol catalog");

        *self.catalog.write().await = Some(catalog.clone());
        Ok(catalog)
    }

    async fn available_margin(&self) -> Result<Decimal, ExchangeError> {
        let account: AccountInfo = self
            .retry
            .run(Capability::Account, "account", self, || {
                self.send_signed(Method::GET, "/fapi/v2/account", Vec::new())
            })
            .await?;
        Ok(account.available_balance)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let params: Params = vec![
            ("symbol", symbol.to_string()),
            ("leverage", leverage.to_string()),
        ];
        let _: serde_json::Value = self
            .retry
            .run(Capability::PositionSettings, "set_leverage", self, || {
                self.send_signed(Method::POST, "/fapi/v1/leverage", params.clone())
            })
            .await?;
        debug!(symbol, leverage, "Leverage set");
        Ok(())
    }

    async fn set_margin_type(
        &self,
        symbol: &str,
        margin_type: MarginType,
    ) -> Result<(), ExchangeError> {
        let params: Params = vec![
            ("symbol", symbol.to_string()),
            ("marginType", margin_type.as_api_str().to_string()),
        ];
        let result: Result<serde_json::Value, _> = self
            .retry
            .run(Capability::PositionSettings, "set_margin_type", self, || {
                self.send_signed(Method::POST, "/fapi/v1/marginType", params.clone())
            })
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if self.retry.classifier().classify(&e) == ErrorClass::NoChange => {
                debug!(symbol, %margin_type, "Margin type already set");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Result<OrderFill, ExchangeError> {
        // Reused across retries so a resubmission can detect an order that
        // was accepted even though the response was lost.
        let client_order_id = format!("pt-{}", uuid::Uuid::new_v4().simple());
        let mut params: Params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_api_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.normalize().to_string()),
            ("newClientOrderId", client_order_id.clone()),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let started = Instant::now();
        let attempts = AtomicU32::new(0);
        let result: Result<OrderResponse, _> = self
            .retry
            .run(Capability::Trading, "place_order", self, || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                let params = params.clone();
                let client_order_id = client_order_id.clone();
                async move {
                    if attempt > 0 {
                        match self
                            .query_order(symbol, vec![("origClientOrderId", client_order_id)])
                            .await
                        {
                            Ok(existing) => {
                                info!(symbol, order_id = existing.order_id, "Order already accepted on previous attempt");
                                return Ok(existing);
                            }
                            Err(e) if e.class() == ErrorClass::NotFound => {}
                            Err(e) => return Err(e),
                        }
                    }
                    self.send_signed(Method::POST, "/fapi/v1/order", params).await
                }
            })
            .await;

        let response = match result {
            Ok(response) => {
                metrics::record_order(symbol, side, "accepted");
                response
            }
            Err(e) => {
                metrics::record_order(symbol, side, "failed");
                return Err(e);
            }
        };
        metrics::observe_order_latency(started.elapsed());

        let mut fill = response.into_fill(side, quantity);
        info!(
            symbol,
            %side,
            %quantity,
            reduce_only,
            order_id = %fill.order_id,
            state = %fill.state,
            "Market order submitted"
        );

        let mut polls = 0;
        while !fill.has_fill_price() && polls < self.config.fill_poll_attempts {
            polls += 1;
            tokio::time::sleep(self.config.fill_poll_delay()).await;
            match self.get_order(symbol, &fill.order_id).await {
                Ok(polled) => fill = polled,
                Err(e) => warn!(symbol, order_id = %fill.order_id, error = %e, "Order poll failed"),
            }
        }

        if !fill.has_fill_price() {
            warn!(
                symbol,
                order_id = %fill.order_id,
                "Fill price not reported after polling"
            );
        }
        Ok(fill)
    }

    async fn get_order(&self, symbol: &str, order_id: &OrderId) -> Result<OrderFill, ExchangeError> {
        let response: OrderResponse = self
            .retry
            .run(Capability::OrderQuery, "get_order", self, || {
                self.query_order(symbol, vec![("orderId", order_id.to_string())])
            })
            .await?;
        Ok(response.into_fill(OrderSide::Buy, Decimal::ZERO))
    }

    async fn get_fee(&self, symbol: &str, order_id: &OrderId) -> Result<Decimal, ExchangeError> {
        let params: Params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let fills: Vec<UserTrade> = self
            .retry
            .run(Capability::OrderQuery, "user_trades", self, || {
                self.send_signed(Method::GET, "/fapi/v1/userTrades", params.clone())
            })
            .await?;

        let fills: Vec<UserTrade> = fills
            .into_iter()
            .filter(|f| f.order_id.to_string() == order_id.as_str())
            .collect();
        if fills.is_empty() {
            return Err(ExchangeError::NotFound(format!(
                "no fills for order {} on {}",
                order_id, symbol
            )));
        }

        let mut bnb_price = None;
        let mut total = Decimal::ZERO;
        for fill in &fills {
            total += self.commission_in_quote(fill, &mut bnb_price).await;
        }
        Ok(total)
    }
}

#[async_trait]
impl PriceSource for BinanceClient {
    async fn ticker_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let ticker: TickerPrice = self
            .retry
            .run(Capability::MarketData, "ticker_price", self, || {
                self.send_public("/fapi/v1/ticker/price", vec![("symbol", symbol.to_string())])
            })
            .await?;
        if ticker.price <= Decimal::ZERO {
            return Err(ExchangeError::Decode(format!(
                "non-positive price for {}",
                ticker.symbol
            )));
        }
        Ok(ticker.price)
    }
}

fn map_reqwest(e: reqwest::Error) -> ExchangeError {
    if e.is_decode() {
        ExchangeError::Decode(e.to_string())
    } else {
        ExchangeError::Network(e.to_string())
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_matches_reference_vector() {
        // Example from the exchange API documentation
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let payload = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        let signature = BinanceClient::sign(secret, payload).unwrap();
        assert_eq!(
            signature,
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_encode_preserves_order() {
        let params: Params = vec![
            ("symbol", "BTCUSDT".to_string()),
            ("side", "BUY".to_string()),
            ("quantity", "0.002".to_string()),
        ];
        assert_eq!(
            BinanceClient::encode(&params).unwrap(),
            "symbol=BTCUSDT&side=BUY&quantity=0.002"
        );
    }

    #[tokio::test]
    async fn test_signed_call_without_credentials_is_not_configured() {
        let client =
            BinanceClient::new(BinanceConfig::default(), None, RetryPolicy::default()).unwrap();
        assert!(!client.has_credentials());
        let err = client.available_margin().await.unwrap_err();
        assert!(matches!(err, ExchangeError::NotConfigured));
    }

    #[test]
    fn test_zero_rate_limit_rejected() {
        let config = BinanceConfig {
            requests_per_second: 0,
            ..Default::default()
        };
        assert!(BinanceClient::new(config, None, RetryPolicy::default()).is_err());
    }

    #[test]
    fn test_truncate_long_body() {
        let body = "x".repeat(500);
        assert_eq!(truncate(&body).len(), 200);
        assert_eq!(truncate("short"), "short");
    }
}
