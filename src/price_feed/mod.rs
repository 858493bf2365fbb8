//! Price Feed Gateway
//!
//! One instance per account. Prices come from two places:
//! - a streaming ticker subscription covering every symbol the account's
//!   active trades need (trusted for `stream_staleness`)
//! - REST pulls, cached for `pull_ttl` unless the caller asks for a fresh value
//!
//! A stale or missing streamed quote never blocks the caller; it falls
//! through to a pull. A failed pull is reported as [`PriceFeedError`], never
//! as a zero or stale price.

mod cache;

pub use cache::{PriceCacheEntry, QuoteCache, QuoteSource};

use futures_util::future::join_all;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::exchange::{ExchangeError, MarketData, PriceSource, QuoteStream};
use crate::logging::KeyedLogThrottle;
use crate::metrics;
use crate::resilience::CircuitBreaker;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PriceFeedConfig {
    /// Streamed quotes older than this are ignored
    pub stream_staleness_ms: u64,
    /// Lifetime of a pulled quote in the cache
    pub pull_ttl_secs: u64,
    /// Capacity of the stream -> cache channel
    pub channel_capacity: usize,
    /// Consecutive pull failures before the breaker opens
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,
}

impl Default for PriceFeedConfig {
    fn default() -> Self {
        Self {
            stream_staleness_ms: 5_000,
            pull_ttl_secs: 900,
            channel_capacity: 1024,
            breaker_failure_threshold: 5,
            breaker_cooldown_secs: 30,
        }
    }
}

impl PriceFeedConfig {
    pub fn stream_staleness(&self) -> Duration {
        Duration::from_millis(self.stream_staleness_ms)
    }

    pub fn pull_ttl(&self) -> Duration {
        Duration::from_secs(self.pull_ttl_secs)
    }
}

#[derive(Debug, Error)]
pub enum PriceFeedError {
    #[error("price unavailable for {symbol}: {source}")]
    Unavailable {
        symbol: String,
        #[source]
        source: ExchangeError,
    },

    #[error("price pulls suspended after repeated failures ({symbol})")]
    CircuitOpen { symbol: String },

    #[error("ticker stream could not be started: {0}")]
    Stream(#[source] ExchangeError),
}

/// How a pull may use the TTL cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullMode {
    /// Serve from the pull cache when younger than the TTL
    Cached,
    /// Always go to the exchange
    Fresh,
}

#[derive(Default)]
struct Subscription {
    symbols: BTreeSet<String>,
    stream_task: Option<JoinHandle<()>>,
    ingest_task: Option<JoinHandle<()>>,
}

impl Subscription {
    fn abort(&mut self) {
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
        if let Some(task) = self.ingest_task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.abort();
    }
}

pub struct PriceFeed {
    config: PriceFeedConfig,
    source: Arc<dyn PriceSource>,
    stream: Option<Arc<dyn QuoteStream>>,
    stream_cache: Arc<QuoteCache>,
    pull_cache: QuoteCache,
    subscription: Mutex<Subscription>,
    breaker: CircuitBreaker,
    throttle: KeyedLogThrottle,
}

impl PriceFeed {
    /// `stream = None` gives a pull-only feed.
    pub fn new(
        config: PriceFeedConfig,
        source: Arc<dyn PriceSource>,
        stream: Option<Arc<dyn QuoteStream>>,
    ) -> Self {
        let stream_cache = Arc::new(QuoteCache::new(
            QuoteSource::Stream,
            config.stream_staleness(),
        ));
        let pull_cache = QuoteCache::new(QuoteSource::Pull, config.pull_ttl());
        let breaker = CircuitBreaker::new(
            "price_pull",
            config.breaker_failure_threshold,
            Duration::from_secs(config.breaker_cooldown_secs),
        );
        Self {
            config,
            source,
            stream,
            stream_cache,
            pull_cache,
            subscription: Mutex::new(Subscription::default()),
            breaker,
            throttle: KeyedLogThrottle::new(Duration::from_secs(60)),
        }
    }

    /// Point the stream at exactly `symbols`.
    ///
    /// No-op when the live stream already covers that set; otherwise the
    /// stream is torn down and restarted on the new set, so symbols of closed
    /// trades drop out. An empty set just stops the stream.
    pub async fn subscribe<I, S>(&self, symbols: I) -> Result<(), PriceFeedError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let Some(stream) = self.stream.as_ref() else {
            return Ok(());
        };

        let requested: BTreeSet<String> = symbols.into_iter().map(Into::into).collect();
        let mut sub = self.subscription.lock().await;

        let stream_alive = sub
            .stream_task
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        if stream_alive && requested == sub.symbols {
            return Ok(());
        }

        sub.abort();
        if requested.is_empty() {
            if !std::mem::take(&mut sub.symbols).is_empty() {
                info!("Price stream stopped, no symbols left");
            }
            return Ok(());
        }
        sub.symbols.clear();
        let wanted = requested;
        let (tx, mut rx) = mpsc::channel::<MarketData>(self.config.channel_capacity);
        let stream_task = stream
            .spawn_stream(wanted.iter().cloned().collect(), tx)
            .await
            .map_err(PriceFeedError::Stream)?;

        let cache = Arc::clone(&self.stream_cache);
        let ingest_task = tokio::spawn(async move {
            while let Some(quote) = rx.recv().await {
                cache.insert_if_newer(&quote.symbol, quote.price, Instant::now());
            }
            debug!("Quote channel closed");
        });

        info!(symbols = ?wanted, "Price stream subscription updated");
        sub.symbols = wanted;
        sub.stream_task = Some(stream_task);
        sub.ingest_task = Some(ingest_task);
        Ok(())
    }

    /// Symbols the stream currently covers.
    pub async fn subscribed_symbols(&self) -> BTreeSet<String> {
        self.subscription.lock().await.symbols.clone()
    }

    /// Record a streamed quote. Used by the ingest task; public for callers
    /// that receive quotes from elsewhere.
    pub fn ingest_quote(&self, quote: &MarketData) {
        self.stream_cache
            .insert_if_newer(&quote.symbol, quote.price, Instant::now());
    }

    /// Streamed price if fresh, otherwise a pull through the TTL cache.
    pub async fn get_price(&self, symbol: &str) -> Result<Decimal, PriceFeedError> {
        if let Some(price) = self.stream_cache.fresh(symbol) {
            metrics::record_price_lookup("stream");
            return Ok(price);
        }
        self.pull(symbol, PullMode::Cached).await
    }

    /// Batch lookup. Symbols without a fresh streamed quote are pulled
    /// concurrently; symbols that cannot be priced are omitted.
    pub async fn get_prices(&self, symbols: &[String], mode: PullMode) -> HashMap<String, Decimal> {
        let mut prices = HashMap::with_capacity(symbols.len());
        let mut misses = Vec::new();

        for symbol in symbols {
            match self.stream_cache.fresh(symbol) {
                Some(price) => {
                    metrics::record_price_lookup("stream");
                    prices.insert(symbol.clone(), price);
                }
                None => misses.push(symbol.as_str()),
            }
        }

        let pulled = join_all(misses.iter().map(|s| self.pull(s, mode))).await;
        for (symbol, result) in misses.into_iter().zip(pulled) {
            match result {
                Ok(price) => {
                    prices.insert(symbol.to_string(), price);
                }
                Err(e) => {
                    if let Some(suppressed) = self.throttle.check(symbol) {
                        warn!(symbol, error = %e, suppressed, "Price unavailable");
                    }
                }
            }
        }
        prices
    }

    /// REST lookup, optionally served from the TTL cache.
    pub async fn pull(&self, symbol: &str, mode: PullMode) -> Result<Decimal, PriceFeedError> {
        if mode == PullMode::Cached {
            if let Some(price) = self.pull_cache.fresh(symbol) {
                metrics::record_price_lookup("pull_cache");
                return Ok(price);
            }
        }

        if self.breaker.is_open() {
            metrics::record_price_lookup("circuit_open");
            return Err(PriceFeedError::CircuitOpen {
                symbol: symbol.to_string(),
            });
        }

        let started = Instant::now();
        match self.source.ticker_price(symbol).await {
            Ok(price) => {
                self.breaker.record_success();
                metrics::record_price_lookup("pull");
                // Another pull may have landed while this one was in flight
                self.pull_cache.insert_if_newer(symbol, price, started);
                Ok(price)
            }
            Err(source) => {
                self.breaker.record_failure();
                metrics::record_price_lookup("unavailable");
                Err(PriceFeedError::Unavailable {
                    symbol: symbol.to_string(),
                    source,
                })
            }
        }
    }

    /// Age of the last streamed quote for `symbol`.
    pub fn stream_quote_age(&self, symbol: &str) -> Option<Duration> {
        self.stream_cache.get(symbol).map(|e| e.age())
    }

    /// Stop the stream and forget every cached quote.
    pub async fn release(&self) {
        let mut sub = self.subscription.lock().await;
        sub.abort();
        let released = std::mem::take(&mut sub.symbols);
        self.stream_cache.clear();
        self.pull_cache.clear();
        self.throttle.clear();
        if !released.is_empty() {
            info!(symbols = released.len(), "Price stream released");
        }
    }
}

#[async_trait::async_trait]
impl PriceSource for PriceFeed {
    async fn ticker_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.get_price(symbol).await.map_err(|e| match e {
            PriceFeedError::Unavailable { source, .. } => source,
            other => ExchangeError::CircuitOpen(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSource {
        calls: AtomicU32,
        price: Decimal,
        fail: bool,
    }

    impl CountingSource {
        fn new(price: Decimal) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                price,
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                price: Decimal::ZERO,
                fail: true,
            })
        }
    }

    #[async_trait]
    impl PriceSource for CountingSource {
        async fn ticker_price(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ExchangeError::Network("down".into()))
            } else {
                Ok(self.price)
            }
        }
    }

    fn quote(symbol: &str, price: Decimal) -> MarketData {
        MarketData {
            symbol: symbol.to_string(),
            price,
            timestamp: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_stream_quote_is_used() {
        let source = CountingSource::new(dec!(1));
        let feed = PriceFeed::new(PriceFeedConfig::default(), source.clone(), None);
        feed.ingest_quote(&quote("BTCUSDT", dec!(50000)));

        assert_eq!(feed.get_price("BTCUSDT").await.unwrap(), dec!(50000));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_stream_quote_falls_back_to_pull() {
        let source = CountingSource::new(dec!(49000));
        let feed = PriceFeed::new(PriceFeedConfig::default(), source.clone(), None);
        feed.ingest_quote(&quote("BTCUSDT", dec!(50000)));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(feed.get_price("BTCUSDT").await.unwrap(), dec!(49000));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_cache_ttl_and_fresh_mode() {
        let source = CountingSource::new(dec!(3000));
        let feed = PriceFeed::new(PriceFeedConfig::default(), source.clone(), None);

        feed.get_price("ETHUSDT").await.unwrap();
        feed.get_price("ETHUSDT").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        feed.pull("ETHUSDT", PullMode::Fresh).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(901)).await;
        feed.get_price("ETHUSDT").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pull_is_unavailable_not_zero() {
        let feed = PriceFeed::new(PriceFeedConfig::default(), CountingSource::failing(), None);
        let err = feed.get_price("BTCUSDT").await.unwrap_err();
        assert!(matches!(err, PriceFeedError::Unavailable { .. }));

        let prices = feed
            .get_prices(&["BTCUSDT".to_string()], PullMode::Fresh)
            .await;
        assert!(prices.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_stops_pulls() {
        let source = CountingSource::failing();
        let config = PriceFeedConfig {
            breaker_failure_threshold: 2,
            ..Default::default()
        };
        let feed = PriceFeed::new(config, source.clone(), None);

        let _ = feed.get_price("BTCUSDT").await;
        let _ = feed.get_price("BTCUSDT").await;
        let err = feed.get_price("BTCUSDT").await.unwrap_err();
        assert!(matches!(err, PriceFeedError::CircuitOpen { .. }));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_mixes_stream_and_pull() {
        let source = CountingSource::new(dec!(3000));
        let feed = PriceFeed::new(PriceFeedConfig::default(), source.clone(), None);
        feed.ingest_quote(&quote("BTCUSDT", dec!(50000)));

        let prices = feed
            .get_prices(
                &["BTCUSDT".to_string(), "ETHUSDT".to_string()],
                PullMode::Fresh,
            )
            .await;
        assert_eq!(prices["BTCUSDT"], dec!(50000));
        assert_eq!(prices["ETHUSDT"], dec!(3000));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    /// Stream that records every symbol set it was started on.
    #[derive(Default)]
    struct RecordingStream {
        started: std::sync::Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl QuoteStream for RecordingStream {
        async fn spawn_stream(
            &self,
            symbols: Vec<String>,
            _sender: mpsc::Sender<MarketData>,
        ) -> Result<JoinHandle<()>, ExchangeError> {
            self.started.lock().unwrap().push(symbols);
            Ok(tokio::spawn(std::future::pending::<()>()))
        }
    }

    #[tokio::test]
    async fn test_subscription_follows_requested_symbols() {
        let stream = Arc::new(RecordingStream::default());
        let feed = PriceFeed::new(
            PriceFeedConfig::default(),
            CountingSource::new(dec!(1)),
            Some(stream.clone() as Arc<dyn QuoteStream>),
        );

        feed.subscribe(["BTCUSDT", "ETHUSDT"]).await.unwrap();
        feed.subscribe(["ETHUSDT", "BTCUSDT"]).await.unwrap();
        assert_eq!(stream.started.lock().unwrap().len(), 1);

        // BTC/ETH closed, SOL/ETH still open
        feed.subscribe(["SOLUSDT", "ETHUSDT"]).await.unwrap();
        let symbols: Vec<String> = feed.subscribed_symbols().await.into_iter().collect();
        assert_eq!(symbols, vec!["ETHUSDT".to_string(), "SOLUSDT".to_string()]);
        assert_eq!(stream.started.lock().unwrap().len(), 2);

        feed.subscribe(Vec::<String>::new()).await.unwrap();
        assert!(feed.subscribed_symbols().await.is_empty());
        assert_eq!(stream.started.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_release_clears_caches() {
        let feed = PriceFeed::new(PriceFeedConfig::default(), CountingSource::new(dec!(1)), None);
        feed.ingest_quote(&quote("BTCUSDT", dec!(50000)));
        feed.release().await;
        assert!(feed.stream_quote_age("BTCUSDT").is_none());
    }
}
