//! Per-account session registry.
//!
//! One [`AccountSession`] per user: the live execution gateway, the paper
//! gateway for test-mode trades and the account's price feed. Sessions are
//! built lazily on first use, reused across ticks, rebuilt when the user's
//! credentials change and torn down explicitly.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::collaborators::{CredentialStore, Credentials};
use crate::exchange::binance::{BinanceClient, BinanceConfig, BinanceQuoteStream, RetryPolicy};
use crate::exchange::{ExchangeError, ExecutionGateway, QuoteStream};
use crate::paper::PaperGateway;
use crate::price_feed::{PriceFeed, PriceFeedConfig};
use crate::trade::UserId;

/// How long a session's credential check stays valid before the store is re-read.
pub const DEFAULT_CREDENTIAL_RECHECK: Duration = Duration::from_secs(60);

/// Everything the engine needs to act for one account.
pub struct AccountSession {
    pub user_id: UserId,
    gateway: Arc<dyn ExecutionGateway>,
    paper: Arc<dyn ExecutionGateway>,
    pub price_feed: Arc<PriceFeed>,
    has_credentials: bool,
    /// Route every trade through the paper gateway
    simulated: bool,
    fingerprint: Option<u64>,
    checked_at: Mutex<Instant>,
}

impl AccountSession {
    pub fn new(
        user_id: impl Into<UserId>,
        gateway: Arc<dyn ExecutionGateway>,
        paper: Arc<dyn ExecutionGateway>,
        price_feed: Arc<PriceFeed>,
        credentials: Option<&Credentials>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            gateway,
            paper,
            price_feed,
            has_credentials: credentials.is_some(),
            simulated: false,
            fingerprint: credentials.map(Credentials::fingerprint),
            checked_at: Mutex::new(Instant::now()),
        }
    }

    #[must_use]
    pub fn simulated(mut self, simulated: bool) -> Self {
        self.simulated = simulated;
        self
    }

    /// Gateway that executes orders for a trade with the given mode.
    pub fn gateway_for(&self, test_mode: bool) -> &Arc<dyn ExecutionGateway> {
        if test_mode || self.simulated {
            &self.paper
        } else {
            &self.gateway
        }
    }

    /// False for a live trade on an account without credentials.
    pub fn can_execute(&self, test_mode: bool) -> bool {
        test_mode || self.simulated || self.has_credentials
    }

    pub fn has_credentials(&self) -> bool {
        self.has_credentials
    }

    pub fn fingerprint(&self) -> Option<u64> {
        self.fingerprint
    }

    fn recheck_due(&self, window: Duration) -> bool {
        match self.checked_at.lock() {
            Ok(checked) => checked.elapsed() >= window,
            Err(_) => true,
        }
    }

    fn mark_checked(&self) {
        if let Ok(mut checked) = self.checked_at.lock() {
            *checked = Instant::now();
        }
    }
}

/// Builds the session of one account.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn build(
        &self,
        user_id: &str,
        credentials: Option<Credentials>,
    ) -> Result<AccountSession, ExchangeError>;
}

/// Binance USDT-M sessions: REST client, combined ticker stream, price feed
/// and a paper gateway sharing the feed.
pub struct BinanceSessionFactory {
    binance: BinanceConfig,
    retry: RetryPolicy,
    feed: PriceFeedConfig,
    paper_fee_rate: Decimal,
    simulated: bool,
}

impl BinanceSessionFactory {
    pub fn new(
        binance: BinanceConfig,
        retry: RetryPolicy,
        feed: PriceFeedConfig,
        paper_fee_rate: Decimal,
    ) -> Self {
        Self {
            binance,
            retry,
            feed,
            paper_fee_rate,
            simulated: false,
        }
    }

    /// Execute every trade on the paper gateway, live ones included.
    #[must_use]
    pub fn simulated(mut self, simulated: bool) -> Self {
        self.simulated = simulated;
        self
    }
}

#[async_trait]
impl SessionFactory for BinanceSessionFactory {
    async fn build(
        &self,
        user_id: &str,
        credentials: Option<Credentials>,
    ) -> Result<AccountSession, ExchangeError> {
        let client = Arc::new(BinanceClient::new(
            self.binance.clone(),
            credentials.clone(),
            self.retry.clone(),
        )?);
        let stream: Arc<dyn QuoteStream> = Arc::new(BinanceQuoteStream::new(&self.binance));
        let feed = Arc::new(PriceFeed::new(
            self.feed.clone(),
            client.clone(),
            Some(stream),
        ));
        let paper = Arc::new(PaperGateway::new(
            feed.clone(),
            client.clone(),
            self.paper_fee_rate,
        ));
        debug!(
            user_id,
            authenticated = client.has_credentials(),
            "Account session built"
        );
        Ok(
            AccountSession::new(user_id, client, paper, feed, credentials.as_ref())
                .simulated(self.simulated),
        )
    }
}

/// Account id -> session, with controlled lifetime.
pub struct GatewayRegistry {
    factory: Arc<dyn SessionFactory>,
    credentials: Arc<dyn CredentialStore>,
    sessions: RwLock<HashMap<UserId, Arc<AccountSession>>>,
    recheck: Duration,
}

impl GatewayRegistry {
    pub fn new(factory: Arc<dyn SessionFactory>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            factory,
            credentials,
            sessions: RwLock::new(HashMap::new()),
            recheck: DEFAULT_CREDENTIAL_RECHECK,
        }
    }

    #[must_use]
    pub fn with_recheck_window(mut self, recheck: Duration) -> Self {
        self.recheck = recheck;
        self
    }

    /// Session for `user_id`, building it on first use.
    ///
    /// Once the recheck window has passed the credential store is read again;
    /// a rotated key pair replaces the session and releases the old feed.
    pub async fn session(&self, user_id: &str) -> Result<Arc<AccountSession>, ExchangeError> {
        let existing = self.sessions.read().await.get(user_id).cloned();
        match existing {
            Some(session) if !session.recheck_due(self.recheck) => Ok(session),
            Some(session) => {
                let current = self.load_credentials(user_id).await?;
                if current.as_ref().map(Credentials::fingerprint) == session.fingerprint {
                    session.mark_checked();
                    return Ok(session);
                }
                info!(user_id, "Credentials changed, rebuilding account session");
                self.install(user_id, current).await
            }
            None => {
                let current = self.load_credentials(user_id).await?;
                self.install(user_id, current).await
            }
        }
    }

    /// Session already built for `user_id`, without building one.
    pub async fn existing(&self, user_id: &str) -> Option<Arc<AccountSession>> {
        self.sessions.read().await.get(user_id).cloned()
    }

    async fn load_credentials(&self, user_id: &str) -> Result<Option<Credentials>, ExchangeError> {
        self.credentials
            .credentials(user_id)
            .await
            .map_err(|e| ExchangeError::Configuration(format!("credential store: {}", e)))
    }

    async fn install(
        &self,
        user_id: &str,
        credentials: Option<Credentials>,
    ) -> Result<Arc<AccountSession>, ExchangeError> {
        let session = Arc::new(self.factory.build(user_id, credentials).await?);
        let previous = self
            .sessions
            .write()
            .await
            .insert(user_id.to_string(), Arc::clone(&session));
        if let Some(old) = previous {
            old.price_feed.release().await;
        }
        Ok(session)
    }

    /// Drop the session of a removed account.
    pub async fn teardown(&self, user_id: &str) {
        let removed = self.sessions.write().await.remove(user_id);
        if let Some(session) = removed {
            session.price_feed.release().await;
            info!(user_id, "Account session torn down");
        }
    }

    /// Release every feed and forget every session.
    pub async fn release_all(&self) {
        let drained: Vec<_> = self.sessions.write().await.drain().collect();
        for (_, session) in &drained {
            session.price_feed.release().await;
        }
        if !drained.is_empty() {
            info!(sessions = drained.len(), "All account sessions released");
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
