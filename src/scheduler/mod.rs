//! Monitoring Scheduler
//!
//! One supervisory loop per process. Every tick it walks the accounts,
//! keeps each account's price subscription in line with its active trades,
//! batch-fetches prices, evaluates every active trade and closes the ones
//! whose exit condition fired. Failures stay inside the user or trade that
//! raised them.
//!
//! A health check runs beside the tick and restarts the whole loop when it
//! has been up too long, keeps failing, or stops completing ticks.

mod policy;
mod stats;

pub use policy::{RestartReason, SelfHealPolicy};
pub use stats::{SchedulerStats, StatsSnapshot};

use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::collaborators::StoreError;
use crate::health::{self, HealthState};
use crate::logging::KeyedLogThrottle;
use crate::metrics;
use crate::price_feed::PullMode;
use crate::registry::{AccountSession, GatewayRegistry};
use crate::trade::{CloseReason, PairTrade, TradeError, TradeManager};

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    /// Pause after a failed tick
    pub error_pause_secs: u64,
    pub health_check_interval_secs: u64,
    /// Planned restart after this much uptime
    pub max_uptime_secs: u64,
    pub max_consecutive_errors: u32,
    /// Stall threshold as a multiple of the tick interval
    pub stall_multiplier: u32,
    pub restart_pause_secs: u64,
    /// Upper bound on waiting for in-flight closes during a restart
    pub close_wait_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            error_pause_secs: 5,
            health_check_interval_secs: 5,
            max_uptime_secs: 12 * 60 * 60,
            max_consecutive_errors: 10,
            stall_multiplier: 3,
            restart_pause_secs: 5,
            close_wait_secs: 60,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn stall_threshold(&self) -> Duration {
        self.tick_interval() * self.stall_multiplier
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.tick_interval_ms == 0 {
            return Err(SchedulerError::Configuration(
                "tick_interval_ms must be > 0".to_string(),
            ));
        }
        if self.health_check_interval_secs == 0 {
            return Err(SchedulerError::Configuration(
                "health_check_interval_secs must be > 0".to_string(),
            ));
        }
        if self.max_consecutive_errors == 0 || self.stall_multiplier == 0 {
            return Err(SchedulerError::Configuration(
                "max_consecutive_errors and stall_multiplier must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Failed to enumerate accounts: {0}")]
    Accounts(#[from] StoreError),

    #[error("Tick task panicked: {0}")]
    Panicked(String),

    #[error("Scheduler configuration error: {0}")]
    Configuration(String),
}

/// How one run of the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    Shutdown,
    Restart(RestartReason),
}

pub struct MonitorScheduler {
    config: SchedulerConfig,
    policy: SelfHealPolicy,
    manager: Arc<TradeManager>,
    registry: Arc<GatewayRegistry>,
    stats: Arc<SchedulerStats>,
    health: Option<HealthState>,
    throttle: KeyedLogThrottle,
}

impl MonitorScheduler {
    pub fn new(
        config: SchedulerConfig,
        manager: Arc<TradeManager>,
        registry: Arc<GatewayRegistry>,
    ) -> Self {
        Self {
            policy: SelfHealPolicy::from_config(&config),
            config,
            manager,
            registry,
            stats: Arc::new(SchedulerStats::new()),
            health: None,
            throttle: KeyedLogThrottle::new(Duration::from_secs(60)),
        }
    }

    #[must_use]
    pub fn with_health(mut self, health: HealthState) -> Self {
        self.health = Some(health);
        self
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        Arc::clone(&self.stats)
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), SchedulerError> {
        self.config.validate()?;
        info!(
            tick_ms = self.config.tick_interval_ms,
            max_uptime_secs = self.config.max_uptime_secs,
            "Monitoring scheduler starting"
        );

        loop {
            self.stats.reset_run();
            match self.run_once(&mut shutdown).await {
                RunEnd::Shutdown => break,
                RunEnd::Restart(reason) => {
                    warn!(%reason, "Self-healing restart");
                    metrics::record_restart(reason.as_label());
                    self.stats.record_restart();
                    self.stop().await;

                    let pause = Duration::from_secs(self.config.restart_pause_secs);
                    tokio::select! {
                        _ = sleep(pause) => {}
                        _ = wait_for_shutdown(&mut shutdown) => break,
                    }
                    info!("Scheduler restarting");
                }
            }
        }

        info!("Monitoring scheduler shutting down");
        self.stop().await;
        Ok(())
    }

    async fn run_once(self: &Arc<Self>, shutdown: &mut watch::Receiver<bool>) -> RunEnd {
        let mut tick_timer = interval(self.config.tick_interval());
        tick_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health_timer = interval(Duration::from_secs(self.config.health_check_interval_secs));
        health_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut current: Option<JoinHandle<Result<usize, SchedulerError>>> = None;
        let mut pause_until: Option<Instant> = None;
        // After a failed tick the stall timer counts from the end of the pause
        let mut stall_origin: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = wait_for_shutdown(shutdown) => {
                    if let Some(tick) = current.take() {
                        tick.abort();
                    }
                    return RunEnd::Shutdown;
                }

                _ = tick_timer.tick() => {
                    if pause_until.is_some_and(|until| Instant::now() < until) {
                        continue;
                    }
                    pause_until = None;
                    if current.is_some() {
                        debug!("Previous tick still running, skipping");
                        continue;
                    }
                    let this = Arc::clone(self);
                    current = Some(tokio::spawn(async move { this.tick().await }));
                }

                result = join_current(&mut current), if current.is_some() => {
                    current = None;
                    if self.on_tick_finished(result) {
                        stall_origin = None;
                    } else {
                        let until = Instant::now() + Duration::from_secs(self.config.error_pause_secs);
                        pause_until = Some(until);
                        stall_origin = Some(until);
                    }
                }

                _ = health_timer.tick() => {
                    let mut snapshot = self.stats.snapshot();
                    if let Some(origin) = stall_origin {
                        snapshot.since_last_success = snapshot
                            .since_last_success
                            .min(Instant::now().saturating_duration_since(origin));
                    }
                    let in_pause = pause_until.is_some_and(|until| Instant::now() < until);
                    if let Some(health) = &self.health {
                        let status = self.policy.health_status(&snapshot);
                        health::update_from_stats(health, &snapshot, status, self.manager.in_flight_closes()).await;
                    }
                    let closing = current.is_some() && self.manager.in_flight_closes() > 0;
                    if let Some(reason) = self.policy.check(&snapshot, in_pause, closing) {
                        if let Some(tick) = current.take() {
                            tick.abort();
                        }
                        return RunEnd::Restart(reason);
                    }
                }
            }
        }
    }

    /// Book a finished tick. Returns false when the tick failed.
    fn on_tick_finished(&self, result: Result<Result<usize, SchedulerError>, JoinError>) -> bool {
        let error = match result {
            Ok(Ok(active)) => {
                self.stats.record_success(active);
                metrics::record_tick(true);
                metrics::set_active_trades(active);
                return true;
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) if e.is_panic() => format!("tick panicked: {}", e),
            Err(_) => return true,
        };
        let streak = self.stats.record_failure();
        metrics::record_tick(false);
        error!(
            error = %error,
            consecutive_errors = streak,
            pause_secs = self.config.error_pause_secs,
            "Scheduler tick failed"
        );
        false
    }

    /// Wait (bounded) for in-flight closes, then release every session.
    async fn stop(&self) {
        let deadline = Instant::now() + Duration::from_secs(self.config.close_wait_secs);
        while self.manager.in_flight_closes() > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(100)).await;
        }
        let remaining = self.manager.in_flight_closes();
        if remaining > 0 {
            warn!(remaining, "Closes still in flight after wait, releasing anyway");
        }
        self.registry.release_all().await;
    }

    /// One pass over every account. Returns the number of active trades seen.
    ///
    /// Fails only when the accounts cannot be enumerated or a user task
    /// panicked; user and trade errors are logged and skipped.
    pub async fn tick(self: Arc<Self>) -> Result<usize, SchedulerError> {
        let accounts = self.manager.store().load_user_accounts().await?;

        let mut users = JoinSet::new();
        for account in accounts {
            let this = Arc::clone(&self);
            let span = info_span!("user_tick", user_id = %account.user_id);
            users.spawn(
                async move {
                    let result = this.process_user(&account.user_id).await;
                    (account.user_id, result)
                }
                .instrument(span),
            );
        }

        let mut active = 0;
        let mut panicked = None;
        while let Some(joined) = users.join_next().await {
            match joined {
                Ok((_, Ok(count))) => active += count,
                Ok((user_id, Err(e))) => {
                    if let Some(suppressed) = self.throttle.check(&format!("user:{}", user_id)) {
                        warn!(user_id = %user_id, error = %e, suppressed, "User skipped this tick");
                    }
                }
                Err(e) if e.is_panic() => {
                    error!(error = %e, "User task panicked");
                    panicked = Some(e.to_string());
                }
                Err(e) => debug!(error = %e, "User task cancelled"),
            }
        }

        match panicked {
            Some(message) => Err(SchedulerError::Panicked(message)),
            None => Ok(active),
        }
    }

    async fn process_user(self: &Arc<Self>, user_id: &str) -> Result<usize, TradeError> {
        let trades: Vec<PairTrade> = self
            .manager
            .store()
            .load_active_trades(user_id)
            .await?
            .into_iter()
            .filter(PairTrade::is_active)
            .collect();
        if trades.is_empty() {
            if let Some(session) = self.registry.existing(user_id).await {
                if let Err(e) = session.price_feed.subscribe(Vec::<String>::new()).await {
                    debug!(error = %e, "Failed to stop idle quote stream");
                }
            }
            return Ok(0);
        }

        let session = self.registry.session(user_id).await?;
        let symbols: BTreeSet<String> = trades
            .iter()
            .flat_map(|t| t.symbols())
            .map(str::to_string)
            .collect();

        if let Err(e) = session.price_feed.subscribe(symbols.iter().cloned()).await {
            if let Some(suppressed) = self.throttle.check(&format!("stream:{}", user_id)) {
                warn!(error = %e, suppressed, "Quote stream subscription failed, using pulls");
            }
        }

        let symbols: Vec<String> = symbols.into_iter().collect();
        let prices = session.price_feed.get_prices(&symbols, PullMode::Fresh).await;

        let count = trades.len();
        for trade in trades {
            let span = info_span!("trade_tick", trade_id = %trade.id);
            self.process_trade(&session, trade, &prices).instrument(span).await;
        }
        Ok(count)
    }

    async fn process_trade(
        self: &Arc<Self>,
        session: &Arc<AccountSession>,
        trade: PairTrade,
        prices: &HashMap<String, Decimal>,
    ) {
        if self.manager.is_closing(&trade.id) {
            debug!("Close in flight, skipping evaluation");
            return;
        }
        if !session.can_execute(trade.test_mode) {
            if let Some(suppressed) = self.throttle.check(&format!("creds:{}", trade.id)) {
                warn!(suppressed, "Credentials not configured, trade not monitored");
            }
            return;
        }

        if trade.is_partially_closed() {
            let reason = trade.close_reason.unwrap_or(CloseReason::Manual);
            warn!(%reason, "Trade is half closed, retrying the open leg");
            self.close(session, trade, reason).await;
            return;
        }

        let (Some(&long_price), Some(&short_price)) = (
            prices.get(&trade.long.symbol),
            prices.get(&trade.short.symbol),
        ) else {
            if let Some(suppressed) = self.throttle.check(&format!("price:{}", trade.id)) {
                warn!(suppressed, "No fresh price for a leg, skipping evaluation");
            }
            return;
        };

        let (trade, evaluation) = match self
            .manager
            .evaluate_and_persist(trade, long_price, short_price)
            .await
        {
            Ok(evaluated) => evaluated,
            Err(e) => {
                warn!(error = %e, "Evaluation failed");
                return;
            }
        };

        if let Some(reason) = evaluation.close_reason {
            self.close(session, trade, reason).await;
        }
    }

    async fn close(
        self: &Arc<Self>,
        session: &Arc<AccountSession>,
        trade: PairTrade,
        reason: CloseReason,
    ) {
        let Some(claim) = self.manager.try_claim_close(&trade.id) else {
            return;
        };

        // Spawned so that aborting the tick does not abort a close half way.
        let manager = Arc::clone(&self.manager);
        let session = Arc::clone(session);
        let close = tokio::spawn(
            async move {
                let result = manager
                    .close_trade_claimed(&session, trade, reason, &claim)
                    .await;
                drop(claim);
                result
            }
            .in_current_span(),
        );

        match close.await {
            Ok(Ok(closed)) => info!(net_pnl = %closed.net_pnl, %reason, "Trade closed by scheduler"),
            Ok(Err(e)) => error!(error = %e, %reason, "Scheduled close failed"),
            Err(e) => error!(error = %e, "Close task panicked"),
        }
    }
}

async fn join_current<T>(current: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match current.as_mut() {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
