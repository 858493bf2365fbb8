//! Health check HTTP endpoint for monitoring

use crate::metrics;
use crate::scheduler::StatsSnapshot;
use axum::{routing::get, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HealthResponse {
    pub status: String, // "healthy", "degraded", "critical"
    pub version: String,
    pub uptime_seconds: u64,
    pub ticks: u64,
    pub failed_ticks: u64,
    pub consecutive_errors: u32,
    pub seconds_since_last_success: u64,
    pub active_trades: usize,
    pub in_flight_closes: usize,
    pub restarts: u32,
    pub timestamp: i64,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: 0,
            ticks: 0,
            failed_ticks: 0,
            consecutive_errors: 0,
            seconds_since_last_success: 0,
            active_trades: 0,
            in_flight_closes: 0,
            restarts: 0,
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// Shared health state, refreshed by the scheduler's health check.
pub type HealthState = Arc<RwLock<HealthResponse>>;

pub fn create_health_state() -> HealthState {
    Arc::new(RwLock::new(HealthResponse::default()))
}

pub async fn update_from_stats(
    state: &HealthState,
    stats: &StatsSnapshot,
    status: &str,
    in_flight_closes: usize,
) {
    let mut health = state.write().await;
    health.status = status.to_string();
    health.uptime_seconds = stats.uptime.as_secs();
    health.ticks = stats.ticks;
    health.failed_ticks = stats.failed_ticks;
    health.consecutive_errors = stats.consecutive_errors;
    health.seconds_since_last_success = stats.since_last_success.as_secs();
    health.active_trades = stats.active_trades;
    health.in_flight_closes = in_flight_closes;
    health.restarts = stats.restarts;
    health.timestamp = Utc::now().timestamp();
}

async fn health_check(
    axum::extract::State(state): axum::extract::State<HealthState>,
) -> Json<HealthResponse> {
    let health = state.read().await.clone();
    Json(health)
}

async fn metrics_endpoint() -> String {
    metrics::gather_metrics()
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
}

pub async fn run_health_server(port: u16, state: HealthState) {
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!("Health check server listening on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Health server failed to bind to {}: {}. System will continue without health endpoint.", addr, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Health check server failed: {}", e);
    }
}
