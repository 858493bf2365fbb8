//! Binance USDT-M Futures
//!
//! - [`client::BinanceClient`]: signed REST client implementing
//!   [`ExecutionGateway`](crate::exchange::ExecutionGateway) and
//!   [`PriceSource`](crate::exchange::PriceSource)
//! - [`websocket::BinanceQuoteStream`]: combined `@ticker` stream
//! - [`retry`]: error classification table and backoff policy
//! - [`clock`]: server-time offset used to stamp signed requests

pub mod client;
pub mod clock;
pub mod models;
pub mod retry;
pub mod websocket;

use serde::Deserialize;
use std::time::Duration;

pub use client::BinanceClient;
pub use retry::{ErrorClassifier, RetryExecutor, RetryPolicy};
pub use websocket::BinanceQuoteStream;

const MAINNET_REST_URL: &str = "https://fapi.binance.com";
const MAINNET_WS_URL: &str = "wss://fstream.binance.com/stream";
const TESTNET_REST_URL: &str = "https://testnet.binancefuture.com";
const TESTNET_WS_URL: &str = "wss://stream.binancefuture.com/stream";

/// Connection settings for the futures API.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BinanceConfig {
    pub rest_url: String,
    /// Combined-stream endpoint; `?streams=` is appended per subscription
    pub ws_url: String,
    pub recv_window_ms: u64,
    /// Maximum age of the server-time offset before a resync
    pub time_sync_interval_secs: u64,
    /// Pause before each post-submit order poll
    pub fill_poll_delay_ms: u64,
    /// Order polls after submission when the fill price is missing
    pub fill_poll_attempts: u32,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Client-side request budget per account
    pub requests_per_second: u32,
    /// Upper bound of the websocket reconnect backoff
    pub ws_max_backoff_secs: u64,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            rest_url: MAINNET_REST_URL.to_string(),
            ws_url: MAINNET_WS_URL.to_string(),
            recv_window_ms: 5000,
            time_sync_interval_secs: 30,
            fill_poll_delay_ms: 1000,
            fill_poll_attempts: 2,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
            requests_per_second: 10,
            ws_max_backoff_secs: 60,
        }
    }
}

impl BinanceConfig {
    /// Defaults pointed at the futures testnet.
    pub fn testnet() -> Self {
        Self::default().with_testnet_urls()
    }

    #[must_use]
    pub fn with_testnet_urls(mut self) -> Self {
        self.rest_url = TESTNET_REST_URL.to_string();
        self.ws_url = TESTNET_WS_URL.to_string();
        self
    }

    pub fn time_sync_interval(&self) -> Duration {
        Duration::from_secs(self.time_sync_interval_secs)
    }

    pub fn fill_poll_delay(&self) -> Duration {
        Duration::from_millis(self.fill_poll_delay_ms)
    }
}
