//! Binance Futures combined ticker stream.
//!
//! ## WebSocket Flow
//! 1. Connect to `wss://fstream.binance.com/stream?streams=btcusdt@ticker/ethusdt@ticker`
//! 2. Receive `{"stream":"btcusdt@ticker","data":{"e":"24hrTicker","E":1700000000000,"s":"BTCUSDT","c":"37000.10",...}}`
//! 3. Answer server pings with pongs; reconnect with backoff on close or error

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use super::BinanceConfig;
use crate::exchange::{ExchangeError, QuoteStream};
use crate::metrics;
use crate::types::MarketData;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Streams `@ticker` updates for a set of futures symbols.
#[derive(Debug, Clone)]
pub struct BinanceQuoteStream {
    ws_url: String,
    max_backoff: Duration,
}

impl BinanceQuoteStream {
    pub fn new(config: &BinanceConfig) -> Self {
        Self {
            ws_url: config.ws_url.clone(),
            max_backoff: Duration::from_secs(config.ws_max_backoff_secs.max(1)),
        }
    }

    /// Combined-stream URL for the given symbols.
    pub fn stream_url(base: &str, symbols: &[String]) -> String {
        let streams: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@ticker", s.to_lowercase()))
            .collect();
        format!("{}?streams={}", base, streams.join("/"))
    }

    /// Extract a quote from a combined-stream ticker frame.
    ///
    /// Frames without `data.s`/`data.c`, or with a non-positive price, are ignored.
    pub fn parse_ticker(text: &str) -> Option<MarketData> {
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        let data = value.get("data").unwrap_or(&value);

        let symbol = data.get("s")?.as_str()?;
        let price = Decimal::from_str(data.get("c")?.as_str()?).ok()?;
        if price <= Decimal::ZERO {
            return None;
        }
        let timestamp = data
            .get("E")
            .and_then(|v| v.as_i64())
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        Some(MarketData {
            symbol: symbol.to_string(),
            price,
            timestamp,
        })
    }

    /// Connect, doubling the delay after each failure up to `max_backoff`.
    /// Gives up only when the receiver side has gone away.
    async fn connect_with_retry(
        url: &str,
        max_backoff: Duration,
        sender: &mpsc::Sender<MarketData>,
    ) -> Option<WsStream> {
        let mut backoff = Duration::from_secs(1);
        let mut attempt = 0u32;

        loop {
            if sender.is_closed() {
                return None;
            }
            attempt += 1;
            match connect_async(url).await {
                Ok((stream, _)) => {
                    info!(attempt, "Ticker stream connected");
                    return Some(stream);
                }
                Err(e) => {
                    error!(attempt, error = %e, "Ticker stream connection failed");
                    debug!(delay_ms = backoff.as_millis() as u64, "Retrying ticker stream");
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, max_backoff);
                }
            }
        }
    }

    /// Pump frames until the connection drops. Returns false when the
    /// receiver is gone and the task should stop.
    async fn pump(stream: WsStream, sender: &mpsc::Sender<MarketData>) -> bool {
        let (mut write, mut read) = stream.split();

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if let Some(quote) = Self::parse_ticker(&text) {
                        if sender.send(quote).await.is_err() {
                            info!("Quote receiver dropped, stopping ticker stream");
                            return false;
                        }
                    }
                }
                Ok(Message::Ping(payload)) => {
                    if let Err(e) = write.send(Message::Pong(payload)).await {
                        warn!(error = %e, "Failed to send pong");
                    }
                }
                Ok(Message::Close(frame)) => {
                    info!(?frame, "Ticker stream closed by server");
                    return true;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Ticker stream error");
                    return true;
                }
            }
        }
        info!("Ticker stream ended");
        true
    }
}

#[async_trait]
impl QuoteStream for BinanceQuoteStream {
    async fn spawn_stream(
        &self,
        symbols: Vec<String>,
        sender: mpsc::Sender<MarketData>,
    ) -> Result<JoinHandle<()>, ExchangeError> {
        if symbols.is_empty() {
            return Err(ExchangeError::Configuration(
                "ticker stream needs at least one symbol".to_string(),
            ));
        }

        let url = Self::stream_url(&self.ws_url, &symbols);
        let max_backoff = self.max_backoff;
        info!(symbols = ?symbols, "Starting ticker stream");

        Ok(tokio::spawn(async move {
            let mut connections = 0u64;
            loop {
                let Some(stream) = Self::connect_with_retry(&url, max_backoff, &sender).await
                else {
                    return;
                };
                connections += 1;
                if connections > 1 {
                    metrics::record_ws_reconnect();
                }

                if !Self::pump(stream, &sender).await {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_stream_url() {
        let url = BinanceQuoteStream::stream_url(
            "wss://fstream.binance.com/stream",
            &["BTCUSDT".to_string(), "ETHUSDT".to_string()],
        );
        assert_eq!(
            url,
            "wss://fstream.binance.com/stream?streams=btcusdt@ticker/ethusdt@ticker"
        );
    }

    #[test]
    fn test_parse_combined_ticker() {
        let frame = r#"{"stream":"btcusdt@ticker","data":{"e":"24hrTicker","E":1700000000000,"s":"BTCUSDT","c":"37000.10","o":"36000"}}"#;
        let quote = BinanceQuoteStream::parse_ticker(frame).unwrap();
        assert_eq!(quote.symbol, "BTCUSDT");
        assert_eq!(quote.price, dec!(37000.10));
        assert_eq!(quote.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_parse_ignores_other_frames() {
        assert!(BinanceQuoteStream::parse_ticker(r#"{"result":null,"id":1}"#).is_none());
        assert!(BinanceQuoteStream::parse_ticker("not json").is_none());
        assert!(BinanceQuoteStream::parse_ticker(
            r#"{"data":{"s":"BTCUSDT","c":"0"}}"#
        )
        .is_none());
    }

    #[tokio::test]
    async fn test_empty_symbol_set_rejected() {
        let stream = BinanceQuoteStream::new(&BinanceConfig::default());
        let (tx, _rx) = mpsc::channel(1);
        assert!(stream.spawn_stream(Vec::new(), tx).await.is_err());
    }
}
