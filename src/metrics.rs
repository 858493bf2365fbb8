//! Prometheus Metrics Module
//!
//! Pre-registered metrics for the engine. Registration happens once, on
//! first use, through `lazy_static`.

use lazy_static::lazy_static;
use prometheus::{
    opts, register_gauge, register_gauge_vec, register_histogram, register_int_counter,
    register_int_counter_vec, Encoder, Gauge, GaugeVec, Histogram, IntCounter, IntCounterVec,
    TextEncoder,
};
use std::time::Duration;

use crate::exchange::ErrorClass;
use crate::types::OrderSide;

lazy_static! {
    // --- Order Metrics ---

    /// Orders submitted (by symbol, side, status)
    pub static ref ORDERS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("pairtrader_orders_total", "Market orders submitted"),
        &["symbol", "side", "status"]
    ).expect("FATAL: Failed to register ORDERS_TOTAL metric - check for duplicate registration");

    /// Submission to fill-resolution latency in seconds
    pub static ref ORDER_LATENCY: Histogram = register_histogram!(
        "pairtrader_order_latency_seconds",
        "Order submission latency including fill polling",
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]
    ).expect("FATAL: Failed to register ORDER_LATENCY metric - check for duplicate registration");

    /// Exchange API errors by operation and class
    pub static ref API_ERRORS: IntCounterVec = register_int_counter_vec!(
        opts!("pairtrader_api_errors_total", "Exchange API errors by classification"),
        &["operation", "class"]
    ).expect("FATAL: Failed to register API_ERRORS metric - check for duplicate registration");

    // --- Price Feed Metrics ---

    /// Price lookups by the source that answered them
    pub static ref PRICE_LOOKUPS: IntCounterVec = register_int_counter_vec!(
        opts!("pairtrader_price_lookups_total", "Price lookups by source"),
        &["source"]
    ).expect("FATAL: Failed to register PRICE_LOOKUPS metric - check for duplicate registration");

    /// WebSocket reconnections
    pub static ref WS_RECONNECTIONS: IntCounter = register_int_counter!(
        opts!("pairtrader_websocket_reconnections_total", "Quote stream reconnections")
    ).expect("FATAL: Failed to register WS_RECONNECTIONS metric - check for duplicate registration");

    // --- Trade Metrics ---

    pub static ref TRADES_OPENED: IntCounter = register_int_counter!(
        opts!("pairtrader_trades_opened_total", "Pair trades opened")
    ).expect("FATAL: Failed to register TRADES_OPENED metric - check for duplicate registration");

    pub static ref TRADES_CLOSED: IntCounterVec = register_int_counter_vec!(
        opts!("pairtrader_trades_closed_total", "Pair trades closed by reason"),
        &["reason"]
    ).expect("FATAL: Failed to register TRADES_CLOSED metric - check for duplicate registration");

    /// Compensating closes of a long leg after a failed short leg
    pub static ref COMPENSATIONS: IntCounterVec = register_int_counter_vec!(
        opts!("pairtrader_compensations_total", "Open compensations by outcome"),
        &["outcome"]
    ).expect("FATAL: Failed to register COMPENSATIONS metric - check for duplicate registration");

    /// Unrealised PnL per active trade
    pub static ref TRADE_PNL: GaugeVec = register_gauge_vec!(
        opts!("pairtrader_trade_pnl", "Unrealised PnL of an active trade"),
        &["trade_id"]
    ).expect("FATAL: Failed to register TRADE_PNL metric - check for duplicate registration");

    pub static ref ACTIVE_TRADES: Gauge = register_gauge!(
        opts!("pairtrader_active_trades", "Active trades seen in the last tick")
    ).expect("FATAL: Failed to register ACTIVE_TRADES metric - check for duplicate registration");

    // --- Scheduler Metrics ---

    pub static ref SCHEDULER_TICKS: IntCounterVec = register_int_counter_vec!(
        opts!("pairtrader_scheduler_ticks_total", "Scheduler ticks by outcome"),
        &["outcome"]
    ).expect("FATAL: Failed to register SCHEDULER_TICKS metric - check for duplicate registration");

    pub static ref SCHEDULER_RESTARTS: IntCounterVec = register_int_counter_vec!(
        opts!("pairtrader_scheduler_restarts_total", "Self-healing restarts by reason"),
        &["reason"]
    ).expect("FATAL: Failed to register SCHEDULER_RESTARTS metric - check for duplicate registration");
}

pub fn record_order(symbol: &str, side: OrderSide, status: &str) {
    ORDERS_TOTAL
        .with_label_values(&[symbol, side.as_api_str(), status])
        .inc();
}

pub fn observe_order_latency(latency: Duration) {
    ORDER_LATENCY.observe(latency.as_secs_f64());
}

pub fn record_api_error(operation: &str, class: ErrorClass) {
    API_ERRORS
        .with_label_values(&[operation, class.as_label()])
        .inc();
}

pub fn record_price_lookup(source: &str) {
    PRICE_LOOKUPS.with_label_values(&[source]).inc();
}

pub fn record_ws_reconnect() {
    WS_RECONNECTIONS.inc();
}

pub fn record_trade_opened() {
    TRADES_OPENED.inc();
}

pub fn record_trade_closed(reason: &str) {
    TRADES_CLOSED.with_label_values(&[reason]).inc();
}

/// `outcome` is `closed` or `failed`
pub fn record_compensation(outcome: &str) {
    COMPENSATIONS.with_label_values(&[outcome]).inc();
}

pub fn record_tick(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    SCHEDULER_TICKS.with_label_values(&[outcome]).inc();
}

pub fn record_restart(reason: &str) {
    SCHEDULER_RESTARTS.with_label_values(&[reason]).inc();
}

pub fn set_trade_pnl(trade_id: &str, pnl: f64) {
    TRADE_PNL.with_label_values(&[trade_id]).set(pnl);
}

/// Drop the gauge series of a trade that is no longer active.
pub fn remove_trade_pnl(trade_id: &str) {
    let _ = TRADE_PNL.remove_label_values(&[trade_id]);
}

pub fn set_active_trades(count: usize) {
    ACTIVE_TRADES.set(count as f64);
}

/// Get metrics as text for /metrics endpoint
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode Prometheus metrics: {}", e);
        return String::new();
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Prometheus metrics buffer is not valid UTF-8: {}", e);
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_metrics() {
        record_order("TESTUSDT", OrderSide::Buy, "accepted");
        record_api_error("place_order", ErrorClass::RateLimited);

        let output = gather_metrics();
        assert!(
            output.contains("pairtrader_orders_total"),
            "Expected metrics output to contain 'pairtrader_orders_total', got: {}",
            &output[..output.len().min(200)]
        );
        assert!(output.contains("pairtrader_api_errors_total"));
    }

    #[test]
    fn test_trade_pnl_series_removed() {
        set_trade_pnl("metrics-test-trade", 12.5);
        assert_eq!(
            TRADE_PNL.with_label_values(&["metrics-test-trade"]).get(),
            12.5
        );
        remove_trade_pnl("metrics-test-trade");
        assert!(!gather_metrics().contains("metrics-test-trade"));
    }
}
