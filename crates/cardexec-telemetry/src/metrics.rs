//! Prometheus metrics for card execution.
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. A registration failure
//! means duplicate metric names, a fatal configuration error that should
//! crash at startup. These panics only occur during static initialization.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, Encoder,
    HistogramVec, IntGauge, TextEncoder,
};

use crate::error::{TelemetryError, TelemetryResult};

/// Finished query executions.
/// Labels: variant, outcome (success/error/cancelled)
pub static EXECUTIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "cardexec_executions_total",
        "Total card query executions by outcome",
        &["variant", "outcome"]
    )
    .unwrap()
});

/// Time from execute call to the invocation settling.
pub static EXECUTION_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "cardexec_execution_latency_ms",
        "Card query execution latency in milliseconds",
        &["variant"],
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 30000.0]
    )
    .unwrap()
});

/// Records handed to the record sink.
pub static RECORDS_EMITTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "cardexec_records_emitted_total",
        "Total records emitted to the record sink",
        &["variant"]
    )
    .unwrap()
});

/// Stream blocks parsed, by wire format.
pub static STREAM_BLOCKS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "cardexec_stream_blocks_total",
        "Total streamed blocks parsed",
        &["format"]
    )
    .unwrap()
});

/// Open WebSocket subscriptions.
pub static WS_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("cardexec_ws_connected", "Open WebSocket subscriptions").unwrap()
});

/// WebSocket reconnection attempts.
pub static WS_RECONNECT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "cardexec_ws_reconnect_total",
        "Total WebSocket reconnection attempts",
        &["reason"]
    )
    .unwrap()
});

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    /// Record a finished execution.
    pub fn execution_finished(variant: &str, outcome: &str, latency_ms: f64) {
        EXECUTIONS_TOTAL
            .with_label_values(&[variant, outcome])
            .inc();
        EXECUTION_LATENCY_MS
            .with_label_values(&[variant])
            .observe(latency_ms);
    }

    pub fn records_emitted(variant: &str, count: usize) {
        RECORDS_EMITTED_TOTAL
            .with_label_values(&[variant])
            .inc_by(count as f64);
    }

    pub fn stream_block(format: &str) {
        STREAM_BLOCKS_TOTAL.with_label_values(&[format]).inc();
    }

    /// A WebSocket subscription opened.
    pub fn ws_connected() {
        WS_CONNECTED.inc();
    }

    /// A previously opened WebSocket subscription closed.
    pub fn ws_disconnected() {
        WS_CONNECTED.dec();
    }

    pub fn ws_reconnect(reason: &str) {
        WS_RECONNECT_TOTAL.with_label_values(&[reason]).inc();
    }

    /// Render every registered metric in the text exposition format.
    pub fn gather_text() -> TelemetryResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}
