//! Prometheus metrics and structured logging for card execution.
//!
//! - Execution outcomes and latency per transport variant
//! - Stream block and record throughput
//! - WebSocket connection gauge and reconnect counter
//! - `tracing` subscriber setup (JSON in production, pretty otherwise)

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
