//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Execution error: {0}")]
    Execution(#[from] cardexec_engine::ExecutionError),

    #[error("HTTP client error: {0}")]
    Http(#[from] cardexec_http::HttpError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] cardexec_telemetry::TelemetryError),

    #[error("Output error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
