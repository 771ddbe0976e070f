//! Error types for cardexec-core.

use thiserror::Error;

/// Core error types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Unsupported query variant: {0}")]
    UnsupportedVariant(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
