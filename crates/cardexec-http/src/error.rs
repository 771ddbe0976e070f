//! HTTP transport error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    /// Non-2xx response.
    #[error("HTTP {status}: {status_text}")]
    Status { status: u16, status_text: String },

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Response body is not available for streaming")]
    NoBody,

    #[error("Failed to parse response: {0}")]
    Decode(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl HttpError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type HttpResult<T> = Result<T, HttpError>;
