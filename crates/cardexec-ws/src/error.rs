//! WebSocket error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("WebSocket connection timeout")]
    ConnectTimeout,

    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: code={code}, reason={reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("WebSocket connection failed after {0} attempts")]
    ReconnectExhausted(u32),

    #[error("WebSocket is not connected")]
    NotConnected,

    #[error("Connection cancelled")]
    Cancelled,

    #[error("Invalid handshake request: {0}")]
    InvalidRequest(String),

    #[error("Tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type WsResult<T> = Result<T, WsError>;
