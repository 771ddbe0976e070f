//! Stream error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Stream ended inside a UTF-8 sequence ({0} dangling bytes)")]
    TruncatedUtf8(usize),
}

pub type StreamResult<T> = Result<T, StreamError>;
