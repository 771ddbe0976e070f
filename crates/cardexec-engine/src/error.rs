//! Execution error types.

use cardexec_core::CoreError;
use cardexec_http::HttpError;
use cardexec_ws::WsError;
use thiserror::Error;

/// Failure raised by a host-supplied processor or custom handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProcessorError {
    message: String,
}

impl ProcessorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for ProcessorError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ProcessorError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

pub type ProcessorResult<T> = Result<T, ProcessorError>;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Ws(#[from] WsError),

    #[error("Custom query handler is not registered: {0}")]
    UnknownHandler(String),

    #[error("Custom query timed out after {0} ms")]
    Timeout(u64),

    #[error("Custom query was cancelled")]
    Cancelled,
}

impl ExecutionError {
    /// Cancellation from any layer. Expected, never written to state.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Http(e) => e.is_cancelled(),
            Self::Ws(WsError::Cancelled) => true,
            _ => false,
        }
    }
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_from_any_layer() {
        assert!(ExecutionError::Cancelled.is_cancelled());
        assert!(ExecutionError::from(HttpError::Cancelled).is_cancelled());
        assert!(ExecutionError::from(WsError::Cancelled).is_cancelled());
        assert!(!ExecutionError::Timeout(10).is_cancelled());
        assert!(!ExecutionError::from(WsError::ConnectTimeout).is_cancelled());
    }

    #[test]
    fn test_messages_pass_through() {
        let err = ExecutionError::from(ProcessorError::new("bad row"));
        assert_eq!(err.to_string(), "bad row");

        let err = ExecutionError::from(HttpError::Status {
            status: 503,
            status_text: "Service Unavailable".to_string(),
        });
        assert_eq!(err.to_string(), "HTTP 503: Service Unavailable");

        assert_eq!(
            ExecutionError::Timeout(250).to_string(),
            "Custom query timed out after 250 ms"
        );
    }
}
