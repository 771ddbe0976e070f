//! Execution state, card identity and record types.
//!
//! `ExecutionState` is the externally observable state of one card
//! execution. It is only mutated through `StateUpdate`, which mirrors a
//! partial update: every `None` field leaves the current value untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A normalized, kind-tagged record emitted to the record store.
///
/// Records are JSON objects of the shape `{kind, meta?, reportId?, cardId?, ...}`
/// once post-processed. Raw transport items travel through the same type
/// until post-processors normalize them.
pub type CardRecord = Value;

/// Runtime or per-call parameters used for placeholder resolution.
pub type Params = Map<String, Value>;

/// Get the `kind` discriminator of a record, if present.
pub fn record_kind(record: &CardRecord) -> Option<&str> {
    record.get("kind").and_then(Value::as_str)
}

/// Card loading state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadingState {
    #[default]
    Idle,
    Loading,
    Error,
    Success,
}

impl std::fmt::Display for LoadingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Loading => write!(f, "loading"),
            Self::Error => write!(f, "error"),
            Self::Success => write!(f, "success"),
        }
    }
}

/// Transport connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Externally observable state of a card execution.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub loading_state: LoadingState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh: Option<DateTime<Utc>>,
    pub connection_status: ConnectionStatus,
    pub stream_active: bool,
}

impl ExecutionState {
    /// Merge a partial update into this state.
    pub fn apply(&mut self, update: &StateUpdate) {
        if let Some(loading) = update.loading_state {
            self.loading_state = loading;
        }
        if let Some(error) = &update.error {
            self.error = error.clone();
        }
        if let Some(at) = update.last_refresh {
            self.last_refresh = Some(at);
        }
        if let Some(status) = update.connection_status {
            self.connection_status = status;
        }
        if let Some(active) = update.stream_active {
            self.stream_active = active;
        }
    }

    /// Check if an invocation is in flight.
    pub fn is_loading(&self) -> bool {
        self.loading_state == LoadingState::Loading
    }
}

/// Partial update of an `ExecutionState`.
///
/// `error` is tri-state: `None` keeps the current error, `Some(None)` clears
/// it and `Some(Some(msg))` replaces it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateUpdate {
    pub loading_state: Option<LoadingState>,
    pub error: Option<Option<String>>,
    pub last_refresh: Option<DateTime<Utc>>,
    pub connection_status: Option<ConnectionStatus>,
    pub stream_active: Option<bool>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loading(mut self, loading: LoadingState) -> Self {
        self.loading_state = Some(loading);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(Some(message.into()));
        self
    }

    pub fn without_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn with_connection(mut self, status: ConnectionStatus) -> Self {
        self.connection_status = Some(status);
        self
    }

    pub fn with_stream_active(mut self, active: bool) -> Self {
        self.stream_active = Some(active);
        self
    }

    /// Stamp `last_refresh` with the current time.
    pub fn refreshed_now(mut self) -> Self {
        self.last_refresh = Some(Utc::now());
        self
    }

    /// `success` plus a fresh `last_refresh`.
    pub fn success() -> Self {
        Self::new()
            .with_loading(LoadingState::Success)
            .refreshed_now()
    }

    /// The forced reset applied by `cancel()`.
    pub fn reset() -> Self {
        Self::new()
            .with_loading(LoadingState::Idle)
            .with_connection(ConnectionStatus::Disconnected)
            .with_stream_active(false)
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Identity of a card inside a report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardKey {
    pub report_id: String,
    pub card_id: String,
}

impl CardKey {
    pub fn new(report_id: impl Into<String>, card_id: impl Into<String>) -> Self {
        Self {
            report_id: report_id.into(),
            card_id: card_id.into(),
        }
    }
}

impl std::fmt::Display for CardKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.report_id, self.card_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_state_is_idle_disconnected() {
        let state = ExecutionState::default();
        assert_eq!(state.loading_state, LoadingState::Idle);
        assert_eq!(state.connection_status, ConnectionStatus::Disconnected);
        assert!(!state.stream_active);
        assert!(state.error.is_none());
    }

    #[test]
    fn test_apply_partial_update_keeps_untouched_fields() {
        let mut state = ExecutionState {
            error: Some("boom".to_string()),
            stream_active: true,
            ..Default::default()
        };

        state.apply(&StateUpdate::new().with_connection(ConnectionStatus::Connected));

        assert_eq!(state.connection_status, ConnectionStatus::Connected);
        assert_eq!(state.error.as_deref(), Some("boom"));
        assert!(state.stream_active);
    }

    #[test]
    fn test_apply_error_tri_state() {
        let mut state = ExecutionState::default();

        state.apply(&StateUpdate::new().with_error("failed"));
        assert_eq!(state.error.as_deref(), Some("failed"));

        state.apply(&StateUpdate::new().with_loading(LoadingState::Loading));
        assert_eq!(state.error.as_deref(), Some("failed"));

        state.apply(&StateUpdate::new().without_error());
        assert!(state.error.is_none());
    }

    #[test]
    fn test_reset_forces_idle() {
        let mut state = ExecutionState {
            loading_state: LoadingState::Success,
            connection_status: ConnectionStatus::Connected,
            stream_active: true,
            ..Default::default()
        };
        state.apply(&StateUpdate::reset());
        assert_eq!(state.loading_state, LoadingState::Idle);
        assert_eq!(state.connection_status, ConnectionStatus::Disconnected);
        assert!(!state.stream_active);
    }

    #[test]
    fn test_success_stamps_refresh() {
        let update = StateUpdate::success();
        assert_eq!(update.loading_state, Some(LoadingState::Success));
        assert!(update.last_refresh.is_some());
        assert!(StateUpdate::new().is_empty());
    }

    #[test]
    fn test_state_serializes_camel_case() {
        let state = ExecutionState::default();
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["loadingState"], "idle");
        assert_eq!(value["connectionStatus"], "disconnected");
        assert_eq!(value["streamActive"], false);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_card_key_display() {
        let key = CardKey::new("sales", "revenue");
        assert_eq!(key.to_string(), "sales::revenue");
    }

    #[test]
    fn test_record_kind() {
        assert_eq!(record_kind(&json!({"kind": "number", "value": 1})), Some("number"));
        assert_eq!(record_kind(&json!({"value": 1})), None);
        assert_eq!(record_kind(&json!("raw")), None);
    }
}
