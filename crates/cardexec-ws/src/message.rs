//! Subscription protocol messages.
//!
//! Outbound frames are JSON objects tagged by `action`. Inbound frames are
//! decoded as JSON (falling back to the raw string) and split into control
//! messages, consumed by the connection, and data messages, forwarded.

use cardexec_core::{AckPolicy, Compression, Params, WebSocketPayload};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::WsResult;

/// Client identifier sent in the subscribe message.
pub const USER_AGENT: &str = concat!("cardexec/", env!("CARGO_PKG_VERSION"));

/// Identity of the subscribing card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub report_id: String,
    pub card_id: String,
    pub kind: String,
    pub user_agent: String,
}

impl ClientInfo {
    pub fn new(
        report_id: impl Into<String>,
        card_id: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            report_id: report_id.into(),
            card_id: card_id.into(),
            kind: kind.into(),
            user_agent: USER_AGENT.to_string(),
        }
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Outbound message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WsRequest {
    #[serde(rename_all = "camelCase")]
    Subscribe {
        topic: String,
        subscription_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        resume_seq: Option<u64>,
        ack_policy: AckPolicy,
        compression: Compression,
        #[serde(skip_serializing_if = "Params::is_empty")]
        params: Params,
        timestamp: String,
        client_info: ClientInfo,
    },
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        subscription_id: String,
        timestamp: String,
    },
    Ping,
    Pong {
        timestamp: String,
    },
    #[serde(rename_all = "camelCase")]
    Ack {
        message_id: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        subscription_id: Option<String>,
        timestamp: String,
    },
}

impl WsRequest {
    pub fn subscribe(payload: &WebSocketPayload, client: &ClientInfo) -> Self {
        Self::Subscribe {
            topic: payload.topic.clone(),
            subscription_id: payload.subscription_id.clone(),
            resume_seq: payload.resume_seq,
            ack_policy: payload.ack_policy,
            compression: payload.compression,
            params: payload.params.clone(),
            timestamp: timestamp(),
            client_info: client.clone(),
        }
    }

    pub fn unsubscribe(subscription_id: impl Into<String>) -> Self {
        Self::Unsubscribe {
            subscription_id: subscription_id.into(),
            timestamp: timestamp(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: timestamp(),
        }
    }

    /// Acknowledgment. The automatic ack names the subscription, a manual
    /// ack does not.
    pub fn ack(message_id: Value, subscription_id: Option<String>) -> Self {
        Self::Ack {
            message_id,
            subscription_id,
            timestamp: timestamp(),
        }
    }

    pub fn to_text(&self) -> WsResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Inbound message after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Server heartbeat; answered with a pong.
    Ping,
    Pong,
    Ack,
    Subscribed,
    /// Server-side error report. Logged, never forwarded.
    ServerError(String),
    /// Subscription rejected. Surfaces as an error without closing.
    SubscriptionError(String),
    Data(Value),
}

/// Frame text as JSON, or the raw string when it is not JSON.
pub fn decode_frame(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// `message`, else `error`, as display text.
fn error_text(value: &Value) -> String {
    let field = value
        .get("message")
        .filter(|v| !v.is_null())
        .or_else(|| value.get("error").filter(|v| !v.is_null()));
    match field {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "unknown error".to_string(),
    }
}

pub fn classify_inbound(value: Value) -> Inbound {
    let action = value.get("action").and_then(Value::as_str);
    match action {
        Some("ping") => Inbound::Ping,
        Some("pong") => Inbound::Pong,
        Some("ack") => Inbound::Ack,
        Some("subscribed") => Inbound::Subscribed,
        Some("error") => Inbound::ServerError(error_text(&value)),
        Some("subscription_error") => Inbound::SubscriptionError(error_text(&value)),
        _ => Inbound::Data(value),
    }
}

/// Acknowledgment id of a data message: `id`, else `messageId`.
/// Only non-empty strings and numbers count.
pub fn message_id(value: &Value) -> Option<Value> {
    ["id", "messageId"]
        .iter()
        .filter_map(|key| value.get(*key))
        .find(|v| match v {
            Value::String(s) => !s.is_empty(),
            Value::Number(_) => true,
            _ => false,
        })
        .cloned()
}
