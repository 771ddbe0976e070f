//! Query specifications.
//!
//! A `QuerySpec` selects one of four transports and carries its payload.
//! The serialized form is `{"variant": "...", "payload": {...}}` with
//! camelCase payload fields, so the same document loads from JSON or TOML.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::placeholder::resolve_placeholders;
use crate::types::Params;

/// Default WebSocket reconnect base delay in milliseconds.
pub fn default_reconnect_delay() -> u64 {
    1000
}

/// Default number of reconnect attempts after an abnormal close.
pub fn default_max_reconnect_attempts() -> u32 {
    5
}

/// Default client heartbeat interval in milliseconds. `0` disables pings.
pub fn default_heartbeat_interval() -> u64 {
    30_000
}

/// Default custom handler timeout in milliseconds.
pub fn default_custom_timeout() -> u64 {
    30_000
}

/// Transport variant discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryVariant {
    Http,
    StreamingHttp,
    Websocket,
    Custom,
}

impl QueryVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::StreamingHttp => "streaming-http",
            Self::Websocket => "websocket",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for QueryVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueryVariant {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "http" => Ok(Self::Http),
            "streaming-http" => Ok(Self::StreamingHttp),
            "websocket" => Ok(Self::Websocket),
            "custom" => Ok(Self::Custom),
            other => Err(CoreError::UnsupportedVariant(other.to_string())),
        }
    }
}

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    #[serde(alias = "get")]
    Get,
    #[serde(alias = "post")]
    Post,
    #[serde(alias = "put")]
    Put,
    #[serde(alias = "patch")]
    Patch,
    #[serde(alias = "delete")]
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    pub fn is_get(&self) -> bool {
        matches!(self, Self::Get)
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-shot HTTP payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpPayload {
    #[serde(default)]
    pub method: HttpMethod,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub params: Params,
    /// Per-request timeout in milliseconds, on top of the client timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Wire format of a streamed response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    Sse,
    Ndjson,
    Delimited,
    Json,
}

impl StreamFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sse => "sse",
            Self::Ndjson => "ndjson",
            Self::Delimited => "delimited",
            Self::Json => "json",
        }
    }
}

impl std::fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Streaming HTTP payload: an HTTP request plus framing hints.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingHttpPayload {
    #[serde(flatten)]
    pub request: HttpPayload,
    /// Forced wire format. Auto-detected per chunk when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_format: Option<StreamFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_delimiter: Option<String>,
}

/// WebSocket message acknowledgment policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    #[default]
    Auto,
    Manual,
}

impl AckPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

/// Compression requested in the subscribe message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Deflate,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }
}

/// WebSocket sub-protocols: a single name or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Protocols {
    One(String),
    Many(Vec<String>),
}

impl Protocols {
    /// Comma-joined value for the `Sec-WebSocket-Protocol` header.
    /// `None` when no protocol is named.
    pub fn header_value(&self) -> Option<String> {
        let joined = match self {
            Self::One(name) => name.trim().to_string(),
            Self::Many(names) => names
                .iter()
                .map(|n| n.trim())
                .filter(|n| !n.is_empty())
                .collect::<Vec<_>>()
                .join(", "),
        };
        (!joined.is_empty()).then_some(joined)
    }
}

/// WebSocket subscription payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketPayload {
    pub url: String,
    #[serde(default, skip_serializing_if = "Params::is_empty")]
    pub params: Params,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_seq: Option<u64>,
    pub subscription_id: String,
    #[serde(default)]
    pub ack_policy: AckPolicy,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocols: Option<Protocols>,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl WebSocketPayload {
    pub fn new(
        url: impl Into<String>,
        topic: impl Into<String>,
        subscription_id: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            params: Params::new(),
            topic: topic.into(),
            resume_seq: None,
            subscription_id: subscription_id.into(),
            ack_policy: AckPolicy::default(),
            compression: Compression::default(),
            protocols: None,
            reconnect_delay: default_reconnect_delay(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval: default_heartbeat_interval(),
            headers: BTreeMap::new(),
        }
    }
}

/// Custom handler payload. The handler itself is registered by name on
/// the execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomPayload {
    pub handler: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default = "default_custom_timeout")]
    pub timeout: u64,
}

impl CustomPayload {
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            params: Params::new(),
            streaming: false,
            timeout: default_custom_timeout(),
        }
    }
}

/// A card's data query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant", content = "payload", rename_all = "kebab-case")]
pub enum QuerySpec {
    Http(HttpPayload),
    StreamingHttp(StreamingHttpPayload),
    Websocket(WebSocketPayload),
    Custom(CustomPayload),
}

impl QuerySpec {
    pub fn variant(&self) -> QueryVariant {
        match self {
            Self::Http(_) => QueryVariant::Http,
            Self::StreamingHttp(_) => QueryVariant::StreamingHttp,
            Self::Websocket(_) => QueryVariant::Websocket,
            Self::Custom(_) => QueryVariant::Custom,
        }
    }

    /// Parse a spec from its JSON form.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| CoreError::InvalidQuery(e.to_string()))
    }

    /// Check the query is executable.
    pub fn validate(&self) -> Result<()> {
        let url = match self {
            Self::Http(p) => &p.url,
            Self::StreamingHttp(p) => &p.request.url,
            Self::Websocket(p) => {
                if p.url.trim().is_empty() {
                    return Err(CoreError::InvalidQuery(
                        "WebSocket URL is required in payload".to_string(),
                    ));
                }
                return Ok(());
            }
            Self::Custom(p) => {
                if p.handler.trim().is_empty() {
                    return Err(CoreError::InvalidQuery(
                        "Custom handler name is required".to_string(),
                    ));
                }
                return Ok(());
            }
        };
        if url.trim().is_empty() {
            return Err(CoreError::InvalidQuery("URL is required in payload".to_string()));
        }
        Ok(())
    }
}

/// A configured query before placeholder resolution.
///
/// The payload stays untyped so that any field, numeric or not, can hold a
/// `${{ runtime.* }}` placeholder. It is typed into a [`QuerySpec`] once per
/// invocation, after resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryTemplate {
    pub variant: QueryVariant,
    #[serde(default)]
    pub payload: Value,
}

impl QueryTemplate {
    pub fn new(variant: QueryVariant, payload: Value) -> Self {
        Self { variant, payload }
    }

    /// Parse a template from `{"variant": ..., "payload": ...}`.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| CoreError::InvalidQuery(e.to_string()))
    }

    pub fn variant(&self) -> QueryVariant {
        self.variant
    }

    /// Substitute `${{ runtime.* }}` placeholders throughout the payload.
    pub fn substitute(&self, runtime: &Params) -> QueryTemplate {
        Self {
            variant: self.variant,
            payload: resolve_placeholders(&self.payload, runtime),
        }
    }

    /// Type the payload for its variant.
    pub fn to_spec(&self) -> Result<QuerySpec> {
        fn typed<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T> {
            T::deserialize(payload).map_err(|e| CoreError::InvalidQuery(e.to_string()))
        }

        Ok(match self.variant {
            QueryVariant::Http => QuerySpec::Http(typed(&self.payload)?),
            QueryVariant::StreamingHttp => QuerySpec::StreamingHttp(typed(&self.payload)?),
            QueryVariant::Websocket => QuerySpec::Websocket(typed(&self.payload)?),
            QueryVariant::Custom => QuerySpec::Custom(typed(&self.payload)?),
        })
    }

    /// Substitute placeholders, then type the result. A resolved payload
    /// that does not fit its variant (a required string turned `null`, a
    /// number field given text) is an `InvalidQuery` error.
    pub fn resolve(&self, runtime: &Params) -> Result<QuerySpec> {
        self.substitute(runtime).to_spec()
    }
}

impl TryFrom<&QuerySpec> for QueryTemplate {
    type Error = CoreError;

    fn try_from(spec: &QuerySpec) -> Result<Self> {
        let payload = match spec {
            QuerySpec::Http(p) => serde_json::to_value(p)?,
            QuerySpec::StreamingHttp(p) => serde_json::to_value(p)?,
            QuerySpec::Websocket(p) => serde_json::to_value(p)?,
            QuerySpec::Custom(p) => serde_json::to_value(p)?,
        };
        Ok(Self::new(spec.variant(), payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_http_spec_from_json_defaults() {
        let spec = QuerySpec::from_value(json!({
            "variant": "http",
            "payload": {"url": "https://api.test/cards", "params": {"id": 1}}
        }))
        .unwrap();

        match &spec {
            QuerySpec::Http(p) => {
                assert_eq!(p.method, HttpMethod::Get);
                assert_eq!(p.params.get("id"), Some(&json!(1)));
                assert!(p.headers.is_empty());
            }
            other => panic!("expected http, got {other:?}"),
        }
        assert_eq!(spec.variant(), QueryVariant::Http);
        assert_eq!(spec.variant().to_string(), "http");
    }

    #[test]
    fn test_streaming_spec_flattens_request() {
        let spec = QuerySpec::from_value(json!({
            "variant": "streaming-http",
            "payload": {
                "method": "POST",
                "url": "https://api.test/stream",
                "streamFormat": "ndjson",
                "streamDelimiter": "|"
            }
        }))
        .unwrap();

        let QuerySpec::StreamingHttp(p) = spec else {
            panic!("expected streaming-http");
        };
        assert_eq!(p.request.method, HttpMethod::Post);
        assert_eq!(p.stream_format, Some(StreamFormat::Ndjson));
        assert_eq!(p.stream_delimiter.as_deref(), Some("|"));
    }

    #[test]
    fn test_websocket_defaults() {
        let spec = QuerySpec::from_value(json!({
            "variant": "websocket",
            "payload": {"url": "ws://localhost/ws", "topic": "ticks", "subscriptionId": "s1"}
        }))
        .unwrap();

        let QuerySpec::Websocket(p) = spec else {
            panic!("expected websocket");
        };
        assert_eq!(p.ack_policy, AckPolicy::Auto);
        assert_eq!(p.compression, Compression::None);
        assert_eq!(p.reconnect_delay, 1000);
        assert_eq!(p.max_reconnect_attempts, 5);
        assert_eq!(p.heartbeat_interval, 30_000);
        assert!(p.protocols.is_none());
    }

    #[test]
    fn test_protocols_string_or_list() {
        let one: Protocols = serde_json::from_value(json!("graphql-ws")).unwrap();
        assert_eq!(one.header_value().as_deref(), Some("graphql-ws"));

        let many: Protocols = serde_json::from_value(json!(["v1", " v2 ", ""])).unwrap();
        assert_eq!(many.header_value().as_deref(), Some("v1, v2"));

        assert!(Protocols::Many(vec![]).header_value().is_none());
    }

    #[test]
    fn test_custom_defaults() {
        let spec = QuerySpec::from_value(json!({
            "variant": "custom",
            "payload": {"handler": "metrics"}
        }))
        .unwrap();
        assert_eq!(spec, QuerySpec::Custom(CustomPayload::new("metrics")));
    }

    #[test]
    fn test_unknown_variant_is_invalid() {
        let err = QuerySpec::from_value(json!({"variant": "ftp", "payload": {}})).unwrap_err();
        assert!(matches!(err, CoreError::InvalidQuery(_)));
        assert!("ftp".parse::<QueryVariant>().is_err());
        assert_eq!(
            "streaming-http".parse::<QueryVariant>().unwrap(),
            QueryVariant::StreamingHttp
        );
    }

    fn runtime(value: Value) -> Params {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_resolve_substitutes_placeholders() {
        let template = QueryTemplate::from_value(json!({
            "variant": "http",
            "payload": {
                "url": "https://api.test/${{ runtime.region }}/cards",
                "params": {"limit": "${{ runtime.limit }}"}
            }
        }))
        .unwrap();

        let QuerySpec::Http(p) = template
            .resolve(&runtime(json!({"region": "eu", "limit": 10})))
            .unwrap()
        else {
            panic!("expected http");
        };
        assert_eq!(p.url, "https://api.test/eu/cards");
        assert_eq!(p.params.get("limit"), Some(&json!(10)));
    }

    #[test]
    fn test_numeric_websocket_fields_take_placeholders() {
        let template = QueryTemplate::from_value(json!({
            "variant": "websocket",
            "payload": {
                "url": "ws://localhost/ws",
                "topic": "ticks",
                "subscriptionId": "s1",
                "resumeSeq": "${{ runtime.lastSeq }}",
                "heartbeatInterval": "${{ runtime.heartbeat }}",
                "ackPolicy": "${{ runtime.ack }}"
            }
        }))
        .unwrap();

        let resolved = template
            .resolve(&runtime(json!({"lastSeq": 42, "heartbeat": 0, "ack": "manual"})))
            .unwrap();
        let QuerySpec::Websocket(p) = resolved else {
            panic!("expected websocket");
        };
        assert_eq!(p.resume_seq, Some(42));
        assert_eq!(p.heartbeat_interval, 0);
        assert_eq!(p.ack_policy, AckPolicy::Manual);
    }

    #[test]
    fn test_missing_optional_number_resolves_to_none() {
        let template = QueryTemplate::from_value(json!({
            "variant": "websocket",
            "payload": {
                "url": "ws://localhost/ws",
                "topic": "ticks",
                "subscriptionId": "s1",
                "resumeSeq": "${{ runtime.lastSeq }}"
            }
        }))
        .unwrap();

        let QuerySpec::Websocket(p) = template.resolve(&Params::new()).unwrap() else {
            panic!("expected websocket");
        };
        assert_eq!(p.resume_seq, None);
    }

    #[test]
    fn test_custom_timeout_and_streaming_take_placeholders() {
        let template = QueryTemplate::from_value(json!({
            "variant": "custom",
            "payload": {
                "handler": "metrics",
                "timeout": "${{ runtime.timeoutMs }}",
                "streaming": "${{ runtime.live }}"
            }
        }))
        .unwrap();

        let resolved = template
            .resolve(&runtime(json!({"timeoutMs": 250, "live": true})))
            .unwrap();
        let QuerySpec::Custom(p) = resolved else {
            panic!("expected custom");
        };
        assert_eq!(p.timeout, 250);
        assert!(p.streaming);
    }

    #[test]
    fn test_resolve_to_invalid_spec_fails() {
        let template = QueryTemplate::new(
            QueryVariant::Http,
            json!({"url": "${{ runtime.missing }}"}),
        );
        let err = template.resolve(&Params::new()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidQuery(_)));

        let template = QueryTemplate::new(
            QueryVariant::Custom,
            json!({"handler": "h", "timeout": "${{ runtime.timeoutMs }}"}),
        );
        let err = template
            .resolve(&runtime(json!({"timeoutMs": "soon"})))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidQuery(_)));
    }

    #[test]
    fn test_template_keeps_unresolved_payload() {
        let template: QueryTemplate = toml::from_str(
            r#"
            variant = "custom"
            [payload]
            handler = "metrics"
            timeout = "${{ runtime.timeoutMs }}"
            "#,
        )
        .unwrap();
        assert_eq!(template.variant(), QueryVariant::Custom);
        assert_eq!(template.payload["timeout"], "${{ runtime.timeoutMs }}");
        assert!(QueryTemplate::from_value(json!({"variant": "ftp"})).is_err());
    }

    #[test]
    fn test_template_from_typed_query() {
        let spec = QuerySpec::Custom(CustomPayload::new("metrics"));
        let template = QueryTemplate::try_from(&spec).unwrap();
        assert_eq!(template.variant(), QueryVariant::Custom);
        assert_eq!(template.to_spec().unwrap(), spec);
    }

    #[test]
    fn test_validate() {
        let empty = QuerySpec::Http(HttpPayload::default());
        assert!(empty.validate().is_err());

        let ws = QuerySpec::Websocket(WebSocketPayload::new("", "t", "s"));
        assert!(ws.validate().is_err());

        let ok = QuerySpec::Custom(CustomPayload::new("h"));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_spec_loads_from_toml() {
        let spec: QuerySpec = toml::from_str(
            r#"
            variant = "websocket"
            [payload]
            url = "ws://localhost:9000/feed"
            topic = "orders"
            subscriptionId = "orders-1"
            ackPolicy = "manual"
            protocols = ["v1"]
            heartbeatInterval = 0
            "#,
        )
        .unwrap();
        let QuerySpec::Websocket(p) = spec else {
            panic!("expected websocket");
        };
        assert_eq!(p.ack_policy, AckPolicy::Manual);
        assert_eq!(p.heartbeat_interval, 0);
        assert_eq!(p.protocols, Some(Protocols::Many(vec!["v1".to_string()])));
    }
}
