//! Application configuration.

use std::collections::HashSet;
use std::time::Duration;

use cardexec_core::{CardKey, Params, QueryTemplate};
use cardexec_http::HttpClientConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, AppResult};

pub const DEFAULT_CONFIG_PATH: &str = "config/cards.toml";
pub const CONFIG_ENV: &str = "CARDEXEC_CONFIG";

/// Logging settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default)]
    pub log_filter: Option<String>,
}

/// Shared HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl HttpConfig {
    pub fn client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

/// One card to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardConfig {
    pub report_id: String,
    pub card_id: String,
    pub kind: String,
    /// Passed to processors as `card_settings`.
    #[serde(default)]
    pub settings: Value,
    /// Cards without a query are loaded but never produce records.
    #[serde(default)]
    pub query: Option<QueryTemplate>,
}

impl CardConfig {
    pub fn key(&self) -> CardKey {
        CardKey::new(&self.report_id, &self.card_id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Values for `${{ runtime.* }}` placeholders.
    #[serde(default)]
    pub runtime_params: Params,
    /// Accumulate non-snapshot batches instead of replacing them.
    #[serde(default)]
    pub append_records: bool,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub cards: Vec<CardConfig>,
}

impl AppConfig {
    /// Path from the command line, then `CARDEXEC_CONFIG`, then the default.
    pub fn resolve_path(cli: Option<String>) -> String {
        cli.or_else(|| std::env::var(CONFIG_ENV).ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
    }

    /// Load from a specific file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Card keys must be non-empty and unique.
    pub fn validate(&self) -> AppResult<()> {
        let mut seen = HashSet::new();
        for card in &self.cards {
            if card.report_id.trim().is_empty() || card.card_id.trim().is_empty() {
                return Err(AppError::Config(
                    "report_id and card_id must not be empty".to_string(),
                ));
            }
            if !seen.insert(card.key()) {
                return Err(AppError::Config(format!("Duplicate card: {}", card.key())));
            }
        }
        Ok(())
    }
}

/// Parse a `key=value` command line parameter. The value is read as JSON
/// and kept as a string when it is not valid JSON.
pub fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in `{raw}`"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardexec_core::QueryVariant;
    use serde_json::json;

    const SAMPLE: &str = r#"
append_records = true

[runtime_params]
base = "http://localhost:8080"
limit = 10

[telemetry]
log_filter = "warn"

[http]
request_timeout_ms = 5000

[[cards]]
report_id = "ops"
card_id = "latency"
kind = "chart"
settings = { title = "Latency" }

[cards.query]
variant = "http"
payload = { url = "${{ runtime.base }}/latency", method = "GET" }

[[cards]]
report_id = "ops"
card_id = "notes"
kind = "markdown"
"#;

    #[test]
    fn test_parse_sample() {
        let config = AppConfig::parse(SAMPLE).unwrap();
        assert!(config.append_records);
        assert_eq!(config.runtime_params["limit"], json!(10));
        assert_eq!(config.telemetry.log_filter.as_deref(), Some("warn"));
        assert_eq!(config.http.request_timeout_ms, 5000);
        assert_eq!(config.http.connect_timeout_ms, 10_000);

        assert_eq!(config.cards.len(), 2);
        let chart = &config.cards[0];
        assert_eq!(chart.key(), CardKey::new("ops", "latency"));
        assert_eq!(chart.settings["title"], "Latency");
        assert_eq!(
            chart.query.as_ref().map(QueryTemplate::variant),
            Some(QueryVariant::Http)
        );
        assert!(config.cards[1].query.is_none());
        assert!(config.cards[1].settings.is_null());
    }

    #[test]
    fn test_shipped_card_file_parses() {
        let config = AppConfig::parse(include_str!("../../../config/cards.toml")).unwrap();
        let variants: Vec<QueryVariant> = config
            .cards
            .iter()
            .filter_map(|c| c.query.as_ref().map(QueryTemplate::variant))
            .collect();
        assert_eq!(
            variants,
            vec![
                QueryVariant::Http,
                QueryVariant::StreamingHttp,
                QueryVariant::Websocket
            ]
        );

        // Numeric fields may carry placeholders until a call resolves them.
        let prices = config.cards[2].query.as_ref().unwrap();
        assert_eq!(prices.payload["resumeSeq"], "${{ runtime.lastSeq }}");
        let mut runtime = config.runtime_params.clone();
        runtime.insert("lastSeq".to_string(), json!(7));
        match prices.resolve(&runtime).unwrap() {
            cardexec_core::QuerySpec::Websocket(p) => assert_eq!(p.resume_seq, Some(7)),
            other => panic!("expected websocket, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config = AppConfig::parse("").unwrap();
        assert!(config.cards.is_empty());
        assert_eq!(config.http.client_config().request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_duplicate_cards_rejected() {
        let content = r#"
[[cards]]
report_id = "r"
card_id = "c"
kind = "number"

[[cards]]
report_id = "r"
card_id = "c"
kind = "table"
"#;
        let err = AppConfig::parse(content).unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: Duplicate card: r::c");
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        assert!(matches!(
            AppConfig::parse("cards = 3"),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("id=42").unwrap(), ("id".to_string(), json!(42)));
        assert_eq!(
            parse_param("filter={\"a\":true}").unwrap(),
            ("filter".to_string(), json!({"a": true}))
        );
        assert_eq!(
            parse_param("region=eu-west").unwrap(),
            ("region".to_string(), json!("eu-west"))
        );
        assert_eq!(parse_param("empty=").unwrap(), ("empty".to_string(), json!("")));
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=1").is_err());
    }
}
