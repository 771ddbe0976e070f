//! HTTP client for one-shot and streamed card queries.

use std::future::Future;
use std::time::Duration;

use cardexec_core::HttpPayload;
use cardexec_stream::Utf8Decoder;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{HttpError, HttpResult};
use crate::request::{request_body, request_headers, request_url};

/// Default timeout for one-shot requests and for the streaming connect phase.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default TCP connect timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client timeouts.
#[derive(Debug, Clone, Copy)]
pub struct HttpClientConfig {
    /// Whole-request timeout for one-shot queries, and the time allowed for
    /// a streamed response to produce its headers.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// HTTP client shared by every card execution.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    config: HttpClientConfig,
}

/// Race `fut` against cancellation.
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = HttpResult<T>>,
) -> HttpResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HttpError::Cancelled),
        result = fut => result,
    }
}

fn check_status(response: &Response) -> HttpResult<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    Err(HttpError::Status {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
    })
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> HttpResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> HttpClientConfig {
        self.config
    }

    fn build(&self, payload: &HttpPayload) -> HttpResult<RequestBuilder> {
        let url = request_url(payload)?;
        let method = reqwest::Method::from_bytes(payload.method.as_str().as_bytes())
            .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;

        let mut request = self
            .client
            .request(method, url)
            .headers(request_headers(payload)?);
        if let Some(body) = request_body(payload)? {
            request = request.body(body);
        }
        Ok(request)
    }

    /// Payload timeout, falling back to the client's request timeout.
    fn request_timeout(&self, payload: &HttpPayload) -> Duration {
        payload
            .timeout
            .map(Duration::from_millis)
            .unwrap_or(self.config.request_timeout)
    }

    /// Send the request and parse the JSON response body.
    pub async fn fetch_json(
        &self,
        payload: &HttpPayload,
        cancel: &CancellationToken,
    ) -> HttpResult<Value> {
        let request = self.build(payload)?.timeout(self.request_timeout(payload));

        debug!(method = %payload.method, url = %payload.url, "Sending HTTP query");

        cancellable(cancel, async {
            let response = request.send().await?;
            check_status(&response)?;
            response
                .json::<Value>()
                .await
                .map_err(|e| HttpError::Decode(e.to_string()))
        })
        .await
    }

    /// Send the request and return the body as an incremental text stream.
    ///
    /// Only the wait for response headers is bounded by the payload or
    /// client timeout. Reading the body is bounded by cancellation alone.
    pub async fn open_stream(
        &self,
        payload: &HttpPayload,
        cancel: &CancellationToken,
    ) -> HttpResult<TextStream> {
        let request = self.build(payload)?;
        let limit = self.request_timeout(payload);

        debug!(method = %payload.method, url = %payload.url, "Opening HTTP stream");

        let response = cancellable(cancel, async {
            tokio::time::timeout(limit, request.send())
                .await
                .map_err(|_| HttpError::Timeout(limit.as_millis() as u64))?
                .map_err(HttpError::from)
        })
        .await?;

        check_status(&response)?;
        if matches!(
            response.status(),
            StatusCode::NO_CONTENT | StatusCode::RESET_CONTENT
        ) {
            return Err(HttpError::NoBody);
        }

        Ok(TextStream::new(response))
    }
}

/// Decoded text view over a streamed response body.
pub struct TextStream {
    response: Response,
    decoder: Utf8Decoder,
    bytes_read: u64,
}

impl TextStream {
    fn new(response: Response) -> Self {
        Self {
            response,
            decoder: Utf8Decoder::new(),
            bytes_read: 0,
        }
    }

    /// Total body bytes received so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Next non-empty piece of decoded text, `None` at end of body.
    pub async fn next_text(&mut self, cancel: &CancellationToken) -> HttpResult<Option<String>> {
        loop {
            let chunk = cancellable(cancel, async {
                self.response.chunk().await.map_err(HttpError::from)
            })
            .await?;

            let Some(bytes) = chunk else {
                if let Err(e) = self.decoder.finish() {
                    warn!(error = %e, "Dropping incomplete trailing bytes");
                }
                return Ok(None);
            };

            self.bytes_read += bytes.len() as u64;
            let text = self.decoder.decode(&bytes);
            if !text.is_empty() {
                return Ok(Some(text));
            }
        }
    }
}

impl std::fmt::Debug for TextStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextStream")
            .field("status", &self.response.status())
            .field("bytes_read", &self.bytes_read)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HttpClientConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let client = HttpClient::new(HttpClientConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let payload = HttpPayload {
            // Never contacted: cancellation wins the race.
            url: "http://127.0.0.1:9/unreachable".to_string(),
            ..Default::default()
        };
        let err = client.fetch_json(&payload, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_payload_timeout_overrides_client_timeout() {
        let client = HttpClient::new(HttpClientConfig::default()).unwrap();
        let mut payload = HttpPayload::default();
        assert_eq!(client.request_timeout(&payload), Duration::from_secs(30));

        payload.timeout = Some(250);
        assert_eq!(client.request_timeout(&payload), Duration::from_millis(250));
    }

    #[test]
    fn test_status_error_message() {
        let err = HttpError::Status {
            status: 503,
            status_text: "Service Unavailable".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 503: Service Unavailable");
    }
}
