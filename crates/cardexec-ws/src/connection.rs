//! Subscription connection driver.
//!
//! One spawned task owns the socket for the lifetime of a subscription. It
//! connects, subscribes, runs the message loop, and reconnects with
//! exponential backoff after abnormal closures. Callers talk to it through
//! [`WsHandle`] and receive [`WsEvent`]s over a channel.

use cardexec_core::{AckPolicy, WebSocketPayload};
use cardexec_telemetry::Metrics;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{WsError, WsResult};
use crate::handle::WsHandle;
use crate::heartbeat::{next_tick, HeartbeatMonitor};
use crate::message::{classify_inbound, decode_frame, message_id, ClientInfo, Inbound, WsRequest};

/// Time allowed for the opening handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound of the reconnect delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Time allowed for unsubscribe and close frames on manual close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Status used when a close frame carries no code.
const CLOSE_NO_STATUS: u16 = 1005;

/// Status used when the stream ends without a close frame.
const CLOSE_ABNORMAL: u16 = 1006;

const EVENT_CHANNEL_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Subscription connection configuration.
#[derive(Debug, Clone)]
pub struct WsConfig {
    pub payload: WebSocketPayload,
    pub client: ClientInfo,
    pub connect_timeout: Duration,
    pub max_backoff: Duration,
}

impl WsConfig {
    pub fn new(payload: WebSocketPayload, client: ClientInfo) -> Self {
        Self {
            payload,
            client,
            connect_timeout: CONNECT_TIMEOUT,
            max_backoff: MAX_BACKOFF,
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.payload.reconnect_delay)
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    /// Socket closed, the driver is deciding whether to reconnect.
    Disconnected,
    /// Driver finished. Terminal.
    Closed,
}

/// Event delivered to the subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum WsEvent {
    /// A connection attempt started. `attempt` is 0 for the first one.
    Connecting { attempt: u32 },
    /// Socket open and subscribe message sent.
    Connected { session_id: Uuid },
    /// Data message, control messages already filtered out.
    Message(Value),
    SubscriptionError(String),
    /// Socket closed. `error` is set when the close came from a transport failure.
    Disconnected {
        code: u16,
        reason: String,
        error: Option<String>,
    },
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    /// Reconnect attempts used up. Terminal.
    Exhausted { attempts: u32 },
}

/// Reconnect delay for the `attempt`-th consecutive reconnect (1-based):
/// `min(base * 2^(attempt-1), cap)`.
pub fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(cap)
}

/// Handshake request carrying payload headers and sub-protocols.
pub fn build_request(payload: &WebSocketPayload) -> WsResult<Request> {
    let mut request = payload.url.as_str().into_client_request()?;
    let headers = request.headers_mut();

    for (name, value) in &payload.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| WsError::InvalidRequest(format!("header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| WsError::InvalidRequest(format!("header {name}: {e}")))?;
        headers.insert(name, value);
    }

    if let Some(protocols) = payload.protocols.as_ref().and_then(|p| p.header_value()) {
        let value = HeaderValue::from_str(&protocols)
            .map_err(|e| WsError::InvalidRequest(format!("protocols {protocols:?}: {e}")))?;
        headers.insert(SEC_WEBSOCKET_PROTOCOL, value);
    }

    Ok(request)
}

fn reconnect_reason(code: u16, error: Option<&str>) -> &'static str {
    match (code, error) {
        (_, Some(_)) => "error",
        (CLOSE_NO_STATUS, None) => "no_status",
        (CLOSE_ABNORMAL, None) => "stream_ended",
        _ => "server_close",
    }
}

/// Why the driver stopped.
#[derive(Debug, Clone)]
pub(crate) enum Failure {
    Timeout,
    Connect(String),
    Closed { code: u16, reason: String },
    Exhausted(u32),
}

impl Failure {
    fn from_connect(err: &WsError) -> Self {
        match err {
            WsError::ConnectTimeout => Self::Timeout,
            other => Self::Connect(other.to_string()),
        }
    }

    pub(crate) fn to_error(&self) -> WsError {
        match self {
            Self::Timeout => WsError::ConnectTimeout,
            Self::Connect(msg) => WsError::ConnectionFailed(msg.clone()),
            Self::Closed { code, reason } => WsError::ConnectionClosed {
                code: *code,
                reason: reason.clone(),
            },
            Self::Exhausted(n) => WsError::ReconnectExhausted(*n),
        }
    }
}

/// How one open socket ended.
enum SessionEnd {
    Cancelled,
    Closed {
        code: u16,
        reason: String,
        error: Option<String>,
    },
}

impl SessionEnd {
    fn lost(err: impl std::fmt::Display) -> Self {
        Self::Closed {
            code: CLOSE_ABNORMAL,
            reason: String::new(),
            error: Some(err.to_string()),
        }
    }
}

/// State shared between the driver task and its handles.
pub(crate) struct Shared {
    pub(crate) config: WsConfig,
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) outbound: mpsc::UnboundedSender<String>,
    events: mpsc::Sender<WsEvent>,
    /// Set on manual close. No events are delivered afterwards.
    pub(crate) detached: AtomicBool,
    pub(crate) cancel: CancellationToken,
    pub(crate) heartbeat: HeartbeatMonitor,
    pub(crate) failure: Mutex<Option<Failure>>,
    pub(crate) session: RwLock<Option<Uuid>>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn emit(&self, event: WsEvent) {
        if self.detached.load(Ordering::Acquire) {
            return;
        }
        if self.events.send(event).await.is_err() {
            debug!("WebSocket event receiver dropped");
        }
    }

    async fn establish(&self) -> WsResult<WsStream> {
        let request = build_request(&self.config.payload)?;
        let limit = self.config.connect_timeout;

        info!(url = %self.config.payload.url, topic = %self.config.payload.topic, "Connecting to WebSocket");

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(WsError::Cancelled),
            r = tokio::time::timeout(limit, connect_async_tls_with_config(request, None, true, None)) => r,
        };
        let (stream, _response) = result.map_err(|_| WsError::ConnectTimeout)??;
        Ok(stream)
    }

    async fn send(&self, write: &mut WsSink, request: &WsRequest) -> WsResult<()> {
        write.send(Message::Text(request.to_text()?)).await?;
        Ok(())
    }

    async fn handle_text(&self, text: &str, write: &mut WsSink) -> WsResult<()> {
        self.heartbeat.record_message();

        match classify_inbound(decode_frame(text)) {
            Inbound::Ping => {
                debug!("Received ping, sending pong");
                self.send(write, &WsRequest::pong()).await?;
            }
            Inbound::Pong => self.heartbeat.record_pong(),
            Inbound::Ack | Inbound::Subscribed => {
                debug!("Received control message");
            }
            Inbound::ServerError(message) => {
                warn!(%message, "WebSocket server error");
            }
            Inbound::SubscriptionError(message) => {
                error!(%message, "WebSocket subscription error");
                self.emit(WsEvent::SubscriptionError(message)).await;
            }
            Inbound::Data(value) => {
                let payload = &self.config.payload;
                if payload.ack_policy == AckPolicy::Auto {
                    if let Some(id) = message_id(&value) {
                        let ack = WsRequest::ack(id, Some(payload.subscription_id.clone()));
                        self.send(write, &ack).await?;
                    }
                }
                self.emit(WsEvent::Message(value)).await;
            }
        }
        Ok(())
    }

    /// Unsubscribe and close with 1000, bounded by [`CLOSE_TIMEOUT`].
    async fn close_gracefully(&self, write: &mut WsSink) {
        let unsubscribe = WsRequest::unsubscribe(self.config.payload.subscription_id.clone());
        let close = async {
            if let Err(e) = self.send(write, &unsubscribe).await {
                debug!(error = %e, "Unsubscribe on close failed");
            }
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "User cancelled".into(),
            };
            if let Err(e) = write.send(Message::Close(Some(frame))).await {
                debug!(error = %e, "Close frame failed");
            }
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
            warn!("Timed out closing WebSocket");
        }
    }

    async fn run_session(
        &self,
        stream: WsStream,
        outbound: &mut mpsc::UnboundedReceiver<String>,
    ) -> SessionEnd {
        let (mut write, mut read) = stream.split();

        // Anything queued for the previous socket is stale.
        while outbound.try_recv().is_ok() {}

        let subscribe = WsRequest::subscribe(&self.config.payload, &self.config.client);
        if let Err(e) = self.send(&mut write, &subscribe).await {
            return SessionEnd::lost(e);
        }

        let session_id = Uuid::new_v4();
        *self.session.write() = Some(session_id);
        self.heartbeat.reset();
        self.set_state(ConnectionState::Connected);
        Metrics::ws_connected();
        info!(%session_id, topic = %self.config.payload.topic, "WebSocket subscribed");
        self.emit(WsEvent::Connected { session_id }).await;

        let mut ticker = self.heartbeat.ticker();

        let end = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.close_gracefully(&mut write).await;
                    break SessionEnd::Cancelled;
                }

                msg = read.next() => {
                    let result = match msg {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text, &mut write).await,
                        Some(Ok(Message::Binary(bytes))) => {
                            self.handle_text(&String::from_utf8_lossy(&bytes), &mut write).await
                        }
                        // tungstenite answers protocol pings itself.
                        Some(Ok(Message::Ping(_))) => Ok(()),
                        Some(Ok(Message::Pong(_))) => {
                            self.heartbeat.record_pong();
                            Ok(())
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (u16::from(f.code), f.reason.to_string()))
                                .unwrap_or((CLOSE_NO_STATUS, String::new()));
                            warn!(code, %reason, "WebSocket closed by server");
                            break SessionEnd::Closed { code, reason, error: None };
                        }
                        Some(Ok(Message::Frame(_))) => Ok(()),
                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket read error");
                            break SessionEnd::lost(e);
                        }
                        None => {
                            warn!("WebSocket stream ended");
                            break SessionEnd::Closed {
                                code: CLOSE_ABNORMAL,
                                reason: String::new(),
                                error: None,
                            };
                        }
                    };
                    if let Err(e) = result {
                        error!(error = %e, "WebSocket write failed");
                        break SessionEnd::lost(e);
                    }
                }

                Some(text) = outbound.recv() => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        error!(error = %e, "WebSocket write failed");
                        break SessionEnd::lost(e);
                    }
                }

                _ = next_tick(&mut ticker) => {
                    if let Err(e) = self.send(&mut write, &WsRequest::Ping).await {
                        break SessionEnd::lost(e);
                    }
                    self.heartbeat.record_ping();
                    debug!("Sent heartbeat ping");
                }
            }
        };

        *self.session.write() = None;
        Metrics::ws_disconnected();
        end
    }
}

/// Connect/subscribe/reconnect loop. Runs until cancelled, closed normally,
/// out of attempts, or the first connection fails.
async fn run(shared: Arc<Shared>, mut outbound: mpsc::UnboundedReceiver<String>) {
    let max_attempts = shared.config.payload.max_reconnect_attempts;
    let mut attempts = 0u32;
    let mut ever_connected = false;

    let failure = loop {
        shared.set_state(ConnectionState::Connecting);
        shared.emit(WsEvent::Connecting { attempt: attempts }).await;

        let end = match shared.establish().await {
            Ok(stream) => {
                ever_connected = true;
                attempts = 0;
                shared.run_session(stream, &mut outbound).await
            }
            Err(WsError::Cancelled) => SessionEnd::Cancelled,
            Err(e) if !ever_connected => {
                error!(error = %e, "WebSocket connection failed");
                break Some(Failure::from_connect(&e));
            }
            Err(e) => {
                warn!(error = %e, attempt = attempts, "WebSocket reconnection failed");
                SessionEnd::lost(e)
            }
        };

        let (code, reason, error) = match end {
            SessionEnd::Cancelled => break None,
            SessionEnd::Closed {
                code,
                reason,
                error,
            } => (code, reason, error),
        };

        shared.set_state(ConnectionState::Disconnected);
        shared
            .emit(WsEvent::Disconnected {
                code,
                reason: reason.clone(),
                error: error.clone(),
            })
            .await;

        if code == 1000 || code == 1001 {
            info!(code, "WebSocket closed normally, not reconnecting");
            break Some(Failure::Closed { code, reason });
        }

        if attempts >= max_attempts {
            error!(attempts = max_attempts, "Max reconnection attempts reached");
            shared
                .emit(WsEvent::Exhausted {
                    attempts: max_attempts,
                })
                .await;
            break Some(Failure::Exhausted(max_attempts));
        }

        attempts += 1;
        let delay = backoff_delay(
            shared.config.reconnect_delay(),
            attempts,
            shared.config.max_backoff,
        );
        Metrics::ws_reconnect(reconnect_reason(code, error.as_deref()));
        warn!(attempt = attempts, max_attempts, delay_ms = delay.as_millis() as u64, "Reconnecting");

        shared.set_state(ConnectionState::Reconnecting);
        shared
            .emit(WsEvent::Reconnecting {
                attempt: attempts,
                max_attempts,
                delay,
            })
            .await;

        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break None,
            _ = tokio::time::sleep(delay) => {}
        }
    };

    *shared.failure.lock() = failure;
    shared.set_state(ConnectionState::Closed);
    debug!("WebSocket driver stopped");
}

/// Start the driver without waiting for the first connection.
pub fn spawn_connection(config: WsConfig, events: mpsc::Sender<WsEvent>) -> WsHandle {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (state, _) = watch::channel(ConnectionState::Connecting);
    let heartbeat = HeartbeatMonitor::new(config.payload.heartbeat_interval);

    let shared = Arc::new(Shared {
        config,
        state,
        outbound: outbound_tx,
        events,
        detached: AtomicBool::new(false),
        cancel: CancellationToken::new(),
        heartbeat,
        failure: Mutex::new(None),
        session: RwLock::new(None),
    });

    let driver = tokio::spawn(run(shared.clone(), outbound_rx));
    WsHandle::new(shared, driver)
}

/// Start the driver and wait for the first connection to open.
///
/// A failed first connection is terminal: nothing is retried.
pub async fn connect(config: WsConfig, events: mpsc::Sender<WsEvent>) -> WsResult<WsHandle> {
    let handle = spawn_connection(config, events);
    if let Err(e) = handle.wait_connected().await {
        handle.close();
        return Err(e);
    }
    Ok(handle)
}

/// Event channel sized for one subscription.
pub fn event_channel() -> (mpsc::Sender<WsEvent>, mpsc::Receiver<WsEvent>) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardexec_core::Protocols;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(1000);
        let delays: Vec<u64> = (1..=7)
            .map(|n| backoff_delay(base, n, MAX_BACKOFF).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn test_backoff_extremes() {
        let base = Duration::from_millis(250);
        assert_eq!(backoff_delay(base, 0, MAX_BACKOFF), base);
        assert_eq!(backoff_delay(base, u32::MAX, MAX_BACKOFF), MAX_BACKOFF);
        assert_eq!(backoff_delay(Duration::ZERO, 5, MAX_BACKOFF), Duration::ZERO);
    }

    #[test]
    fn test_build_request_headers_and_protocols() {
        let mut payload = WebSocketPayload::new("ws://127.0.0.1:9/feed", "t", "s");
        payload
            .headers
            .insert("Authorization".to_string(), "Bearer abc".to_string());
        payload.protocols = Some(Protocols::Many(vec!["v1".to_string(), "v2".to_string()]));

        let request = build_request(&payload).unwrap();
        assert_eq!(request.uri().path(), "/feed");
        assert_eq!(request.headers()["authorization"], "Bearer abc");
        assert_eq!(request.headers()[SEC_WEBSOCKET_PROTOCOL], "v1, v2");
    }

    #[test]
    fn test_build_request_rejects_bad_input() {
        let payload = WebSocketPayload::new("not a url", "t", "s");
        assert!(build_request(&payload).is_err());

        let mut payload = WebSocketPayload::new("ws://127.0.0.1:9", "t", "s");
        payload.headers.insert("bad name".to_string(), "v".to_string());
        assert!(matches!(
            build_request(&payload),
            Err(WsError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_failure_messages() {
        assert_eq!(
            Failure::Timeout.to_error().to_string(),
            "WebSocket connection timeout"
        );
        assert_eq!(
            Failure::Connect("refused".to_string()).to_error().to_string(),
            "WebSocket connection failed: refused"
        );
        assert_eq!(
            Failure::Exhausted(5).to_error().to_string(),
            "WebSocket connection failed after 5 attempts"
        );
    }

    #[test]
    fn test_reconnect_reason_labels() {
        assert_eq!(reconnect_reason(1006, Some("reset")), "error");
        assert_eq!(reconnect_reason(1005, None), "no_status");
        assert_eq!(reconnect_reason(1006, None), "stream_ended");
        assert_eq!(reconnect_reason(4000, None), "server_close");
    }
}
