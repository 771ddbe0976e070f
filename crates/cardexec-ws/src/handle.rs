//! Cloneable handle to a subscription connection.
//!
//! Writes go through a channel to the driver task, so the handle stays
//! valid across reconnects. Sends are refused while the socket is not open.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::{ConnectionState, Shared};
use crate::error::{WsError, WsResult};
use crate::heartbeat::HeartbeatStats;
use crate::message::WsRequest;

#[derive(Clone)]
pub struct WsHandle {
    shared: Arc<Shared>,
    driver: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl WsHandle {
    pub(crate) fn new(shared: Arc<Shared>, driver: JoinHandle<()>) -> Self {
        Self {
            shared,
            driver: Arc::new(Mutex::new(Some(driver))),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Id of the open socket, `None` while disconnected.
    pub fn session_id(&self) -> Option<Uuid> {
        *self.shared.session.read()
    }

    pub fn subscription_id(&self) -> &str {
        &self.shared.config.payload.subscription_id
    }

    pub fn heartbeat_stats(&self) -> HeartbeatStats {
        self.shared.heartbeat.stats()
    }

    /// Queue a text frame on the open socket.
    pub fn send_text(&self, text: impl Into<String>) -> WsResult<()> {
        if !self.is_connected() {
            warn!("Cannot send message: WebSocket is not connected");
            return Err(WsError::NotConnected);
        }
        self.shared
            .outbound
            .send(text.into())
            .map_err(|_| WsError::NotConnected)
    }

    /// Queue a message. Strings go out verbatim, anything else as JSON.
    pub fn send_json(&self, message: &Value) -> WsResult<()> {
        match message {
            Value::String(text) => self.send_text(text.clone()),
            other => self.send_text(serde_json::to_string(other)?),
        }
    }

    /// Acknowledge one message by id.
    pub fn send_ack(&self, message_id: &str) -> WsResult<()> {
        let ack = WsRequest::ack(Value::String(message_id.to_string()), None);
        self.send_text(ack.to_text()?)
    }

    /// Send an unsubscribe for `subscription_id`, or for this connection's
    /// own subscription. Silently skipped while disconnected.
    pub fn unsubscribe(&self, subscription_id: Option<&str>) -> WsResult<()> {
        if !self.is_connected() {
            debug!("Skipping unsubscribe: WebSocket is not connected");
            return Ok(());
        }
        let id = subscription_id.unwrap_or_else(|| self.subscription_id());
        self.send_text(WsRequest::unsubscribe(id).to_text()?)
    }

    /// Wait until the socket is open.
    ///
    /// Every caller waits on the same in-flight attempt, so concurrent
    /// waiters never start extra connections. Fails once the driver has
    /// stopped.
    pub async fn wait_connected(&self) -> WsResult<()> {
        let mut state = self.shared.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed => return Err(self.closed_error()),
                _ => {}
            }
            if state.changed().await.is_err() {
                return Err(self.closed_error());
            }
        }
    }

    fn closed_error(&self) -> WsError {
        match self.shared.failure.lock().as_ref() {
            Some(failure) => failure.to_error(),
            None => WsError::Cancelled,
        }
    }

    /// Close manually: no further events are delivered, the driver sends an
    /// unsubscribe and closes with 1000, and nothing reconnects. Idempotent.
    pub fn close(&self) {
        self.shared.detached.store(true, Ordering::Release);
        self.shared.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Close and wait for the driver to finish.
    pub async fn shutdown(&self) {
        self.close();
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                warn!(error = %e, "WebSocket driver task failed");
            }
        }
    }
}

impl std::fmt::Debug for WsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsHandle")
            .field("url", &self.shared.config.payload.url)
            .field("subscription_id", &self.subscription_id())
            .field("state", &self.state())
            .finish()
    }
}
