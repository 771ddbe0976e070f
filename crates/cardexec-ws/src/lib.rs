//! WebSocket subscription transport for card queries.
//!
//! Provides a subscription connection with:
//! - Subscribe on open, unsubscribe and close code 1000 on manual close
//! - Application-level heartbeat (`{"action":"ping"}` every interval)
//! - Control-message filtering (ping/pong/ack/error/subscribed)
//! - Automatic acknowledgment of data messages carrying an id
//! - Exponential-backoff reconnect on abnormal closure
//! - Channel-based event delivery and a cloneable write handle

pub mod connection;
pub mod error;
pub mod handle;
pub mod heartbeat;
pub mod message;

pub use connection::{
    backoff_delay, build_request, connect, event_channel, spawn_connection, ConnectionState,
    WsConfig, WsEvent, CONNECT_TIMEOUT, MAX_BACKOFF,
};
pub use error::{WsError, WsResult};
pub use handle::WsHandle;
pub use heartbeat::{HeartbeatMonitor, HeartbeatStats};
pub use message::{classify_inbound, decode_frame, message_id, ClientInfo, Inbound, WsRequest};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any `wss://` connection is made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
