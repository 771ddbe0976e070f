//! Mock WebSocket server.
//!
//! Accepts connections, records every text frame and close code it receives,
//! and pushes scripted frames to all live connections.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Frame or action pushed to every connected client.
#[derive(Debug, Clone)]
pub enum ServerCommand {
    Text(String),
    Binary(Vec<u8>),
    Close(u16),
    /// Close frame without a status code.
    CloseWithoutStatus,
    /// Drop the TCP stream without a close frame.
    Drop,
}

#[derive(Default)]
struct ServerState {
    messages: Mutex<Vec<String>>,
    client_close_codes: Mutex<Vec<Option<u16>>>,
    connections: Mutex<u32>,
}

pub struct MockWsServer {
    addr: SocketAddr,
    commands: broadcast::Sender<ServerCommand>,
    state: Arc<ServerState>,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MockWsServer {
    /// Start a new mock WebSocket server on an available port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState::default());
        let (commands, _) = broadcast::channel(64);

        let accept_state = state.clone();
        let accept_commands = commands.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let rx = accept_commands.subscribe();
                tokio::spawn(handle_connection(stream, accept_state.clone(), rx));
            }
        });

        Self {
            addr,
            commands,
            state,
            accept_task: std::sync::Mutex::new(Some(accept_task)),
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn connection_count(&self) -> u32 {
        *self.state.connections.lock().await
    }

    pub async fn received_messages(&self) -> Vec<String> {
        self.state.messages.lock().await.clone()
    }

    /// Received frames that parse as JSON.
    pub async fn received_json(&self) -> Vec<Value> {
        self.received_messages()
            .await
            .iter()
            .filter_map(|m| serde_json::from_str(m).ok())
            .collect()
    }

    /// Poll until a received JSON frame matches `predicate`.
    pub async fn wait_for<F>(&self, predicate: F, limit: Duration) -> Option<Value>
    where
        F: Fn(&Value) -> bool,
    {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if let Some(found) = self.received_json().await.into_iter().find(|m| predicate(m)) {
                return Some(found);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Close codes of close frames sent by clients (`None` for no status).
    pub async fn client_close_codes(&self) -> Vec<Option<u16>> {
        self.state.client_close_codes.lock().await.clone()
    }

    pub fn send(&self, command: ServerCommand) {
        let _ = self.commands.send(command);
    }

    pub fn send_text(&self, text: &str) {
        self.send(ServerCommand::Text(text.to_string()));
    }

    /// Stop accepting connections. New connection attempts are refused.
    pub async fn stop_accepting(&self) {
        let task = self.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }

    pub async fn shutdown(self) {
        self.stop_accepting().await;
        self.send(ServerCommand::Drop);
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<ServerState>,
    mut commands: broadcast::Receiver<ServerCommand>,
) {
    *state.connections.lock().await += 1;

    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();

    loop {
        // Frames already on the socket are recorded before a command acts.
        tokio::select! {
            biased;
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    state.messages.lock().await.push(text);
                }
                Some(Ok(Message::Close(frame))) => {
                    state
                        .client_close_codes
                        .lock()
                        .await
                        .push(frame.map(|f| u16::from(f.code)));
                    break;
                }
                Some(Ok(_)) => {}
                _ => break,
            },
            cmd = commands.recv() => match cmd {
                Ok(ServerCommand::Text(text)) => {
                    let _ = write.send(Message::Text(text)).await;
                }
                Ok(ServerCommand::Binary(bytes)) => {
                    let _ = write.send(Message::Binary(bytes)).await;
                }
                Ok(ServerCommand::Close(code)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: "server close".into(),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    break;
                }
                Ok(ServerCommand::CloseWithoutStatus) => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
                Ok(ServerCommand::Drop) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// URL of a port with nothing listening.
pub async fn unused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}", addr)
}

/// Listener that accepts TCP connections and never answers the handshake.
pub async fn silent_server() -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    (format!("ws://{}", addr), task)
}
