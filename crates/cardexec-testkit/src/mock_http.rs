//! Mock HTTP server.
//!
//! Serves canned responses per path. Bodies are sent as separate chunks
//! with a delay in between so clients observe one read per chunk.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A request as received by the mock server.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub content_type: Option<String>,
    pub body: String,
}

/// Canned response for one path.
#[derive(Debug, Clone)]
pub struct MockRoute {
    pub path: String,
    pub status: u16,
    pub content_type: String,
    pub chunks: Vec<String>,
    pub chunk_delay: Duration,
    /// Keep the body open after the last chunk.
    pub hold_open: bool,
}

impl MockRoute {
    pub fn json(path: &str, body: &str) -> Self {
        Self {
            path: path.to_string(),
            status: 200,
            content_type: "application/json".to_string(),
            chunks: vec![body.to_string()],
            chunk_delay: Duration::ZERO,
            hold_open: false,
        }
    }

    pub fn status(path: &str, status: u16) -> Self {
        Self {
            status,
            chunks: Vec::new(),
            ..Self::json(path, "")
        }
    }

    pub fn chunked(path: &str, chunks: &[&str], delay: Duration) -> Self {
        Self {
            content_type: "text/plain".to_string(),
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            chunk_delay: delay,
            ..Self::json(path, "")
        }
    }

    pub fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

struct ServerState {
    routes: Vec<MockRoute>,
    requests: Mutex<Vec<RecordedRequest>>,
}

pub struct MockHttpServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    handle: JoinHandle<()>,
}

impl MockHttpServer {
    pub async fn start(routes: Vec<MockRoute>) -> Self {
        let state = Arc::new(ServerState {
            routes,
            requests: Mutex::new(Vec::new()),
        });

        let app = Router::new().fallback(serve_route).with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn shutdown(self) {
        self.handle.abort();
    }
}

async fn serve_route(State(state): State<Arc<ServerState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = to_bytes(body, usize::MAX).await.unwrap_or_default();

    state.requests.lock().unwrap().push(RecordedRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        content_type: parts
            .headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: String::from_utf8_lossy(&body).to_string(),
    });

    let Some(route) = state.routes.iter().find(|r| r.path == parts.uri.path()) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let delay = route.chunk_delay;
    let chunks = futures_util::stream::iter(route.chunks.clone()).then(move |chunk| async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok::<_, Infallible>(chunk)
    });

    let body = if route.hold_open {
        Body::from_stream(chunks.chain(futures_util::stream::pending()))
    } else {
        Body::from_stream(chunks)
    };

    Response::builder()
        .status(route.status)
        .header("content-type", route.content_type.as_str())
        .body(body)
        .unwrap()
}
