//! Test doubles shared by the transport and engine integration tests.
//!
//! - `mock_http`: canned, optionally chunked HTTP responses per path
//! - `mock_ws`: scripted WebSocket server that records client frames

pub mod mock_http;
pub mod mock_ws;
