//! HTTP and streaming-HTTP transport for card queries.
//!
//! Both transports build the same request from an `HttpPayload`:
//! - GET carries the JSON-encoded `params` as a single `params` query pair
//! - Other methods send `{"params": "<json>"}` as the body
//!
//! `HttpClient::fetch_json` returns the parsed body in one shot.
//! `HttpClient::open_stream` returns a `TextStream` that yields decoded
//! text chunk by chunk, with UTF-8 sequences carried across reads.

pub mod client;
pub mod error;
pub mod request;

pub use client::{HttpClient, HttpClientConfig, TextStream};
pub use error::{HttpError, HttpResult};
pub use request::{request_body, request_headers, request_url};
