//! Core data model for dashboard card query execution.
//!
//! This crate provides the types shared by every transport and by the
//! execution state machine:
//! - `QueryTemplate`: Configured query, resolved into a typed `QuerySpec`
//! - `ExecutionState`, `StateUpdate`: Externally observable card state
//! - `CardKey`, `CardRecord`: Card identity and normalized records
//! - `resolve_placeholders`: `${{ runtime.* }}` substitution

pub mod error;
pub mod placeholder;
pub mod query;
pub mod types;

pub use error::{CoreError, Result};
pub use placeholder::resolve_placeholders;
pub use query::{
    AckPolicy, Compression, CustomPayload, HttpMethod, HttpPayload, Protocols, QuerySpec,
    QueryTemplate, QueryVariant, StreamFormat, StreamingHttpPayload, WebSocketPayload,
};
pub use types::{
    record_kind, CardKey, CardRecord, ConnectionStatus, ExecutionState, LoadingState, Params,
    StateUpdate,
};
