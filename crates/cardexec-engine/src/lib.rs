//! Card execution engine.
//!
//! Runs a card's query over one of four transports and publishes the
//! results through an observer:
//! - `CardExecution`: the per-card state machine (`execute_query`,
//!   `cancel`, `reconnect`, WebSocket write helpers)
//! - Pre/post processor pipeline with per-kind and per-card registration
//! - Custom handlers returning records or a stream of batches
//! - `CardRegistry` and `RecordStore` for hosts composing many cards

pub mod custom;
pub mod error;
pub mod execution;
pub mod observer;
pub mod processor;
pub mod registry;
pub mod state;
pub mod store;

mod streaming;
mod websocket;

pub use custom::{handler_fn, CustomHandler, CustomOutput, CustomQueryContext};
pub use error::{ExecutionError, ExecutionResult, ProcessorError, ProcessorResult};
pub use execution::{CardExecution, CardExecutionBuilder};
pub use observer::{ChannelObserver, ExecutionEvent, ExecutionObserver, FnObserver, NoopObserver};
pub use processor::{
    post_processor_fn, pre_processor_fn, reject, run_post_processors, run_pre_processors,
    to_records, BoxFuture, PostProcessor, PreProcessor, ProcessorContext, ProcessorRegistry,
    ProcessorSet,
};
pub use registry::CardRegistry;
pub use state::StateReporter;
pub use store::{RecordStore, StoreObserver};
