//! Custom-handler transport.
//!
//! A host registers handlers by name. A handler returns either a record
//! vector or a stream of record batches; streamed batches are
//! post-processed and emitted one by one. The whole run, stream included,
//! is bounded by the payload timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cardexec_core::{CardRecord, ConnectionStatus, CustomPayload, Params, StateUpdate};
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ExecutionError, ExecutionResult, ProcessorResult};
use crate::processor::BoxFuture;
use crate::state::{Emitter, StateReporter};

/// What a handler produced.
pub enum CustomOutput {
    Records(Vec<CardRecord>),
    /// Finite, non-restartable sequence of batches.
    Stream(BoxStream<'static, ProcessorResult<Vec<CardRecord>>>),
}

impl CustomOutput {
    pub fn records(records: Vec<CardRecord>) -> Self {
        Self::Records(records)
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = ProcessorResult<Vec<CardRecord>>> + Send + 'static,
    {
        Self::Stream(stream.boxed())
    }
}

impl std::fmt::Debug for CustomOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Records(records) => f.debug_tuple("Records").field(&records.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Everything a handler gets for one run.
#[derive(Debug, Clone)]
pub struct CustomQueryContext {
    pub report_id: String,
    pub card_id: String,
    pub kind: String,
    /// Resolved payload `params`.
    pub params: Params,
    pub runtime_params: Params,
    pub card_settings: Value,
    /// Cancelled on `cancel()` and on timeout.
    pub cancel: CancellationToken,
    pub state: StateReporter,
}

pub trait CustomHandler: Send + Sync {
    fn call(&self, ctx: CustomQueryContext) -> BoxFuture<'static, ProcessorResult<CustomOutput>>;
}

struct FnHandler<F>(F);

impl<F, Fut> CustomHandler for FnHandler<F>
where
    F: Fn(CustomQueryContext) -> Fut + Send + Sync,
    Fut: Future<Output = ProcessorResult<CustomOutput>> + Send + 'static,
{
    fn call(&self, ctx: CustomQueryContext) -> BoxFuture<'static, ProcessorResult<CustomOutput>> {
        Box::pin((self.0)(ctx))
    }
}

/// Handler from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CustomHandler>
where
    F: Fn(CustomQueryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProcessorResult<CustomOutput>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Run a handler. Returns the records of a one-shot handler, `None` when
/// the output was streamed and already emitted.
pub(crate) async fn run_custom(
    handler: Arc<dyn CustomHandler>,
    payload: &CustomPayload,
    runtime_params: &Params,
    emitter: &Emitter,
) -> ExecutionResult<Option<Vec<CardRecord>>> {
    emitter.update(
        StateUpdate::new()
            .with_connection(ConnectionStatus::Connecting)
            .with_stream_active(payload.streaming),
    )?;

    let token = emitter.cancel().child_token();
    let base = emitter.ctx();
    let ctx = CustomQueryContext {
        report_id: base.report_id.clone(),
        card_id: base.card_id.clone(),
        kind: base.kind.clone(),
        params: payload.params.clone(),
        runtime_params: runtime_params.clone(),
        card_settings: base.card_settings.clone(),
        cancel: token.clone(),
        state: emitter.reporter(),
    };

    emitter.update(StateUpdate::new().with_connection(ConnectionStatus::Connected))?;
    debug!(handler = %payload.handler, streaming = payload.streaming, "Running custom handler");

    let limit = Duration::from_millis(payload.timeout);
    let outcome = tokio::select! {
        biased;
        _ = emitter.cancel().cancelled() => Err(ExecutionError::Cancelled),
        result = tokio::time::timeout(limit, invoke(handler, ctx, &token, emitter)) => match result {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                warn!(handler = %payload.handler, timeout_ms = payload.timeout, "Custom handler timed out");
                Err(ExecutionError::Timeout(payload.timeout))
            }
        },
    };

    // Dropped silently once stale.
    let _ = emitter.update(
        StateUpdate::new()
            .with_connection(ConnectionStatus::Disconnected)
            .with_stream_active(false),
    );
    outcome
}

async fn invoke(
    handler: Arc<dyn CustomHandler>,
    ctx: CustomQueryContext,
    token: &CancellationToken,
    emitter: &Emitter,
) -> ExecutionResult<Option<Vec<CardRecord>>> {
    match handler.call(ctx).await? {
        CustomOutput::Records(records) => Ok(Some(records)),
        CustomOutput::Stream(stream) => {
            consume_stream(stream, token, emitter).await?;
            Ok(None)
        }
    }
}

async fn consume_stream(
    mut stream: BoxStream<'static, ProcessorResult<Vec<CardRecord>>>,
    token: &CancellationToken,
    emitter: &Emitter,
) -> ExecutionResult<()> {
    emitter.update(StateUpdate::new().with_stream_active(true))?;

    let mut emitted = false;
    while let Some(batch) = stream.next().await {
        if token.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        let records = emitter.process(batch?).await?;
        if records.is_empty() {
            continue;
        }
        emitter.emit(&records)?;
        let update = if emitted {
            StateUpdate::new().refreshed_now()
        } else {
            StateUpdate::success()
        };
        emitter.update(update)?;
        emitted = true;
    }

    if !emitted {
        emitter.update(StateUpdate::success())?;
    }
    debug!("Custom stream finished");
    Ok(())
}
