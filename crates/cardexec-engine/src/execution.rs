//! Card execution state machine.
//!
//! `idle -> loading -> {success, error}`, back to `loading` on the next
//! `execute_query`, and to `idle/disconnected` on `cancel()`.
//!
//! At most one transport is live per card. Starting an invocation outside
//! `loading` first releases the previous one's resources; `execute_query`
//! while `loading` is a no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use cardexec_core::{
    CardKey, CardRecord, ConnectionStatus, ExecutionState, LoadingState, Params, QuerySpec,
    QueryTemplate, StateUpdate,
};
use cardexec_http::{HttpClient, HttpClientConfig};
use cardexec_telemetry::Metrics;
use cardexec_ws::{WsError, WsHandle};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::custom::{run_custom, CustomHandler};
use crate::error::{ExecutionError, ExecutionResult};
use crate::observer::{ExecutionObserver, NoopObserver};
use crate::processor::{
    run_pre_processors, to_records, PostProcessor, PreProcessor, ProcessorContext, ProcessorSet,
};
use crate::state::{Emitter, StateCell};
use crate::streaming::run_streaming;
use crate::websocket::start_websocket;

/// Resources owned by the running invocation.
struct Invocation {
    generation: u64,
    cancel: CancellationToken,
    ws: Option<WsHandle>,
}

impl Invocation {
    fn release(self) {
        debug!(generation = self.generation, "Releasing invocation");
        self.cancel.cancel();
        if let Some(ws) = self.ws {
            ws.close();
        }
    }
}

struct Inner {
    key: CardKey,
    kind: String,
    card_settings: Value,
    query: Option<QueryTemplate>,
    runtime_params: Params,
    processors: ProcessorSet,
    handlers: HashMap<String, Arc<dyn CustomHandler>>,
    http: HttpClient,
    cell: Arc<StateCell>,
    /// Parameters remembered across calls, reused by `reconnect()`.
    params: Mutex<Params>,
    active: Mutex<Option<Invocation>>,
}

/// Execution context of one card. Cheap to clone, clones share state.
#[derive(Clone)]
pub struct CardExecution {
    inner: Arc<Inner>,
}

pub struct CardExecutionBuilder {
    key: CardKey,
    kind: String,
    card_settings: Value,
    query: Option<QueryTemplate>,
    runtime_params: Params,
    processors: ProcessorSet,
    handlers: HashMap<String, Arc<dyn CustomHandler>>,
    http: Option<HttpClient>,
    observer: Arc<dyn ExecutionObserver>,
}

impl CardExecutionBuilder {
    /// Placeholders anywhere in the payload are resolved per call.
    pub fn query(mut self, query: QueryTemplate) -> Self {
        self.query = Some(query);
        self
    }

    pub fn runtime_params(mut self, params: Params) -> Self {
        self.runtime_params = params;
        self
    }

    pub fn card_settings(mut self, settings: Value) -> Self {
        self.card_settings = settings;
        self
    }

    pub fn pre_processor(mut self, processor: Arc<dyn PreProcessor>) -> Self {
        self.processors.pre.push(processor);
        self
    }

    pub fn post_processor(mut self, processor: Arc<dyn PostProcessor>) -> Self {
        self.processors.post.push(processor);
        self
    }

    /// Append a processor set after the ones already added.
    pub fn processors(mut self, processors: &ProcessorSet) -> Self {
        self.processors.extend(processors);
        self
    }

    pub fn handler(mut self, name: impl Into<String>, handler: Arc<dyn CustomHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Share a client between cards. A default client is built otherwise.
    pub fn http_client(mut self, client: HttpClient) -> Self {
        self.http = Some(client);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn build(self) -> ExecutionResult<CardExecution> {
        let http = match self.http {
            Some(client) => client,
            None => HttpClient::new(HttpClientConfig::default())?,
        };
        Ok(CardExecution {
            inner: Arc::new(Inner {
                key: self.key,
                kind: self.kind,
                card_settings: self.card_settings,
                query: self.query,
                runtime_params: self.runtime_params,
                processors: self.processors,
                handlers: self.handlers,
                http,
                cell: Arc::new(StateCell::new(self.observer)),
                params: Mutex::new(Params::new()),
                active: Mutex::new(None),
            }),
        })
    }
}

impl CardExecution {
    pub fn builder(key: CardKey, kind: impl Into<String>) -> CardExecutionBuilder {
        CardExecutionBuilder {
            key,
            kind: kind.into(),
            card_settings: Value::Object(Default::default()),
            query: None,
            runtime_params: Params::new(),
            processors: ProcessorSet::new(),
            handlers: HashMap::new(),
            http: None,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn key(&self) -> &CardKey {
        &self.inner.key
    }

    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    pub fn query(&self) -> Option<&QueryTemplate> {
        self.inner.query.as_ref()
    }

    pub fn state(&self) -> ExecutionState {
        self.inner.cell.snapshot()
    }

    /// Parameters remembered from previous calls.
    pub fn params(&self) -> Params {
        self.inner.params.lock().clone()
    }

    /// Run the card's query once.
    ///
    /// `params` are merged into the remembered parameters, which override
    /// runtime parameters during placeholder resolution. Returns once a
    /// one-shot result is emitted, a stream has ended, or a WebSocket
    /// subscription is open. A no-op without a query or while loading.
    pub async fn execute_query(&self, params: Params) -> ExecutionResult<()> {
        let params = {
            let mut remembered = self.inner.params.lock();
            remembered.extend(params);
            remembered.clone()
        };

        let Some(query) = self.inner.query.clone() else {
            debug!(card = %self.inner.key, "No query configured");
            return Ok(());
        };

        let Some(generation) = self.inner.cell.begin() else {
            debug!(card = %self.inner.key, "Query already loading, ignoring");
            return Ok(());
        };

        let cancel = CancellationToken::new();
        let previous = self.inner.active.lock().replace(Invocation {
            generation,
            cancel: cancel.clone(),
            ws: None,
        });
        if let Some(previous) = previous {
            previous.release();
        }

        let variant = query.variant();
        let started = Instant::now();
        info!(card = %self.inner.key, %variant, generation, "Executing query");

        let result = self.run(generation, &cancel, query, params).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(()) => {
                Metrics::execution_finished(variant.as_str(), "success", latency_ms);
                Ok(())
            }
            Err(e) if e.is_cancelled() => {
                info!(card = %self.inner.key, %variant, "Query cancelled");
                Metrics::execution_finished(variant.as_str(), "cancelled", latency_ms);
                Err(ExecutionError::Cancelled)
            }
            Err(e) => {
                error!(card = %self.inner.key, %variant, error = %e, "Query failed");
                Metrics::execution_finished(variant.as_str(), "error", latency_ms);
                self.inner.cell.apply(
                    generation,
                    StateUpdate::new()
                        .with_loading(LoadingState::Error)
                        .with_error(e.to_string())
                        .with_connection(ConnectionStatus::Disconnected)
                        .with_stream_active(false),
                );
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        generation: u64,
        cancel: &CancellationToken,
        query: QueryTemplate,
        params: Params,
    ) -> ExecutionResult<()> {
        let inner = &self.inner;
        let mut parameters = inner.runtime_params.clone();
        parameters.extend(params);

        let ctx = ProcessorContext {
            report_id: inner.key.report_id.clone(),
            card_id: inner.key.card_id.clone(),
            kind: inner.kind.clone(),
            query,
            parameters,
            card_settings: inner.card_settings.clone(),
        };

        let processed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
            result = run_pre_processors(&ctx, &inner.processors.pre) => result?,
        };

        let substituted = processed.substitute(&ctx.parameters);
        let resolved = substituted.to_spec()?;
        resolved.validate()?;

        let emitter = Emitter::new(
            inner.cell.clone(),
            generation,
            cancel.clone(),
            ProcessorContext {
                query: substituted,
                ..ctx
            },
            inner.processors.post.clone(),
        );

        match &resolved {
            QuerySpec::Http(payload) => {
                let raw = inner.http.fetch_json(payload, cancel).await?;
                self.finish_one_shot(&emitter, to_records(raw)).await
            }
            QuerySpec::StreamingHttp(payload) => run_streaming(&inner.http, payload, &emitter).await,
            QuerySpec::Websocket(payload) => {
                let handle = start_websocket(payload, &emitter).await?;
                self.attach_websocket(generation, handle)?;
                emitter.update(
                    StateUpdate::success()
                        .with_connection(ConnectionStatus::Connected)
                        .with_stream_active(true),
                )
            }
            QuerySpec::Custom(payload) => {
                let handler = inner
                    .handlers
                    .get(&payload.handler)
                    .cloned()
                    .ok_or_else(|| ExecutionError::UnknownHandler(payload.handler.clone()))?;
                match run_custom(handler, payload, &inner.runtime_params, &emitter).await? {
                    Some(records) => self.finish_one_shot(&emitter, records).await,
                    None => Ok(()),
                }
            }
        }
    }

    /// Post-process and emit a one-shot result, empty or not.
    async fn finish_one_shot(&self, emitter: &Emitter, records: Vec<CardRecord>) -> ExecutionResult<()> {
        let records = emitter.process(records).await?;
        emitter.emit(&records)?;
        emitter.update(StateUpdate::success())
    }

    /// Hand the socket to the running invocation, or close it if a cancel
    /// got in first.
    fn attach_websocket(&self, generation: u64, handle: WsHandle) -> ExecutionResult<()> {
        let mut active = self.inner.active.lock();
        match active.as_mut() {
            Some(invocation) if invocation.generation == generation => {
                invocation.ws = Some(handle);
                Ok(())
            }
            _ => {
                handle.close();
                Err(ExecutionError::Cancelled)
            }
        }
    }

    /// Stop whatever is running and force `idle/disconnected`. Idempotent.
    pub fn cancel(&self) {
        let previous = self.inner.active.lock().take();
        if let Some(previous) = previous {
            previous.release();
        }
        self.inner.cell.reset();
        debug!(card = %self.inner.key, "Execution cancelled");
    }

    /// `cancel()` then `execute_query` with the remembered parameters.
    pub async fn reconnect(&self) -> ExecutionResult<()> {
        self.cancel();
        self.execute_query(Params::new()).await
    }

    /// Push records straight to the observer.
    pub fn set_records(&self, records: Vec<CardRecord>) {
        self.inner.cell.emit_now(&records);
    }

    fn websocket(&self) -> Option<WsHandle> {
        self.inner.active.lock().as_ref().and_then(|a| a.ws.clone())
    }

    fn connected_websocket(&self) -> Result<WsHandle, WsError> {
        match self.websocket() {
            Some(ws) if ws.is_connected() => Ok(ws),
            _ => {
                warn!(card = %self.inner.key, "Cannot send message: WebSocket is not connected");
                Err(WsError::NotConnected)
            }
        }
    }

    /// Send a message on the open subscription. Strings go out verbatim.
    pub fn send_message(&self, message: &Value) -> ExecutionResult<()> {
        Ok(self.connected_websocket()?.send_json(message)?)
    }

    /// Acknowledge a message under the `manual` ack policy.
    pub fn send_ack(&self, message_id: &str) -> ExecutionResult<()> {
        Ok(self.connected_websocket()?.send_ack(message_id)?)
    }

    pub fn is_websocket_connected(&self) -> bool {
        self.websocket().is_some_and(|ws| ws.is_connected())
    }

    /// Unsubscribe `subscription_id`, or the card's own subscription.
    /// Skipped while disconnected.
    pub fn unsubscribe(&self, subscription_id: Option<&str>) -> ExecutionResult<()> {
        match self.websocket() {
            Some(ws) => Ok(ws.unsubscribe(subscription_id)?),
            None => {
                debug!(card = %self.inner.key, "No WebSocket to unsubscribe");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for CardExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardExecution")
            .field("key", &self.inner.key)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}
