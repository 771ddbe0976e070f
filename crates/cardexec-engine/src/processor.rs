//! Pre/post processor pipeline.
//!
//! Pre-processors rewrite the query before resolution, post-processors turn
//! raw transport data into card records. Both run strictly in order and
//! stop at the first failure.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use cardexec_core::{CardKey, CardRecord, Params, QueryTemplate};
use dashmap::DashMap;
use serde_json::Value;
use tracing::error;

use crate::error::{ProcessorError, ProcessorResult};

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a processor sees of the card and the query.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorContext {
    pub report_id: String,
    pub card_id: String,
    pub kind: String,
    /// Unresolved query for pre-processors, the placeholder-free query
    /// for post-processors.
    pub query: QueryTemplate,
    /// Runtime parameters merged with the call parameters.
    pub parameters: Params,
    pub card_settings: Value,
}

pub trait PreProcessor: Send + Sync {
    fn process<'a>(&'a self, ctx: &'a ProcessorContext) -> BoxFuture<'a, ProcessorResult<QueryTemplate>>;
}

pub trait PostProcessor: Send + Sync {
    fn process<'a>(
        &'a self,
        ctx: &'a ProcessorContext,
        records: Vec<CardRecord>,
    ) -> BoxFuture<'a, ProcessorResult<Vec<CardRecord>>>;
}

/// Synchronous pre-processor from a closure.
pub struct FnPreProcessor<F>(F);

impl<F> PreProcessor for FnPreProcessor<F>
where
    F: Fn(&ProcessorContext) -> ProcessorResult<QueryTemplate> + Send + Sync,
{
    fn process<'a>(&'a self, ctx: &'a ProcessorContext) -> BoxFuture<'a, ProcessorResult<QueryTemplate>> {
        let result = (self.0)(ctx);
        Box::pin(async move { result })
    }
}

/// Synchronous post-processor from a closure.
pub struct FnPostProcessor<F>(F);

impl<F> PostProcessor for FnPostProcessor<F>
where
    F: Fn(&ProcessorContext, Vec<CardRecord>) -> ProcessorResult<Vec<CardRecord>> + Send + Sync,
{
    fn process<'a>(
        &'a self,
        ctx: &'a ProcessorContext,
        records: Vec<CardRecord>,
    ) -> BoxFuture<'a, ProcessorResult<Vec<CardRecord>>> {
        let result = (self.0)(ctx, records);
        Box::pin(async move { result })
    }
}

pub fn pre_processor_fn<F>(f: F) -> Arc<dyn PreProcessor>
where
    F: Fn(&ProcessorContext) -> ProcessorResult<QueryTemplate> + Send + Sync + 'static,
{
    Arc::new(FnPreProcessor(f))
}

pub fn post_processor_fn<F>(f: F) -> Arc<dyn PostProcessor>
where
    F: Fn(&ProcessorContext, Vec<CardRecord>) -> ProcessorResult<Vec<CardRecord>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnPostProcessor(f))
}

/// Raw data as a record batch: arrays are spread, anything else wrapped.
pub fn to_records(raw: Value) -> Vec<CardRecord> {
    match raw {
        Value::Array(items) => items,
        other => vec![other],
    }
}

/// Run pre-processors in order, each seeing the previous one's query.
pub async fn run_pre_processors(
    ctx: &ProcessorContext,
    processors: &[Arc<dyn PreProcessor>],
) -> ProcessorResult<QueryTemplate> {
    let mut ctx = ctx.clone();
    for (index, processor) in processors.iter().enumerate() {
        match processor.process(&ctx).await {
            Ok(query) => ctx.query = query,
            Err(e) => {
                error!(index, error = %e, card_id = %ctx.card_id, "Pre-processor failed");
                return Err(e);
            }
        }
    }
    Ok(ctx.query)
}

/// Thread a batch through post-processors in order.
pub async fn run_post_processors(
    ctx: &ProcessorContext,
    records: Vec<CardRecord>,
    processors: &[Arc<dyn PostProcessor>],
) -> ProcessorResult<Vec<CardRecord>> {
    let mut records = records;
    for (index, processor) in processors.iter().enumerate() {
        match processor.process(ctx, records).await {
            Ok(next) => records = next,
            Err(e) => {
                error!(index, error = %e, card_id = %ctx.card_id, "Post-processor failed");
                return Err(e);
            }
        }
    }
    Ok(records)
}

/// Ordered pre and post processors of one card.
#[derive(Clone, Default)]
pub struct ProcessorSet {
    pub pre: Vec<Arc<dyn PreProcessor>>,
    pub post: Vec<Arc<dyn PostProcessor>>,
}

impl ProcessorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pre(mut self, processor: Arc<dyn PreProcessor>) -> Self {
        self.pre.push(processor);
        self
    }

    pub fn with_post(mut self, processor: Arc<dyn PostProcessor>) -> Self {
        self.post.push(processor);
        self
    }

    /// Append `other`'s processors after this set's.
    pub fn extend(&mut self, other: &ProcessorSet) {
        self.pre.extend(other.pre.iter().cloned());
        self.post.extend(other.post.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.post.is_empty()
    }
}

impl std::fmt::Debug for ProcessorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorSet")
            .field("pre", &self.pre.len())
            .field("post", &self.post.len())
            .finish()
    }
}

/// Processors registered per card kind and per report card.
#[derive(Default)]
pub struct ProcessorRegistry {
    by_kind: DashMap<String, ProcessorSet>,
    by_card: DashMap<CardKey, ProcessorSet>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_kind_pre(&self, kind: &str, processor: Arc<dyn PreProcessor>) {
        self.by_kind.entry(kind.to_string()).or_default().pre.push(processor);
    }

    pub fn register_kind_post(&self, kind: &str, processor: Arc<dyn PostProcessor>) {
        self.by_kind.entry(kind.to_string()).or_default().post.push(processor);
    }

    pub fn register_card_pre(&self, key: &CardKey, processor: Arc<dyn PreProcessor>) {
        self.by_card.entry(key.clone()).or_default().pre.push(processor);
    }

    pub fn register_card_post(&self, key: &CardKey, processor: Arc<dyn PostProcessor>) {
        self.by_card.entry(key.clone()).or_default().post.push(processor);
    }

    /// Kind-level processors followed by card-level ones.
    pub fn processors_for(&self, report_id: &str, card_id: &str, kind: &str) -> ProcessorSet {
        let mut set = ProcessorSet::new();
        if let Some(by_kind) = self.by_kind.get(kind) {
            set.extend(&by_kind);
        }
        if let Some(by_card) = self.by_card.get(&CardKey::new(report_id, card_id)) {
            set.extend(&by_card);
        }
        set
    }
}

/// Error for a processor that rejects its input.
pub fn reject(message: impl Into<String>) -> ProcessorError {
    ProcessorError::new(message)
}
