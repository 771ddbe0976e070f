//! Execution builders and an event recorder.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cardexec_core::{CardKey, CardRecord, ExecutionState, LoadingState, Params, QueryTemplate};
use cardexec_engine::{CardExecution, CardExecutionBuilder, ChannelObserver, ExecutionEvent};
use serde_json::Value;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(3);

pub fn key() -> CardKey {
    CardKey::new("report-1", "card-1")
}

/// Builder for `key()` wired to a fresh recorder.
pub fn builder(query: QueryTemplate) -> (CardExecutionBuilder, Recorder) {
    let (tx, rx) = mpsc::unbounded_channel();
    let observer = ChannelObserver::new(key(), tx);
    let builder = CardExecution::builder(key(), "table")
        .query(query)
        .observer(Arc::new(observer));
    (builder, Recorder::new(rx))
}

pub fn params(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        other => panic!("params must be an object, got {other}"),
    }
}

pub fn query(value: Value) -> QueryTemplate {
    QueryTemplate::from_value(value).expect("valid query")
}

/// Collects everything an execution publishes.
pub struct Recorder {
    rx: mpsc::UnboundedReceiver<ExecutionEvent>,
    events: Vec<ExecutionEvent>,
}

impl Recorder {
    pub fn new(rx: mpsc::UnboundedReceiver<ExecutionEvent>) -> Self {
        Self {
            rx,
            events: Vec::new(),
        }
    }

    /// Pull whatever has been published so far.
    pub fn drain(&mut self) -> &[ExecutionEvent] {
        while let Ok(event) = self.rx.try_recv() {
            self.events.push(event);
        }
        &self.events
    }

    pub fn batches(&mut self) -> Vec<Vec<CardRecord>> {
        self.drain()
            .iter()
            .filter_map(|event| match event {
                ExecutionEvent::Records { records, .. } => Some(records.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn states(&mut self) -> Vec<ExecutionState> {
        self.drain()
            .iter()
            .filter_map(|event| match event {
                ExecutionEvent::State { state, .. } => Some(state.clone()),
                _ => None,
            })
            .collect()
    }

    /// Loading states in order, consecutive duplicates collapsed.
    pub fn loading_sequence(&mut self) -> Vec<LoadingState> {
        let mut sequence: Vec<LoadingState> = Vec::new();
        for state in self.states() {
            if sequence.last() != Some(&state.loading_state) {
                sequence.push(state.loading_state);
            }
        }
        sequence
    }

    /// Wait until a published event satisfies `predicate`.
    pub async fn wait_for<F>(&mut self, predicate: F) -> ExecutionEvent
    where
        F: Fn(&ExecutionEvent) -> bool,
    {
        if let Some(found) = self.drain().iter().find(|e| predicate(*e)) {
            return found.clone();
        }
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.rx.recv())
                .await
                .expect("event arrives in time")
                .expect("event channel open");
            self.events.push(event.clone());
            if predicate(&event) {
                return event;
            }
        }
    }

    pub async fn wait_for_state<F>(&mut self, predicate: F) -> ExecutionState
    where
        F: Fn(&ExecutionState) -> bool,
    {
        let event = self
            .wait_for(|event| matches!(event, ExecutionEvent::State { state, .. } if predicate(state)))
            .await;
        match event {
            ExecutionEvent::State { state, .. } => state,
            _ => unreachable!(),
        }
    }

    /// Wait until at least `n` batches were published.
    pub async fn wait_for_batches(&mut self, n: usize) -> Vec<Vec<CardRecord>> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let batches = self.batches();
            if batches.len() >= n {
                return batches;
            }
            let event = tokio::time::timeout_at(deadline, self.rx.recv())
                .await
                .expect("batch arrives in time")
                .expect("event channel open");
            self.events.push(event);
        }
    }
}
