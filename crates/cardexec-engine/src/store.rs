//! In-memory record store.
//!
//! Holds the records and latest state of every card and notifies
//! subscribers with the key of each card that changed. The execution never
//! reads it back, it only writes through `StoreObserver`.

use std::sync::Arc;

use cardexec_core::{CardKey, CardRecord, ExecutionState, StateUpdate};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::observer::ExecutionObserver;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

pub struct RecordStore {
    records: DashMap<CardKey, Vec<CardRecord>>,
    states: DashMap<CardKey, ExecutionState>,
    append_records: bool,
    changes: broadcast::Sender<CardKey>,
}

/// Table and chart batches are full snapshots.
fn is_snapshot(batch: &[CardRecord]) -> bool {
    batch.first().is_some_and(|first| {
        first.get("rows").is_some_and(Value::is_array)
            || first.get("data").is_some_and(Value::is_array)
    })
}

impl RecordStore {
    /// `append_records` makes non-snapshot batches accumulate instead of
    /// replacing the card's records.
    pub fn new(append_records: bool) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            records: DashMap::new(),
            states: DashMap::new(),
            append_records,
            changes,
        }
    }

    pub fn apply_batch(&self, key: &CardKey, batch: &[CardRecord]) {
        {
            let mut records = self.records.entry(key.clone()).or_default();
            if self.append_records && !is_snapshot(batch) {
                records.extend(batch.iter().cloned());
            } else {
                *records = batch.to_vec();
            }
        }
        self.notify(key);
    }

    pub fn set_state(&self, key: &CardKey, state: ExecutionState) {
        self.states.insert(key.clone(), state);
        self.notify(key);
    }

    fn notify(&self, key: &CardKey) {
        // No subscribers is fine.
        let _ = self.changes.send(key.clone());
    }

    pub fn records(&self, key: &CardKey) -> Vec<CardRecord> {
        self.records
            .get(key)
            .map(|records| records.value().clone())
            .unwrap_or_default()
    }

    pub fn state(&self, key: &CardKey) -> Option<ExecutionState> {
        self.states.get(key).map(|state| state.value().clone())
    }

    pub fn clear(&self, key: &CardKey) {
        self.records.remove(key);
        self.states.remove(key);
        self.notify(key);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CardKey> {
        self.changes.subscribe()
    }

    pub fn observer(self: &Arc<Self>, key: CardKey) -> StoreObserver {
        StoreObserver {
            store: self.clone(),
            key,
        }
    }
}

/// Writes one card's batches and states into a `RecordStore`.
#[derive(Clone)]
pub struct StoreObserver {
    store: Arc<RecordStore>,
    key: CardKey,
}

impl ExecutionObserver for StoreObserver {
    fn on_records_update(&self, records: &[CardRecord]) {
        self.store.apply_batch(&self.key, records);
    }

    fn on_state_change(&self, _update: &StateUpdate, state: &ExecutionState) {
        self.store.set_state(&self.key, state.clone());
    }
}
