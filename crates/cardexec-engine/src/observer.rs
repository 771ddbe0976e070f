//! Outbound side effects of an execution.
//!
//! An execution never stores records itself. Every batch and every state
//! change goes to one `ExecutionObserver`, in emission order.

use cardexec_core::{CardKey, CardRecord, ExecutionState, StateUpdate};
use tokio::sync::mpsc;
use tracing::trace;

/// Receiver of record batches and state changes.
///
/// Called while the execution's state lock is held, so emission order is
/// preserved across tasks. Implementations must not call back into the
/// execution.
pub trait ExecutionObserver: Send + Sync {
    fn on_records_update(&self, records: &[CardRecord]);

    /// `update` is the partial change, `state` the merged result.
    fn on_state_change(&self, update: &StateUpdate, state: &ExecutionState);
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {
    fn on_records_update(&self, _records: &[CardRecord]) {}

    fn on_state_change(&self, _update: &StateUpdate, _state: &ExecutionState) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    Records {
        key: CardKey,
        records: Vec<CardRecord>,
    },
    State {
        key: CardKey,
        state: ExecutionState,
    },
}

impl ExecutionEvent {
    pub fn key(&self) -> &CardKey {
        match self {
            Self::Records { key, .. } | Self::State { key, .. } => key,
        }
    }
}

/// Forwards events over an unbounded channel. Several cards can share
/// one channel, events carry the card key.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    key: CardKey,
    tx: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelObserver {
    pub fn new(key: CardKey, tx: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
        Self { key, tx }
    }

    fn send(&self, event: ExecutionEvent) {
        if self.tx.send(event).is_err() {
            trace!(card = %self.key, "Execution event receiver dropped");
        }
    }
}

impl ExecutionObserver for ChannelObserver {
    fn on_records_update(&self, records: &[CardRecord]) {
        self.send(ExecutionEvent::Records {
            key: self.key.clone(),
            records: records.to_vec(),
        });
    }

    fn on_state_change(&self, _update: &StateUpdate, state: &ExecutionState) {
        self.send(ExecutionEvent::State {
            key: self.key.clone(),
            state: state.clone(),
        });
    }
}

/// Observer from two closures.
pub struct FnObserver<R, S> {
    on_records: R,
    on_state: S,
}

impl<R, S> FnObserver<R, S>
where
    R: Fn(&[CardRecord]) + Send + Sync,
    S: Fn(&ExecutionState) + Send + Sync,
{
    pub fn new(on_records: R, on_state: S) -> Self {
        Self {
            on_records,
            on_state,
        }
    }
}

impl<R, S> ExecutionObserver for FnObserver<R, S>
where
    R: Fn(&[CardRecord]) + Send + Sync,
    S: Fn(&ExecutionState) + Send + Sync,
{
    fn on_records_update(&self, records: &[CardRecord]) {
        (self.on_records)(records)
    }

    fn on_state_change(&self, _update: &StateUpdate, state: &ExecutionState) {
        (self.on_state)(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardexec_core::LoadingState;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_channel_observer_preserves_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let key = CardKey::new("r", "c");
        let observer = ChannelObserver::new(key.clone(), tx);

        let update = StateUpdate::new().with_loading(LoadingState::Loading);
        let mut state = ExecutionState::default();
        state.apply(&update);

        observer.on_state_change(&update, &state);
        observer.on_records_update(&[json!({"kind": "number"})]);

        match rx.try_recv().unwrap() {
            ExecutionEvent::State { key: k, state } => {
                assert_eq!(k, key);
                assert_eq!(state.loading_state, LoadingState::Loading);
            }
            other => panic!("expected state, got {other:?}"),
        }
        let records = rx.try_recv().unwrap();
        assert_eq!(records.key(), &key);
        assert_eq!(
            records,
            ExecutionEvent::Records {
                key,
                records: vec![json!({"kind": "number"})]
            }
        );
    }

    #[test]
    fn test_channel_observer_survives_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let observer = ChannelObserver::new(CardKey::new("r", "c"), tx);
        observer.on_records_update(&[json!(1)]);
    }

    #[test]
    fn test_fn_observer() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer = FnObserver::new(
            move |records: &[CardRecord]| sink.lock().extend(records.iter().cloned()),
            |_state: &ExecutionState| {},
        );

        observer.on_records_update(&[json!(1), json!(2)]);
        assert_eq!(*seen.lock(), vec![json!(1), json!(2)]);
    }
}
