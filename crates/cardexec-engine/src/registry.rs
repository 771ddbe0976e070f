//! Keyed table of card executions.

use cardexec_core::CardKey;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::execution::CardExecution;

/// Executions by card, inserted on first use and removed on disposal.
#[derive(Default)]
pub struct CardRegistry {
    cards: DashMap<CardKey, CardExecution>,
}

impl CardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert_with<F>(&self, key: CardKey, build: F) -> CardExecution
    where
        F: FnOnce() -> CardExecution,
    {
        self.cards.entry(key).or_insert_with(build).value().clone()
    }

    /// Like `get_or_insert_with` for a fallible constructor. Nothing is
    /// inserted when `build` fails.
    pub fn get_or_try_insert_with<F, E>(&self, key: CardKey, build: F) -> Result<CardExecution, E>
    where
        F: FnOnce() -> Result<CardExecution, E>,
    {
        match self.cards.entry(key) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let execution = build()?;
                entry.insert(execution.clone());
                Ok(execution)
            }
        }
    }

    pub fn get(&self, key: &CardKey) -> Option<CardExecution> {
        self.cards.get(key).map(|entry| entry.value().clone())
    }

    /// Remove a card and cancel whatever it was running.
    pub fn remove(&self, key: &CardKey) -> Option<CardExecution> {
        let (_, execution) = self.cards.remove(key)?;
        execution.cancel();
        debug!(card = %key, "Card removed");
        Some(execution)
    }

    pub fn cancel_all(&self) {
        for entry in self.cards.iter() {
            entry.value().cancel();
        }
    }

    pub fn keys(&self) -> Vec<CardKey> {
        let mut keys: Vec<CardKey> = self.cards.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionError;

    fn execution(key: &CardKey) -> CardExecution {
        CardExecution::builder(key.clone(), "number").build().unwrap()
    }

    #[test]
    fn test_insert_on_first_use() {
        let registry = CardRegistry::new();
        let key = CardKey::new("r", "c");

        let first = registry.get_or_insert_with(key.clone(), || execution(&key));
        let second = registry.get_or_insert_with(key.clone(), || panic!("built twice"));
        assert_eq!(first.key(), second.key());
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&key).is_some());
    }

    #[test]
    fn test_failed_build_inserts_nothing() {
        let registry = CardRegistry::new();
        let key = CardKey::new("r", "c");

        let result = registry.get_or_try_insert_with(key.clone(), || {
            Err::<CardExecution, _>(ExecutionError::UnknownHandler("x".to_string()))
        });
        assert!(result.is_err());
        assert!(registry.is_empty());

        let ok = registry.get_or_try_insert_with(key.clone(), || Ok::<_, ExecutionError>(execution(&key)));
        assert!(ok.is_ok());
        assert_eq!(registry.keys(), vec![key]);
    }

    #[test]
    fn test_remove_cancels() {
        let registry = CardRegistry::new();
        let key = CardKey::new("r", "c");
        registry.get_or_insert_with(key.clone(), || execution(&key));

        let removed = registry.remove(&key).unwrap();
        assert_eq!(removed.state().loading_state, cardexec_core::LoadingState::Idle);
        assert!(registry.remove(&key).is_none());
        assert!(registry.is_empty());
    }
}
