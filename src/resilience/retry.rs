//! # Retry Ledger
//!
//! Per-conversation retry state shared across all listener workers.
//!
//! A conversation's state is mutated by exactly one worker at a time (the one
//! currently holding the message), but any replacement worker that receives a
//! redelivered message must observe the accumulated count, so the ledger
//! itself is safe for concurrent access.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::sync::atomic::{AtomicU32, Ordering};

/// Retry bookkeeping for one conversation handle.
///
/// `first_failure_at` is set exactly once for the lifetime of the state;
/// `attempts` is monotone non-decreasing while the state exists.
#[derive(Debug, Default)]
pub struct RetryState {
    count: AtomicU32,
    first_failure_at: OnceLock<DateTime<Utc>>,
    last_error_kind: Mutex<Option<String>>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current attempt count.
    pub fn attempts(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Record one failure: stamps the first-failure time on the first call,
    /// increments the count, remembers the error kind. Returns the new count.
    pub fn record_failure(&self, error_kind: &str) -> u32 {
        let _ = self.first_failure_at.set(Utc::now());
        if let Ok(mut last) = self.last_error_kind.lock() {
            *last = Some(error_kind.to_string());
        }
        self.count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// When the first failure was recorded, if any.
    pub fn first_failure_at(&self) -> Option<DateTime<Utc>> {
        self.first_failure_at.get().copied()
    }

    /// Tag of the most recent error, if any.
    pub fn last_error_kind(&self) -> Option<String> {
        self.last_error_kind.lock().ok().and_then(|l| l.clone())
    }
}

/// Concurrency-safe mapping from conversation handle to [`RetryState`].
#[derive(Debug, Default)]
pub struct RetryLedger {
    states: RwLock<HashMap<String, Arc<RetryState>>>,
}

impl RetryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic insert-if-absent; returns the unique state for the handle.
    /// Identity-idempotent: repeated calls return the same state object until
    /// the handle is cleared.
    pub fn get_or_create(&self, conversation_handle: &str) -> Arc<RetryState> {
        if let Some(state) = self
            .states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(conversation_handle)
        {
            return state.clone();
        }

        self.states
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(conversation_handle.to_string())
            .or_insert_with(|| Arc::new(RetryState::new()))
            .clone()
    }

    /// Remove the state for a handle; idempotent.
    pub fn clear(&self, conversation_handle: &str) {
        self.states
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(conversation_handle);
    }

    /// Empty the ledger; used at supervisor shutdown.
    pub fn clear_all(&self) {
        self.states
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Number of tracked conversations; telemetry only.
    pub fn len(&self) -> usize {
        self.states.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_identity_idempotent() {
        let ledger = RetryLedger::new();
        let a = ledger.get_or_create("h1");
        let b = ledger.get_or_create("h1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn clear_is_idempotent_and_resets_state() {
        let ledger = RetryLedger::new();
        let state = ledger.get_or_create("h1");
        state.record_failure("Handler");
        assert_eq!(state.attempts(), 1);

        ledger.clear("h1");
        ledger.clear("h1");

        let fresh = ledger.get_or_create("h1");
        assert!(!Arc::ptr_eq(&state, &fresh));
        assert_eq!(fresh.attempts(), 0);
    }

    #[test]
    fn first_failure_time_is_set_exactly_once() {
        let state = RetryState::new();
        assert!(state.first_failure_at().is_none());

        state.record_failure("Handler");
        let first = state.first_failure_at().unwrap();

        state.record_failure("Database");
        assert_eq!(state.first_failure_at().unwrap(), first);
        assert_eq!(state.attempts(), 2);
        assert_eq!(state.last_error_kind().as_deref(), Some("Database"));
    }

    #[test]
    fn clear_all_empties_the_ledger() {
        let ledger = RetryLedger::new();
        ledger.get_or_create("h1");
        ledger.get_or_create("h2");
        assert_eq!(ledger.len(), 2);

        ledger.clear_all();
        assert!(ledger.is_empty());
    }

    #[test]
    fn concurrent_get_or_create_yields_one_state() {
        let ledger = Arc::new(RetryLedger::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            handles.push(std::thread::spawn(move || {
                ledger.get_or_create("shared").record_failure("Handler")
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.get_or_create("shared").attempts(), 8);
    }
}
