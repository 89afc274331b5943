//! # Error History
//!
//! Bounded in-memory ring of classified failures, readable through the
//! telemetry surface. Thread-safe; writers never block message processing
//! for longer than the ring append.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::constants::ERROR_LOG_CAPACITY;

/// One recorded failure.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    /// Where the failure happened ("envelope parsing", "worker 3", ...).
    pub context: String,
    pub detail: String,
}

/// Ring buffer of the most recent failures.
#[derive(Debug, Default)]
pub struct ErrorLog {
    records: Mutex<VecDeque<ErrorRecord>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record, evicting the oldest entries beyond capacity.
    pub fn record(&self, context: impl Into<String>, detail: impl Into<String>) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.push_back(ErrorRecord {
            at: Utc::now(),
            context: context.into(),
            detail: detail.into(),
        });
        while records.len() > ERROR_LOG_CAPACITY {
            records.pop_front();
        }
    }

    /// The most recent `limit` records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<ErrorRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let skip = records.len().saturating_sub(limit);
        records.iter().skip(skip).cloned().collect()
    }

    /// The single most recent record.
    pub fn last(&self) -> Option<ErrorRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .back()
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all records; administrative use.
    pub fn clear(&self) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
