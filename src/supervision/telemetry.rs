//! # Worker Sensors
//!
//! Per-worker counters and the aggregate view over all live workers. All
//! counters are monotone non-decreasing while a worker runs, writes are
//! atomic, and reads produce non-blocking snapshots so telemetry never slows
//! a worker down.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use crate::constants::{OPERATIONAL_ERROR_RATE_THRESHOLD, RECENT_ACTIVITY_WINDOW_SECS};

/// Counter bundle owned by one worker.
#[derive(Debug)]
pub struct WorkerTelemetry {
    worker_id: u64,
    queue_name: String,
    started_at: OnceLock<DateTime<Utc>>,
    started_instant: OnceLock<Instant>,
    last_message_at: Mutex<Option<DateTime<Utc>>>,
    messages_processed: AtomicU64,
    errors_encountered: AtomicU64,
    running: AtomicBool,
    shutdown_requested: AtomicBool,
}

impl WorkerTelemetry {
    pub fn new(worker_id: u64, queue_name: impl Into<String>) -> Self {
        Self {
            worker_id,
            queue_name: queue_name.into(),
            started_at: OnceLock::new(),
            started_instant: OnceLock::new(),
            last_message_at: Mutex::new(None),
            messages_processed: AtomicU64::new(0),
            errors_encountered: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    pub fn record_started(&self) {
        let _ = self.started_at.set(Utc::now());
        let _ = self.started_instant.set(Instant::now());
        self.running.store(true, Ordering::Release);
    }

    pub fn record_stopped(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn record_shutdown_requested(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
    }

    pub fn record_message(&self) {
        self.messages_processed.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut last) = self.last_message_at.lock() {
            *last = Some(Utc::now());
        }
    }

    pub fn record_error(&self) {
        self.errors_encountered.fetch_add(1, Ordering::AcqRel);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Acquire)
    }

    pub fn errors_encountered(&self) -> u64 {
        self.errors_encountered.load(Ordering::Acquire)
    }

    /// Non-blocking snapshot with derived rates.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let messages = self.messages_processed();
        let errors = self.errors_encountered();
        let uptime_seconds = self
            .started_instant
            .get()
            .map(|s| s.elapsed().as_secs())
            .unwrap_or(0);
        let last_message_at = self
            .last_message_at
            .lock()
            .map(|l| *l)
            .unwrap_or(None);

        TelemetrySnapshot {
            worker_id: self.worker_id,
            queue_name: self.queue_name.clone(),
            started_at: self.started_at.get().copied(),
            last_message_at,
            messages_processed: messages,
            errors_encountered: errors,
            running: self.is_running(),
            shutdown_requested: self.shutdown_requested.load(Ordering::Acquire),
            uptime_seconds,
            messages_per_second: rate_per_second(messages, uptime_seconds),
            error_rate: error_rate(messages, errors),
            recently_active: last_message_at
                .map(|at| (Utc::now() - at).num_seconds() < RECENT_ACTIVITY_WINDOW_SECS as i64)
                .unwrap_or(false),
        }
    }
}

/// Point-in-time view of one worker's sensors.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub worker_id: u64,
    pub queue_name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub messages_processed: u64,
    pub errors_encountered: u64,
    pub running: bool,
    pub shutdown_requested: bool,
    pub uptime_seconds: u64,
    pub messages_per_second: f64,
    pub error_rate: f64,
    pub recently_active: bool,
}

/// Aggregate view over all live workers.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateTelemetry {
    pub supervising: bool,
    pub configured_workers: usize,
    pub active_workers: usize,
    pub total_messages_processed: u64,
    pub total_errors_encountered: u64,
    pub messages_per_second: f64,
    pub error_rate: f64,
    pub uptime_seconds: u64,
    /// Supervising with a full worker set and an error rate under threshold.
    pub fully_operational: bool,
    pub tracked_retry_conversations: usize,
    pub workers: Vec<TelemetrySnapshot>,
}

impl AggregateTelemetry {
    /// Fold worker snapshots into the aggregate view.
    pub fn from_snapshots(
        supervising: bool,
        configured_workers: usize,
        active_workers: usize,
        uptime_seconds: u64,
        tracked_retry_conversations: usize,
        workers: Vec<TelemetrySnapshot>,
    ) -> Self {
        let total_messages_processed: u64 = workers.iter().map(|w| w.messages_processed).sum();
        let total_errors_encountered: u64 = workers.iter().map(|w| w.errors_encountered).sum();
        let messages_per_second: f64 = workers.iter().map(|w| w.messages_per_second).sum();
        let aggregate_error_rate = error_rate(total_messages_processed, total_errors_encountered);

        Self {
            supervising,
            configured_workers,
            active_workers,
            total_messages_processed,
            total_errors_encountered,
            messages_per_second,
            error_rate: aggregate_error_rate,
            uptime_seconds,
            fully_operational: supervising
                && active_workers == configured_workers
                && aggregate_error_rate < OPERATIONAL_ERROR_RATE_THRESHOLD,
            tracked_retry_conversations,
            workers,
        }
    }
}

fn rate_per_second(count: u64, elapsed_seconds: u64) -> f64 {
    if elapsed_seconds == 0 {
        0.0
    } else {
        count as f64 / elapsed_seconds as f64
    }
}

fn error_rate(messages: u64, errors: u64) -> f64 {
    let total = messages + errors;
    if total == 0 {
        0.0
    } else {
        errors as f64 / total as f64
    }
}
