//! # Supervision Tree
//!
//! The supervised worker pool: N listener workers, each owning a dedicated
//! queue connection, observed by a supervisor that applies the restart policy
//! when a worker dies and drives graceful-then-forced shutdown.

pub mod restart;
pub mod supervisor;
pub mod telemetry;
pub mod worker;

pub use restart::{DefaultRestartPolicy, RestartPolicy};
pub use supervisor::{Supervisor, WorkerExit};
pub use telemetry::{AggregateTelemetry, TelemetrySnapshot, WorkerTelemetry};
pub use worker::{ListenerWorker, WorkerOutcome};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::config::BrokerConfig;
use crate::database::{ConnectionManager, QueueDequeuer};
use crate::messaging::Dispatcher;
use crate::resilience::{ErrorClassifier, ErrorLog, RetryLedger};

/// Collaborator bundle threaded through the supervision tree.
///
/// Built once per supervision start and shared by reference; there is no
/// ambient or global state.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<BrokerConfig>,
    pub connection_manager: ConnectionManager,
    pub classifier: Arc<ErrorClassifier>,
    pub dequeuer: QueueDequeuer,
    pub dispatcher: Dispatcher,
    pub retry_ledger: Arc<RetryLedger>,
    pub error_log: Arc<ErrorLog>,
}

/// Cooperative shutdown signal shared between a worker and the supervisor.
///
/// Once requested the signal stays set; `wait` resolves immediately for late
/// subscribers, so a worker that checks between operations and a worker
/// parked inside `select!` both observe the same request.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal and wake every waiter.
    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(&self) {
        while !self.is_requested() {
            let notified = self.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `duration`, aborting early on shutdown. Returns `true` when
    /// the full duration elapsed, `false` when the sleep was cancelled.
    pub async fn sleep_cancellable(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.wait() => false,
        }
    }
}
