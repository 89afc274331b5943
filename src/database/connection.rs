//! Connection seam between the relay core and the external database driver.
//!
//! The driver (connection pool, credentials, vendor client) lives outside
//! this crate. The core consumes a [`ConnectionFactory`] and receives
//! [`QueueConnection`] values with auto-commit disabled; every dequeued
//! message is finalized on its owning connection by exactly one commit or
//! rollback.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;

use crate::error::{BrokerError, Result};

/// One row produced by the blocking receive, carrying the standard queue
/// binding fields.
#[derive(Debug, Clone)]
pub struct ReceivedRow {
    pub conversation_handle: String,
    pub message_type_name: String,
    pub message_body: String,
    pub message_enqueue_time: DateTime<Utc>,
    pub message_sequence_number: Option<i64>,
    pub priority: Option<i32>,
    pub conversation_group_id: String,
    pub service_name: String,
    pub contract_name: String,
}

/// Handle for interrupting a blocking receive from another task.
///
/// Obtained from the connection before the worker enters its receive loop;
/// the supervisor fires it during forced shutdown. `cancel` must be safe to
/// call at any point, including when no receive is in flight.
pub trait InterruptHandle: Send + Sync {
    fn cancel(&self);
}

/// A dedicated queue connection owned by a single worker.
///
/// Implementations run with auto-commit disabled: `receive` and
/// `end_conversation` take effect only at `commit`, and `rollback` returns
/// any received-but-unacknowledged message to the queue.
#[async_trait]
pub trait QueueConnection: Send {
    /// Execute the blocking-receive statement. Resolves with `Ok(None)` when
    /// the receive completes without a row (timeout or cancellation) and with
    /// an error for anything else. Must be cancellable mid-flight through the
    /// connection's [`InterruptHandle`].
    async fn receive(&mut self, statement: &str) -> Result<Option<ReceivedRow>>;

    /// End the given conversation with a reason (the acknowledge statement).
    async fn end_conversation(&mut self, conversation_handle: &str, reason: &str) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// Interrupt handle bound to this connection.
    fn interrupt_handle(&self) -> Arc<dyn InterruptHandle>;
}

/// Factory for worker connections plus the pre-flight status probes.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a new connection with auto-commit disabled.
    async fn connect(&self) -> Result<Box<dyn QueueConnection>>;

    /// Whether the database has its message broker enabled.
    async fn is_broker_enabled(&self) -> Result<bool>;

    /// Whether the named queue exists and is enabled for receiving.
    async fn is_queue_enabled(&self, queue_name: &str) -> Result<bool>;
}

/// Thin façade over the external [`ConnectionFactory`].
///
/// Adds the never-raising cleanup operations used on error paths and during
/// shutdown, where a secondary failure must not mask the original one.
#[derive(Clone)]
pub struct ConnectionManager {
    factory: Arc<dyn ConnectionFactory>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self { factory }
    }

    /// Acquire a fresh worker connection. Failure here means the worker
    /// cannot start at all.
    pub async fn acquire(&self) -> Result<Box<dyn QueueConnection>> {
        self.factory.connect().await.map_err(|e| {
            BrokerError::Connection(format!("Critical database connection failure: {e}"))
        })
    }

    /// Roll back, logging instead of raising on failure.
    pub async fn safe_rollback(&self, conn: &mut dyn QueueConnection, worker_id: u64) {
        if let Err(e) = conn.rollback().await {
            warn!(worker_id, error = %e, "Error rolling back transaction");
        }
    }

    /// Close, logging instead of raising on failure.
    pub async fn safe_close(&self, conn: &mut dyn QueueConnection, worker_id: u64) {
        if let Err(e) = conn.close().await {
            warn!(worker_id, error = %e, "Error closing connection");
        }
    }

    /// Roll back then close; the standard drain sequence.
    pub async fn safe_close_with_rollback(&self, conn: &mut dyn QueueConnection, worker_id: u64) {
        self.safe_rollback(conn, worker_id).await;
        self.safe_close(conn, worker_id).await;
    }

    /// Interrupt an in-flight blocking receive from outside the owning worker.
    pub fn interrupt_blocking_receive(&self, handle: &Arc<dyn InterruptHandle>, worker_id: u64) {
        tracing::debug!(worker_id, "Interrupting blocking receive");
        handle.cancel();
    }

    /// Pre-flight probe: broker enabled for the database.
    pub async fn is_broker_enabled(&self) -> Result<bool> {
        self.factory.is_broker_enabled().await
    }

    /// Pre-flight probe: queue present and enabled for receive.
    pub async fn is_queue_enabled(&self, queue_name: &str) -> Result<bool> {
        self.factory.is_queue_enabled(queue_name).await
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager").finish_non_exhaustive()
    }
}
