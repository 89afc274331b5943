//! # Listener Worker
//!
//! One worker's lifecycle: acquire a dedicated connection, loop over
//! { dequeue → dispatch → acknowledge | rollback → retry/poison }, clean up,
//! report the terminal outcome to the supervisor.
//!
//! ```text
//!   Init → Ignition → Running → Draining → Terminated
//!             │          │
//!             └──Fatal───┴── worker exit (may trigger restart)
//! ```
//!
//! Invariants:
//! - the worker owns its connection for its entire lifetime;
//! - every dequeued message ends in exactly one of commit-after-success,
//!   commit-after-poison-ack, rollback-for-retry, or rollback-at-shutdown;
//! - the worker never exits leaving an uncommitted connection open.

use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::database::connection::{InterruptHandle, QueueConnection};
use crate::error::BrokerError;
use crate::messaging::RawMessage;
use crate::resilience::ErrorKind;
use crate::supervision::telemetry::WorkerTelemetry;
use crate::supervision::{Services, ShutdownSignal};

/// Terminal outcome reported to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Planned stop; not restarted.
    Graceful,
    /// Stopped on a recoverable error; eligible for restart.
    Recoverable,
    /// Unrecoverable worker failure (fatal database condition); not restarted.
    Fatal,
    /// Process must terminate immediately (exit code 2).
    FatalProcess,
    /// Process must stop gracefully then exit (exit code 3).
    FatalSystem,
}

impl WorkerOutcome {
    pub fn restartable(&self) -> bool {
        matches!(self, WorkerOutcome::Recoverable)
    }

    /// Exit code demanded by process-fatal outcomes.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            WorkerOutcome::FatalProcess => Some(2),
            WorkerOutcome::FatalSystem => Some(3),
            _ => None,
        }
    }
}

/// Flow control inside the running loop.
enum LoopControl {
    Continue,
    Exit(WorkerOutcome),
}

/// One supervised listener worker.
pub struct ListenerWorker {
    worker_id: u64,
    queue_name: String,
    services: Services,
    telemetry: Arc<WorkerTelemetry>,
    shutdown: Arc<ShutdownSignal>,
    interrupt: Mutex<Option<Arc<dyn InterruptHandle>>>,
}

impl ListenerWorker {
    pub fn new(
        worker_id: u64,
        queue_name: impl Into<String>,
        services: Services,
        telemetry: Arc<WorkerTelemetry>,
    ) -> Self {
        Self {
            worker_id,
            queue_name: queue_name.into(),
            services,
            telemetry,
            shutdown: Arc::new(ShutdownSignal::new()),
            interrupt: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    pub fn telemetry(&self) -> &Arc<WorkerTelemetry> {
        &self.telemetry
    }

    /// Cooperative shutdown: aborts the in-flight receive select, the next
    /// backoff sleep, and the next loop iteration.
    pub fn request_shutdown(&self) {
        info!(worker_id = self.worker_id, queue = %self.queue_name, "Shutdown requested for worker");
        self.telemetry.record_shutdown_requested();
        self.shutdown.request();
    }

    /// Forced interruption of a blocking receive stuck inside the driver.
    /// Used by the supervisor after the graceful timeout elapses.
    pub fn interrupt(&self) {
        if let Ok(guard) = self.interrupt.lock() {
            if let Some(handle) = guard.as_ref() {
                self.services
                    .connection_manager
                    .interrupt_blocking_receive(handle, self.worker_id);
            }
        }
    }

    /// Run the worker to completion.
    pub async fn run(self: Arc<Self>) -> WorkerOutcome {
        self.telemetry.record_started();
        info!(worker_id = self.worker_id, queue = %self.queue_name, "🚀 WORKER: Starting listener");

        // Ignition: one dedicated connection for the worker's whole life.
        let mut conn = match self.services.connection_manager.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(
                    worker_id = self.worker_id,
                    queue = %self.queue_name,
                    error = %e,
                    "Ignition failure - could not establish connection"
                );
                self.telemetry.record_error();
                self.services
                    .error_log
                    .record(format!("worker {}", self.worker_id), format!("Ignition failure: {e}"));
                self.telemetry.record_stopped();
                return WorkerOutcome::Fatal;
            }
        };

        if let Ok(mut guard) = self.interrupt.lock() {
            *guard = Some(conn.interrupt_handle());
        }
        info!(worker_id = self.worker_id, queue = %self.queue_name, "Ignition successful - worker running");

        let outcome = self.running_loop(conn.as_mut()).await;

        match outcome {
            WorkerOutcome::Graceful => {
                info!(worker_id = self.worker_id, "Worker stopped gracefully")
            }
            WorkerOutcome::Recoverable => {
                warn!(worker_id = self.worker_id, "Worker stopped due to recoverable error")
            }
            _ => error!(worker_id = self.worker_id, outcome = ?outcome, "Worker stopped due to fatal failure"),
        }

        // Draining: roll back anything uncommitted, release the connection.
        self.services
            .connection_manager
            .safe_close_with_rollback(conn.as_mut(), self.worker_id)
            .await;
        if let Ok(mut guard) = self.interrupt.lock() {
            *guard = None;
        }
        self.telemetry.record_stopped();
        info!(worker_id = self.worker_id, "Cleanup completed for worker");

        outcome
    }

    async fn running_loop(&self, conn: &mut dyn QueueConnection) -> WorkerOutcome {
        // Receive failures without message context are bounded like message
        // retries; the counter resets on any successful receive.
        let mut receive_failures: u32 = 0;

        loop {
            if self.shutdown.is_requested() {
                self.services
                    .connection_manager
                    .safe_rollback(conn, self.worker_id)
                    .await;
                return WorkerOutcome::Graceful;
            }

            // The receive future borrows the connection, so the shutdown arm
            // only signals; rollback happens after the select releases it.
            let received = tokio::select! {
                received = self.services.dequeuer.receive(conn, &self.queue_name, self.worker_id) => Some(received),
                _ = self.shutdown.wait() => None,
            };
            let Some(received) = received else {
                self.services
                    .connection_manager
                    .safe_rollback(conn, self.worker_id)
                    .await;
                return WorkerOutcome::Graceful;
            };

            match received {
                Ok(None) => {
                    receive_failures = 0;
                }
                Ok(Some(message)) => {
                    receive_failures = 0;
                    match self.process_message(conn, &message).await {
                        LoopControl::Continue => {}
                        LoopControl::Exit(outcome) => return outcome,
                    }
                }
                Err(e) => {
                    match self.handle_receive_error(conn, e, &mut receive_failures).await {
                        LoopControl::Continue => {}
                        LoopControl::Exit(outcome) => return outcome,
                    }
                }
            }
        }
    }

    /// Dispatch one message and finalize it on the owning connection.
    async fn process_message(
        &self,
        conn: &mut dyn QueueConnection,
        message: &RawMessage,
    ) -> LoopControl {
        let dispatched = self.services.dispatcher.dispatch(message).await;

        match dispatched {
            Ok(outcome) => match self.acknowledge(conn, message, outcome.ack_reason()).await {
                Ok(()) => {
                    self.services
                        .retry_ledger
                        .clear(&message.conversation_handle);
                    self.telemetry.record_message();
                    LoopControl::Continue
                }
                Err(ack_error) => {
                    self.telemetry.record_error();
                    self.handle_message_failure(conn, message, ack_error).await
                }
            },
            Err(dispatch_error) => {
                self.telemetry.record_error();
                self.handle_message_failure(conn, message, dispatch_error)
                    .await
            }
        }
    }

    /// Acknowledge-then-commit; atomic with respect to external observers.
    async fn acknowledge(
        &self,
        conn: &mut dyn QueueConnection,
        message: &RawMessage,
        reason: &str,
    ) -> crate::error::Result<()> {
        conn.end_conversation(&message.conversation_handle, reason)
            .await?;
        conn.commit().await
    }

    /// Classifier-driven response to a failure while holding a message.
    async fn handle_message_failure(
        &self,
        conn: &mut dyn QueueConnection,
        message: &RawMessage,
        error: BrokerError,
    ) -> LoopControl {
        let handle = &message.conversation_handle;
        let state = self.services.retry_ledger.get_or_create(handle);
        let kind = self.services.classifier.classify(&error, state.attempts());

        self.services.error_log.record(
            format!("worker {}", self.worker_id),
            format!("{kind} during processing of conversation {handle}: {error}"),
        );

        match kind {
            ErrorKind::Shutdown => {
                info!(worker_id = self.worker_id, "Message processing stopped due to shutdown request");
                self.services
                    .connection_manager
                    .safe_rollback(conn, self.worker_id)
                    .await;
                LoopControl::Exit(WorkerOutcome::Graceful)
            }

            ErrorKind::Poison => self.consume_poison_message(conn, message, &error).await,

            ErrorKind::Retryable => {
                let attempt = state.record_failure(error.tag());
                warn!(
                    worker_id = self.worker_id,
                    conversation_handle = %handle,
                    attempt,
                    max_retries = self.services.classifier.max_retries(),
                    error = %error,
                    "Retryable error - rolling back for redelivery"
                );
                self.services
                    .connection_manager
                    .safe_rollback(conn, self.worker_id)
                    .await;

                let delay = self.services.classifier.retry_delay(attempt);
                if !self.shutdown.sleep_cancellable(delay).await {
                    return LoopControl::Exit(WorkerOutcome::Graceful);
                }
                LoopControl::Continue
            }

            ErrorKind::FatalDb => {
                error!(
                    worker_id = self.worker_id,
                    conversation_handle = %handle,
                    error = %error,
                    "Fatal database error - stopping worker"
                );
                self.services
                    .connection_manager
                    .safe_rollback(conn, self.worker_id)
                    .await;
                LoopControl::Exit(WorkerOutcome::Fatal)
            }

            ErrorKind::FatalProcess | ErrorKind::FatalSystem => {
                error!(
                    worker_id = self.worker_id,
                    kind = %kind,
                    error = %error,
                    "Critical failure - worker terminating"
                );
                self.services
                    .connection_manager
                    .safe_rollback(conn, self.worker_id)
                    .await;
                LoopControl::Exit(if kind == ErrorKind::FatalProcess {
                    WorkerOutcome::FatalProcess
                } else {
                    WorkerOutcome::FatalSystem
                })
            }
        }
    }

    /// Acknowledge a poisoned message with a recorded reason and clear its
    /// retry state. Failure to consume the poison is itself a recoverable
    /// worker failure: the message stays in the queue for a fresh worker.
    async fn consume_poison_message(
        &self,
        conn: &mut dyn QueueConnection,
        message: &RawMessage,
        error: &BrokerError,
    ) -> LoopControl {
        let handle = &message.conversation_handle;
        let state = self.services.retry_ledger.get_or_create(handle);
        let attempts = state.attempts();

        let reason = match error {
            BrokerError::Poison { reason, .. } => reason.clone(),
            other => format!(
                "Poison message consumed after {attempts} consecutive errors - {other}"
            ),
        };

        error!(
            worker_id = self.worker_id,
            conversation_handle = %handle,
            message_type = %message.message_type_name,
            attempts,
            first_failure_at = ?state.first_failure_at(),
            last_error_kind = ?state.last_error_kind(),
            reason = %reason,
            "=== POISON MESSAGE CONSUMED ==="
        );

        let consumed: crate::error::Result<()> = async {
            conn.end_conversation(handle, &reason).await?;
            conn.commit().await
        }
        .await;

        match consumed {
            Ok(()) => {
                self.services.retry_ledger.clear(handle);
                self.services.error_log.record(
                    format!("worker {}", self.worker_id),
                    format!("Poison message consumed for conversation {handle}: {reason}"),
                );
                info!(
                    worker_id = self.worker_id,
                    conversation_handle = %handle,
                    "Poison message consumed - conversation ended"
                );
                LoopControl::Continue
            }
            Err(consume_error) => {
                error!(
                    worker_id = self.worker_id,
                    conversation_handle = %handle,
                    error = %consume_error,
                    "Failed to consume poison message"
                );
                self.services
                    .connection_manager
                    .safe_rollback(conn, self.worker_id)
                    .await;
                LoopControl::Exit(WorkerOutcome::Recoverable)
            }
        }
    }

    /// Receive failures carry no message context: retry with backoff up to
    /// the classifier's bound, then stop the worker for a restart.
    async fn handle_receive_error(
        &self,
        conn: &mut dyn QueueConnection,
        error: BrokerError,
        receive_failures: &mut u32,
    ) -> LoopControl {
        self.telemetry.record_error();
        let kind = self.services.classifier.classify(&error, *receive_failures);

        self.services.error_log.record(
            format!("worker {}", self.worker_id),
            format!("{kind} during receive: {error}"),
        );

        match kind {
            ErrorKind::Shutdown => {
                self.services
                    .connection_manager
                    .safe_rollback(conn, self.worker_id)
                    .await;
                LoopControl::Exit(WorkerOutcome::Graceful)
            }
            ErrorKind::FatalDb => {
                error!(
                    worker_id = self.worker_id,
                    error = %error,
                    "Fatal database error during receive - stopping worker"
                );
                self.services
                    .connection_manager
                    .safe_rollback(conn, self.worker_id)
                    .await;
                LoopControl::Exit(WorkerOutcome::Fatal)
            }
            ErrorKind::FatalProcess => LoopControl::Exit(WorkerOutcome::FatalProcess),
            ErrorKind::FatalSystem => LoopControl::Exit(WorkerOutcome::FatalSystem),
            ErrorKind::Poison => {
                // Retry bound exhausted with no message to poison; hand the
                // queue to a fresh worker.
                error!(
                    worker_id = self.worker_id,
                    consecutive_failures = *receive_failures,
                    error = %error,
                    "Receive failures exceeded retry bound - stopping worker for restart"
                );
                LoopControl::Exit(WorkerOutcome::Recoverable)
            }
            ErrorKind::Retryable => {
                *receive_failures += 1;
                warn!(
                    worker_id = self.worker_id,
                    consecutive_failures = *receive_failures,
                    error = %error,
                    "Receive error - backing off before retry"
                );
                self.services
                    .connection_manager
                    .safe_rollback(conn, self.worker_id)
                    .await;

                let delay = self.services.classifier.retry_delay(*receive_failures);
                if !self.shutdown.sleep_cancellable(delay).await {
                    return LoopControl::Exit(WorkerOutcome::Graceful);
                }
                LoopControl::Continue
            }
        }
    }
}

impl std::fmt::Debug for ListenerWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerWorker")
            .field("worker_id", &self.worker_id)
            .field("queue_name", &self.queue_name)
            .field("running", &self.telemetry.is_running())
            .finish_non_exhaustive()
    }
}
