//! # Supervisor
//!
//! Owner of the worker set and of the restart policy. Starts N listener
//! workers for a queue, observes their completions through a worker-death
//! channel, replaces eligible casualties, and drives graceful-then-forced
//! shutdown.
//!
//! The death monitor runs on its own task holding a weak reference to the
//! supervisor state, so dropping the supervisor tears the monitor down and a
//! dying worker never executes supervisor logic synchronously.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::constants::{FORCED_SHUTDOWN_WAIT_SECS, RESTART_SETTLE_DELAY_MS};
use crate::database::{ConnectionFactory, ConnectionManager, QueueDequeuer};
use crate::error::{BrokerError, Result};
use crate::messaging::{Dispatcher, EnvelopeParser};
use crate::registry::HandlerRegistry;
use crate::resilience::{ClassifierConfig, ErrorClassifier, ErrorLog, RetryLedger};
use crate::supervision::restart::{DefaultRestartPolicy, RestartPolicy};
use crate::supervision::telemetry::{AggregateTelemetry, TelemetrySnapshot, WorkerTelemetry};
use crate::supervision::worker::{ListenerWorker, WorkerOutcome};
use crate::supervision::Services;

/// Terminal report delivered by the execution substrate when a worker exits.
#[derive(Debug, Clone, Copy)]
pub struct WorkerExit {
    pub worker_id: u64,
    pub outcome: WorkerOutcome,
}

/// Invoked with the deterministic exit code when a process-fatal outcome
/// surfaces. The default hook only logs; binaries install `process::exit`.
pub type FatalHook = Arc<dyn Fn(i32) + Send + Sync>;

/// Supervisor-owned context for one live worker.
struct WorkerContext {
    worker_id: u64,
    #[allow(dead_code)]
    started_at: DateTime<Utc>,
    worker: Arc<ListenerWorker>,
    handle: JoinHandle<()>,
}

/// Captured start parameters; preserved across `stop(false)` so `restart`
/// can reuse them.
#[derive(Clone)]
struct StartState {
    queue_name: String,
    registry: Arc<HandlerRegistry>,
    services: Services,
}

struct SupervisorInner {
    config: Arc<BrokerConfig>,
    connection_manager: ConnectionManager,
    classifier: Arc<ErrorClassifier>,
    retry_ledger: Arc<RetryLedger>,
    error_log: Arc<ErrorLog>,
    supervising: AtomicBool,
    start_state: Mutex<Option<StartState>>,
    started_at: Mutex<Option<(DateTime<Utc>, Instant)>>,
    workers: Mutex<Vec<WorkerContext>>,
    /// Shared monotonic counter; worker ids are never reused in-process.
    next_worker_id: AtomicU64,
    exit_tx: mpsc::UnboundedSender<WorkerExit>,
    /// Held until the first start spawns the death monitor.
    exit_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerExit>>>,
    restart_policy: Box<dyn RestartPolicy>,
    fatal_hook: Mutex<FatalHook>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Supervisor over a fixed set of listener workers.
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(config: Arc<BrokerConfig>, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self::with_restart_policy(config, factory, Box::new(DefaultRestartPolicy))
    }

    pub fn with_restart_policy(
        config: Arc<BrokerConfig>,
        factory: Arc<dyn ConnectionFactory>,
        restart_policy: Box<dyn RestartPolicy>,
    ) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let classifier = Arc::new(ErrorClassifier::new(ClassifierConfig::from_broker_config(
            &config,
        )));

        let inner = Arc::new(SupervisorInner {
            config,
            connection_manager: ConnectionManager::new(factory),
            classifier,
            retry_ledger: Arc::new(RetryLedger::new()),
            error_log: Arc::new(ErrorLog::new()),
            supervising: AtomicBool::new(false),
            start_state: Mutex::new(None),
            started_at: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            next_worker_id: AtomicU64::new(0),
            exit_tx,
            exit_rx: Mutex::new(Some(exit_rx)),
            restart_policy,
            fatal_hook: Mutex::new(Arc::new(|code: i32| {
                error!(exit_code = code, "Process-fatal outcome reached; no fatal hook installed");
            })),
            monitor_handle: Mutex::new(None),
        });

        debug!("Supervisor created");
        Self { inner }
    }

    /// Install the action taken on process-fatal worker outcomes.
    pub fn set_fatal_hook(&self, hook: FatalHook) {
        *lock(&self.inner.fatal_hook) = hook;
    }

    /// Start supervision: validate inputs, capture them into the state slots,
    /// and spawn the configured number of workers.
    pub async fn start(&self, queue_name: &str, registry: Arc<HandlerRegistry>) -> Result<()> {
        let inner = &self.inner;

        if inner
            .supervising
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Supervision already active");
            return Err(BrokerError::InvalidState(
                "Supervision already active".to_string(),
            ));
        }

        if !inner.config.is_valid_queue(queue_name) {
            inner.supervising.store(false, Ordering::Release);
            return Err(BrokerError::InvalidInput(format!(
                "Queue name '{queue_name}' is empty or too long"
            )));
        }

        info!(
            queue = queue_name,
            listeners = inner.config.listener_count,
            "🏁 SUPERVISOR: Starting supervision"
        );

        // The death monitor is spawned once, on the first start, and lives
        // for the supervisor's lifetime.
        {
            let mut monitor = lock(&inner.monitor_handle);
            if monitor.is_none() {
                if let Some(exit_rx) = lock(&inner.exit_rx).take() {
                    *monitor = Some(tokio::spawn(monitor_loop(Arc::downgrade(inner), exit_rx)));
                }
            }
        }

        let services = Services {
            config: inner.config.clone(),
            connection_manager: inner.connection_manager.clone(),
            classifier: inner.classifier.clone(),
            dequeuer: QueueDequeuer::new(),
            dispatcher: Dispatcher::new(
                EnvelopeParser::new(inner.error_log.clone()),
                registry.clone(),
            ),
            retry_ledger: inner.retry_ledger.clone(),
            error_log: inner.error_log.clone(),
        };

        let state = StartState {
            queue_name: queue_name.to_string(),
            registry,
            services,
        };
        *lock(&inner.start_state) = Some(state.clone());
        *lock(&inner.started_at) = Some((Utc::now(), Instant::now()));

        for _ in 0..inner.config.listener_count {
            inner.spawn_worker(&state);
        }

        info!(
            queue = queue_name,
            workers = inner.config.listener_count,
            "✅ SUPERVISOR: Supervision started"
        );
        Ok(())
    }

    /// Stop supervision: cooperative shutdown, bounded graceful wait, forced
    /// interruption of anything still blocked, ledger cleanup.
    pub async fn stop(&self, clear_state: bool) -> Result<()> {
        self.inner.stop_supervision(clear_state).await
    }

    /// Stop keeping the state slots, settle briefly, start again from them.
    pub async fn restart(&self) -> Result<()> {
        info!("Restarting supervision");
        self.stop(false).await?;
        tokio::time::sleep(Duration::from_millis(RESTART_SETTLE_DELAY_MS)).await;

        let state = lock(&self.inner.start_state).clone();
        let Some(state) = state else {
            let message = "Cannot restart supervision - missing queue name or handler registry";
            self.inner.error_log.record("supervisor", message);
            error!("{message}");
            return Err(BrokerError::Supervision(message.to_string()));
        };

        self.start(&state.queue_name, state.registry.clone()).await
    }

    /// Operator safety hatch: replace every worker whose task has finished.
    /// Auto-restart through the death monitor is authoritative; this only
    /// picks up workers the policy declined or that died unnoticed.
    pub async fn restart_failed(&self) -> Result<usize> {
        let inner = &self.inner;

        if !inner.supervising.load(Ordering::Acquire) {
            warn!("Cannot restart workers - supervision is not active");
            return Ok(0);
        }

        let state = lock(&inner.start_state).clone();
        let Some(state) = state else {
            return Ok(0);
        };

        let finished: Vec<WorkerContext> = {
            let mut workers = lock(&inner.workers);
            let mut finished = Vec::new();
            let mut index = 0;
            while index < workers.len() {
                if workers[index].handle.is_finished() {
                    finished.push(workers.remove(index));
                } else {
                    index += 1;
                }
            }
            finished
        };

        if finished.is_empty() {
            info!("No failed workers to restart");
            return Ok(0);
        }

        info!(count = finished.len(), "Found finished workers to restart");
        let replaced = finished.len();
        for dead in finished {
            let new_id = inner.spawn_worker(&state);
            info!(
                old_worker_id = dead.worker_id,
                new_worker_id = new_id,
                "Manually restarted worker"
            );
        }

        info!(
            active = self.active_worker_count(),
            configured = self.configured_worker_count(),
            "Restart complete"
        );
        Ok(replaced)
    }

    pub fn is_supervising(&self) -> bool {
        self.inner.supervising.load(Ordering::Acquire)
    }

    pub fn configured_worker_count(&self) -> usize {
        self.inner.config.listener_count
    }

    /// Workers that are running and whose task is still alive.
    pub fn active_worker_count(&self) -> usize {
        lock(&self.inner.workers)
            .iter()
            .filter(|ctx| ctx.worker.telemetry().is_running() && !ctx.handle.is_finished())
            .count()
    }

    /// All tracked contexts, including ones that finished but were not yet
    /// replaced.
    pub fn total_worker_count(&self) -> usize {
        lock(&self.inner.workers).len()
    }

    /// Supervising, with a live death monitor and a full worker set.
    pub fn is_healthy(&self) -> bool {
        let monitor_alive = lock(&self.inner.monitor_handle)
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);
        self.is_supervising()
            && monitor_alive
            && self.active_worker_count() == self.configured_worker_count()
    }

    pub fn uptime(&self) -> Duration {
        lock(&self.inner.started_at)
            .map(|(_, instant)| instant.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    pub fn queue_name(&self) -> Option<String> {
        lock(&self.inner.start_state)
            .as_ref()
            .map(|state| state.queue_name.clone())
    }

    pub fn retry_ledger(&self) -> &Arc<RetryLedger> {
        &self.inner.retry_ledger
    }

    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.inner.connection_manager
    }

    pub fn error_log(&self) -> &Arc<ErrorLog> {
        &self.inner.error_log
    }

    pub fn worker_snapshots(&self) -> Vec<TelemetrySnapshot> {
        lock(&self.inner.workers)
            .iter()
            .map(|ctx| ctx.worker.telemetry().snapshot())
            .collect()
    }

    /// Aggregate telemetry over all live workers.
    pub fn telemetry(&self) -> AggregateTelemetry {
        AggregateTelemetry::from_snapshots(
            self.is_supervising(),
            self.configured_worker_count(),
            self.active_worker_count(),
            self.uptime().as_secs(),
            self.inner.retry_ledger.len(),
            self.worker_snapshots(),
        )
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("supervising", &self.is_supervising())
            .field("configured_workers", &self.configured_worker_count())
            .field("active_workers", &self.active_worker_count())
            .finish_non_exhaustive()
    }
}

impl SupervisorInner {
    /// Spawn one worker and register its context. Worker ids come from the
    /// shared monotonic counter so successive incarnations stay
    /// distinguishable in logs and telemetry.
    fn spawn_worker(&self, state: &StartState) -> u64 {
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::AcqRel) + 1;
        let telemetry = Arc::new(WorkerTelemetry::new(worker_id, state.queue_name.as_str()));
        let worker = Arc::new(ListenerWorker::new(
            worker_id,
            state.queue_name.as_str(),
            state.services.clone(),
            telemetry,
        ));

        let exit_tx = self.exit_tx.clone();
        let runner = worker.clone();
        let handle = tokio::spawn(async move {
            let outcome = runner.run().await;
            let _ = exit_tx.send(WorkerExit { worker_id, outcome });
        });

        lock(&self.workers).push(WorkerContext {
            worker_id,
            started_at: Utc::now(),
            worker,
            handle,
        });

        info!(worker_id, queue = %state.queue_name, "Started worker");
        worker_id
    }

    async fn stop_supervision(&self, clear_state: bool) -> Result<()> {
        if !self.supervising.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        info!("🛑 SUPERVISOR: Stopping supervision");

        let contexts: Vec<WorkerContext> = lock(&self.workers).drain(..).collect();
        info!(count = contexts.len(), "Requesting graceful shutdown of workers");
        for ctx in &contexts {
            ctx.worker.request_shutdown();
        }

        let graceful_deadline = Instant::now() + self.config.graceful_timeout();
        let mut lingering = Vec::new();
        for mut ctx in contexts {
            let remaining = graceful_deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, &mut ctx.handle).await {
                Ok(Err(join_error)) if join_error.is_panic() => {
                    error!(worker_id = ctx.worker_id, "Worker task panicked during shutdown");
                }
                Ok(_) => {}
                Err(_) => lingering.push(ctx),
            }
        }

        if !lingering.is_empty() {
            warn!(
                count = lingering.len(),
                timeout_seconds = self.config.graceful_timeout_seconds,
                "Graceful shutdown timeout exceeded, interrupting remaining workers"
            );
            for ctx in &lingering {
                ctx.worker.interrupt();
            }
            for mut ctx in lingering {
                let forced_wait = Duration::from_secs(FORCED_SHUTDOWN_WAIT_SECS);
                if tokio::time::timeout(forced_wait, &mut ctx.handle).await.is_err() {
                    error!(worker_id = ctx.worker_id, "Failed to stop worker, aborting its task");
                    ctx.handle.abort();
                }
            }
        }

        self.retry_ledger.clear_all();

        if clear_state {
            *lock(&self.start_state) = None;
            *lock(&self.started_at) = None;
        }

        info!("🛑 SUPERVISOR: Supervision stopped");
        Ok(())
    }

    /// Worker-death callback, invoked once per terminated worker from the
    /// monitor task.
    async fn handle_worker_exit(&self, exit: WorkerExit) {
        let removed = {
            let mut workers = lock(&self.workers);
            workers
                .iter()
                .position(|ctx| ctx.worker_id == exit.worker_id)
                .map(|index| workers.remove(index))
        };

        if removed.is_none() {
            // Already replaced (manual restart) or drained by stop().
            debug!(worker_id = exit.worker_id, "No context found for exited worker");
            return;
        }

        if !self.supervising.load(Ordering::Acquire) {
            debug!(worker_id = exit.worker_id, "Worker exited during shutdown");
            return;
        }

        if exit.outcome != WorkerOutcome::Graceful {
            self.error_log.record(
                "supervisor",
                format!("Worker {} exited with outcome {:?}", exit.worker_id, exit.outcome),
            );
        }

        if let Some(exit_code) = exit.outcome.exit_code() {
            error!(
                worker_id = exit.worker_id,
                exit_code,
                "Process-fatal worker outcome - stopping supervision"
            );
            let _ = self.stop_supervision(true).await;
            let hook = lock(&self.fatal_hook).clone();
            (hook.as_ref())(exit_code);
            return;
        }

        if !self.restart_policy.should_restart(&exit.outcome) {
            warn!(
                worker_id = exit.worker_id,
                outcome = ?exit.outcome,
                "Worker will NOT be restarted"
            );
            return;
        }

        let state = lock(&self.start_state).clone();
        let Some(state) = state else {
            warn!("Cannot restart worker - supervisor state slots are empty");
            return;
        };

        let new_id = self.spawn_worker(&state);
        let active = lock(&self.workers)
            .iter()
            .filter(|ctx| !ctx.handle.is_finished())
            .count();
        warn!(
            dead_worker_id = exit.worker_id,
            new_worker_id = new_id,
            active,
            configured = self.config.listener_count,
            "Worker died and was replaced"
        );
        debug!(
            tracked_conversations = self.retry_ledger.len(),
            "Retry ledger state after worker replacement"
        );
    }
}

/// Death-monitor loop; holds only a weak reference so the supervisor can be
/// dropped freely.
async fn monitor_loop(
    weak: Weak<SupervisorInner>,
    mut exit_rx: mpsc::UnboundedReceiver<WorkerExit>,
) {
    while let Some(exit) = exit_rx.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner.handle_worker_exit(exit).await;
    }
    debug!("Supervisor death monitor ended");
}

/// Poison-tolerant mutex lock; supervision state stays usable even if a
/// holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
