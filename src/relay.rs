//! # Relay Facade
//!
//! Wires configuration, the external connection factory, and the handler
//! registry into a running supervised consumer. This is the surface an
//! embedding application talks to: start, stop, restart, and the read-only
//! telemetry contract.

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::BrokerConfig;
use crate::database::validator::EnvironmentValidator;
use crate::database::ConnectionFactory;
use crate::error::{BrokerError, Result};
use crate::registry::HandlerRegistry;
use crate::resilience::ErrorRecord;
use crate::supervision::supervisor::FatalHook;
use crate::supervision::{AggregateTelemetry, Supervisor, TelemetrySnapshot};

/// The change-data-capture relay: a supervised pool of queue listeners
/// delivering typed change events to registered table handlers.
pub struct BrokerRelay {
    config: Arc<BrokerConfig>,
    registry: Arc<HandlerRegistry>,
    supervisor: Supervisor,
}

impl BrokerRelay {
    /// Assemble a relay. Nothing runs until [`BrokerRelay::start`].
    pub fn new(
        config: BrokerConfig,
        factory: Arc<dyn ConnectionFactory>,
        registry: HandlerRegistry,
    ) -> Self {
        let config = Arc::new(config);
        let supervisor = Supervisor::new(config.clone(), factory);
        Self {
            config,
            registry: Arc::new(registry),
            supervisor,
        }
    }

    /// Install the action taken when a process-fatal error surfaces
    /// (exit code 2 or 3). Binaries typically install `std::process::exit`.
    pub fn set_fatal_hook(&self, hook: FatalHook) {
        self.supervisor.set_fatal_hook(hook);
    }

    /// Validate configuration and environment, then start supervision.
    pub async fn start(&self) -> Result<()> {
        info!("Starting broker relay");

        self.config.validate()?;

        if self.registry.is_empty() {
            warn!("No table handlers registered - not starting message processing");
            return Err(BrokerError::InvalidState(
                "No table handlers registered".to_string(),
            ));
        }

        let validator =
            EnvironmentValidator::new(&self.config, self.supervisor_connection_manager());
        validator.validate().await?;

        self.registry.log_configuration();

        self.supervisor
            .start(&self.config.queue_name, self.registry.clone())
            .await?;

        info!(
            queue = %self.config.queue_name,
            workers = self.config.listener_count,
            "Broker relay started"
        );
        Ok(())
    }

    /// Stop message processing and clear supervision state.
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping broker relay");
        self.supervisor.stop(true).await?;
        info!("Broker relay stopped");
        Ok(())
    }

    /// Stop keeping state, settle, start again.
    pub async fn restart(&self) -> Result<()> {
        self.supervisor.restart().await
    }

    /// Replace workers whose tasks finished; operator safety hatch.
    pub async fn restart_failed_workers(&self) -> Result<usize> {
        self.supervisor.restart_failed().await
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_supervising()
    }

    pub fn is_healthy(&self) -> bool {
        self.supervisor.is_healthy()
    }

    /// Aggregate telemetry over the worker set.
    pub fn telemetry(&self) -> AggregateTelemetry {
        self.supervisor.telemetry()
    }

    /// Per-worker telemetry snapshots.
    pub fn worker_snapshots(&self) -> Vec<TelemetrySnapshot> {
        self.supervisor.worker_snapshots()
    }

    /// Most recent classified failures, oldest first.
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        self.supervisor.error_log().recent(limit)
    }

    /// Conversations currently tracked by the retry ledger.
    pub fn retry_ledger_size(&self) -> usize {
        self.supervisor.retry_ledger().len()
    }

    /// Access the supervisor for advanced orchestration.
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    fn supervisor_connection_manager(&self) -> &crate::database::ConnectionManager {
        self.supervisor.connection_manager()
    }
}

impl std::fmt::Debug for BrokerRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerRelay")
            .field("queue_name", &self.config.queue_name)
            .field("running", &self.is_running())
            .field("registered_tables", &self.registry.len())
            .finish_non_exhaustive()
    }
}
