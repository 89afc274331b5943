//! Pre-flight environment validation.
//!
//! Run once before supervision starts. A disabled broker, a disabled or
//! missing queue, or an invalid queue name all point at configuration the
//! relay cannot repair, so each is surfaced as a configuration error and
//! startup is refused.

use tracing::{error, info};

use crate::config::BrokerConfig;
use crate::database::connection::ConnectionManager;
use crate::error::{BrokerError, Result};

pub struct EnvironmentValidator<'a> {
    config: &'a BrokerConfig,
    connection_manager: &'a ConnectionManager,
}

impl<'a> EnvironmentValidator<'a> {
    pub fn new(config: &'a BrokerConfig, connection_manager: &'a ConnectionManager) -> Self {
        Self {
            config,
            connection_manager,
        }
    }

    /// Validate the environment for the configured queue.
    pub async fn validate(&self) -> Result<()> {
        let queue_name = &self.config.queue_name;

        if !self.config.is_valid_queue(queue_name) {
            error!(queue = %queue_name, "Invalid queue name");
            return Err(BrokerError::Configuration(format!(
                "Invalid queue configuration: {queue_name}"
            )));
        }

        if !self.connection_manager.is_broker_enabled().await? {
            error!("Message broker is DISABLED for the database");
            return Err(BrokerError::Configuration(
                "Message broker is disabled on the database".to_string(),
            ));
        }

        if !self.connection_manager.is_queue_enabled(queue_name).await? {
            error!(queue = %queue_name, "Queue is disabled or missing");
            return Err(BrokerError::Configuration(format!(
                "Queue '{queue_name}' is disabled or does not exist"
            )));
        }

        info!(queue = %queue_name, "Environment validation passed");
        Ok(())
    }
}
