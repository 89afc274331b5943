use crate::error::{BrokerError, Result};
use std::time::Duration;

/// Runtime configuration for the relay.
///
/// Defaults are conservative: four listeners, three retries with exponential
/// backoff between one and thirty seconds, and a thirty-second graceful
/// shutdown window.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Queue to receive from. Required; there is no usable default.
    pub queue_name: String,
    /// Number of listener workers, each with a dedicated connection.
    pub listener_count: usize,
    /// Failures allowed per conversation before it is poisoned.
    pub max_retries: u32,
    /// Base retry delay in milliseconds.
    pub base_retry_delay_ms: u64,
    /// Ceiling for the backoff delay in milliseconds.
    pub max_retry_delay_ms: u64,
    /// Double the delay per attempt when set; otherwise every delay is the base.
    pub use_exponential_backoff: bool,
    /// How long `stop` waits for workers to drain before interrupting them.
    pub graceful_timeout_seconds: u64,
    /// Upper bound on accepted queue-name length.
    pub max_queue_name_length: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_name: String::new(),
            listener_count: 4,
            max_retries: 3,
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
            use_exponential_backoff: true,
            graceful_timeout_seconds: 30,
            max_queue_name_length: 128,
        }
    }
}

impl BrokerConfig {
    /// Create a configuration for the given queue with default tuning.
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Self::default()
        }
    }

    /// Load configuration from `BROKER_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(queue_name) = std::env::var("BROKER_QUEUE_NAME") {
            config.queue_name = queue_name;
        }

        if let Ok(value) = std::env::var("BROKER_LISTENER_COUNT") {
            config.listener_count = value.parse().map_err(|e| {
                BrokerError::Configuration(format!("Invalid listener_count: {e}"))
            })?;
        }

        if let Ok(value) = std::env::var("BROKER_MAX_RETRIES") {
            config.max_retries = value
                .parse()
                .map_err(|e| BrokerError::Configuration(format!("Invalid max_retries: {e}")))?;
        }

        if let Ok(value) = std::env::var("BROKER_BASE_RETRY_DELAY_MS") {
            config.base_retry_delay_ms = value.parse().map_err(|e| {
                BrokerError::Configuration(format!("Invalid base_retry_delay_ms: {e}"))
            })?;
        }

        if let Ok(value) = std::env::var("BROKER_MAX_RETRY_DELAY_MS") {
            config.max_retry_delay_ms = value.parse().map_err(|e| {
                BrokerError::Configuration(format!("Invalid max_retry_delay_ms: {e}"))
            })?;
        }

        if let Ok(value) = std::env::var("BROKER_USE_EXPONENTIAL_BACKOFF") {
            config.use_exponential_backoff = value.parse().map_err(|e| {
                BrokerError::Configuration(format!("Invalid use_exponential_backoff: {e}"))
            })?;
        }

        if let Ok(value) = std::env::var("BROKER_GRACEFUL_TIMEOUT_SECONDS") {
            config.graceful_timeout_seconds = value.parse().map_err(|e| {
                BrokerError::Configuration(format!("Invalid graceful_timeout_seconds: {e}"))
            })?;
        }

        Ok(config)
    }

    /// Validate the configuration before supervision starts.
    pub fn validate(&self) -> Result<()> {
        if !self.is_valid_queue(&self.queue_name) {
            return Err(BrokerError::Configuration(format!(
                "Invalid queue name '{}' (must be non-empty, at most {} characters)",
                self.queue_name, self.max_queue_name_length
            )));
        }

        if self.listener_count == 0 {
            return Err(BrokerError::Configuration(
                "listener_count must be at least 1".to_string(),
            ));
        }

        if self.base_retry_delay_ms > self.max_retry_delay_ms {
            return Err(BrokerError::Configuration(format!(
                "base_retry_delay_ms ({}) exceeds max_retry_delay_ms ({})",
                self.base_retry_delay_ms, self.max_retry_delay_ms
            )));
        }

        Ok(())
    }

    /// Queue-name validity check used both for our own queue and for
    /// operator-supplied names.
    pub fn is_valid_queue(&self, queue_name: &str) -> bool {
        !queue_name.trim().is_empty() && queue_name.len() <= self.max_queue_name_length
    }

    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_seconds)
    }
}
