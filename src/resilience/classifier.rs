//! # Error Classification
//!
//! Maps a raised error plus its retry context into an [`ErrorKind`] and
//! derives retry delays. The classifier is pure: it takes the error and the
//! conversation's accumulated attempt count, produces a tag, and every
//! downstream decision (acknowledge-as-poison, rollback-and-retry,
//! stop-worker, stop-process) branches on that tag once.
//!
//! Classification rules:
//!
//! - resource exhaustion → [`ErrorKind::FatalProcess`] (exit code 2);
//! - subsystem/load-time faults → [`ErrorKind::FatalSystem`] (exit code 3);
//! - database errors whose vendor code or SQLSTATE family is in the seeded
//!   fatal set, plus connection and configuration failures →
//!   [`ErrorKind::FatalDb`] (worker stops, not restarted);
//! - validation poison → [`ErrorKind::Poison`];
//! - shutdown signals → [`ErrorKind::Shutdown`];
//! - everything else (transient database faults, handler errors, and handler
//!   panics; a deterministic bug must not take the process down) →
//!   [`ErrorKind::Retryable`], escalating to Poison once the conversation has
//!   exhausted `max_retries`.

use std::collections::HashSet;
use std::time::Duration;

use crate::config::BrokerConfig;
use crate::constants::{fatal_db, BACKOFF_EXPONENT_CAP};
use crate::error::BrokerError;

/// Response strategy tag produced by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Terminate the process immediately after a stop attempt (exit code 2).
    FatalProcess,
    /// Stop gracefully, then exit (exit code 3).
    FatalSystem,
    /// Stop the worker; the supervisor will not restart it.
    FatalDb,
    /// Roll back, count the attempt, back off, continue.
    Retryable,
    /// Acknowledge with a poison reason, clear retry state, continue.
    Poison,
    /// Orderly worker exit.
    Shutdown,
}

impl ErrorKind {
    /// Deterministic process exit code, for the two process-fatal kinds.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ErrorKind::FatalProcess => Some(2),
            ErrorKind::FatalSystem => Some(3),
            _ => None,
        }
    }

    /// Tag stored in the retry ledger and the error ring.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::FatalProcess => "FatalProcess",
            ErrorKind::FatalSystem => "FatalSystem",
            ErrorKind::FatalDb => "FatalDb",
            ErrorKind::Retryable => "Retryable",
            ErrorKind::Poison => "Poison",
            ErrorKind::Shutdown => "Shutdown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier tuning: retry bounds, backoff shape, and the fatal database
/// error seeds.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub use_exponential_backoff: bool,
    /// Vendor error codes treated as fatal.
    pub fatal_error_codes: HashSet<i32>,
    /// SQLSTATE class prefixes treated as fatal.
    pub fatal_sql_state_prefixes: Vec<String>,
}

impl ClassifierConfig {
    /// Build from the broker configuration with the seeded fatal sets.
    pub fn from_broker_config(config: &BrokerConfig) -> Self {
        let mut fatal_error_codes = HashSet::new();
        for codes in [
            fatal_db::BROKER_CONFIGURATION_CODES,
            fatal_db::QUEUE_OBJECT_CODES,
            fatal_db::AUTHENTICATION_CODES,
            fatal_db::PERMISSION_CODES,
            fatal_db::DATABASE_STATE_CODES,
            fatal_db::CONNECTION_CODES,
        ] {
            fatal_error_codes.extend(codes.iter().copied());
        }

        Self {
            max_retries: config.max_retries,
            base_retry_delay: config.base_retry_delay(),
            max_retry_delay: config.max_retry_delay(),
            use_exponential_backoff: config.use_exponential_backoff,
            fatal_error_codes,
            fatal_sql_state_prefixes: fatal_db::SQL_STATE_PREFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Pure error-to-strategy mapping.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    config: ClassifierConfig,
}

impl ErrorClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Base mapping from error to kind, ignoring retry history.
    pub fn kind(&self, error: &BrokerError) -> ErrorKind {
        match error {
            BrokerError::ResourceExhaustion(_) => ErrorKind::FatalProcess,
            BrokerError::Subsystem(_) => ErrorKind::FatalSystem,
            BrokerError::Shutdown(_) => ErrorKind::Shutdown,
            BrokerError::Poison { .. } => ErrorKind::Poison,
            BrokerError::Connection(_) | BrokerError::Configuration(_) => ErrorKind::FatalDb,
            BrokerError::Database {
                code, sql_state, ..
            } => {
                if self.is_fatal_db(*code, sql_state.as_deref()) {
                    ErrorKind::FatalDb
                } else {
                    ErrorKind::Retryable
                }
            }
            // Handler failures and caught panics are retryable: a bug on a
            // deterministic bad row escalates to poison through the retry
            // limit instead of stopping the worker.
            BrokerError::Handler(_) | BrokerError::HandlerPanic(_) => ErrorKind::Retryable,
            _ => ErrorKind::Retryable,
        }
    }

    /// Full classification: the base mapping plus the retry-limit transition.
    /// A retryable error on a conversation that has already used up
    /// `max_retries` attempts becomes Poison.
    pub fn classify(&self, error: &BrokerError, attempts: u32) -> ErrorKind {
        match self.kind(error) {
            ErrorKind::Retryable if attempts >= self.config.max_retries => ErrorKind::Poison,
            kind => kind,
        }
    }

    /// Whether a database error is unrecoverable without operator help.
    pub fn is_fatal_db(&self, code: i32, sql_state: Option<&str>) -> bool {
        if self.config.fatal_error_codes.contains(&code) {
            return true;
        }
        if let Some(state) = sql_state {
            return self
                .config
                .fatal_sql_state_prefixes
                .iter()
                .any(|prefix| state.starts_with(prefix.as_str()));
        }
        false
    }

    /// Delay before retry attempt `attempt` (1-based):
    /// `min(base * 2^min(attempt, 10), cap)` under exponential backoff,
    /// otherwise the base delay.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        if !self.config.use_exponential_backoff {
            return self.config.base_retry_delay;
        }

        let exponent = attempt.min(BACKOFF_EXPONENT_CAP);
        let delayed = self
            .config
            .base_retry_delay
            .saturating_mul(1u32 << exponent);
        delayed.min(self.config.max_retry_delay)
    }
}
