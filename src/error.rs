//! Crate-wide error type.
//!
//! Every fallible operation in the relay returns [`BrokerError`]. Database
//! failures keep their vendor error code and SQLSTATE so the classifier can
//! branch on them without string matching; everything downstream of the
//! classifier works with the derived [`crate::resilience::ErrorKind`] tag
//! instead of re-inspecting causes.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    /// Error raised by the database while executing a queue operation.
    #[error("Database error {code}{}: {message}", .sql_state.as_deref().map(|s| format!(" (SQLSTATE {s})")).unwrap_or_default())]
    Database {
        /// Vendor-specific error code.
        code: i32,
        /// Five-character SQLSTATE, when the driver supplies one.
        sql_state: Option<String>,
        message: String,
    },

    /// Failure acquiring or operating a connection outside a statement.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Misconfiguration that requires operator intervention.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Deterministic per-message failure; the message must be acknowledged
    /// with the given reason instead of redelivered.
    #[error("Poison message (conversation {conversation_handle}): {reason}")]
    Poison {
        conversation_handle: String,
        reason: String,
    },

    /// Error returned by a registered change handler.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Panic caught while running a registered change handler.
    #[error("Handler panicked: {0}")]
    HandlerPanic(String),

    /// Unrecoverable runtime fault; the process must terminate immediately.
    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// Load-time or subsystem fault; the process must stop after draining.
    #[error("Subsystem failure: {0}")]
    Subsystem(String),

    /// Cancellation observed while waiting or processing.
    #[error("Shutdown requested: {0}")]
    Shutdown(String),

    /// Supervisor lifecycle failure (start/stop/restart misuse).
    #[error("Supervision error: {0}")]
    Supervision(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl BrokerError {
    /// Shorthand for a database error without a SQLSTATE.
    pub fn database(code: i32, message: impl Into<String>) -> Self {
        BrokerError::Database {
            code,
            sql_state: None,
            message: message.into(),
        }
    }

    /// Shorthand for a poison error.
    pub fn poison(conversation_handle: impl Into<String>, reason: impl Into<String>) -> Self {
        BrokerError::Poison {
            conversation_handle: conversation_handle.into(),
            reason: reason.into(),
        }
    }

    /// Short variant tag, recorded in the retry ledger and telemetry.
    pub fn tag(&self) -> &'static str {
        match self {
            BrokerError::Database { .. } => "Database",
            BrokerError::Connection(_) => "Connection",
            BrokerError::Configuration(_) => "Configuration",
            BrokerError::Poison { .. } => "Poison",
            BrokerError::Handler(_) => "Handler",
            BrokerError::HandlerPanic(_) => "HandlerPanic",
            BrokerError::ResourceExhaustion(_) => "ResourceExhaustion",
            BrokerError::Subsystem(_) => "Subsystem",
            BrokerError::Shutdown(_) => "Shutdown",
            BrokerError::Supervision(_) => "Supervision",
            BrokerError::InvalidState(_) => "InvalidState",
            BrokerError::InvalidInput(_) => "InvalidInput",
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(error: serde_json::Error) -> Self {
        BrokerError::InvalidInput(format!("JSON serialization error: {error}"))
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
