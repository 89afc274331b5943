//! # Resilience Module
//!
//! Fault handling for the message-processing runtime: the error classifier
//! that maps failures to response strategies, the per-conversation retry
//! ledger, and the bounded error history exposed to telemetry.

pub mod classifier;
pub mod error_log;
pub mod retry;

pub use classifier::{ClassifierConfig, ErrorClassifier, ErrorKind};
pub use error_log::{ErrorLog, ErrorRecord};
pub use retry::{RetryLedger, RetryState};
