//! # broker-relay
//!
//! Change-data-capture relay: a long-running supervised worker pool that
//! dequeues row-change messages from a database message queue, parses the
//! JSON envelope into typed change events, routes them to registered
//! per-table handlers, and acknowledges or retries with poison quarantine.
//!
//! Delivery semantics are at-least-once: a message leaves the queue only
//! through an acknowledged commit, and deterministic failures are quarantined
//! as poison with a recorded reason instead of being redelivered forever.
//!
//! The database side (trigger, queue, driver) is an external collaborator.
//! Applications implement [`database::ConnectionFactory`], register handlers
//! through [`registry::HandlerRegistry::builder`], and run the whole thing
//! through [`relay::BrokerRelay`].

pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod registry;
pub mod relay;
pub mod resilience;
pub mod supervision;

pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
pub use messaging::{ChangeEvent, ChangeType};
pub use registry::{ChangeHandler, HandlerRegistry, RegistrationOptions};
pub use relay::BrokerRelay;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = BrokerConfig::default();
        assert_eq!(config.listener_count, 4);
        assert_eq!(config.max_retries, 3);
    }
}
