//! # System Constants
//!
//! Wire-level constants and operational boundaries of the relay: the Service
//! Broker system message type URIs, the seeded fatal database error codes,
//! and the tuning constants shared across the supervision tree.

/// Service Broker system message type URIs (exact strings from the wire).
pub mod system_messages {
    /// Normal conversation termination.
    pub const END_DIALOG: &str = "http://schemas.microsoft.com/SQL/ServiceBroker/EndDialog";
    /// Error condition raised inside the broker.
    pub const ERROR: &str = "http://schemas.microsoft.com/SQL/ServiceBroker/Error";
    /// Conversation timer expiry.
    pub const DIALOG_TIMER: &str = "http://schemas.microsoft.com/SQL/ServiceBroker/DialogTimer";
}

/// Seed values for the classifier's fatal database error detection.
///
/// These cover conditions that cannot be recovered without operator
/// intervention: broker configuration, missing queue objects, authentication,
/// permissions, database availability, and connection failures. Deployments
/// can extend the sets through [`crate::resilience::ClassifierConfig`].
pub mod fatal_db {
    /// Broker configuration errors (broker disabled, routing disabled,
    /// delivery disabled, dialog security unavailable or invalid).
    pub const BROKER_CONFIGURATION_CODES: &[i32] = &[9617, 9618, 9619, 9621, 9632, 9633];

    /// Queue/service object errors (invalid object, missing master key,
    /// missing service, missing queue, missing message type).
    pub const QUEUE_OBJECT_CODES: &[i32] = &[208, 15581, 15597, 15598, 15599];

    /// Authentication failures (login failed, password expired, account locked).
    pub const AUTHENTICATION_CODES: &[i32] = &[18456, 18470, 18487];

    /// Permission denials.
    pub const PERMISSION_CODES: &[i32] = &[229, 15404, 15247];

    /// Database availability (missing, locked, restricted, recovering).
    pub const DATABASE_STATE_CODES: &[i32] = &[911, 924, 927, 942];

    /// Connection-level failures (cannot open, pipe errors, reset, timeouts,
    /// connection refused).
    pub const CONNECTION_CODES: &[i32] = &[2, 53, 233, 10060, 10061];

    /// SQLSTATE class prefixes treated as fatal: connection exceptions and
    /// invalid authorization.
    pub const SQL_STATE_PREFIXES: &[&str] = &["08", "28"];
}

/// Bounded size of the in-memory error ring exposed to telemetry.
pub const ERROR_LOG_CAPACITY: usize = 100;

/// Window within which a worker's last message counts as recent activity.
pub const RECENT_ACTIVITY_WINDOW_SECS: u64 = 300;

/// Aggregate error-rate ceiling for the fully-operational flag.
pub const OPERATIONAL_ERROR_RATE_THRESHOLD: f64 = 0.10;

/// Pause between stop and start during a supervisor restart, giving worker
/// connections time to release.
pub const RESTART_SETTLE_DELAY_MS: u64 = 2_000;

/// Secondary wait after forced interruption before giving up on a worker.
pub const FORCED_SHUTDOWN_WAIT_SECS: u64 = 10;

/// Backoff exponent cap; keeps the shifted delay from overflowing.
pub const BACKOFF_EXPONENT_CAP: u32 = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_message_uris_are_exact() {
        assert_eq!(
            system_messages::END_DIALOG,
            "http://schemas.microsoft.com/SQL/ServiceBroker/EndDialog"
        );
        assert_eq!(
            system_messages::ERROR,
            "http://schemas.microsoft.com/SQL/ServiceBroker/Error"
        );
        assert_eq!(
            system_messages::DIALOG_TIMER,
            "http://schemas.microsoft.com/SQL/ServiceBroker/DialogTimer"
        );
    }

    #[test]
    fn fatal_code_sets_are_disjoint() {
        let mut all: Vec<i32> = Vec::new();
        all.extend_from_slice(fatal_db::BROKER_CONFIGURATION_CODES);
        all.extend_from_slice(fatal_db::QUEUE_OBJECT_CODES);
        all.extend_from_slice(fatal_db::AUTHENTICATION_CODES);
        all.extend_from_slice(fatal_db::PERMISSION_CODES);
        all.extend_from_slice(fatal_db::DATABASE_STATE_CODES);
        all.extend_from_slice(fatal_db::CONNECTION_CODES);
        let count = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(count, all.len());
    }
}
