//! # Database Boundary
//!
//! Everything the relay needs from the database side, expressed as traits the
//! external driver implements. The core never executes SQL itself: it renders
//! the blocking-receive statement, hands it to a [`QueueConnection`], and
//! interprets the returned row.

pub mod connection;
pub mod dequeuer;
pub mod validator;

pub use connection::{
    ConnectionFactory, ConnectionManager, InterruptHandle, QueueConnection, ReceivedRow,
};
pub use dequeuer::QueueDequeuer;
pub use validator::EnvironmentValidator;
