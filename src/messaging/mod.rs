//! # Messaging Module
//!
//! Message model and processing pipeline: the raw dequeued message, the JSON
//! envelope parser that turns a data message into a typed [`ChangeEvent`],
//! and the dispatcher that routes events to registered table handlers.

pub mod dispatcher;
pub mod envelope;
pub mod message;

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use envelope::{ChangeEvent, ChangeType, EnvelopeParser};
pub use message::{RawMessage, SystemMessageType};
