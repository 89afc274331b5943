//! # Message Dispatcher
//!
//! Routes one dequeued message to its destination: system messages are
//! consumed with a cleanup reason, data messages are parsed, matched against
//! the handler registry, and delivered to the registered handler's
//! INSERT/UPDATE/DELETE method.
//!
//! A well-formed message for an unsubscribed, disabled, or unsupported table
//! is acknowledged, not poisoned: there is nothing wrong with the message,
//! the consumer just has no work for it.

use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::{BrokerError, Result};
use crate::messaging::envelope::{ChangeEvent, ChangeType, EnvelopeParser};
use crate::messaging::message::{RawMessage, SystemMessageType};
use crate::registry::handler_registry::{HandlerRegistration, HandlerRegistry};

/// What the worker should do with the message after dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler processed the event.
    Handled,
    /// No handler ran; acknowledge with the given reason.
    Acknowledge(String),
}

impl DispatchOutcome {
    /// Reason recorded on the acknowledge statement.
    pub fn ack_reason(&self) -> &str {
        match self {
            DispatchOutcome::Handled => "Successfully processed",
            DispatchOutcome::Acknowledge(reason) => reason,
        }
    }
}

/// Parses, validates against the registry, and invokes handlers.
#[derive(Clone)]
pub struct Dispatcher {
    parser: EnvelopeParser,
    registry: Arc<HandlerRegistry>,
}

impl Dispatcher {
    pub fn new(parser: EnvelopeParser, registry: Arc<HandlerRegistry>) -> Self {
        Self { parser, registry }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Process one message. Errors out of this method carry enough context
    /// for the classifier; the worker decides commit versus rollback.
    pub async fn dispatch(&self, message: &RawMessage) -> Result<DispatchOutcome> {
        if let Some(system_type) = SystemMessageType::from_type_name(&message.message_type_name) {
            return Ok(self.handle_system_message(message, system_type));
        }

        if !message.has_data_content() {
            warn!(
                worker_id = message.worker_id,
                message_type = %message.message_type_name,
                "Received message with no data content"
            );
            return Ok(DispatchOutcome::Acknowledge("No data content".to_string()));
        }

        self.handle_data_message(message).await
    }

    /// System messages are consumed without invoking any handler.
    fn handle_system_message(
        &self,
        message: &RawMessage,
        system_type: SystemMessageType,
    ) -> DispatchOutcome {
        let reason = system_type.cleanup_reason(&message.message_type_name);
        info!(
            worker_id = message.worker_id,
            message_type = %message.message_type_name,
            conversation_handle = %message.conversation_handle,
            reason = %reason,
            "Consumed system message"
        );
        DispatchOutcome::Acknowledge(reason)
    }

    /// Data message processing:
    /// 1. parse generically to extract the table name;
    /// 2. find the registration and check it is willing to take the event;
    /// 3. re-parse with the registration's record converter;
    /// 4. route to the handler method for the change type.
    async fn handle_data_message(&self, message: &RawMessage) -> Result<DispatchOutcome> {
        let started = Instant::now();

        let generic = self.parser.parse(message)?;

        let Some(registration) = self.registry.get(&generic.table_name) else {
            warn!(table = %generic.table_name, "No handler registered for table");
            return Ok(DispatchOutcome::Acknowledge(format!(
                "No handler registered for table {}",
                generic.table_name
            )));
        };

        if !registration.enabled {
            warn!(table = %generic.table_name, "Handler for table is disabled");
            return Ok(DispatchOutcome::Acknowledge(format!(
                "Handler for table {} is disabled",
                generic.table_name
            )));
        }

        if !registration.supports(generic.change_type) {
            warn!(
                table = %generic.table_name,
                change_type = %generic.change_type,
                "Handler does not support this change type"
            );
            return Ok(DispatchOutcome::Acknowledge(format!(
                "Handler for table {} does not support {} events",
                generic.table_name, generic.change_type
            )));
        }

        let typed = self
            .parser
            .parse_with_converter(message, registration.record_converter())?;
        let event_id = typed.event_id.clone();
        let table_name = typed.table_name.clone();

        self.route_to_handler(typed, &registration).await?;

        info!(
            event_id = %event_id,
            table = %table_name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Processed change event"
        );
        Ok(DispatchOutcome::Handled)
    }

    /// Invoke the handler inside its own task so a panic surfaces as a
    /// classifiable error instead of unwinding through the worker loop.
    async fn route_to_handler(
        &self,
        event: ChangeEvent,
        registration: &HandlerRegistration,
    ) -> Result<()> {
        let handler = registration.handler.clone();
        let change_type = event.change_type;
        let registration_name = registration.registration_name.clone();

        let join = tokio::spawn(async move {
            match change_type {
                ChangeType::Insert => handler.on_insert(event).await,
                ChangeType::Update => handler.on_update(event).await,
                ChangeType::Delete => handler.on_delete(event).await,
            }
        });

        match join.await {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => {
                let panic_message = panic_detail(join_error.into_panic());
                Err(BrokerError::HandlerPanic(format!(
                    "Handler '{registration_name}' panicked: {panic_message}"
                )))
            }
            Err(join_error) => Err(BrokerError::Handler(format!(
                "Handler '{registration_name}' task failed: {join_error}"
            ))),
        }
    }
}

fn panic_detail(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
