//! Blocking-receive primitive.
//!
//! One operation: take the next message off the queue, or nothing. The
//! statement blocks inside the database until a message arrives or the
//! receive is cancelled; an empty result is a normal outcome and the caller
//! simply loops.

use chrono::Utc;
use tracing::{debug, trace};

use crate::database::connection::QueueConnection;
use crate::error::Result;
use crate::messaging::RawMessage;

const RECEIVE_STATEMENT_TEMPLATE: &str = "WAITFOR (RECEIVE TOP(1) \
     conversation_handle, \
     message_type_name, \
     CAST(message_body AS NVARCHAR(MAX)) as message_body, \
     message_enqueue_time, \
     message_sequence_number, \
     priority, \
     conversation_group_id, \
     service_name, \
     service_contract_name \
     FROM [{queue}])";

/// Executes the blocking receive and materializes [`RawMessage`] values.
#[derive(Debug, Clone, Default)]
pub struct QueueDequeuer;

impl QueueDequeuer {
    pub fn new() -> Self {
        Self
    }

    /// Render the blocking-receive statement for a queue.
    pub fn receive_statement(&self, queue_name: &str) -> String {
        RECEIVE_STATEMENT_TEMPLATE.replace("{queue}", queue_name)
    }

    /// Receive at most one message. `Ok(None)` means the receive completed
    /// without a row; the worker loops and receives again.
    pub async fn receive(
        &self,
        conn: &mut dyn QueueConnection,
        queue_name: &str,
        worker_id: u64,
    ) -> Result<Option<RawMessage>> {
        let statement = self.receive_statement(queue_name);

        match conn.receive(&statement).await? {
            Some(row) => {
                debug!(
                    worker_id,
                    conversation_handle = %row.conversation_handle,
                    message_type = %row.message_type_name,
                    "Received message from queue"
                );
                Ok(Some(RawMessage::from_row(row, Utc::now(), worker_id)))
            }
            None => {
                trace!(worker_id, queue = queue_name, "No messages available (timeout)");
                Ok(None)
            }
        }
    }
}
