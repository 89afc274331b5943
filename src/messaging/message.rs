//! # Raw Queue Messages
//!
//! The immutable representation of one dequeued row, plus recognition of the
//! broker's system message types.

use chrono::{DateTime, Utc};

use crate::constants::system_messages;
use crate::database::connection::ReceivedRow;

/// Known system message types emitted by the broker itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemMessageType {
    /// Normal conversation termination.
    EndDialog,
    /// Error condition raised inside the broker.
    Error,
    /// Conversation timer expiry.
    DialogTimer,
    /// Any other message type URI outside the data contract.
    Other,
}

impl SystemMessageType {
    /// Match a message type name against the known system URIs. Returns
    /// `None` for data messages.
    pub fn from_type_name(message_type_name: &str) -> Option<SystemMessageType> {
        match message_type_name {
            system_messages::END_DIALOG => Some(SystemMessageType::EndDialog),
            system_messages::ERROR => Some(SystemMessageType::Error),
            system_messages::DIALOG_TIMER => Some(SystemMessageType::DialogTimer),
            _ => None,
        }
    }

    /// The acknowledgment reason recorded when this system message is consumed.
    pub fn cleanup_reason(&self, message_type_name: &str) -> String {
        match self {
            SystemMessageType::EndDialog => "EndDialog cleanup".to_string(),
            SystemMessageType::Error => "Error message cleanup".to_string(),
            SystemMessageType::DialogTimer => "Timer expiry cleanup".to_string(),
            SystemMessageType::Other => {
                format!("Unknown system message cleanup: {message_type_name}")
            }
        }
    }
}

/// One message taken off the queue. Immutable after creation; discarded after
/// the owning worker's next commit or rollback.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Opaque conversation identity; the natural message key.
    pub conversation_handle: String,
    pub message_type_name: String,
    /// UTF-8 body; may be empty for system messages.
    pub message_body: String,
    pub enqueued_at: DateTime<Utc>,
    pub sequence_number: Option<i64>,
    pub priority: Option<i32>,
    pub conversation_group_id: String,
    pub service_name: String,
    pub contract_name: String,
    /// Wall clock at the moment the consumer received the row.
    pub received_at: DateTime<Utc>,
    /// Worker that dequeued the message.
    pub worker_id: u64,
}

impl RawMessage {
    /// Build a message from a receive-binding row.
    pub fn from_row(row: ReceivedRow, received_at: DateTime<Utc>, worker_id: u64) -> Self {
        Self {
            conversation_handle: row.conversation_handle,
            message_type_name: row.message_type_name,
            message_body: row.message_body,
            enqueued_at: row.message_enqueue_time,
            sequence_number: row.message_sequence_number,
            priority: row.priority,
            conversation_group_id: row.conversation_group_id,
            service_name: row.service_name,
            contract_name: row.contract_name,
            received_at,
            worker_id,
        }
    }

    /// A message is a system message iff its type name is one of the known
    /// broker URIs; everything else is a data message.
    pub fn is_system_message(&self) -> bool {
        SystemMessageType::from_type_name(&self.message_type_name).is_some()
    }

    /// Whether the body carries anything worth parsing.
    pub fn has_data_content(&self) -> bool {
        !self.message_body.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(message_type_name: &str, body: &str) -> ReceivedRow {
        ReceivedRow {
            conversation_handle: "C0FFEE".to_string(),
            message_type_name: message_type_name.to_string(),
            message_body: body.to_string(),
            message_enqueue_time: Utc::now(),
            message_sequence_number: Some(1),
            priority: Some(5),
            conversation_group_id: "group-1".to_string(),
            service_name: "ChangeCaptureService".to_string(),
            contract_name: "ChangeCaptureContract".to_string(),
        }
    }

    #[test]
    fn recognizes_all_system_message_uris() {
        assert_eq!(
            SystemMessageType::from_type_name(
                "http://schemas.microsoft.com/SQL/ServiceBroker/EndDialog"
            ),
            Some(SystemMessageType::EndDialog)
        );
        assert_eq!(
            SystemMessageType::from_type_name(
                "http://schemas.microsoft.com/SQL/ServiceBroker/Error"
            ),
            Some(SystemMessageType::Error)
        );
        assert_eq!(
            SystemMessageType::from_type_name(
                "http://schemas.microsoft.com/SQL/ServiceBroker/DialogTimer"
            ),
            Some(SystemMessageType::DialogTimer)
        );
        assert_eq!(SystemMessageType::from_type_name("ChangeCaptureMessage"), None);
    }

    #[test]
    fn cleanup_reasons_match_contract() {
        assert_eq!(
            SystemMessageType::EndDialog.cleanup_reason("ignored"),
            "EndDialog cleanup"
        );
        assert_eq!(
            SystemMessageType::Error.cleanup_reason("ignored"),
            "Error message cleanup"
        );
        assert_eq!(
            SystemMessageType::DialogTimer.cleanup_reason("ignored"),
            "Timer expiry cleanup"
        );
        assert_eq!(
            SystemMessageType::Other.cleanup_reason("urn:custom"),
            "Unknown system message cleanup: urn:custom"
        );
    }

    #[test]
    fn data_message_detection() {
        let msg = RawMessage::from_row(row("ChangeCaptureMessage", "{}"), Utc::now(), 1);
        assert!(!msg.is_system_message());
        assert!(msg.has_data_content());

        let system = RawMessage::from_row(
            row(
                "http://schemas.microsoft.com/SQL/ServiceBroker/EndDialog",
                "",
            ),
            Utc::now(),
            1,
        );
        assert!(system.is_system_message());
        assert!(!system.has_data_content());

        let blank = RawMessage::from_row(row("ChangeCaptureMessage", "   "), Utc::now(), 1);
        assert!(!blank.has_data_content());
    }
}
