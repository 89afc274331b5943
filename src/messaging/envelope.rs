//! # Envelope Parsing
//!
//! Turns a data message body into a typed [`ChangeEvent`].
//!
//! The body is a JSON envelope:
//!
//! ```text
//! { "eventId":   "OSYNDEXP_9_B5719C8C-7B2A-4700-8109-98711215CC5C",
//!   "tableName": "OSYNDEXP",
//!   "operation": "INSERT",
//!   "timestamp": "2025-12-01T15:47:03.280",
//!   "record":    { "Jrknr": 9, "Id": 92749 } }
//! ```
//!
//! `eventId`, `tableName` and `operation` are required; a missing or empty
//! required field, malformed JSON, or an unknown operation poisons the
//! message. `timestamp` and `record` are tolerated in any broken form:
//! an unparseable timestamp falls back to the current time with a warning and
//! a missing, null, or non-object record becomes an empty mapping. Unknown
//! top-level fields are ignored. Field-level schema drift in `record` never
//! poisons a message: a failed typed conversion leaves `typed_record` unset
//! and the raw mapping remains the source of truth.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use std::any::Any;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

use crate::error::{BrokerError, Result};
use crate::messaging::message::RawMessage;
use crate::resilience::ErrorLog;

/// The row mutation kind carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    pub const ALL: [ChangeType; 3] = [ChangeType::Insert, ChangeType::Update, ChangeType::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Insert => "INSERT",
            ChangeType::Update => "UPDATE",
            ChangeType::Delete => "DELETE",
        }
    }
}

impl FromStr for ChangeType {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(ChangeType::Insert),
            "UPDATE" => Ok(ChangeType::Update),
            "DELETE" => Ok(ChangeType::Delete),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Converts a raw record mapping into a handler-declared record type.
///
/// Installed by typed registrations; returns `None` when the mapping does not
/// fit the declared type.
pub type RecordConverter =
    Arc<dyn Fn(&Map<String, Value>) -> Option<Box<dyn Any + Send + Sync>> + Send + Sync>;

/// Parsed, typed representation of one table mutation. Lives for a single
/// dispatcher call.
#[derive(Debug)]
pub struct ChangeEvent {
    pub event_id: String,
    /// Canonical upper-case table name.
    pub table_name: String,
    pub change_type: ChangeType,
    /// Event time from the payload, falling back to the receive wall clock.
    pub event_time: NaiveDateTime,
    pub received_time: DateTime<Utc>,
    /// Record fields as sent on the wire; possibly empty.
    pub raw_record: Map<String, Value>,
    typed_record: Option<Box<dyn Any + Send + Sync>>,
    pub conversation_handle: String,
    pub message_type_name: String,
}

impl ChangeEvent {
    /// Downcast the typed record, when conversion succeeded.
    pub fn typed_record<T: 'static>(&self) -> Option<&T> {
        self.typed_record.as_ref().and_then(|r| r.downcast_ref())
    }

    pub fn has_typed_record(&self) -> bool {
        self.typed_record.is_some()
    }
}

/// Validates and parses data message envelopes.
#[derive(Clone)]
pub struct EnvelopeParser {
    error_log: Arc<ErrorLog>,
}

impl EnvelopeParser {
    pub fn new(error_log: Arc<ErrorLog>) -> Self {
        Self { error_log }
    }

    /// Parse with the raw mapping only.
    pub fn parse(&self, message: &RawMessage) -> Result<ChangeEvent> {
        self.parse_with_converter(message, None)
    }

    /// Parse and additionally run the registration's record converter.
    pub fn parse_with_converter(
        &self,
        message: &RawMessage,
        converter: Option<&RecordConverter>,
    ) -> Result<ChangeEvent> {
        let body = message.message_body.trim();
        if body.is_empty() {
            return Err(self.poison(message, "Message body is empty".to_string()));
        }

        let envelope: Value = match serde_json::from_str(body) {
            Ok(value) => value,
            Err(e) => {
                let reason = format!(
                    "Malformed JSON in message {}: {e}",
                    message.message_type_name
                );
                return Err(self.poison(message, reason));
            }
        };

        let event_id = self.required_string(message, &envelope, "eventId")?;
        let table_name = self.required_string(message, &envelope, "tableName")?;
        let operation = self.required_string(message, &envelope, "operation")?;

        let change_type = ChangeType::from_str(&operation).map_err(|_| {
            self.poison(
                message,
                format!(
                    "Invalid message data in {}: unsupported operation '{operation}'",
                    message.message_type_name
                ),
            )
        })?;

        let event_time = parse_timestamp(envelope.get("timestamp"));
        let raw_record = extract_raw_record(&envelope);

        let typed_record = converter.and_then(|convert| {
            let converted = convert(&raw_record);
            if converted.is_none() {
                warn!(
                    event_id = %event_id,
                    table = %table_name,
                    "Failed to parse record to declared type, raw record remains authoritative"
                );
            }
            converted
        });

        Ok(ChangeEvent {
            event_id,
            table_name: table_name.to_uppercase(),
            change_type,
            event_time,
            received_time: Utc::now(),
            raw_record,
            typed_record,
            conversation_handle: message.conversation_handle.clone(),
            message_type_name: message.message_type_name.clone(),
        })
    }

    fn required_string(
        &self,
        message: &RawMessage,
        envelope: &Value,
        field: &str,
    ) -> Result<String> {
        match envelope.get(field).and_then(Value::as_str) {
            Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
            _ => Err(self.poison(
                message,
                format!("{field} is required but missing or empty"),
            )),
        }
    }

    fn poison(&self, message: &RawMessage, reason: String) -> BrokerError {
        self.error_log.record("envelope parsing", reason.clone());
        warn!(
            conversation_handle = %message.conversation_handle,
            reason = %reason,
            "Validation failed - treating as poison"
        );
        BrokerError::poison(message.conversation_handle.clone(), reason)
    }
}

/// Parse the optional local-date-time timestamp, falling back to now.
fn parse_timestamp(value: Option<&Value>) -> NaiveDateTime {
    let Some(raw) = value.and_then(Value::as_str).filter(|s| !s.trim().is_empty()) else {
        return Utc::now().naive_utc();
    };

    match NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%dT%H:%M:%S%.f") {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(timestamp = raw, error = %e, "Failed to parse timestamp, using current time");
            Utc::now().naive_utc()
        }
    }
}

/// Record data as a field mapping; anything that is not an object yields an
/// empty map.
fn extract_raw_record(envelope: &Value) -> Map<String, Value> {
    match envelope.get("record") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            warn!(
                record_kind = %json_kind(other),
                "Record field is not an object, using empty mapping"
            );
            Map::new()
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
