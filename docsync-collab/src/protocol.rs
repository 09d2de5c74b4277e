//! Realtime wire protocol.
//!
//! Every WebSocket text frame is one JSON event:
//! ```text
//! { "event": "document:op", "data": { "docId": "...", "position": 0, ... } }
//! ```
//!
//! | Direction        | Event               | Data                      |
//! |------------------|---------------------|---------------------------|
//! | client → server  | `document:join`     | doc id string             |
//! | client → server  | `document:leave`    | doc id string             |
//! | client → server  | `document:op`       | TextOperation (unchecked) |
//! | server → client  | `document:updated`  | DocumentSnapshot          |
//! | server → client  | `document:conflict` | `{message, snapshot}`     |
//! | server → client  | `document:error`    | `{message, details}`      |
//!
//! Operation payloads arrive as raw JSON and go through [`validate_operation`]
//! before anything touches the store.

use std::collections::BTreeMap;

use docsync_core::{DocumentSnapshot, TextOperation};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const CONFLICT_MESSAGE: &str = "Version mismatch detected. Snapshot resynced.";
pub const INVALID_OPERATION_MESSAGE: &str = "Invalid operation payload";
pub const MALFORMED_MESSAGE: &str = "Malformed message";
pub const STORE_UNAVAILABLE_MESSAGE: &str = "Document store unavailable";
pub const CHANNEL_UNAVAILABLE_MESSAGE: &str = "Sequencing channel unavailable";

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "document:join")]
    Join(String),
    #[serde(rename = "document:leave")]
    Leave(String),
    /// Raw payload, validated separately
    #[serde(rename = "document:op")]
    Op(Value),
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "document:updated")]
    Updated(DocumentSnapshot),
    #[serde(rename = "document:conflict")]
    Conflict(ConflictNotice),
    #[serde(rename = "document:error")]
    Error(ErrorNotice),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictNotice {
    pub message: String,
    pub snapshot: DocumentSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

/// Field-level validation failures, shaped like a flattened schema error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationDetails {
    pub form_errors: Vec<String>,
    pub field_errors: BTreeMap<String, Vec<String>>,
}

impl ValidationDetails {
    fn form(&mut self, message: impl Into<String>) {
        self.form_errors.push(message.into());
    }

    fn field(&mut self, name: &str, message: impl Into<String>) {
        self.field_errors
            .entry(name.to_string())
            .or_default()
            .push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.form_errors.is_empty() && self.field_errors.is_empty()
    }
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid operation payload")]
    InvalidOperation(ValidationDetails),
    #[error("Connection closed")]
    ConnectionClosed,
}

impl ClientEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

impl ServerEvent {
    pub fn conflict(snapshot: DocumentSnapshot) -> Self {
        ServerEvent::Conflict(ConflictNotice {
            message: CONFLICT_MESSAGE.to_string(),
            snapshot,
        })
    }

    pub fn error(message: impl Into<String>, details: Value) -> Self {
        ServerEvent::Error(ErrorNotice {
            message: message.into(),
            details,
        })
    }

    pub fn invalid_operation(details: &ValidationDetails) -> Self {
        Self::error(
            INVALID_OPERATION_MESSAGE,
            serde_json::to_value(details).unwrap_or(Value::Null),
        )
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Check a raw `document:op` payload and build the operation.
///
/// Rules: `docId` and `clientId` are non-empty strings; `position`,
/// `deleteCount` and `baseVersion` are non-negative integers;
/// `insertText` is a string. Every failing field is reported.
pub fn validate_operation(raw: &Value) -> Result<TextOperation, ProtocolError> {
    let mut details = ValidationDetails::default();

    let Some(obj) = raw.as_object() else {
        details.form("Expected object");
        return Err(ProtocolError::InvalidOperation(details));
    };

    let doc_id = non_empty_string(obj, "docId", &mut details);
    let position = non_negative_int(obj, "position", &mut details);
    let delete_count = non_negative_int(obj, "deleteCount", &mut details);
    let insert_text = string(obj, "insertText", &mut details);
    let client_id = non_empty_string(obj, "clientId", &mut details);
    let base_version = non_negative_int(obj, "baseVersion", &mut details);

    match (doc_id, position, delete_count, insert_text, client_id, base_version) {
        (
            Some(doc_id),
            Some(position),
            Some(delete_count),
            Some(insert_text),
            Some(client_id),
            Some(base_version),
        ) if details.is_empty() => Ok(TextOperation {
            doc_id,
            position,
            delete_count,
            insert_text,
            client_id,
            base_version,
        }),
        _ => Err(ProtocolError::InvalidOperation(details)),
    }
}

fn string(obj: &Map<String, Value>, name: &str, details: &mut ValidationDetails) -> Option<String> {
    match obj.get(name) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            details.field(name, format!("Expected string, received {}", kind(other)));
            None
        }
        None => {
            details.field(name, "Required");
            None
        }
    }
}

fn non_empty_string(
    obj: &Map<String, Value>,
    name: &str,
    details: &mut ValidationDetails,
) -> Option<String> {
    let s = string(obj, name, details)?;
    if s.is_empty() {
        details.field(name, "String must contain at least 1 character(s)");
        return None;
    }
    Some(s)
}

fn non_negative_int(
    obj: &Map<String, Value>,
    name: &str,
    details: &mut ValidationDetails,
) -> Option<u64> {
    let value = match obj.get(name) {
        Some(value) => value,
        None => {
            details.field(name, "Required");
            return None;
        }
    };
    let Value::Number(number) = value else {
        details.field(name, format!("Expected number, received {}", kind(value)));
        return None;
    };

    if let Some(n) = number.as_u64() {
        return Some(n);
    }
    if number.as_i64().is_some() {
        details.field(name, "Number must be greater than or equal to 0");
        return None;
    }
    // Floats: whole non-negative values are accepted
    match number.as_f64() {
        Some(f) if f.fract() == 0.0 && f >= 0.0 && f <= u64::MAX as f64 => Some(f as u64),
        Some(f) if f < 0.0 => {
            details.field(name, "Number must be greater than or equal to 0");
            None
        }
        _ => {
            details.field(name, "Expected integer, received float");
            None
        }
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Details payload for errors that are not validation failures.
pub fn reason(detail: impl std::fmt::Display) -> Value {
    json!({ "reason": detail.to_string() })
}
