//! Protocol message types for the management message system
//!
//! Individual messages stay loosely typed (`serde_json::Map`) because each
//! plugin owns its own message schema; only the envelope and the handful of
//! messages the broker itself produces are given concrete types.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

/// Version of the server API this broker speaks
pub const SERVER_API: &str = "3.2";

/// Version of the client API this broker implements
pub const CLIENT_API: &str = "3.7";

/// A single protocol message: a JSON object carrying at least a `type`
pub type Message = Map<String, Value>;

/// Read the `type` field of a message, if it is a string
pub fn message_type(message: &Message) -> Option<&str> {
    message.get("type").and_then(Value::as_str)
}

/// Build a message from a `json!` object literal
///
/// Non-object values produce an empty message, which the store rejects as
/// invalid.
pub fn message_from_value(value: Value) -> Message {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Outcome of an operation requested by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Failed,
    Succeeded,
}

impl OperationStatus {
    /// Numeric status code carried on the wire
    pub fn code(self) -> u8 {
        match self {
            OperationStatus::Failed => 5,
            OperationStatus::Succeeded => 6,
        }
    }
}

/// Result of a server-initiated operation, reported back as a message
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    pub operation_id: Value,
    pub status: OperationStatus,
    pub result_text: String,
}

impl OperationResult {
    pub fn into_message(self) -> Message {
        message_from_value(json!({
            "type": "operation-result",
            "status": self.status.code(),
            "result-text": self.result_text,
            "operation-id": self.operation_id,
        }))
    }
}

/// Digest of an accepted-types list, stable across orderings
///
/// Both sides send the digest instead of the full list so the list only
/// travels when it actually changed.
pub fn types_hash<'a, I>(types: I) -> String
where
    I: IntoIterator<Item = &'a String>,
{
    let sorted: BTreeSet<&String> = types.into_iter().collect();
    let joined = sorted
        .into_iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(";");
    blake3::hash(joined.as_bytes()).to_hex().to_string()
}

/// Request body uploaded on every exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ExchangePayload {
    pub server_api: String,
    pub client_api: String,
    /// Sequence number of the first message in `messages`
    pub sequence: u64,
    /// Next sequence expected from the server's message stream
    pub next_expected_sequence: u64,
    /// Digest of the server-accepted types this client knows about
    pub accepted_types: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_uuid: Option<String>,
    /// Present only when the server's copy of the list is out of date
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_accepted_types: Option<Vec<String>>,
    /// Number of messages pending in total, including those not in this batch
    pub total_messages: usize,
    pub messages: Vec<Message>,
}

/// Response body returned by the server
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct ExchangeResponse {
    pub messages: Vec<Message>,
    pub next_expected_sequence: Option<u64>,
    pub accepted_types: Option<Vec<String>>,
    pub server_uuid: Option<String>,
    pub client_accepted_types_hash: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type() {
        let message = message_from_value(json!({"type": "test", "data": 1}));
        assert_eq!(message_type(&message), Some("test"));

        let untyped = message_from_value(json!({"data": 1}));
        assert_eq!(message_type(&untyped), None);

        let numeric = message_from_value(json!({"type": 42}));
        assert_eq!(message_type(&numeric), None);
    }

    #[test]
    fn test_message_from_non_object() {
        assert!(message_from_value(json!([1, 2, 3])).is_empty());
        assert!(message_from_value(json!("text")).is_empty());
    }

    #[test]
    fn test_operation_result_message() {
        let message = OperationResult {
            operation_id: json!(4),
            status: OperationStatus::Failed,
            result_text: "nope".to_string(),
        }
        .into_message();

        assert_eq!(message_type(&message), Some("operation-result"));
        assert_eq!(message["status"], json!(5));
        assert_eq!(message["result-text"], json!("nope"));
        assert_eq!(message["operation-id"], json!(4));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(OperationStatus::Failed.code(), 5);
        assert_eq!(OperationStatus::Succeeded.code(), 6);
    }

    #[test]
    fn test_types_hash_is_order_independent() {
        let a = vec!["test".to_string(), "computer-info".to_string()];
        let b = vec!["computer-info".to_string(), "test".to_string()];
        assert_eq!(types_hash(&a), types_hash(&b));

        let c = vec!["test".to_string()];
        assert_ne!(types_hash(&a), types_hash(&c));
    }

    #[test]
    fn test_payload_uses_kebab_case() {
        let payload = ExchangePayload {
            server_api: SERVER_API.to_string(),
            client_api: CLIENT_API.to_string(),
            sequence: 3,
            next_expected_sequence: 7,
            accepted_types: "abc".to_string(),
            server_uuid: None,
            client_accepted_types: Some(vec!["set-id".to_string()]),
            total_messages: 0,
            messages: vec![],
        };

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["server-api"], json!("3.2"));
        assert_eq!(value["client-api"], json!("3.7"));
        assert_eq!(value["next-expected-sequence"], json!(7));
        assert_eq!(value["client-accepted-types"], json!(["set-id"]));
        assert!(value.get("server-uuid").is_none());
    }

    #[test]
    fn test_response_tolerates_missing_fields() {
        let response: ExchangeResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(response, ExchangeResponse::default());

        let response: ExchangeResponse = serde_json::from_value(json!({
            "messages": [{"type": "set-id", "id": "secure"}],
            "next-expected-sequence": 2,
            "server-uuid": "abc",
        }))
        .unwrap();
        assert_eq!(response.messages.len(), 1);
        assert_eq!(response.next_expected_sequence, Some(2));
        assert_eq!(response.server_uuid.as_deref(), Some("abc"));
    }
}
