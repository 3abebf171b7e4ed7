//! Parsing and classification of inbound JSON-RPC bodies.
//!
//! A body is either a single message or a non-empty array of messages (a
//! batch). Validation here is pure: deciding what an invalid combination of
//! messages means for a session is left to the transport.

use serde_json::Value;
use thiserror::Error;

use super::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest};

/// Method name of the session handshake request.
pub const INITIALIZE_METHOD: &str = "initialize";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Parse error: Invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("Parse error: Invalid JSON-RPC message: {0}")]
    InvalidMessage(#[source] serde_json::Error),
    #[error("Invalid Request: empty batch")]
    EmptyBatch,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Single(JsonRpcMessage),
    Batch(Vec<JsonRpcMessage>),
}

impl Envelope {
    /// Decode a raw HTTP body.
    pub fn parse(body: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_slice(body).map_err(EnvelopeError::InvalidJson)?;
        Self::from_value(value)
    }

    /// Decode an already parsed JSON document.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        match value {
            Value::Array(items) => {
                if items.is_empty() {
                    return Err(EnvelopeError::EmptyBatch);
                }
                items
                    .into_iter()
                    .map(serde_json::from_value)
                    .collect::<Result<Vec<JsonRpcMessage>, _>>()
                    .map(Envelope::Batch)
                    .map_err(EnvelopeError::InvalidMessage)
            }
            other => serde_json::from_value(other)
                .map(Envelope::Single)
                .map_err(EnvelopeError::InvalidMessage),
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, Envelope::Batch(_))
    }

    pub fn messages(&self) -> &[JsonRpcMessage] {
        match self {
            Envelope::Single(message) => std::slice::from_ref(message),
            Envelope::Batch(messages) => messages,
        }
    }

    pub fn into_messages(self) -> Vec<JsonRpcMessage> {
        match self {
            Envelope::Single(message) => vec![message],
            Envelope::Batch(messages) => messages,
        }
    }

    pub fn contains_initialize(&self) -> bool {
        self.messages().iter().any(is_initialize_request)
    }
}

/// The messages of one body, split by kind. Order within each kind is preserved.
#[derive(Debug, Default)]
pub struct MessageKinds<'a> {
    pub requests: Vec<&'a JsonRpcRequest>,
    pub notifications: Vec<&'a JsonRpcNotification>,
    /// Responses and errors sent by the client (answers to server-initiated requests).
    pub responses: Vec<&'a JsonRpcMessage>,
}

impl MessageKinds<'_> {
    pub fn has_requests(&self) -> bool {
        !self.requests.is_empty()
    }
}

pub fn classify(messages: &[JsonRpcMessage]) -> MessageKinds<'_> {
    let mut kinds = MessageKinds::default();
    for message in messages {
        match message {
            JsonRpcMessage::Request(request) => kinds.requests.push(request),
            JsonRpcMessage::Notification(notification) => kinds.notifications.push(notification),
            JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_) => kinds.responses.push(message),
        }
    }
    kinds
}

pub fn is_initialize_request(message: &JsonRpcMessage) -> bool {
    matches!(message, JsonRpcMessage::Request(request) if request.method == INITIALIZE_METHOD)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_single_message() {
        let envelope = Envelope::parse(br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).unwrap();
        assert!(!envelope.is_batch());
        assert_eq!(envelope.messages().len(), 1);
        assert!(!envelope.contains_initialize());
    }

    #[test]
    fn test_parse_batch() {
        let body = json!([
            {"jsonrpc": "2.0", "id": 1, "method": "tools/list"},
            {"jsonrpc": "2.0", "method": "notifications/progress"},
            {"jsonrpc": "2.0", "id": 7, "result": {}}
        ]);
        let envelope = Envelope::parse(body.to_string().as_bytes()).unwrap();
        assert!(envelope.is_batch());
        let kinds = classify(envelope.messages());
        assert_eq!(kinds.requests.len(), 1);
        assert_eq!(kinds.notifications.len(), 1);
        assert_eq!(kinds.responses.len(), 1);
        assert!(kinds.has_requests());
    }

    #[test]
    fn test_parse_malformed_json() {
        let error = Envelope::parse(b"{not json").unwrap_err();
        assert!(matches!(error, EnvelopeError::InvalidJson(_)));
        assert!(error.to_string().starts_with("Parse error"));
    }

    #[test]
    fn test_parse_invalid_envelope() {
        let error = Envelope::parse(br#"{"jsonrpc":"2.0","params":{}}"#).unwrap_err();
        assert!(matches!(error, EnvelopeError::InvalidMessage(_)));

        // one bad member poisons the whole batch
        let error = Envelope::parse(br#"[{"jsonrpc":"2.0","method":"a"},{"foo":1}]"#).unwrap_err();
        assert!(matches!(error, EnvelopeError::InvalidMessage(_)));
    }

    #[test]
    fn test_parse_empty_batch() {
        assert!(matches!(
            Envelope::parse(b"[]").unwrap_err(),
            EnvelopeError::EmptyBatch
        ));
    }

    #[test]
    fn test_request_wins_over_notification_in_batch() {
        let envelope = Envelope::from_value(json!([
            {"jsonrpc": "2.0", "id": "x", "method": "initialize", "params": {}},
            {"jsonrpc": "2.0", "method": "initialize"}
        ]))
        .unwrap();
        let kinds = classify(envelope.messages());
        assert_eq!(kinds.requests.len(), 1);
        assert_eq!(kinds.notifications.len(), 1);
        // only the request form counts as an initialize request
        let count = envelope
            .messages()
            .iter()
            .filter(|m| is_initialize_request(m))
            .count();
        assert_eq!(count, 1);
    }
}
