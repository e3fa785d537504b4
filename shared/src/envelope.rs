//! Message envelope exchanged with the fleet server
//!
//! Every frame on the wire is a JSON object of the form:
//! ```text
//! { "$proto.version": "1.0", "id": "...", "correlationId": "...", "body": { "type": "...", ... } }
//! ```
//! `correlationId` is only present on responses and names the request being answered.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{MessageId, ReceiptId, TargetId, PROTOCOL_VERSION};

/// Message type tags used by the core
pub mod message_type {
    /// Positive acknowledgement
    pub const ACK_ACK: &str = "ACK-ACK";
    /// Negative acknowledgement; carries a `reason`
    pub const ACK_NAK: &str = "ACK-NAK";
    /// Result (or error) of an operation that was answered with a receipt
    pub const ASYNC_RESP: &str = "ASYNC-RESP";
    /// Server gave up waiting on one or more receipts
    pub const ASYNC_TIMEOUT: &str = "ASYNC-TIMEOUT";
    /// Client asks the server to abandon one or more receipts
    pub const ASYNC_CANCEL: &str = "ASYNC-CANCEL";
    /// Generic command addressed to one or more objects
    pub const OBJ_CMD: &str = "OBJ-CMD";
    /// Parameter write
    pub const PRM_SET: &str = "PRM-SET";
    /// Firmware upload
    pub const FW_UPLOAD: &str = "FW-UPLOAD";
    /// Visual/audible signal request (e.g. flash lights)
    pub const UAV_SIGNAL: &str = "UAV-SIGNAL";
    /// Vehicle version query
    pub const UAV_VER: &str = "UAV-VER";
}

/// Body of a message: a `type` discriminator plus arbitrary fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl MessageBody {
    /// Create an empty body of the given type
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Get a top-level field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Look up `body[key][target]`, the per-target shape used by multi-object requests
    pub fn for_target(&self, key: &str, target: &TargetId) -> Option<&Value> {
        self.fields.get(key)?.as_object()?.get(target.as_str())
    }

    /// Whether this body is a negative acknowledgement
    pub fn is_negative_ack(&self) -> bool {
        self.kind == message_type::ACK_NAK
    }

    /// Human-readable reason attached to a NAK or error body
    pub fn reason(&self) -> Option<&str> {
        self.fields.get("reason").and_then(Value::as_str)
    }

    /// Build the single-target form `{ "ids": [target], ... }` of a multi-object request
    pub fn addressed_to(kind: impl Into<String>, targets: &[TargetId]) -> Self {
        let ids: Vec<Value> = targets
            .iter()
            .map(|t| Value::String(t.as_str().to_string()))
            .collect();
        Self::new(kind).with("ids", ids)
    }

    /// Receipt ids listed in an `ASYNC-TIMEOUT` body
    pub fn receipt_ids(&self) -> Vec<ReceiptId> {
        self.fields
            .get("ids")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(ReceiptId::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Outer wrapper carrying routing metadata around a message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "$proto.version")]
    pub version: String,
    pub id: MessageId,
    #[serde(
        rename = "correlationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<MessageId>,
    pub body: MessageBody,
}

impl Envelope {
    /// Create an envelope with a fresh id and the default protocol version
    pub fn new(body: MessageBody) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            id: MessageId::generate(),
            correlation_id: None,
            body,
        }
    }

    /// Create a response to `request`
    pub fn response_to(request: &Envelope, body: MessageBody) -> Self {
        Self {
            version: request.version.clone(),
            id: MessageId::generate(),
            correlation_id: Some(request.id.clone()),
            body,
        }
    }

    /// Message type of the body
    pub fn kind(&self) -> &str {
        &self.body.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let body = MessageBody::new(message_type::OBJ_CMD).with("command", "__show_upload");
        let envelope = Envelope {
            version: "1.0".into(),
            id: MessageId::from("m-1"),
            correlation_id: None,
            body,
        };

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "$proto.version": "1.0",
                "id": "m-1",
                "body": { "type": "OBJ-CMD", "command": "__show_upload" }
            })
        );
    }

    #[test]
    fn test_response_parsing() {
        let raw = json!({
            "$proto.version": "1.0",
            "id": "m-2",
            "correlationId": "m-1",
            "body": { "type": "OBJ-CMD", "receipt": { "uav-1": "r-9" } }
        });

        let envelope: Envelope = serde_json::from_value(raw).unwrap();
        assert_eq!(envelope.correlation_id, Some(MessageId::from("m-1")));
        assert_eq!(
            envelope.body.for_target("receipt", &TargetId::from("uav-1")),
            Some(&json!("r-9"))
        );
        assert_eq!(envelope.body.for_target("result", &TargetId::from("uav-1")), None);
    }

    #[test]
    fn test_response_to_copies_id_into_correlation() {
        let request = Envelope::new(MessageBody::new(message_type::UAV_VER));
        let response = Envelope::response_to(&request, MessageBody::new(message_type::ACK_ACK));
        assert_eq!(response.correlation_id.as_ref(), Some(&request.id));
        assert_ne!(response.id, request.id);
    }

    #[test]
    fn test_negative_ack_reason() {
        let body = MessageBody::new(message_type::ACK_NAK).with("reason", "no such object");
        assert!(body.is_negative_ack());
        assert_eq!(body.reason(), Some("no such object"));
    }

    #[test]
    fn test_receipt_ids() {
        let body = MessageBody::new(message_type::ASYNC_TIMEOUT).with("ids", json!(["a", "b"]));
        assert_eq!(body.receipt_ids(), vec![ReceiptId::from("a"), ReceiptId::from("b")]);
        assert!(MessageBody::new(message_type::ASYNC_TIMEOUT).receipt_ids().is_empty());
    }
}
