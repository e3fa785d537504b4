//! Reading the immediate answer to a multi-object request

use fleet_shared::{MessageBody, ReceiptId, TargetId};
use serde_json::Value;

/// What the server said about one target in its immediate response
#[derive(Debug, Clone, PartialEq)]
pub enum ImmediateResponse {
    /// The request failed for this target
    Failed(String),
    /// The request already completed with this value
    Succeeded(Value),
    /// The server will report the outcome later under this receipt
    Deferred(ReceiptId),
    /// The response says nothing about this target
    Missing,
}

/// Inspect `body` for the entry belonging to `target`
///
/// A negative acknowledgement fails every target. Otherwise `error` wins
/// over `receipt`, which wins over `result`.
pub fn interpret(body: &MessageBody, target: &TargetId) -> ImmediateResponse {
    if body.is_negative_ack() {
        return ImmediateResponse::Failed(body.reason().unwrap_or("request rejected").to_string());
    }

    if let Some(error) = body.for_target("error", target) {
        return ImmediateResponse::Failed(describe(error));
    }

    if let Some(receipt) = body.for_target("receipt", target) {
        return match receipt.as_str() {
            Some(receipt) => ImmediateResponse::Deferred(ReceiptId::from(receipt)),
            None => ImmediateResponse::Missing,
        };
    }

    match body.for_target("result", target) {
        Some(value) => ImmediateResponse::Succeeded(value.clone()),
        None => ImmediateResponse::Missing,
    }
}

/// Render an error value as a message
pub(crate) fn describe(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        Value::Null => "unknown error".to_string(),
        other => other.to_string(),
    }
}
