//! Errors surfaced by the request/response layer

use fleet_shared::{MessageId, ReceiptId, TargetId};
use thiserror::Error;

/// Why a request or async operation did not produce a result
///
/// All variants are scoped to a single request or operation; none of them
/// take the hub down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("No transport attached to the message hub")]
    NoTransport,

    #[error("No response to message {message_id} before the deadline")]
    ResponseTimeout { message_id: MessageId },

    #[error("Transport changed while the request was pending")]
    TransportChanged,

    #[error("Server timed out while executing operation {receipt}")]
    ServerSideTimeout { receipt: ReceiptId },

    #[error("Request rejected: {reason}")]
    Rejected { reason: String },

    #[error("Operation {receipt} failed: {reason}")]
    OperationFailed { receipt: ReceiptId, reason: String },

    #[error("Unexpected {kind} response for {target}")]
    UnexpectedResponse { kind: String, target: TargetId },

    #[error("Transport could not deliver frame: {0}")]
    Undeliverable(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Message hub disposed")]
    Disposed,
}

impl HubError {
    /// Errors that may succeed if the same request is sent again later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HubError::ResponseTimeout { .. }
                | HubError::TransportChanged
                | HubError::ServerSideTimeout { .. }
                | HubError::Undeliverable(_)
        )
    }
}
