//! Outstanding requests awaiting a response

use crate::error::HubError;
use fleet_shared::{Envelope, MessageId};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

/// Runs synchronously while a response is matched, before the caller sees it
/// and before the next incoming frame is processed
pub(crate) type ResponseHook = Box<dyn FnOnce(&Envelope) + Send>;

/// The single event that terminates a pending request
#[derive(Debug)]
pub(crate) enum Completion {
    /// A frame with a matching correlation id arrived
    Response(Envelope),
    /// The response timer fired
    TimedOut,
    /// The transport was swapped or detached
    TransportChanged,
    /// The transport refused to take the frame
    Undeliverable(String),
}

/// A request the hub has sent and not yet completed
pub(crate) struct PendingRequest {
    sender: oneshot::Sender<Result<Envelope, HubError>>,
    timer: JoinHandle<()>,
    hook: Option<ResponseHook>,
    message_type: String,
    sent_at: Instant,
}

impl PendingRequest {
    pub fn new(
        sender: oneshot::Sender<Result<Envelope, HubError>>,
        timer: JoinHandle<()>,
        hook: Option<ResponseHook>,
        message_type: String,
    ) -> Self {
        Self {
            sender,
            timer,
            hook,
            message_type,
            sent_at: Instant::now(),
        }
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Stop the timer and hand the outcome to whoever is waiting
    ///
    /// Consumes the request, so it can only ever be finished once.
    pub fn finish(self, id: &MessageId, completion: Completion) {
        self.timer.abort();

        let result = match completion {
            Completion::Response(envelope) => {
                debug!(
                    message_id = %id,
                    kind = %self.message_type,
                    elapsed_ms = self.sent_at.elapsed().as_millis() as u64,
                    "Response matched"
                );
                if let Some(hook) = self.hook {
                    hook(&envelope);
                }
                Ok(envelope)
            }
            Completion::TimedOut => Err(HubError::ResponseTimeout {
                message_id: id.clone(),
            }),
            Completion::TransportChanged => Err(HubError::TransportChanged),
            Completion::Undeliverable(reason) => Err(HubError::Undeliverable(reason)),
        };

        // A dropped receiver means the caller stopped waiting
        let _ = self.sender.send(result);
    }
}

/// Pending requests keyed by the id of the envelope that created them
#[derive(Default)]
pub(crate) struct PendingTable {
    requests: HashMap<MessageId, PendingRequest>,
}

impl PendingTable {
    pub fn insert(&mut self, id: MessageId, request: PendingRequest) {
        self.requests.insert(id, request);
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.requests.contains_key(id)
    }

    /// Remove a request so that exactly one caller gets to finish it
    pub fn take(&mut self, id: &MessageId) -> Option<PendingRequest> {
        self.requests.remove(id)
    }

    pub fn drain(&mut self) -> Vec<(MessageId, PendingRequest)> {
        self.requests.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }
}
