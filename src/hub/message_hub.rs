//! Correlation hub - matches responses to requests and routes notifications

use super::pending::{Completion, PendingRequest, PendingTable, ResponseHook};
use crate::error::HubError;
use crate::transport::{FrameHandler, Transport};
use fleet_shared::{timing, Envelope, MessageBody, MessageId, PROTOCOL_VERSION};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Callback invoked for unsolicited frames of a given type
pub type NotificationHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Callback invoked after the hub dropped its transport
pub type TransportListener = Arc<dyn Fn() + Send + Sync>;

/// Configuration for the message hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How long `send` waits for a response by default
    pub response_timeout: Duration,
    /// Version tag stamped on outgoing envelopes
    pub protocol_version: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(timing::DEFAULT_RESPONSE_TIMEOUT_MS),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

struct Attached {
    generation: u64,
    transport: Arc<dyn Transport>,
}

#[derive(Default)]
struct HubState {
    transport: Option<Attached>,
    /// Bumped on every attach/detach; frames tagged with an older value are stale
    generation: u64,
    pending: PendingTable,
    handlers: HashMap<String, Vec<NotificationHandler>>,
    transport_listeners: Vec<TransportListener>,
    disposed: bool,
}

struct HubInner {
    config: HubConfig,
    state: Mutex<HubState>,
}

/// Turns a connectionless message channel into request/response calls
///
/// The hub is created once at startup and shared by cloning the handle.
/// All bookkeeping happens in short critical sections that never await, so
/// handlers and hooks always run with the lock released.
#[derive(Clone)]
pub struct MessageHub {
    inner: Arc<HubInner>,
}

impl MessageHub {
    /// Create a hub with no transport attached
    pub fn new(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                state: Mutex::new(HubState::default()),
            }),
        }
    }

    fn from_inner(inner: Arc<HubInner>) -> Self {
        Self { inner }
    }

    fn downgrade(&self) -> Weak<HubInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Send a request and wait for the matching response
    pub async fn send(&self, body: MessageBody) -> Result<Envelope, HubError> {
        self.dispatch(body, self.inner.config.response_timeout, None)
            .await
    }

    /// Like [`send`](Self::send) with a per-call deadline
    pub async fn send_with_timeout(
        &self,
        body: MessageBody,
        timeout: Duration,
    ) -> Result<Envelope, HubError> {
        self.dispatch(body, timeout, None).await
    }

    /// Send a request whose response is first shown to `hook`
    pub(crate) async fn send_with_hook(
        &self,
        body: MessageBody,
        hook: ResponseHook,
    ) -> Result<Envelope, HubError> {
        self.dispatch(body, self.inner.config.response_timeout, Some(hook))
            .await
    }

    async fn dispatch(
        &self,
        body: MessageBody,
        timeout: Duration,
        hook: Option<ResponseHook>,
    ) -> Result<Envelope, HubError> {
        let (tx, rx) = oneshot::channel();

        let (envelope, transport) = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return Err(HubError::Disposed);
            }
            let transport = match &state.transport {
                Some(attached) => attached.transport.clone(),
                None => {
                    warn!(kind = %body.kind, "Cannot send request, no transport attached");
                    return Err(HubError::NoTransport);
                }
            };

            let id = loop {
                let candidate = MessageId::generate();
                if !state.pending.contains(&candidate) {
                    break candidate;
                }
            };

            // Spawned under the lock: even a zero timeout cannot fire before the entry exists
            let timer = self.spawn_timer(id.clone(), timeout);
            state.pending.insert(
                id.clone(),
                PendingRequest::new(tx, timer, hook, body.kind.clone()),
            );

            (self.envelope(id, body), transport)
        };

        let id = envelope.id.clone();
        debug!(message_id = %id, kind = envelope.kind(), "Sending request");

        if let Err(e) = transport.send_frame(envelope).await {
            self.complete(&id, Completion::Undeliverable(e.to_string()));
        }

        rx.await.unwrap_or(Err(HubError::Disposed))
    }

    /// Send a fire-and-forget message; no response is tracked
    pub async fn send_notification(&self, body: MessageBody) -> Result<(), HubError> {
        let transport = {
            let state = self.inner.state.lock();
            if state.disposed {
                return Err(HubError::Disposed);
            }
            state
                .transport
                .as_ref()
                .map(|attached| attached.transport.clone())
                .ok_or(HubError::NoTransport)?
        };

        let envelope = self.envelope(MessageId::generate(), body);
        debug!(message_id = %envelope.id, kind = envelope.kind(), "Sending notification");

        transport
            .send_frame(envelope)
            .await
            .map_err(|e| HubError::Undeliverable(e.to_string()))
    }

    fn envelope(&self, id: MessageId, body: MessageBody) -> Envelope {
        Envelope {
            version: self.inner.config.protocol_version.clone(),
            id,
            correlation_id: None,
            body,
        }
    }

    fn spawn_timer(&self, id: MessageId, timeout: Duration) -> JoinHandle<()> {
        let hub = self.downgrade();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = hub.upgrade() {
                let hub = MessageHub::from_inner(inner);
                if hub.complete(&id, Completion::TimedOut) {
                    warn!(message_id = %id, "Response timeout");
                }
            }
        })
    }

    /// Finish a pending request; false if it was already finished
    fn complete(&self, id: &MessageId, completion: Completion) -> bool {
        let pending = self.inner.state.lock().pending.take(id);
        match pending {
            Some(request) => {
                request.finish(id, completion);
                true
            }
            None => false,
        }
    }

    /// Process a frame received from the transport
    ///
    /// A frame answering a pending request resolves that request. Anything
    /// else is an unsolicited notification and goes to every handler
    /// registered for its type, in registration order.
    pub fn handle_incoming(&self, envelope: Envelope) {
        if let Some(correlation_id) = envelope.correlation_id.clone() {
            let pending = self.inner.state.lock().pending.take(&correlation_id);
            if let Some(request) = pending {
                request.finish(&correlation_id, Completion::Response(envelope));
                return;
            }
        }

        let handlers = self
            .inner
            .state
            .lock()
            .handlers
            .get(envelope.kind())
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!(
                kind = envelope.kind(),
                message_id = %envelope.id,
                "Ignoring message with no registered handler"
            );
            return;
        }

        for handler in handlers {
            handler(&envelope);
        }
    }

    /// Entry point for frames coming from a transport attached as `generation`
    fn deliver(&self, generation: u64, envelope: Envelope) {
        let current = self
            .inner
            .state
            .lock()
            .transport
            .as_ref()
            .map(|attached| attached.generation);

        if current != Some(generation) {
            debug!(kind = envelope.kind(), "Dropping frame from detached transport");
            return;
        }

        self.handle_incoming(envelope);
    }

    /// Add a handler for unsolicited messages of type `kind`
    pub fn register_notification_handler(
        &self,
        kind: impl Into<String>,
        handler: NotificationHandler,
    ) {
        self.inner
            .state
            .lock()
            .handlers
            .entry(kind.into())
            .or_default()
            .push(handler);
    }

    /// Add several handlers at once
    pub fn register_notification_handlers<I, K>(&self, handlers: I)
    where
        I: IntoIterator<Item = (K, NotificationHandler)>,
        K: Into<String>,
    {
        let mut state = self.inner.state.lock();
        for (kind, handler) in handlers {
            state.handlers.entry(kind.into()).or_default().push(handler);
        }
    }

    /// Be told whenever the transport is swapped or detached
    ///
    /// Listeners run after every pending request has been rejected and
    /// before a replacement transport is accepted.
    pub fn on_transport_changed(&self, listener: TransportListener) {
        self.inner.state.lock().transport_listeners.push(listener);
    }

    /// Attach a transport, replacing the current one
    pub fn attach(&self, transport: Arc<dyn Transport>) {
        self.set_transport(Some(transport));
    }

    /// Drop the current transport
    pub fn detach(&self) {
        self.set_transport(None);
    }

    /// Swap the active transport
    ///
    /// Every request still pending against the old transport is rejected with
    /// [`HubError::TransportChanged`] first, so a late response can never
    /// resolve a request made before the swap.
    pub fn set_transport(&self, transport: Option<Arc<dyn Transport>>) {
        let (rejected, listeners, generation, previous) = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }

            match (&state.transport, &transport) {
                (Some(current), Some(next)) if Arc::ptr_eq(&current.transport, next) => return,
                (None, None) => return,
                _ => {}
            }

            state.generation += 1;
            let previous = state.transport.take();
            (
                state.pending.drain(),
                state.transport_listeners.clone(),
                state.generation,
                previous,
            )
        };

        if !rejected.is_empty() {
            warn!(
                count = rejected.len(),
                "Rejecting pending requests after transport change"
            );
        }
        for (id, request) in rejected {
            debug!(message_id = %id, kind = request.message_type(), "Rejected by transport change");
            request.finish(&id, Completion::TransportChanged);
        }

        for listener in listeners {
            listener();
        }

        if let Some(previous) = previous {
            info!(transport = previous.transport.name(), "Transport detached");
        }

        let Some(transport) = transport else {
            return;
        };

        let hub = self.downgrade();
        let handler: FrameHandler = Arc::new(move |envelope| {
            if let Some(inner) = hub.upgrade() {
                MessageHub::from_inner(inner).deliver(generation, envelope);
            }
        });
        transport.on_frame(handler);

        let mut state = self.inner.state.lock();
        // A concurrent swap won; its transport stays
        if state.generation != generation || state.disposed {
            return;
        }
        info!(transport = transport.name(), "Transport attached");
        state.transport = Some(Attached {
            generation,
            transport,
        });
    }

    /// Whether a transport is currently attached
    pub fn is_attached(&self) -> bool {
        self.inner.state.lock().transport.is_some()
    }

    /// Number of requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Detach the transport and drop every handler; the hub refuses further use
    pub fn dispose(&self) {
        self.detach();
        let mut state = self.inner.state.lock();
        state.disposed = true;
        state.handlers.clear();
        state.transport_listeners.clear();
        info!("Message hub disposed");
    }
}
