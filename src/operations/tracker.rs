//! Tracks operations the server answers with a receipt

use super::response::{describe, interpret, ImmediateResponse};
use crate::error::HubError;
use crate::hub::{MessageHub, NotificationHandler, ResponseHook};
use fleet_shared::{message_type, Envelope, MessageBody, ReceiptId, TargetId};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Outcome of a single-target async operation
pub type OperationResult = Result<Value, HubError>;

/// Request types for which the server may answer with a receipt
///
/// Which types actually use receipts is a property of the server's wire
/// protocol; override the set when talking to a server that differs.
pub const DEFAULT_RECEIPT_TYPES: &[&str] = &[
    message_type::OBJ_CMD,
    message_type::PRM_SET,
    message_type::FW_UPLOAD,
    message_type::UAV_SIGNAL,
    message_type::UAV_VER,
    "UAV-CALIB",
    "UAV-HALT",
    "UAV-LAND",
    "UAV-MOTOR",
    "UAV-PREFLT",
    "UAV-RST",
    "UAV-RTH",
    "UAV-SLEEP",
    "UAV-TAKEOFF",
    "UAV-TEST",
    "UAV-WAKEUP",
];

/// Configuration for the async operation tracker
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub receipt_types: HashSet<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            receipt_types: DEFAULT_RECEIPT_TYPES.iter().map(|t| t.to_string()).collect(),
        }
    }
}

struct PendingOperation {
    target: TargetId,
    sender: oneshot::Sender<OperationResult>,
}

struct TrackerInner {
    hub: MessageHub,
    config: TrackerConfig,
    pending: Mutex<HashMap<ReceiptId, PendingOperation>>,
}

fn cancel_body(receipt: &ReceiptId) -> MessageBody {
    MessageBody::new(message_type::ASYNC_CANCEL)
        .with("ids", vec![Value::String(receipt.to_string())])
}

/// Where the receipt of one `start_operation` call stands
enum ReceiptSlot {
    Awaiting,
    Registered(ReceiptId),
    Abandoned,
}

/// Withdraws the operation when its caller stops waiting for it
///
/// Dropping `start_operation` before the outcome arrives removes the receipt
/// from the tracker and tells the server to stop; a receipt that shows up
/// after the caller left is cancelled straight away.
struct OperationGuard {
    tracker: Weak<TrackerInner>,
    slot: Arc<Mutex<ReceiptSlot>>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let previous = std::mem::replace(&mut *self.slot.lock(), ReceiptSlot::Abandoned);
        if let ReceiptSlot::Registered(receipt) = previous {
            if let Some(tracker) = self.tracker.upgrade() {
                if tracker.pending.lock().remove(&receipt).is_some() {
                    tracker.forward_cancel(receipt);
                }
            }
        }
    }
}

impl TrackerInner {
    /// Ask the server to stop working on `receipt`, without waiting
    fn forward_cancel(&self, receipt: ReceiptId) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(%receipt, "No runtime to forward cancellation");
            return;
        };
        info!(%receipt, "Operation abandoned by caller");
        let hub = self.hub.clone();
        runtime.spawn(async move {
            if let Err(e) = hub.send_notification(cancel_body(&receipt)).await {
                debug!(%receipt, "Could not forward cancellation: {}", e);
            }
        });
    }

    fn register(&self, receipt: ReceiptId, target: TargetId, sender: oneshot::Sender<OperationResult>) {
        debug!(%receipt, %target, "Operation deferred");
        self.pending
            .lock()
            .insert(receipt, PendingOperation { target, sender });
    }

    /// Deliver the outcome for `receipt`; removal makes delivery at-most-once
    fn resolve(&self, receipt: &ReceiptId, result: OperationResult) -> bool {
        let operation = self.pending.lock().remove(receipt);
        match operation {
            Some(operation) => {
                debug!(%receipt, target = %operation.target, ok = result.is_ok(), "Operation finished");
                let _ = operation.sender.send(result);
                true
            }
            None => false,
        }
    }

    fn on_result(&self, envelope: &Envelope) {
        let Some(receipt) = envelope.body.get("id").and_then(Value::as_str) else {
            warn!("ASYNC-RESP without receipt id");
            return;
        };
        let receipt = ReceiptId::from(receipt);

        let result = match envelope.body.get("error") {
            Some(error) => Err(HubError::OperationFailed {
                receipt: receipt.clone(),
                reason: describe(error),
            }),
            None => Ok(envelope.body.get("result").cloned().unwrap_or(Value::Null)),
        };

        if !self.resolve(&receipt, result) {
            debug!(%receipt, "Stale operation result ignored");
        }
    }

    fn on_timeout(&self, envelope: &Envelope) {
        for receipt in envelope.body.receipt_ids() {
            let error = HubError::ServerSideTimeout {
                receipt: receipt.clone(),
            };
            if self.resolve(&receipt, Err(error)) {
                warn!(%receipt, "Operation timed out on the server");
            } else {
                debug!(%receipt, "Stale operation timeout ignored");
            }
        }
    }

    fn cancel_all(&self, error: HubError) -> usize {
        let drained: Vec<PendingOperation> = self.pending.lock().drain().map(|(_, op)| op).collect();
        let count = drained.len();
        for operation in drained {
            let _ = operation.sender.send(Err(error.clone()));
        }
        count
    }
}

/// Async operations layered on the message hub
///
/// A request may be failed or completed right away, or acknowledged with a
/// receipt; in the latter case the outcome arrives later as an
/// `ASYNC-RESP` or `ASYNC-TIMEOUT` notification naming that receipt.
#[derive(Clone)]
pub struct AsyncOperationTracker {
    inner: Arc<TrackerInner>,
}

impl AsyncOperationTracker {
    /// Create a tracker and hook it into `hub`
    pub fn new(hub: MessageHub, config: TrackerConfig) -> Self {
        let inner = Arc::new(TrackerInner {
            hub: hub.clone(),
            config,
            pending: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        let on_result: NotificationHandler = Arc::new(move |envelope: &Envelope| {
            if let Some(tracker) = weak.upgrade() {
                tracker.on_result(envelope);
            }
        });
        let weak = Arc::downgrade(&inner);
        let on_timeout: NotificationHandler = Arc::new(move |envelope: &Envelope| {
            if let Some(tracker) = weak.upgrade() {
                tracker.on_timeout(envelope);
            }
        });
        hub.register_notification_handlers([
            (message_type::ASYNC_RESP, on_result),
            (message_type::ASYNC_TIMEOUT, on_timeout),
        ]);

        let weak: Weak<TrackerInner> = Arc::downgrade(&inner);
        hub.on_transport_changed(Arc::new(move || {
            if let Some(tracker) = weak.upgrade() {
                let cancelled = tracker.cancel_all(HubError::TransportChanged);
                if cancelled > 0 {
                    warn!(cancelled, "Cancelled async operations after transport change");
                }
            }
        }));

        Self { inner }
    }

    pub fn hub(&self) -> &MessageHub {
        &self.inner.hub
    }

    /// Whether requests of type `kind` may be answered with a receipt
    pub fn supports_receipt(&self, kind: &str) -> bool {
        self.inner.config.receipt_types.contains(kind)
    }

    /// Run `body` against `target` and wait for its final outcome
    pub async fn start_operation(&self, target: &TargetId, body: MessageBody) -> OperationResult {
        let accepts_receipt = self.supports_receipt(&body.kind);
        let kind = body.kind.clone();
        let (op_tx, op_rx) = oneshot::channel();
        let guard = OperationGuard {
            tracker: Arc::downgrade(&self.inner),
            slot: Arc::new(Mutex::new(ReceiptSlot::Awaiting)),
        };

        // Register the receipt while the response is matched, so a result
        // notification right behind it cannot be taken for a stale one
        let hook: ResponseHook = {
            let tracker = Arc::downgrade(&self.inner);
            let slot = guard.slot.clone();
            let target = target.clone();
            Box::new(move |envelope: &Envelope| {
                if !accepts_receipt {
                    return;
                }
                let ImmediateResponse::Deferred(receipt) = interpret(&envelope.body, &target) else {
                    return;
                };
                let Some(tracker) = tracker.upgrade() else {
                    return;
                };
                let mut slot = slot.lock();
                if matches!(*slot, ReceiptSlot::Abandoned) {
                    drop(slot);
                    tracker.forward_cancel(receipt);
                    return;
                }
                *slot = ReceiptSlot::Registered(receipt.clone());
                tracker.register(receipt, target, op_tx);
            })
        };

        let response = self.inner.hub.send_with_hook(body, hook).await?;

        match interpret(&response.body, target) {
            ImmediateResponse::Failed(reason) => Err(HubError::Rejected { reason }),
            ImmediateResponse::Succeeded(value) => Ok(value),
            ImmediateResponse::Deferred(_) if accepts_receipt => {
                op_rx.await.unwrap_or(Err(HubError::Cancelled))
            }
            ImmediateResponse::Deferred(_) | ImmediateResponse::Missing => {
                Err(HubError::UnexpectedResponse {
                    kind,
                    target: target.clone(),
                })
            }
        }
    }

    /// Abandon one operation and ask the server to stop working on it
    pub async fn cancel_operation(&self, receipt: &ReceiptId) -> bool {
        if !self.inner.resolve(receipt, Err(HubError::Cancelled)) {
            return false;
        }

        if let Err(e) = self.inner.hub.send_notification(cancel_body(receipt)).await {
            debug!(%receipt, "Could not forward cancellation: {}", e);
        }

        info!(%receipt, "Operation cancelled");
        true
    }

    /// Reject every pending operation with `error`
    pub fn cancel_all(&self, error: HubError) -> usize {
        self.inner.cancel_all(error)
    }

    /// Number of operations waiting for their outcome
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }
}
