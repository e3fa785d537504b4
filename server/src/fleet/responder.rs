//! Decides how the simulated fleet answers each request

use fleet_shared::{message_type, Envelope, MessageBody, ReceiptId};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Request types the simulator understands
const SUPPORTED: &[&str] = &[
    message_type::OBJ_CMD,
    message_type::PRM_SET,
    message_type::FW_UPLOAD,
    message_type::UAV_SIGNAL,
    message_type::UAV_VER,
];

/// Knobs of the simulated fleet
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Time between handing out a receipt and completing it
    pub operation_delay: Duration,
    /// Vehicles whose id contains this marker reject every request
    pub fail_marker: String,
    /// Vehicles whose id contains this marker never finish, the server times them out
    pub slow_marker: String,
    pub firmware_version: String,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            operation_delay: Duration::from_millis(500),
            fail_marker: "fail".into(),
            slow_marker: "slow".into(),
            firmware_version: "sim-1.0".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeferredOutcome {
    Result(Value),
    Timeout,
}

/// A receipt to complete once the operation delay has passed
#[derive(Debug, Clone, PartialEq)]
pub struct Deferred {
    pub receipt: ReceiptId,
    pub outcome: DeferredOutcome,
}

/// Immediate reply plus the receipts it promised
#[derive(Debug, Default)]
pub struct Plan {
    pub reply: Option<Envelope>,
    pub deferred: Vec<Deferred>,
}

/// Answers requests the way a fleet server would
pub struct FleetResponder {
    config: SimConfig,
    next_receipt: AtomicU64,
}

impl FleetResponder {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            next_receipt: AtomicU64::new(1),
        }
    }

    pub fn operation_delay(&self) -> Duration {
        self.config.operation_delay
    }

    fn issue_receipt(&self) -> ReceiptId {
        let n = self.next_receipt.fetch_add(1, Ordering::SeqCst);
        ReceiptId::new(format!("r-{}", n))
    }

    /// Work out the reply to `request`
    pub fn plan(&self, request: &Envelope) -> Plan {
        let kind = request.kind();

        if kind == message_type::ASYNC_CANCEL {
            // Notification, nothing to answer
            return Plan::default();
        }

        if !SUPPORTED.contains(&kind) {
            return nak(request, format!("unsupported message type {}", kind));
        }

        let Some(ids) = request.body.get("ids").and_then(Value::as_array) else {
            return nak(request, "request has no ids".to_string());
        };

        let mut errors = Map::new();
        let mut results = Map::new();
        let mut receipts = Map::new();
        let mut deferred = Vec::new();

        for target in ids.iter().filter_map(Value::as_str) {
            if target.contains(self.config.fail_marker.as_str()) {
                errors.insert(target.to_string(), json!("simulated failure"));
            } else if kind == message_type::UAV_VER {
                results.insert(
                    target.to_string(),
                    json!({ "firmware": self.config.firmware_version }),
                );
            } else {
                let receipt = self.issue_receipt();
                receipts.insert(target.to_string(), json!(receipt.as_str()));
                let outcome = if target.contains(self.config.slow_marker.as_str()) {
                    DeferredOutcome::Timeout
                } else {
                    DeferredOutcome::Result(Value::Bool(true))
                };
                deferred.push(Deferred { receipt, outcome });
            }
        }

        let mut body = MessageBody::new(kind);
        for (key, entries) in [("error", errors), ("result", results), ("receipt", receipts)] {
            if !entries.is_empty() {
                body = body.with(key, entries);
            }
        }

        Plan {
            reply: Some(Envelope::response_to(request, body)),
            deferred,
        }
    }

    /// Notification that completes `deferred`
    pub fn completion(&self, deferred: &Deferred) -> MessageBody {
        match &deferred.outcome {
            DeferredOutcome::Result(value) => MessageBody::new(message_type::ASYNC_RESP)
                .with("id", deferred.receipt.as_str())
                .with("result", value.clone()),
            DeferredOutcome::Timeout => MessageBody::new(message_type::ASYNC_TIMEOUT)
                .with("ids", vec![Value::String(deferred.receipt.to_string())]),
        }
    }
}

fn nak(request: &Envelope, reason: String) -> Plan {
    Plan {
        reply: Some(Envelope::response_to(
            request,
            MessageBody::new(message_type::ACK_NAK).with("reason", reason),
        )),
        deferred: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_shared::TargetId;

    fn request(kind: &str, targets: &[&str]) -> Envelope {
        let targets: Vec<TargetId> = targets.iter().map(|t| TargetId::from(*t)).collect();
        Envelope::new(MessageBody::addressed_to(kind, &targets))
    }

    #[test]
    fn test_receipts_and_errors() {
        let responder = FleetResponder::new(SimConfig::default());
        let request = request(message_type::OBJ_CMD, &["uav-1", "uav-fail", "uav-slow"]);
        let plan = responder.plan(&request);

        let reply = plan.reply.unwrap();
        assert_eq!(reply.correlation_id.as_ref(), Some(&request.id));
        assert_eq!(
            reply.body.for_target("error", &TargetId::from("uav-fail")),
            Some(&json!("simulated failure"))
        );
        assert_eq!(
            reply.body.for_target("receipt", &TargetId::from("uav-1")),
            Some(&json!("r-1"))
        );

        assert_eq!(plan.deferred.len(), 2);
        assert_eq!(plan.deferred[0].outcome, DeferredOutcome::Result(Value::Bool(true)));
        assert_eq!(plan.deferred[1].outcome, DeferredOutcome::Timeout);
    }

    #[test]
    fn test_version_is_answered_immediately() {
        let responder = FleetResponder::new(SimConfig::default());
        let plan = responder.plan(&request(message_type::UAV_VER, &["uav-1"]));

        assert!(plan.deferred.is_empty());
        let reply = plan.reply.unwrap();
        assert_eq!(
            reply.body.for_target("result", &TargetId::from("uav-1")),
            Some(&json!({ "firmware": "sim-1.0" }))
        );
    }

    #[test]
    fn test_unsupported_type_is_nak() {
        let responder = FleetResponder::new(SimConfig::default());
        let reply = responder
            .plan(&request("XYZ-FOO", &["uav-1"]))
            .reply
            .unwrap();
        assert!(reply.body.is_negative_ack());
        assert!(reply.body.reason().unwrap().contains("XYZ-FOO"));

        let missing_ids = Envelope::new(MessageBody::new(message_type::OBJ_CMD));
        assert!(responder.plan(&missing_ids).reply.unwrap().body.is_negative_ack());
    }

    #[test]
    fn test_cancel_gets_no_reply() {
        let responder = FleetResponder::new(SimConfig::default());
        let plan = responder.plan(&Envelope::new(MessageBody::new(message_type::ASYNC_CANCEL)));
        assert!(plan.reply.is_none());
        assert!(plan.deferred.is_empty());
    }

    #[test]
    fn test_completion_bodies() {
        let responder = FleetResponder::new(SimConfig::default());
        let done = Deferred {
            receipt: ReceiptId::from("r-3"),
            outcome: DeferredOutcome::Result(json!(7)),
        };
        let body = responder.completion(&done);
        assert_eq!(body.kind, message_type::ASYNC_RESP);
        assert_eq!(body.get("id"), Some(&json!("r-3")));

        let late = Deferred {
            receipt: ReceiptId::from("r-4"),
            outcome: DeferredOutcome::Timeout,
        };
        assert_eq!(responder.completion(&late).receipt_ids(), vec![ReceiptId::from("r-4")]);
    }
}
