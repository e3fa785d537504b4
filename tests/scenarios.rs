//! End-to-end behaviour of the hub, the tracker and the upload orchestrator

use async_trait::async_trait;
use fleet_shared::{message_type, MessageBody, MessageId, TargetId};
use ground_station::transport::{MemoryRemote, MemoryTransport};
use ground_station::upload::{
    Executor, ExecutorRegistry, JobFinished, QueueKind, ShowUploadExecutor,
};
use ground_station::{
    AsyncOperationTracker, HubConfig, HubError, JobOutcome, JobType, MessageHub, TrackerConfig,
    UploadOptions, UploadOrchestrator,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Executor that records how many targets it is working on at once
struct Recording {
    failing: HashSet<TargetId>,
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
    started: Mutex<Vec<TargetId>>,
}

impl Recording {
    fn new(delay: Duration) -> Self {
        Self {
            failing: HashSet::new(),
            delay,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
        }
    }

    fn failing(mut self, target: &str) -> Self {
        self.failing.insert(TargetId::from(target));
        self
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for Recording {
    async fn execute(&self, target: &TargetId, _payload: &Value) -> anyhow::Result<()> {
        self.started.lock().push(target.clone());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(target) {
            anyhow::bail!("{} rejected the upload", target);
        }
        Ok(())
    }
}

fn ids(names: &[&str]) -> Vec<TargetId> {
    names.iter().map(|n| TargetId::from(*n)).collect()
}

fn orchestrator(executor: Arc<Recording>, workers: usize) -> UploadOrchestrator {
    let mut registry = ExecutorRegistry::new();
    registry.register_arc(JobType::SHOW_UPLOAD, executor);
    let options = UploadOptions {
        worker_count: Some(workers),
        ..Default::default()
    };
    UploadOrchestrator::new(MessageHub::new(HubConfig::default()), registry, options)
}

fn attached_hub() -> (MessageHub, MemoryRemote) {
    let hub = MessageHub::new(HubConfig::default());
    let (transport, remote) = MemoryTransport::pair("fleet");
    hub.attach(Arc::new(transport));
    (hub, remote)
}

#[tokio::test(start_paused = true)]
async fn scenario_a_all_targets_succeed() {
    let executor = Arc::new(Recording::new(Duration::from_millis(100)));
    let orchestrator = orchestrator(executor.clone(), 2);
    let mut finished = orchestrator.subscribe();

    let job = orchestrator
        .start_job(JobType::SHOW_UPLOAD, json!({}), ids(&["A", "B", "C"]))
        .unwrap();
    assert_eq!(job.await.unwrap(), JobOutcome::Success);

    let mut done = orchestrator.items(QueueKind::Finished);
    done.sort();
    assert_eq!(done, ids(&["A", "B", "C"]));
    for kind in [QueueKind::WaitingToStart, QueueKind::Queued, QueueKind::InProgress, QueueKind::Failed] {
        assert!(orchestrator.items(kind).is_empty(), "{:?} not empty", kind);
    }
    assert!(executor.peak() <= 2);
    assert_eq!(
        finished.recv().await.unwrap(),
        JobFinished::new(JobType::SHOW_UPLOAD, JobOutcome::Success)
    );
}

#[tokio::test(start_paused = true)]
async fn scenario_b_one_target_fails() {
    let executor = Arc::new(Recording::new(Duration::from_millis(50)).failing("A"));
    let orchestrator = orchestrator(executor, 8);

    let job = orchestrator
        .start_job(JobType::SHOW_UPLOAD, json!({}), ids(&["A", "B"]))
        .unwrap();
    assert_eq!(job.await.unwrap(), JobOutcome::Error);

    assert_eq!(orchestrator.items(QueueKind::Failed), ids(&["A"]));
    assert_eq!(orchestrator.items(QueueKind::Finished), ids(&["B"]));
    assert!(orchestrator
        .error_for(&TargetId::from("A"))
        .unwrap()
        .contains("rejected"));
    assert_eq!(
        orchestrator.history(&JobType::SHOW_UPLOAD).unwrap().result,
        JobOutcome::Error
    );
}

#[tokio::test(start_paused = true)]
async fn scenario_c_request_times_out() {
    let (hub, mut remote) = attached_hub();

    let pending = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.send(MessageBody::new(message_type::UAV_VER)).await })
    };
    let request = remote.recv().await.unwrap();

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(
        pending.await.unwrap(),
        Err(HubError::ResponseTimeout {
            message_id: request.id.clone()
        })
    );
    assert_eq!(hub.pending_count(), 0);

    // A response after the deadline resolves nothing
    remote.reply(&request, MessageBody::new(message_type::UAV_VER));
    assert_eq!(hub.pending_count(), 0);
}

#[tokio::test]
async fn scenario_d_transport_swap_rejects_pending() {
    let (hub, mut remote) = attached_hub();

    let first = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.send(MessageBody::new(message_type::UAV_VER)).await })
    };
    let second = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.send(MessageBody::new(message_type::PRM_SET)).await })
    };
    let late_a = remote.recv().await.unwrap();
    let late_b = remote.recv().await.unwrap();
    assert_eq!(hub.pending_count(), 2);

    let (replacement, _replacement_remote) = MemoryTransport::pair("fleet-2");
    hub.attach(Arc::new(replacement));

    for result in futures::future::join_all([first, second]).await {
        assert_eq!(result.unwrap(), Err(HubError::TransportChanged));
    }

    // Late responses over the old link are dropped without error
    remote.reply(&late_a, MessageBody::new(message_type::UAV_VER));
    remote.reply(&late_b, MessageBody::new(message_type::PRM_SET));
    assert_eq!(hub.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn scenario_e_cancel_running_job() {
    let executor = Arc::new(Recording::new(Duration::from_secs(60)));
    let orchestrator = orchestrator(executor.clone(), 3);
    let targets: Vec<TargetId> = (1..=8).map(|n| TargetId::new(format!("uav-{}", n))).collect();

    let job = orchestrator
        .start_job(JobType::SHOW_UPLOAD, json!({}), targets)
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(orchestrator.queue_counts().in_progress, 3);
    assert!(orchestrator.cancel());

    assert_eq!(job.await.unwrap(), JobOutcome::Cancelled);
    let counts = orchestrator.queue_counts();
    assert_eq!(counts.queued, 0);
    assert_eq!(counts.in_progress, 0);
    assert_eq!(counts.waiting_to_start, 8);
    assert!(!orchestrator.is_running());
    assert!(!orchestrator.cancel());
}

#[tokio::test(start_paused = true)]
async fn in_progress_never_exceeds_worker_count() {
    for workers in [1, 3, 8] {
        let executor = Arc::new(Recording::new(Duration::from_millis(75)).failing("uav-4"));
        let orchestrator = orchestrator(executor.clone(), workers);
        let mut progress = orchestrator.subscribe_progress();
        let targets: Vec<TargetId> = (0..20).map(|n| TargetId::new(format!("uav-{}", n))).collect();

        let observer = tokio::spawn(async move {
            let mut peak = 0;
            while progress.changed().await.is_ok() {
                peak = peak.max(progress.borrow().in_progress);
            }
            peak
        });

        let job = orchestrator
            .start_job(JobType::SHOW_UPLOAD, json!({}), targets)
            .unwrap();
        assert_eq!(job.await.unwrap(), JobOutcome::Error);
        assert!(executor.peak() <= workers);
        assert_eq!(executor.started.lock().len(), 20);

        drop(orchestrator);
        assert!(observer.await.unwrap() <= workers);
    }
}

#[tokio::test]
async fn show_upload_through_receipts() {
    let (hub, mut remote) = attached_hub();
    let tracker = AsyncOperationTracker::new(hub.clone(), TrackerConfig::default());
    let mut registry = ExecutorRegistry::new();
    registry.register(JobType::SHOW_UPLOAD, ShowUploadExecutor::new(tracker.clone()));
    let orchestrator = UploadOrchestrator::new(hub, registry, UploadOptions::default());

    let job = orchestrator
        .start_job(JobType::SHOW_UPLOAD, json!({ "name": "demo" }), ids(&["uav-1", "uav-2"]))
        .unwrap();

    // Answer each request with a receipt, then complete it
    for _ in 0..2 {
        let request = remote.recv().await.unwrap();
        assert_eq!(request.kind(), message_type::OBJ_CMD);
        let target = request.body.get("ids").unwrap()[0].as_str().unwrap().to_string();
        let receipt = format!("r-{}", target);

        let mut receipts = serde_json::Map::new();
        receipts.insert(target.clone(), Value::String(receipt.clone()));
        remote.reply(&request, MessageBody::new(message_type::OBJ_CMD).with("receipt", receipts));

        let completion = if target == "uav-2" {
            MessageBody::new(message_type::ASYNC_RESP)
                .with("id", receipt)
                .with("error", "storage full")
        } else {
            MessageBody::new(message_type::ASYNC_RESP)
                .with("id", receipt)
                .with("result", true)
        };
        remote.notify(completion);
    }

    assert_eq!(job.await.unwrap(), JobOutcome::Error);
    assert_eq!(orchestrator.items(QueueKind::Finished), ids(&["uav-1"]));
    assert!(orchestrator
        .error_for(&TargetId::from("uav-2"))
        .unwrap()
        .contains("storage full"));
    assert_eq!(tracker.pending_count(), 0);
}

#[tokio::test]
async fn cancelled_job_withdraws_its_receipts() {
    let (hub, mut remote) = attached_hub();
    let tracker = AsyncOperationTracker::new(hub.clone(), TrackerConfig::default());
    let mut registry = ExecutorRegistry::new();
    registry.register(JobType::SHOW_UPLOAD, ShowUploadExecutor::new(tracker.clone()));
    let orchestrator = UploadOrchestrator::new(hub, registry, UploadOptions::default());

    let job = orchestrator
        .start_job(JobType::SHOW_UPLOAD, json!({ "name": "demo" }), ids(&["uav-1"]))
        .unwrap();

    let request = remote.recv().await.unwrap();
    remote.reply(
        &request,
        MessageBody::new(message_type::OBJ_CMD).with("receipt", json!({ "uav-1": "r-1" })),
    );
    assert_eq!(tracker.pending_count(), 1);

    assert!(orchestrator.cancel());
    assert_eq!(job.await.unwrap(), JobOutcome::Cancelled);
    assert_eq!(tracker.pending_count(), 0);

    let cancel = remote.recv().await.unwrap();
    assert_eq!(cancel.kind(), message_type::ASYNC_CANCEL);
    assert_eq!(cancel.body.get("ids"), Some(&json!(["r-1"])));
    assert_eq!(orchestrator.items(QueueKind::WaitingToStart), ids(&["uav-1"]));
}

#[tokio::test]
async fn unmatched_correlation_is_not_a_response() {
    let (hub, mut remote) = attached_hub();
    let seen = Arc::new(AtomicUsize::new(0));
    {
        let seen = seen.clone();
        hub.register_notification_handler(
            message_type::UAV_VER,
            Arc::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }

    let pending = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.send(MessageBody::new(message_type::UAV_VER)).await })
    };
    let request = remote.recv().await.unwrap();

    let mut stray = fleet_shared::Envelope::new(MessageBody::new(message_type::UAV_VER));
    stray.correlation_id = Some(MessageId::from("nobody-asked"));
    remote.deliver(stray);
    remote.notify(MessageBody::new("NO-HANDLER"));

    assert_eq!(hub.pending_count(), 1);
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    remote.reply(&request, MessageBody::new(message_type::UAV_VER).with("ok", true));
    let response = tokio_test::assert_ok!(pending.await.unwrap());
    assert_eq!(response.correlation_id, Some(request.id));
}
