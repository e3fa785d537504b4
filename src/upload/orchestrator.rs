//! Worker pool driving one upload job across many targets
//!
//! A single feeder task owns the hand-off channel (capacity 1) and decides
//! what happens next; `W` workers take targets from it and run the job's
//! executor. The bounded channel is what keeps at most `W` targets in
//! progress at any time.

use super::executor::{Executor, ExecutorRegistry};
use super::job::{HistoryEntry, JobError, JobFinished, JobHistory, JobOutcome, JobType, UploadJob};
use super::queues::{QueueCounts, QueueKind, TargetQueues};
use crate::error::HubError;
use crate::hub::MessageHub;
use fleet_shared::{message_type, timing, MessageBody, TargetId};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Options shared by every job the orchestrator runs
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Worker count; `None` uses the executor's preference or the default
    pub worker_count: Option<usize>,
    /// Move failed targets back to waiting while the job runs
    pub auto_retry: bool,
    /// Automatic retries allowed per target
    pub max_auto_retries: u32,
    pub flash_lights_on_failure: bool,
    /// Length of one light signal; failed targets are flashed again once it has passed
    pub flash_duration: Duration,
    /// How long the feeder sleeps while waiting for workers to drain
    pub poll_interval: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            worker_count: None,
            auto_retry: false,
            max_auto_retries: timing::DEFAULT_MAX_AUTO_RETRIES,
            flash_lights_on_failure: false,
            flash_duration: Duration::from_millis(timing::FLASH_LIGHTS_DURATION_MS),
            poll_interval: Duration::from_millis(timing::FEEDER_POLL_INTERVAL_MS),
        }
    }
}

impl UploadOptions {
    fn workers_for(&self, executor: &dyn Executor) -> usize {
        self.worker_count
            .or_else(|| executor.concurrency())
            .unwrap_or(timing::DEFAULT_WORKER_COUNT)
            .max(1)
    }
}

/// What travels through the hand-off channel
#[derive(Debug)]
enum WorkItem {
    Upload(TargetId),
    Stop,
}

/// Decision taken by the feeder on each turn
enum FeedStep {
    Dispatch(TargetId),
    Retried(usize),
    Wait(Vec<TargetId>),
    Done,
}

enum FeedEnd {
    Completed,
    Cancelled,
    WorkersGone,
}

#[derive(Default)]
struct OrchestratorState {
    registry: ExecutorRegistry,
    job: Option<UploadJob>,
    queues: TargetQueues,
    last_flash: Option<Instant>,
    item_tokens: HashMap<TargetId, CancellationToken>,
    run: Option<CancellationToken>,
    history: JobHistory,
}

struct OrchestratorInner {
    hub: MessageHub,
    options: UploadOptions,
    state: Mutex<OrchestratorState>,
    progress: watch::Sender<QueueCounts>,
    finished: broadcast::Sender<JobFinished>,
}

impl OrchestratorInner {
    /// Mutate the state and publish the resulting queue counts
    fn update<R>(&self, f: impl FnOnce(&mut OrchestratorState) -> R) -> R {
        let (result, counts) = {
            let mut state = self.state.lock();
            let result = f(&mut state);
            (result, state.queues.counts())
        };
        self.progress.send_if_modified(|current| {
            if *current == counts {
                return false;
            }
            *current = counts;
            true
        });
        result
    }

    /// `queued → inProgress`; returns the token that cancels this attempt
    fn begin_item(&self, target: &TargetId, run: &CancellationToken) -> Option<CancellationToken> {
        self.update(|state| {
            if !state
                .queues
                .move_item(target, QueueKind::Queued, QueueKind::InProgress)
            {
                return None;
            }
            let token = run.child_token();
            state.item_tokens.insert(target.clone(), token.clone());
            Some(token)
        })
    }

    /// Record how an attempt ended; `None` means it was interrupted
    fn finish_item(&self, target: &TargetId, result: Option<anyhow::Result<()>>) {
        self.update(|state| {
            state.item_tokens.remove(target);
            match result {
                Some(Ok(())) => {
                    debug!(%target, "Upload finished");
                    state.queues.mark_finished(target);
                }
                Some(Err(e)) => {
                    let message = format!("{:#}", e);
                    let transient = e
                        .chain()
                        .filter_map(|cause| cause.downcast_ref::<HubError>())
                        .any(HubError::is_transient);
                    warn!(%target, transient, "Upload failed: {}", message);
                    state.queues.mark_failed(target, message);
                }
                None => {
                    debug!(%target, "Upload interrupted");
                    state
                        .queues
                        .move_item(target, QueueKind::InProgress, QueueKind::WaitingToStart);
                }
            }
        })
    }

    fn next_step(&self) -> FeedStep {
        let options = &self.options;
        self.update(|state| {
            if let Some(target) = state.queues.pop_waiting() {
                return FeedStep::Dispatch(target);
            }

            let counts = state.queues.counts();
            if counts.failed > 0
                && options.auto_retry
                && state.queues.has_auto_retry_candidates(options.max_auto_retries)
            {
                return FeedStep::Retried(state.queues.auto_retry(options.max_auto_retries));
            }

            if counts.in_flight() > 0 {
                let mut flash = Vec::new();
                if options.flash_lights_on_failure && counts.failed > 0 {
                    let now = Instant::now();
                    let due = state
                        .last_flash
                        .map_or(true, |at| now.duration_since(at) >= options.flash_duration);
                    if due {
                        state.last_flash = Some(now);
                        flash = state.queues.items(QueueKind::Failed);
                    }
                }
                return FeedStep::Wait(flash);
            }

            FeedStep::Done
        })
    }

    /// Best-effort light signal to the given targets
    fn flash_lights(&self, targets: Vec<TargetId>) {
        debug!(count = targets.len(), "Flashing lights on failed targets");
        let body = MessageBody::addressed_to(message_type::UAV_SIGNAL, &targets)
            .with("signals", json!(["light"]))
            .with("duration", self.options.flash_duration.as_millis() as u64);

        let hub = self.hub.clone();
        tokio::spawn(async move {
            if let Err(e) = hub.send(body).await {
                debug!("Flash lights request failed: {}", e);
            }
        });
    }

    async fn feed(&self, handoff: &mpsc::Sender<WorkItem>, cancel: &CancellationToken) -> FeedEnd {
        loop {
            if cancel.is_cancelled() {
                return FeedEnd::Cancelled;
            }

            match self.next_step() {
                FeedStep::Dispatch(target) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return FeedEnd::Cancelled,
                        sent = handoff.send(WorkItem::Upload(target)) => {
                            if sent.is_err() {
                                return FeedEnd::WorkersGone;
                            }
                        }
                    }
                }
                FeedStep::Retried(count) => info!(count, "Retrying failed targets"),
                FeedStep::Wait(flash) => {
                    if !flash.is_empty() {
                        self.flash_lights(flash);
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return FeedEnd::Cancelled,
                        _ = tokio::time::sleep(self.options.poll_interval) => {}
                    }
                }
                FeedStep::Done => return FeedEnd::Completed,
            }
        }
    }

    async fn run(
        self: Arc<Self>,
        job_type: JobType,
        payload: Arc<Value>,
        executor: Arc<dyn Executor>,
        workers: usize,
        cancel: CancellationToken,
    ) -> JobOutcome {
        info!(%job_type, workers, "Upload job started");

        let (handoff, receiver) = mpsc::channel(1);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let mut pool = JoinSet::new();
        for index in 0..workers {
            pool.spawn(worker(
                self.clone(),
                index,
                receiver.clone(),
                executor.clone(),
                payload.clone(),
                cancel.clone(),
            ));
        }
        // Only workers hold the receiver, so sends fail once they are all gone
        drop(receiver);

        let end = self.feed(&handoff, &cancel).await;
        if matches!(end, FeedEnd::Completed) {
            for _ in 0..workers {
                if handoff.send(WorkItem::Stop).await.is_err() {
                    break;
                }
            }
        }
        drop(handoff);

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                error!("Upload worker crashed: {}", e);
            }
        }

        let outcome = self.update(|state| {
            let returned = state.queues.requeue_in_flight();
            if returned > 0 {
                debug!(returned, "Returned unfinished targets to waiting");
            }
            state.item_tokens.clear();
            state.run = None;
            if let Some(job) = state.job.as_mut() {
                job.running = false;
            }

            let outcome = if cancel.is_cancelled() || matches!(end, FeedEnd::Cancelled) {
                JobOutcome::Cancelled
            } else if matches!(end, FeedEnd::WorkersGone) || state.queues.counts().failed > 0 {
                JobOutcome::Error
            } else {
                JobOutcome::Success
            };
            state
                .history
                .record(job_type.clone(), payload.as_ref().clone(), outcome);
            outcome
        });

        if matches!(end, FeedEnd::WorkersGone) {
            error!(%job_type, "All upload workers exited before the job completed");
        }
        info!(%job_type, %outcome, "Upload job finished");
        let _ = self.finished.send(JobFinished::new(job_type, outcome));
        outcome
    }
}

async fn worker(
    inner: Arc<OrchestratorInner>,
    index: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    executor: Arc<dyn Executor>,
    payload: Arc<Value>,
    cancel: CancellationToken,
) {
    debug!(worker = index, "Upload worker started");
    loop {
        let item = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = receiver.recv() => item,
            }
        };

        let target = match item {
            Some(WorkItem::Upload(target)) => target,
            Some(WorkItem::Stop) | None => break,
        };
        let Some(attempt) = inner.begin_item(&target, &cancel) else {
            continue;
        };

        let execution = AssertUnwindSafe(executor.execute(&target, &payload)).catch_unwind();
        let result = tokio::select! {
            _ = attempt.cancelled() => None,
            result = execution => Some(result.unwrap_or_else(|panic| {
                Err(anyhow::anyhow!("executor panicked: {}", panic_message(panic.as_ref())))
            })),
        };
        inner.finish_item(&target, result);
    }
    debug!(worker = index, "Upload worker stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

fn dedup(targets: Vec<TargetId>) -> Vec<TargetId> {
    let mut seen = HashSet::new();
    targets
        .into_iter()
        .filter(|target| seen.insert(target.clone()))
        .collect()
}

/// Runs upload jobs against the fleet
///
/// One job is current at a time. Its targets move through the five queues
/// while the job runs; queue counts are published on a `watch` channel and
/// every terminated run is announced on a `broadcast` channel.
#[derive(Clone)]
pub struct UploadOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl UploadOrchestrator {
    pub fn new(hub: MessageHub, registry: ExecutorRegistry, options: UploadOptions) -> Self {
        let (progress, _) = watch::channel(QueueCounts::default());
        let (finished, _) = broadcast::channel(16);
        let state = OrchestratorState {
            registry,
            ..Default::default()
        };

        Self {
            inner: Arc::new(OrchestratorInner {
                hub,
                options,
                state: Mutex::new(state),
                progress,
                finished,
            }),
        }
    }

    pub fn options(&self) -> &UploadOptions {
        &self.inner.options
    }

    pub fn register_executor<E: Executor>(&self, job_type: JobType, executor: E) {
        self.inner.state.lock().registry.register(job_type, executor);
    }

    /// Make `job_type` the current job
    ///
    /// Setting up the current type again updates the payload and adds the
    /// targets; a different type starts from fresh queues.
    pub fn setup_job(
        &self,
        job_type: JobType,
        payload: Value,
        targets: Vec<TargetId>,
    ) -> Result<(), JobError> {
        let targets = dedup(targets);
        self.inner.update(|state| {
            if let Some(job) = state.job.as_ref().filter(|job| job.running) {
                return Err(JobError::AlreadyRunning(job.job_type.clone()));
            }
            if !state.registry.contains(&job_type) {
                return Err(JobError::NoExecutor(job_type));
            }

            match state.job.as_mut().filter(|job| job.job_type == job_type) {
                Some(job) => {
                    job.payload = payload;
                    state.queues.enqueue(targets.iter().cloned());
                    for target in targets {
                        if !job.targets.contains(&target) {
                            job.targets.push(target);
                        }
                    }
                }
                None => {
                    debug!(%job_type, targets = targets.len(), "Job set up");
                    state.queues = TargetQueues::seeded(targets.iter().cloned());
                    state.job = Some(UploadJob {
                        job_type,
                        payload,
                        targets,
                        running: false,
                    });
                }
            }
            Ok(())
        })
    }

    /// Start the current job; the handle resolves to its outcome
    pub fn start(&self) -> Result<JoinHandle<JobOutcome>, JobError> {
        let (job_type, payload, executor, cancel) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let Some(job) = state.job.as_mut() else {
                return Err(JobError::NoJob);
            };
            if job.running {
                return Err(JobError::AlreadyRunning(job.job_type.clone()));
            }
            if state.queues.counts().total() == 0 {
                return Err(JobError::NoTargets);
            }
            let executor = state
                .registry
                .get(&job.job_type)
                .ok_or_else(|| JobError::NoExecutor(job.job_type.clone()))?;

            let cancel = CancellationToken::new();
            job.running = true;
            state.run = Some(cancel.clone());
            state.last_flash = None;
            state.queues.reset_auto_retries();
            (
                job.job_type.clone(),
                Arc::new(job.payload.clone()),
                executor,
                cancel,
            )
        };

        let workers = self.inner.options.workers_for(executor.as_ref());
        let inner = self.inner.clone();
        Ok(tokio::spawn(inner.run(job_type, payload, executor, workers, cancel)))
    }

    /// Set up and start a job in one call
    pub fn start_job(
        &self,
        job_type: JobType,
        payload: Value,
        targets: Vec<TargetId>,
    ) -> Result<JoinHandle<JobOutcome>, JobError> {
        self.setup_job(job_type, payload, targets)?;
        self.start()
    }

    /// Ask the running job to stop; returns false if nothing is running
    pub fn cancel(&self) -> bool {
        let state = self.inner.state.lock();
        match &state.run {
            Some(token) => {
                info!("Cancelling upload job");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Move every failed target back to waiting
    pub fn retry_failed(&self) -> usize {
        self.inner.update(|state| state.queues.retry_failed())
    }

    /// Move every finished target back to waiting
    pub fn restart_successful(&self) -> usize {
        self.inner.update(|state| state.queues.restart_finished())
    }

    /// Add targets to the current job, also while it runs
    pub fn enqueue(&self, targets: Vec<TargetId>) -> Result<usize, JobError> {
        let targets = dedup(targets);
        self.inner.update(|state| {
            let Some(job) = state.job.as_mut() else {
                return Err(JobError::NoJob);
            };
            for target in &targets {
                if !job.targets.contains(target) {
                    job.targets.push(target.clone());
                }
            }
            Ok(state.queues.enqueue(targets))
        })
    }

    /// Abort the in-flight attempt for `target`, returning it to waiting
    pub fn cancel_item(&self, target: &TargetId) -> bool {
        let state = self.inner.state.lock();
        match state.item_tokens.get(target) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget the current job; refused while it runs
    pub fn clear(&self) -> Result<(), JobError> {
        self.inner.update(|state| {
            if let Some(job) = state.job.as_ref().filter(|job| job.running) {
                return Err(JobError::AlreadyRunning(job.job_type.clone()));
            }
            state.job = None;
            state.queues = TargetQueues::default();
            Ok(())
        })
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().run.is_some()
    }

    pub fn current_job(&self) -> Option<UploadJob> {
        self.inner.state.lock().job.clone()
    }

    pub fn queue_counts(&self) -> QueueCounts {
        self.inner.state.lock().queues.counts()
    }

    pub fn items(&self, kind: QueueKind) -> Vec<TargetId> {
        self.inner.state.lock().queues.items(kind)
    }

    pub fn error_for(&self, target: &TargetId) -> Option<String> {
        self.inner
            .state
            .lock()
            .queues
            .error_for(target)
            .map(str::to_string)
    }

    pub fn history(&self, job_type: &JobType) -> Option<HistoryEntry> {
        self.inner.state.lock().history.get(job_type).cloned()
    }

    /// Terminal events of every run started after subscribing
    pub fn subscribe(&self) -> broadcast::Receiver<JobFinished> {
        self.inner.finished.subscribe()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<QueueCounts> {
        self.inner.progress.subscribe()
    }
}
