//! Bulk uploads across many targets
//!
//! This module handles:
//! - Per-target queue state (waiting, queued, in progress, finished, failed)
//! - A bounded worker pool fed through a capacity-1 hand-off channel
//! - Automatic and manual retry, job cancellation and per-item cancellation
//! - Executors per job type, including the built-in show/parameter/firmware uploads

mod executor;
mod executors;
mod job;
mod orchestrator;
mod queues;

pub use executor::{Executor, ExecutorRegistry};
pub use executors::{
    FirmwareUploadExecutor, ParameterUploadExecutor, ShowUploadExecutor, FIRMWARE_CONCURRENCY,
    SHOW_UPLOAD_COMMAND,
};
pub use job::{HistoryEntry, JobError, JobFinished, JobHistory, JobOutcome, JobType, UploadJob};
pub use orchestrator::{UploadOptions, UploadOrchestrator};
pub use queues::{QueueCounts, QueueKind, TargetQueues};
