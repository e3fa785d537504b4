//! Upload jobs, their outcomes and history

use fleet_shared::{now_ms, TargetId};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Job type tag, the key of the executor registry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobType(Cow<'static, str>);

impl JobType {
    pub const SHOW_UPLOAD: JobType = JobType(Cow::Borrowed("show-upload"));
    pub const PARAMETER_UPLOAD: JobType = JobType(Cow::Borrowed("param-upload"));
    pub const FIRMWARE_UPDATE: JobType = JobType(Cow::Borrowed("firmware-update"));

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// The job currently set up in the orchestrator
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub job_type: JobType,
    pub payload: Value,
    pub targets: Vec<TargetId>,
    pub running: bool,
}

/// Terminal result of a job run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// No target ended up failed
    Success,
    /// At least one target ended up failed
    Error,
    /// The run was cancelled before it completed
    Cancelled,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Success => f.write_str("success"),
            JobOutcome::Error => f.write_str("error"),
            JobOutcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Event broadcast when a job run terminates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFinished {
    pub job_type: JobType,
    pub success: bool,
    pub cancelled: bool,
}

impl JobFinished {
    pub fn new(job_type: JobType, outcome: JobOutcome) -> Self {
        Self {
            job_type,
            success: outcome == JobOutcome::Success,
            cancelled: outcome == JobOutcome::Cancelled,
        }
    }

    pub fn outcome(&self) -> JobOutcome {
        match (self.success, self.cancelled) {
            (_, true) => JobOutcome::Cancelled,
            (true, false) => JobOutcome::Success,
            (false, false) => JobOutcome::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub job_type: JobType,
    pub payload: Value,
    pub result: JobOutcome,
    pub finished_at_ms: u64,
}

/// Latest outcome per job type
#[derive(Debug, Clone, Default)]
pub struct JobHistory {
    entries: HashMap<JobType, HistoryEntry>,
}

impl JobHistory {
    /// Record a finished run, replacing the previous entry of the same type
    pub fn record(&mut self, job_type: JobType, payload: Value, result: JobOutcome) {
        let entry = HistoryEntry {
            job_type: job_type.clone(),
            payload,
            result,
            finished_at_ms: now_ms(),
        };
        self.entries.insert(job_type, entry);
    }

    pub fn get(&self, job_type: &JobType) -> Option<&HistoryEntry> {
        self.entries.get(job_type)
    }
}

/// Why a job could not be set up or started
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("a {0} job is already running")]
    AlreadyRunning(JobType),

    #[error("no executor registered for job type {0}")]
    NoExecutor(JobType),

    #[error("no job has been set up")]
    NoJob,

    #[error("job has no targets")]
    NoTargets,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_job_types() {
        assert_eq!(JobType::SHOW_UPLOAD, JobType::from("show-upload"));
        assert_eq!(JobType::FIRMWARE_UPDATE.to_string(), "firmware-update");
        assert_ne!(JobType::SHOW_UPLOAD, JobType::PARAMETER_UPLOAD);
    }

    #[test]
    fn test_finished_event_flags() {
        for outcome in [JobOutcome::Success, JobOutcome::Error, JobOutcome::Cancelled] {
            let event = JobFinished::new(JobType::SHOW_UPLOAD, outcome);
            assert_eq!(event.outcome(), outcome);
        }
        let event = JobFinished::new(JobType::SHOW_UPLOAD, JobOutcome::Cancelled);
        assert!(event.cancelled && !event.success);
    }

    #[test]
    fn test_history_keeps_latest_per_type() {
        let mut history = JobHistory::default();
        history.record(JobType::SHOW_UPLOAD, json!({ "v": 1 }), JobOutcome::Error);
        history.record(JobType::SHOW_UPLOAD, json!({ "v": 2 }), JobOutcome::Success);
        history.record(JobType::PARAMETER_UPLOAD, json!({}), JobOutcome::Cancelled);

        assert_eq!(
            history.get(&JobType::PARAMETER_UPLOAD).unwrap().result,
            JobOutcome::Cancelled
        );
        assert!(history.get(&JobType::FIRMWARE_UPDATE).is_none());
        let entry = history.get(&JobType::SHOW_UPLOAD).unwrap();
        assert_eq!(entry.payload, json!({ "v": 2 }));
        assert_eq!(entry.result, JobOutcome::Success);
    }
}
