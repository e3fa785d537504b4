//! Per-job-type executors and their registry

use super::job::JobType;
use async_trait::async_trait;
use fleet_shared::TargetId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Applies one job to one target
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Run the job for `target`; an error marks the target as failed
    async fn execute(&self, target: &TargetId, payload: &Value) -> anyhow::Result<()>;

    /// Preferred number of workers, if the executor has one
    fn concurrency(&self) -> Option<usize> {
        None
    }
}

/// Executors keyed by job type
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<JobType, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` for `job_type`, returning the one it replaces
    pub fn register<E: Executor>(&mut self, job_type: JobType, executor: E) -> Option<Arc<dyn Executor>> {
        self.register_arc(job_type, Arc::new(executor))
    }

    pub fn register_arc(
        &mut self,
        job_type: JobType,
        executor: Arc<dyn Executor>,
    ) -> Option<Arc<dyn Executor>> {
        self.executors.insert(job_type, executor)
    }

    pub fn get(&self, job_type: &JobType) -> Option<Arc<dyn Executor>> {
        self.executors.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &JobType) -> bool {
        self.executors.contains_key(job_type)
    }

    pub fn job_types(&self) -> impl Iterator<Item = &JobType> {
        self.executors.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(Option<usize>);

    #[async_trait]
    impl Executor for Noop {
        async fn execute(&self, _target: &TargetId, _payload: &Value) -> anyhow::Result<()> {
            Ok(())
        }

        fn concurrency(&self) -> Option<usize> {
            self.0
        }
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let mut registry = ExecutorRegistry::new();
        assert!(registry.register(JobType::SHOW_UPLOAD, Noop(None)).is_none());
        assert!(registry.register(JobType::SHOW_UPLOAD, Noop(Some(2))).is_some());

        let executor = registry.get(&JobType::SHOW_UPLOAD).unwrap();
        assert_eq!(executor.concurrency(), Some(2));
        executor
            .execute(&TargetId::from("uav-1"), &Value::Null)
            .await
            .unwrap();

        assert!(!registry.contains(&JobType::FIRMWARE_UPDATE));
        assert_eq!(registry.job_types().count(), 1);
    }
}
