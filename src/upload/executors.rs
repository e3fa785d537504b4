//! Built-in executors for show, parameter and firmware uploads
//!
//! All three talk to the fleet through the async operation tracker, so a
//! target only counts as done once the server reports the final outcome.

use super::executor::Executor;
use crate::operations::AsyncOperationTracker;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use fleet_shared::{message_type, MessageBody, TargetId};
use serde_json::{json, Value};
use tracing::debug;

/// Object command that installs a show on a vehicle
pub const SHOW_UPLOAD_COMMAND: &str = "__show_upload";

/// Default number of parallel firmware transfers
pub const FIRMWARE_CONCURRENCY: usize = 4;

/// Uploads a show description with `OBJ-CMD __show_upload`
pub struct ShowUploadExecutor {
    tracker: AsyncOperationTracker,
}

impl ShowUploadExecutor {
    pub fn new(tracker: AsyncOperationTracker) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl Executor for ShowUploadExecutor {
    async fn execute(&self, target: &TargetId, payload: &Value) -> Result<()> {
        let body = MessageBody::addressed_to(message_type::OBJ_CMD, std::slice::from_ref(target))
            .with("command", SHOW_UPLOAD_COMMAND)
            .with("kwargs", json!({ "show": payload }));

        self.tracker
            .start_operation(target, body)
            .await
            .with_context(|| format!("show upload to {} failed", target))?;
        Ok(())
    }
}

/// Writes every `name: value` pair of the payload with `PRM-SET`
pub struct ParameterUploadExecutor {
    tracker: AsyncOperationTracker,
}

impl ParameterUploadExecutor {
    pub fn new(tracker: AsyncOperationTracker) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl Executor for ParameterUploadExecutor {
    async fn execute(&self, target: &TargetId, payload: &Value) -> Result<()> {
        let Some(parameters) = payload.as_object() else {
            bail!("parameter payload must be an object of name/value pairs");
        };

        for (name, value) in parameters {
            let body = MessageBody::addressed_to(message_type::PRM_SET, std::slice::from_ref(target))
                .with("name", name.as_str())
                .with("value", value.clone());

            self.tracker
                .start_operation(target, body)
                .await
                .with_context(|| format!("setting {} on {} failed", name, target))?;
            debug!(%target, parameter = %name, "Parameter set");
        }
        Ok(())
    }
}

/// Transfers a firmware image with `FW-UPLOAD`
pub struct FirmwareUploadExecutor {
    tracker: AsyncOperationTracker,
    concurrency: usize,
}

impl FirmwareUploadExecutor {
    pub fn new(tracker: AsyncOperationTracker) -> Self {
        Self {
            tracker,
            concurrency: FIRMWARE_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

#[async_trait]
impl Executor for FirmwareUploadExecutor {
    async fn execute(&self, target: &TargetId, payload: &Value) -> Result<()> {
        let Some(blob) = payload.get("blob").and_then(Value::as_str) else {
            bail!("firmware payload has no blob");
        };

        let mut body = MessageBody::addressed_to(message_type::FW_UPLOAD, std::slice::from_ref(target))
            .with("blob", blob);
        if let Some(component) = payload.get("component").and_then(Value::as_str) {
            body = body.with("component", component);
        }

        self.tracker
            .start_operation(target, body)
            .await
            .with_context(|| format!("firmware upload to {} failed", target))?;
        Ok(())
    }

    fn concurrency(&self) -> Option<usize> {
        Some(self.concurrency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{HubConfig, MessageHub};
    use crate::operations::TrackerConfig;
    use crate::transport::{MemoryRemote, MemoryTransport};
    use std::sync::Arc;

    fn setup() -> (AsyncOperationTracker, MemoryRemote) {
        let hub = MessageHub::new(HubConfig::default());
        let (transport, remote) = MemoryTransport::pair("test");
        hub.attach(Arc::new(transport));
        (AsyncOperationTracker::new(hub, TrackerConfig::default()), remote)
    }

    fn result_for(kind: &str, target: &str) -> MessageBody {
        let mut result = serde_json::Map::new();
        result.insert(target.to_string(), Value::Bool(true));
        MessageBody::new(kind).with("result", result)
    }

    #[tokio::test]
    async fn test_show_upload_request() {
        let (tracker, mut remote) = setup();
        let executor = ShowUploadExecutor::new(tracker);
        let task = tokio::spawn(async move {
            executor
                .execute(&TargetId::from("uav-1"), &json!({ "duration": 90 }))
                .await
        });

        let request = remote.recv().await.unwrap();
        assert_eq!(request.kind(), message_type::OBJ_CMD);
        assert_eq!(request.body.get("command"), Some(&json!(SHOW_UPLOAD_COMMAND)));
        assert_eq!(
            request.body.get("kwargs"),
            Some(&json!({ "show": { "duration": 90 } }))
        );
        remote.reply(&request, result_for(message_type::OBJ_CMD, "uav-1"));

        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_show_upload_failure_carries_reason() {
        let (tracker, mut remote) = setup();
        let executor = ShowUploadExecutor::new(tracker);
        let task = tokio::spawn(async move {
            executor.execute(&TargetId::from("uav-1"), &Value::Null).await
        });

        let request = remote.recv().await.unwrap();
        remote.reply(
            &request,
            MessageBody::new(message_type::OBJ_CMD).with("error", json!({ "uav-1": "battery low" })),
        );

        let error = task.await.unwrap().unwrap_err();
        assert!(format!("{:#}", error).contains("battery low"));
    }

    #[tokio::test]
    async fn test_parameters_sent_one_by_one() {
        let (tracker, mut remote) = setup();
        let executor = ParameterUploadExecutor::new(tracker);
        let task = tokio::spawn(async move {
            executor
                .execute(&TargetId::from("uav-1"), &json!({ "A": 1, "B": 2 }))
                .await
        });

        let mut names = Vec::new();
        for _ in 0..2 {
            let request = remote.recv().await.unwrap();
            assert_eq!(request.kind(), message_type::PRM_SET);
            names.push(request.body.get("name").unwrap().as_str().unwrap().to_string());
            remote.reply(&request, result_for(message_type::PRM_SET, "uav-1"));
        }

        assert!(task.await.unwrap().is_ok());
        assert_eq!(names, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_parameter_payload_must_be_object() {
        let (tracker, _remote) = setup();
        let executor = ParameterUploadExecutor::new(tracker);
        assert!(executor
            .execute(&TargetId::from("uav-1"), &json!([1, 2]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_firmware_concurrency() {
        let (tracker, _remote) = setup();
        let executor = FirmwareUploadExecutor::new(tracker.clone());
        assert_eq!(executor.concurrency(), Some(FIRMWARE_CONCURRENCY));
        let executor = FirmwareUploadExecutor::new(tracker).with_concurrency(0);
        assert_eq!(executor.concurrency(), Some(1));
        assert!(executor
            .execute(&TargetId::from("uav-1"), &json!({}))
            .await
            .is_err());
    }
}
