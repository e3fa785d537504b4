use anyhow::{bail, Result};
use fleet_shared::TargetId;
use ground_station::connection::{ConnectionConfig, ConnectionEvent, ConnectionManager};
use ground_station::upload::{
    ExecutorRegistry, FirmwareUploadExecutor, ParameterUploadExecutor, ShowUploadExecutor,
};
use ground_station::{
    AsyncOperationTracker, HubConfig, JobType, MessageHub, TrackerConfig, UploadOptions,
    UploadOrchestrator,
};
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let mut args = std::env::args().skip(1);
    let config = ConnectionConfig {
        server_addr: args.next().unwrap_or_else(|| "127.0.0.1:5000".into()),
        ..Default::default()
    };
    let mut targets: Vec<TargetId> = args.map(TargetId::from).collect();
    if targets.is_empty() {
        targets = (1..=10).map(|n| TargetId::new(format!("uav-{:02}", n))).collect();
    }

    info!("Ground station starting");

    let hub = MessageHub::new(HubConfig::default());
    let tracker = AsyncOperationTracker::new(hub.clone(), TrackerConfig::default());

    let mut registry = ExecutorRegistry::new();
    registry.register(JobType::SHOW_UPLOAD, ShowUploadExecutor::new(tracker.clone()));
    registry.register(JobType::PARAMETER_UPLOAD, ParameterUploadExecutor::new(tracker.clone()));
    registry.register(JobType::FIRMWARE_UPDATE, FirmwareUploadExecutor::new(tracker));
    let job_types: Vec<&str> = registry.job_types().map(JobType::as_str).collect();
    info!("  Job types: {}", job_types.join(", "));

    let options = UploadOptions {
        auto_retry: true,
        flash_lights_on_failure: true,
        ..Default::default()
    };
    let orchestrator = UploadOrchestrator::new(hub.clone(), registry, options);

    let mut conn = ConnectionManager::start(config, hub.clone());
    info!("  Fleet server: {}", conn.server_addr());

    // Wait for the first connection
    loop {
        match conn.recv().await {
            Some(ConnectionEvent::Connected { address }) => {
                info!("Connected to {}", address);
                break;
            }
            Some(ConnectionEvent::ConnectionFailed { reason }) => {
                warn!("Connection failed: {}", reason);
            }
            Some(ConnectionEvent::Disconnected { reason }) => {
                warn!("Disconnected: {}", reason);
            }
            None => bail!("Connection manager closed"),
        }
    }

    let mut progress = orchestrator.subscribe_progress();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let counts = *progress.borrow();
            info!(
                "Upload progress: waiting={} queued={} in_progress={} finished={} failed={}",
                counts.waiting_to_start,
                counts.queued,
                counts.in_progress,
                counts.finished,
                counts.failed
            );
        }
    });

    let show = json!({ "name": "demo", "duration": 120 });
    let job = orchestrator.start_job(JobType::SHOW_UPLOAD, show, targets)?;
    let outcome = job.await?;
    info!("Show upload finished: {}", outcome);

    for target in orchestrator.items(ground_station::upload::QueueKind::Failed) {
        if let Some(reason) = orchestrator.error_for(&target) {
            error!("  {}: {}", target, reason);
        }
    }

    conn.shutdown().await;
    hub.dispose();
    Ok(())
}
