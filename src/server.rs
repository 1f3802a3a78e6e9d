//! Server bootstrap: wires the embedded store, WAL, orchestrator, recovery,
//! and cleanup manager together, then starts the REST listener.

use crate::api::rest::{create_rest_router, ApiState};
use crate::config::Config;
use crate::core::checkpoint::{CheckpointStore, Checkpointer};
use crate::core::cleanup::CleanupManager;
use crate::core::compensation::{CompensationExecutor, IdempotencyStore};
use crate::core::events::SubscriberRegistry;
use crate::core::lane_manager::LaneManager;
use crate::core::orchestrator::SagaOrchestrator;
use crate::core::recovery::RecoveryManager;
use crate::core::wal::Wal;
use crate::storage::KvStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Starts laneforge: opens the embedded store, replays the WAL-backed
/// state, recovers any in-flight sagas, starts the cleanup sweep, and
/// serves the REST API until the process is asked to shut down.
pub async fn start_server(
    verbose: bool,
    quiet: bool,
    host: String,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::load().unwrap_or_default();
    config.server.host = host;
    config.server.port = port;

    if verbose {
        tracing::info!(host = %config.server.host, port = config.server.port, "starting laneforge");
    }

    let kv = Arc::new(KvStore::open(&config.storage.data_dir)?);

    let wal = Wal::new(kv.clone(), config.wal.write_mode.into(), config.wal.async_queue_size);
    let checkpoint_store = CheckpointStore::new(kv.clone());
    let checkpointer = Arc::new(Checkpointer::new(CheckpointStore::new(kv.clone())));
    let saga_store = Arc::new(crate::core::saga_store::SagaStore::new(kv.clone()));
    let idempotency = Arc::new(IdempotencyStore::new(kv.clone()));
    let compensation = Arc::new(CompensationExecutor::new(wal.clone(), idempotency));

    let orchestrator = SagaOrchestrator::new(
        wal.clone(),
        Some(checkpointer),
        Some(saga_store.clone()),
        compensation.clone(),
        config.orchestrator.max_concurrent_sagas,
    );

    let events = SubscriberRegistry::new(256);
    orchestrator.set_event_registry(events.clone());
    compensation.set_event_registry(events);

    let checkpoints = Arc::new(checkpoint_store);
    let recovery = RecoveryManager::new(checkpoints.clone(), orchestrator.clone());
    match recovery.recover_all().await {
        Ok(report) => {
            if !quiet {
                tracing::info!(
                    success = report.outcomes.success,
                    failed = report.outcomes.failed,
                    skipped = report.outcomes.skipped,
                    "startup recovery complete"
                );
            }
        }
        Err(e) => tracing::error!(error = %e, "startup recovery failed"),
    }

    let cleanup = CleanupManager::new(
        wal,
        checkpoints,
        saga_store.clone(),
        Duration::from_secs(config.cleanup.interval_secs),
        Duration::from_secs(config.cleanup.retention_secs),
    );
    cleanup.start()?;

    let lane_manager = LaneManager::new();

    let api_state = ApiState {
        orchestrator,
        saga_store,
        lane_manager,
    };

    let app = create_rest_router(api_state);
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = TcpListener::bind(&addr).await?;

    if !quiet {
        tracing::info!(%addr, "REST server listening");
    }

    axum::serve(listener, app).await?;
    Ok(())
}
