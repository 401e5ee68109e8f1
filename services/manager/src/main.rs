//! holdfast storage manager
//!
//! Serves the control API, owns one actor per volume and drives the
//! periodic reconciliation of replicas, rebuilds and restores.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use holdfast_manager::{
    actors::VolumeDeps,
    api,
    backupstore::MemoryBackupStore,
    config::Config,
    events::EventBus,
    manager::VolumeManager,
    model::{percent_of, DiskSpec, NodeSpec},
    runtime::MockRuntime,
    scheduler::ReplicaScheduler,
    settings::{self, Settings},
    state::AppState,
};
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to HOLDFAST_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting holdfast manager");
    info!(
        listen_addr = %config.listen_addr,
        node = %config.node_id,
        data_dir = %config.data_dir.display(),
        "Configuration loaded"
    );

    let mut initial = Settings::default();
    if let Some(target) = &config.backup_target {
        initial.set(settings::BACKUP_TARGET, target)?;
    }
    let reserved_pct = initial.storage_reserved_percentage_for_default_disk;
    let shared_settings = initial.shared();

    let scheduler = ReplicaScheduler::new(
        Arc::new(RwLock::new(BTreeMap::new())),
        shared_settings.clone(),
    );
    let deps = VolumeDeps {
        runtime: Arc::new(MockRuntime::new()),
        backups: Arc::new(MemoryBackupStore::new()),
        scheduler,
        settings: shared_settings,
        events: EventBus::new(),
        local_node: config.node_id.clone(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = VolumeManager::new(deps, shutdown_rx.clone());

    // Register the local node with its default disk
    let mut disks = BTreeMap::new();
    disks.insert(
        "default-disk".to_string(),
        DiskSpec {
            path: config.data_dir.to_string_lossy().into_owned(),
            storage_maximum: config.disk_capacity,
            storage_reserved: percent_of(config.disk_capacity, reserved_pct),
            allow_scheduling: true,
            tags: Vec::new(),
        },
    );
    manager
        .node_create(NodeSpec {
            name: config.node_id.clone(),
            address: config.node_address.clone(),
            allow_scheduling: true,
            tags: Vec::new(),
            disks,
        })
        .await?;

    let reconciler = manager.spawn_reconciler(config.reconcile_interval, shutdown_rx.clone());

    let app = api::create_router(AppState::new(Arc::clone(&manager)));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    let shutdown_timeout = std::time::Duration::from_secs(10);
    if tokio::time::timeout(shutdown_timeout, reconciler).await.is_err() {
        warn!("Reconciler did not shut down in time");
    }
    manager.shutdown().await;

    info!("Manager shutdown complete");
    Ok(())
}
