//! In-process manager for tests: the real router on `127.0.0.1:0` backed
//! by the mock runtime and the in-memory backup store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use holdfast_id::NodeName;
use holdfast_manager::actors::VolumeDeps;
use holdfast_manager::api;
use holdfast_manager::backupstore::MemoryBackupStore;
use holdfast_manager::events::EventBus;
use holdfast_manager::manager::VolumeManager;
use holdfast_manager::model::{DiskSpec, NodeSpec};
use holdfast_manager::runtime::MockRuntime;
use holdfast_manager::scheduler::ReplicaScheduler;
use holdfast_manager::settings::Settings;
use holdfast_manager::state::AppState;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};

use crate::client::ManagerClient;

/// Name of the disk every test node starts with.
pub const DEFAULT_DISK: &str = "default-disk";

#[derive(Debug, Clone)]
pub struct TestServerConfig {
    pub nodes: usize,
    pub disk_capacity: u64,
    pub job_step: Duration,
    pub reconcile_interval: Duration,
}

impl Default for TestServerConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            disk_capacity: 1 << 30,
            job_step: Duration::from_millis(5),
            reconcile_interval: Duration::from_millis(20),
        }
    }
}

pub struct TestServer {
    pub base_url: String,
    pub manager: Arc<VolumeManager>,
    pub runtime: Arc<MockRuntime>,
    shutdown: watch::Sender<bool>,
    _disks: tempfile::TempDir,
}

impl TestServer {
    pub async fn start() -> std::io::Result<Self> {
        Self::start_with(TestServerConfig::default()).await
    }

    /// Registers `config.nodes` nodes named `node-1..` with one disk each
    /// under a fresh temporary directory.
    pub async fn start_with(config: TestServerConfig) -> std::io::Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info,holdfast_manager=debug".into()),
            )
            .with_test_writer()
            .try_init();

        let disks = tempfile::tempdir()?;
        let settings = Settings::default().shared();
        let scheduler = ReplicaScheduler::new(Arc::new(RwLock::new(BTreeMap::new())), settings.clone());
        let runtime = Arc::new(MockRuntime::new().with_step_delay(config.job_step));
        let deps = VolumeDeps {
            runtime: runtime.clone(),
            backups: Arc::new(MemoryBackupStore::new()),
            scheduler,
            settings,
            events: EventBus::new(),
            local_node: node_name(1),
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let manager = VolumeManager::new(deps, shutdown_rx.clone());
        manager.spawn_reconciler(config.reconcile_interval, shutdown_rx.clone());

        for i in 1..=config.nodes {
            let name = node_name(i);
            let mut node_disks = BTreeMap::new();
            node_disks.insert(
                DEFAULT_DISK.to_string(),
                DiskSpec {
                    path: disks.path().join(name.as_str()).to_string_lossy().into_owned(),
                    storage_maximum: config.disk_capacity,
                    storage_reserved: 0,
                    allow_scheduling: true,
                    tags: Vec::new(),
                },
            );
            manager
                .node_create(NodeSpec {
                    name,
                    address: format!("10.0.0.{i}"),
                    allow_scheduling: true,
                    tags: Vec::new(),
                    disks: node_disks,
                })
                .await
                .map_err(std::io::Error::other)?;
        }

        let app = api::create_router(AppState::new(Arc::clone(&manager)));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let mut server_shutdown = shutdown_rx;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    while !*server_shutdown.borrow() {
                        if server_shutdown.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await;
        });

        Ok(Self {
            base_url: format!("http://{addr}"),
            manager,
            runtime,
            shutdown,
            _disks: disks,
        })
    }

    pub fn client(&self) -> ManagerClient {
        ManagerClient::new(self.base_url.clone())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// `node-<i>`, the name of the i-th test node.
pub fn node_name(i: usize) -> NodeName {
    NodeName::parse(&format!("node-{i}")).unwrap_or_else(|_| unreachable!("node-N is a valid name"))
}
