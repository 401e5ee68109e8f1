//! In-memory instance runtime for tests and development.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use holdfast_events::ReplicaMode;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    BackupJob, EngineProcessSpec, InstanceInfo, InstanceKind, InstanceRuntime, JobEvent, JobKind,
    JobReport, PurgeJob, RebuildJob, ReplicaProcessSpec, ReportSink, RestoreJob, Result,
    RuntimeError,
};
use crate::image::SparseImage;

const DEFAULT_STEP_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct MockReplica {
    volume: String,
    instance_manager: String,
    running: bool,
    image: SparseImage,
    snapshots: BTreeMap<String, SparseImage>,
}

#[derive(Debug)]
struct MockEngine {
    volume: String,
    instance_manager: String,
    endpoint: String,
    size: u64,
    replicas: BTreeMap<String, ReplicaMode>,
}

#[derive(Debug, Default)]
struct MockState {
    replicas: BTreeMap<String, MockReplica>,
    engines: BTreeMap<String, MockEngine>,
}

impl MockState {
    fn engine(&self, name: &str) -> Result<&MockEngine> {
        self.engines
            .get(name)
            .ok_or_else(|| RuntimeError::InstanceNotFound {
                kind: InstanceKind::Engine,
                name: name.to_string(),
            })
    }

    fn engine_mut(&mut self, name: &str) -> Result<&mut MockEngine> {
        self.engines
            .get_mut(name)
            .ok_or_else(|| RuntimeError::InstanceNotFound {
                kind: InstanceKind::Engine,
                name: name.to_string(),
            })
    }

    fn replica(&self, name: &str) -> Result<&MockReplica> {
        self.replicas
            .get(name)
            .ok_or_else(|| RuntimeError::InstanceNotFound {
                kind: InstanceKind::Replica,
                name: name.to_string(),
            })
    }

    fn replica_mut(&mut self, name: &str) -> Result<&mut MockReplica> {
        self.replicas
            .get_mut(name)
            .ok_or_else(|| RuntimeError::InstanceNotFound {
                kind: InstanceKind::Replica,
                name: name.to_string(),
            })
    }

    /// Replicas of an engine that take writes.
    fn writable(&self, engine: &MockEngine) -> Vec<String> {
        engine
            .replicas
            .iter()
            .filter(|(_, mode)| **mode != ReplicaMode::Error)
            .filter(|(name, _)| self.replicas.get(*name).is_some_and(|r| r.running))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn readable(&self, engine_name: &str) -> Result<&MockReplica> {
        let engine = self.engine(engine_name)?;
        engine
            .replicas
            .iter()
            .filter(|(_, mode)| **mode == ReplicaMode::ReadWrite)
            .filter_map(|(name, _)| self.replicas.get(name))
            .find(|r| r.running)
            .ok_or_else(|| RuntimeError::NoReadableReplica(engine_name.to_string()))
    }
}

/// Mock runtime for testing and development.
///
/// Replica data outlives the replica process, so a crashed replica can be
/// restarted with its image intact. Jobs report progress in quarter steps.
#[derive(Clone)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
    step_delay: Duration,
    fail_next_rebuild: Arc<AtomicBool>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            step_delay: DEFAULT_STEP_DELAY,
            fail_next_rebuild: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets the delay between job progress reports.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Makes the next rebuild fail once it reaches the copy step.
    pub fn fail_next_rebuild(&self) {
        self.fail_next_rebuild.store(true, Ordering::SeqCst);
    }

    fn spawn_job<F, Fut>(&self, kind: JobKind, replica: String, sink: ReportSink, work: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        let delay = self.step_delay;
        tokio::spawn(async move {
            for progress in [25, 50, 75] {
                tokio::time::sleep(delay).await;
                let report = JobReport {
                    kind: kind.clone(),
                    replica: replica.clone(),
                    event: JobEvent::Progress(progress),
                };
                if sink.send(report).is_err() {
                    debug!(replica = %replica, "[MOCK] Job sink closed, abandoning job");
                    return;
                }
            }
            tokio::time::sleep(delay).await;

            let event = match work().await {
                Ok(()) => JobEvent::Completed,
                Err(error) => {
                    warn!(replica = %replica, error = %error, "[MOCK] Job failed");
                    JobEvent::Failed(error)
                }
            };
            let _ = sink.send(JobReport {
                kind,
                replica,
                event,
            });
        });
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceRuntime for MockRuntime {
    async fn start_replica(&self, spec: &ReplicaProcessSpec) -> Result<()> {
        info!(
            replica = %spec.name,
            volume = %spec.volume,
            instance_manager = %spec.instance_manager,
            "[MOCK] Starting replica"
        );
        let mut state = self.state.lock().await;
        let replica = state
            .replicas
            .entry(spec.name.clone())
            .or_insert_with(|| MockReplica {
                volume: spec.volume.clone(),
                instance_manager: spec.instance_manager.clone(),
                running: false,
                image: SparseImage::new(spec.size),
                snapshots: BTreeMap::new(),
            });
        replica.running = true;
        replica.instance_manager = spec.instance_manager.clone();
        Ok(())
    }

    async fn stop_replica(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(replica) = state.replicas.get_mut(name) {
            replica.running = false;
            debug!(replica = %name, "[MOCK] Replica stopped");
        }
        Ok(())
    }

    async fn remove_replica_data(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.replicas.remove(name).is_some() {
            debug!(replica = %name, "[MOCK] Replica data removed");
        }
        Ok(())
    }

    async fn start_engine(&self, spec: &EngineProcessSpec) -> Result<String> {
        info!(
            engine = %spec.name,
            volume = %spec.volume,
            instance_manager = %spec.instance_manager,
            replicas = spec.replicas.len(),
            "[MOCK] Starting engine"
        );
        let mut state = self.state.lock().await;
        for replica in &spec.replicas {
            if !state.replica(replica)?.running {
                return Err(RuntimeError::NotRunning(replica.clone()));
            }
        }
        state.engines.insert(
            spec.name.clone(),
            MockEngine {
                volume: spec.volume.clone(),
                instance_manager: spec.instance_manager.clone(),
                endpoint: spec.endpoint.clone(),
                size: spec.size,
                replicas: spec
                    .replicas
                    .iter()
                    .map(|r| (r.clone(), ReplicaMode::ReadWrite))
                    .collect(),
            },
        );
        Ok(spec.endpoint.clone())
    }

    async fn stop_engine(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(engine) = state.engines.remove(name) {
            debug!(engine = %name, endpoint = %engine.endpoint, "[MOCK] Engine stopped");
        }
        Ok(())
    }

    async fn list_instances(&self, instance_manager: &str) -> Result<Vec<InstanceInfo>> {
        let state = self.state.lock().await;
        let engines = state
            .engines
            .iter()
            .filter(|(_, e)| e.instance_manager == instance_manager)
            .map(|(name, e)| InstanceInfo {
                name: name.clone(),
                kind: InstanceKind::Engine,
                volume: e.volume.clone(),
                running: true,
            });
        let replicas = state
            .replicas
            .iter()
            .filter(|(_, r)| r.running && r.instance_manager == instance_manager)
            .map(|(name, r)| InstanceInfo {
                name: name.clone(),
                kind: InstanceKind::Replica,
                volume: r.volume.clone(),
                running: true,
            });
        Ok(engines.chain(replicas).collect())
    }

    async fn delete_instance(&self, instance_manager: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        let is_engine = state
            .engines
            .get(name)
            .is_some_and(|e| e.instance_manager == instance_manager);
        if is_engine {
            state.engines.remove(name);
            info!(engine = %name, "[MOCK] Engine process killed");
            return Ok(());
        }

        match state.replicas.get_mut(name) {
            Some(replica) if replica.running && replica.instance_manager == instance_manager => {
                replica.running = false;
            }
            _ => {
                return Err(RuntimeError::InstanceNotFound {
                    kind: InstanceKind::Replica,
                    name: name.to_string(),
                })
            }
        }
        for engine in state.engines.values_mut() {
            if let Some(mode) = engine.replicas.get_mut(name) {
                *mode = ReplicaMode::Error;
            }
        }
        info!(replica = %name, "[MOCK] Replica process killed");
        Ok(())
    }

    async fn engine_replicas(&self, engine: &str) -> Result<BTreeMap<String, ReplicaMode>> {
        let state = self.state.lock().await;
        Ok(state.engine(engine)?.replicas.clone())
    }

    async fn add_replica(&self, engine: &str, replica: &str, mode: ReplicaMode) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.replica(replica)?.running {
            return Err(RuntimeError::NotRunning(replica.to_string()));
        }
        state
            .engine_mut(engine)?
            .replicas
            .insert(replica.to_string(), mode);
        Ok(())
    }

    async fn remove_replica(&self, engine: &str, replica: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.engine_mut(engine)?.replicas.remove(replica);
        Ok(())
    }

    async fn set_replica_mode(
        &self,
        engine: &str,
        replica: &str,
        mode: ReplicaMode,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .engine_mut(engine)?
            .replicas
            .get_mut(replica)
            .ok_or_else(|| RuntimeError::NotInEngine {
                engine: engine.to_string(),
                replica: replica.to_string(),
            })?;
        *entry = mode;
        Ok(())
    }

    async fn snapshot(&self, engine: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let targets = state.writable(state.engine(engine)?);
        for replica in targets {
            let replica = state.replica_mut(&replica)?;
            let image = replica.image.clone();
            replica.snapshots.insert(name.to_string(), image);
        }
        debug!(engine = %engine, snapshot = %name, "[MOCK] Snapshot taken");
        Ok(())
    }

    async fn expand_replica(&self, replica: &str, size: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        // A replica that never started has no image yet; it is created at
        // the committed size on first start.
        if let Some(replica) = state.replicas.get_mut(replica) {
            replica.image.resize(size);
        }
        Ok(())
    }

    async fn start_rebuild(&self, job: RebuildJob, sink: ReportSink) -> Result<()> {
        {
            let state = self.state.lock().await;
            state.replica(&job.from_replica)?;
            state.replica(&job.replica)?;
            state.engine(&job.engine)?;
        }
        info!(
            replica = %job.replica,
            from = %job.from_replica,
            "[MOCK] Starting rebuild"
        );

        let state = self.state.clone();
        let fail = self.fail_next_rebuild.swap(false, Ordering::SeqCst);
        let RebuildJob {
            engine,
            replica,
            from_replica,
        } = job;
        let target = replica.clone();
        self.spawn_job(JobKind::Rebuild, replica, sink, move || async move {
            let mut state = state.lock().await;
            if fail {
                if let Some(mode) = state
                    .engines
                    .get_mut(&engine)
                    .and_then(|e| e.replicas.get_mut(&target))
                {
                    *mode = ReplicaMode::Error;
                }
                return Err("injected rebuild failure".to_string());
            }

            let (image, snapshots) = {
                let source = state.replica(&from_replica).map_err(|e| e.to_string())?;
                if !source.running {
                    return Err(format!("source replica {from_replica} is not running"));
                }
                (source.image.clone(), source.snapshots.clone())
            };
            let replica = state.replica_mut(&target).map_err(|e| e.to_string())?;
            replica.image = image;
            replica.snapshots = snapshots;

            let mode = state
                .engines
                .get_mut(&engine)
                .and_then(|e| e.replicas.get_mut(&target))
                .ok_or_else(|| format!("replica {target} left engine {engine} during rebuild"))?;
            *mode = ReplicaMode::ReadWrite;
            Ok::<(), String>(())
        });
        Ok(())
    }

    async fn start_backup(&self, job: BackupJob, sink: ReportSink) -> Result<()> {
        let image = {
            let state = self.state.lock().await;
            state.engine(&job.engine)?;
            state
                .replica(&job.replica)?
                .snapshots
                .get(&job.snapshot)
                .cloned()
                .ok_or_else(|| RuntimeError::SnapshotNotFound(job.snapshot.clone()))?
        };
        info!(
            snapshot = %job.snapshot,
            backup = %job.backup.name,
            "[MOCK] Starting backup"
        );

        let BackupJob {
            replica,
            target,
            backup,
            store,
            ..
        } = job;
        let kind = JobKind::Backup {
            backup: backup.name.clone(),
        };
        self.spawn_job(kind, replica, sink, move || async move {
            store
                .create_backup(&target, backup, image)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        });
        Ok(())
    }

    async fn start_restore(&self, job: RestoreJob, sink: ReportSink) -> Result<()> {
        self.state.lock().await.replica(&job.replica)?;
        info!(replica = %job.replica, backup = %job.backup_url, "[MOCK] Starting restore");

        let state = self.state.clone();
        let RestoreJob {
            replica,
            backup_url,
            store,
        } = job;
        let target = replica.clone();
        let kind = JobKind::Restore {
            backup_url: backup_url.clone(),
        };
        self.spawn_job(kind, replica, sink, move || async move {
            let (_, mut image) = store
                .read_backup_image(&backup_url)
                .await
                .map_err(|e| e.to_string())?;
            let mut state = state.lock().await;
            let replica = state.replica_mut(&target).map_err(|e| e.to_string())?;
            if image.size() < replica.image.size() {
                image.resize(replica.image.size());
            }
            replica.image = image;
            Ok::<(), String>(())
        });
        Ok(())
    }

    async fn start_purge(&self, job: PurgeJob, sink: ReportSink) -> Result<()> {
        self.state.lock().await.replica(&job.replica)?;

        let state = self.state.clone();
        let PurgeJob {
            replica,
            snapshots,
        } = job;
        let target = replica.clone();
        self.spawn_job(JobKind::Purge, replica, sink, move || async move {
            let mut state = state.lock().await;
            let replica = state.replica_mut(&target).map_err(|e| e.to_string())?;
            for snapshot in &snapshots {
                replica.snapshots.remove(snapshot);
            }
            Ok::<(), String>(())
        });
        Ok(())
    }

    async fn write_at(&self, engine: &str, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().await;
        let (size, targets) = {
            let e = state.engine(engine)?;
            (e.size, state.writable(e))
        };
        let out_of_range = || RuntimeError::OutOfRange {
            offset,
            len: data.len() as u64,
            size,
        };
        if offset.saturating_add(data.len() as u64) > size {
            return Err(out_of_range());
        }
        if targets.is_empty() {
            return Err(RuntimeError::NoReadableReplica(engine.to_string()));
        }
        for name in targets {
            if !state.replica_mut(&name)?.image.write_at(offset, data) {
                return Err(out_of_range());
            }
        }
        Ok(())
    }

    async fn read_at(&self, engine: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let state = self.state.lock().await;
        let size = state.engine(engine)?.size;
        state
            .readable(engine)?
            .image
            .read_at(offset, len)
            .ok_or(RuntimeError::OutOfRange {
                offset,
                len: len as u64,
                size,
            })
    }

    async fn checksum(&self, engine: &str) -> Result<String> {
        let state = self.state.lock().await;
        Ok(state.readable(engine)?.image.checksum())
    }
}
