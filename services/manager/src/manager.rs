//! Volume manager: the façade every control operation goes through.
//!
//! Each volume is owned by a [`VolumeActor`]. The manager keeps the actor
//! handles and the `watch` receivers of their views, so reads never queue
//! behind slow work while writes are serialized per volume.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use holdfast_events::Frontend;
use holdfast_id::{NodeName, VolumeName};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::actors::framework::{ActorError, ActorHandle, Supervisor};
use crate::actors::volume::{schedule_missing, Reply, VolumeActor, VolumeDeps, VolumeMessage};
use crate::backupstore::{parse_backup_url, Backup, BackupTarget, BackupVolume};
use crate::error::{ManagerError, Result};
use crate::events::VolumeEnvelope;
use crate::model::{
    DiskSpec, Node, NodeSpec, NodeUpdate, Snapshot, VolumeRecord, VolumeSpec, VolumeView,
};
use crate::runtime::InstanceInfo;
use crate::settings::Setting;

const MAILBOX_SIZE: usize = 64;

/// Live processes of one instance manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceManagerView {
    pub name: String,
    pub node_id: NodeName,
    pub instances: Vec<InstanceInfo>,
}

struct VolumeSlot {
    handle: ActorHandle<VolumeMessage>,
    view: watch::Receiver<VolumeView>,
}

pub struct VolumeManager {
    deps: VolumeDeps,
    supervisor: Mutex<Supervisor>,
    volumes: RwLock<BTreeMap<VolumeName, VolumeSlot>>,
}

impl VolumeManager {
    pub fn new(deps: VolumeDeps, shutdown: watch::Receiver<bool>) -> Arc<Self> {
        Arc::new(Self {
            deps,
            supervisor: Mutex::new(Supervisor::new(shutdown)),
            volumes: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VolumeEnvelope> {
        self.deps.events.subscribe()
    }

    /// Sends a `Tick` to every volume actor at `interval` until shutdown.
    pub fn spawn_reconciler(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.tick_all().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Reconciler stopped");
        })
    }

    async fn tick_all(&self) {
        for (name, slot) in self.volumes.read().await.iter() {
            match slot.handle.try_send(VolumeMessage::Tick) {
                Ok(()) | Err(ActorError::MailboxFull) => {}
                Err(e) => debug!(volume = %name, error = %e, "Tick not delivered"),
            }
        }
        let reaped = self.supervisor.lock().await.reap();
        if !reaped.is_empty() {
            debug!(actors = ?reaped, "Reaped stopped volume actors");
        }
    }

    pub async fn shutdown(&self) {
        self.supervisor.lock().await.stop_all().await;
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    #[instrument(skip(self, spec), fields(volume = %spec.name))]
    pub async fn create(&self, mut spec: VolumeSpec) -> Result<VolumeView> {
        if self.volumes.read().await.contains_key(&spec.name) {
            return Err(ManagerError::AlreadyExists {
                kind: "volume",
                name: spec.name.to_string(),
            });
        }

        let source = if spec.from_backup.is_empty() {
            None
        } else {
            let url = parse_backup_url(&spec.from_backup)?;
            let backup = self
                .deps
                .backups
                .get_backup(&url.target, &url.volume, &url.backup)
                .await?;
            spec.size = backup.volume_size;
            Some(backup)
        };

        let (default_replicas, engine_image) = {
            let settings = self.deps.settings.read().await;
            (
                settings.default_replica_count,
                settings.default_engine_image.clone(),
            )
        };
        let mut volume = spec.into_volume(default_replicas, &engine_image)?;
        if let Some(backup) = &source {
            volume.last_backup = backup.name.clone();
            volume.last_backup_at = Some(backup.created);
        }

        let mut record = VolumeRecord::new(volume);
        schedule_missing(&self.deps.scheduler, &mut record).await;

        let mut volumes = self.volumes.write().await;
        let name = record.volume.name.clone();
        if volumes.contains_key(&name) {
            for replica in &record.replicas {
                self.deps.scheduler.release(replica).await;
            }
            return Err(ManagerError::AlreadyExists {
                kind: "volume",
                name: name.to_string(),
            });
        }

        let view = record.view();
        let (view_tx, view_rx) = watch::channel(view.clone());
        let deps = self.deps.clone();
        let handle = self
            .supervisor
            .lock()
            .await
            .spawn_with(name.as_str(), MAILBOX_SIZE, move |handle| {
                let mut actor = VolumeActor::new(deps, record, view_tx, handle);
                actor.announce();
                actor
            });
        volumes.insert(
            name.clone(),
            VolumeSlot {
                handle,
                view: view_rx,
            },
        );

        info!(
            volume = %name,
            size = view.volume.size,
            replicas = view.replicas.len(),
            restore = source.is_some(),
            "Volume created"
        );
        Ok(view)
    }

    pub async fn list(&self) -> Vec<VolumeView> {
        self.volumes
            .read()
            .await
            .values()
            .map(|slot| slot.view.borrow().clone())
            .collect()
    }

    pub async fn get(&self, name: &VolumeName) -> Result<VolumeView> {
        self.volumes
            .read()
            .await
            .get(name)
            .map(|slot| slot.view.borrow().clone())
            .ok_or_else(|| ManagerError::not_found("volume", name.as_str()))
    }

    async fn handle(&self, name: &VolumeName) -> Result<ActorHandle<VolumeMessage>> {
        self.volumes
            .read()
            .await
            .get(name)
            .map(|slot| slot.handle.clone())
            .ok_or_else(|| ManagerError::not_found("volume", name.as_str()))
    }

    /// Sends a command to the volume's actor and waits for its reply.
    async fn call<T, F>(&self, name: &VolumeName, make: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Reply<T>) -> VolumeMessage,
    {
        let handle = self.handle(name).await?;
        handle
            .call(make)
            .await
            .map_err(|e| ManagerError::Unavailable(format!("{name} ({e})")))?
    }

    pub async fn attach(
        &self,
        name: &VolumeName,
        host: NodeName,
        disable_frontend: bool,
    ) -> Result<VolumeView> {
        self.call(name, |reply| VolumeMessage::Attach {
            host,
            disable_frontend,
            reply,
        })
        .await
    }

    pub async fn detach(&self, name: &VolumeName, force: bool) -> Result<VolumeView> {
        self.call(name, |reply| VolumeMessage::Detach { force, reply })
            .await
    }

    pub async fn expand(&self, name: &VolumeName, size: u64) -> Result<VolumeView> {
        crate::model::validate_size(size)?;
        self.call(name, |reply| VolumeMessage::Expand { size, reply })
            .await
    }

    pub async fn migrate(&self, name: &VolumeName, host: NodeName) -> Result<VolumeView> {
        self.call(name, |reply| VolumeMessage::Migrate { host, reply })
            .await
    }

    pub async fn confirm_migration(&self, name: &VolumeName) -> Result<VolumeView> {
        self.call(name, |reply| VolumeMessage::ConfirmMigration { reply })
            .await
    }

    pub async fn rollback_migration(&self, name: &VolumeName) -> Result<VolumeView> {
        self.call(name, |reply| VolumeMessage::RollbackMigration { reply })
            .await
    }

    pub async fn activate(
        &self,
        name: &VolumeName,
        frontend: Option<Frontend>,
    ) -> Result<VolumeView> {
        self.call(name, |reply| VolumeMessage::Activate { frontend, reply })
            .await
    }

    pub async fn salvage(&self, name: &VolumeName, replicas: Vec<String>) -> Result<VolumeView> {
        self.call(name, |reply| VolumeMessage::Salvage { replicas, reply })
            .await
    }

    pub async fn update_replica_count(&self, name: &VolumeName, count: u32) -> Result<VolumeView> {
        self.call(name, |reply| VolumeMessage::UpdateReplicaCount { count, reply })
            .await
    }

    pub async fn pv_create(&self, name: &VolumeName, pv_name: String) -> Result<VolumeView> {
        let pv_name = if pv_name.is_empty() {
            name.to_string()
        } else {
            pv_name
        };
        self.call(name, |reply| VolumeMessage::PvCreate { pv_name, reply })
            .await
    }

    pub async fn pvc_create(
        &self,
        name: &VolumeName,
        namespace: String,
        pvc_name: String,
    ) -> Result<VolumeView> {
        let namespace = if namespace.is_empty() {
            "default".to_string()
        } else {
            namespace
        };
        let pvc_name = if pvc_name.is_empty() {
            name.to_string()
        } else {
            pvc_name
        };
        self.call(name, |reply| VolumeMessage::PvcCreate {
            namespace,
            pvc_name,
            reply,
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, name: &VolumeName) -> Result<()> {
        self.call(name, |reply| VolumeMessage::Delete { reply })
            .await?;
        self.volumes.write().await.remove(name);
        Ok(())
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub async fn snapshot_create(
        &self,
        name: &VolumeName,
        snapshot: Option<String>,
        labels: BTreeMap<String, String>,
    ) -> Result<Snapshot> {
        self.call(name, |reply| VolumeMessage::SnapshotCreate {
            name: snapshot,
            labels,
            reply,
        })
        .await
    }

    pub async fn snapshot_list(&self, name: &VolumeName) -> Result<Vec<Snapshot>> {
        self.call(name, |reply| VolumeMessage::SnapshotList { reply })
            .await
    }

    pub async fn snapshot_delete(&self, name: &VolumeName, snapshot: String) -> Result<()> {
        self.call(name, |reply| VolumeMessage::SnapshotDelete {
            name: snapshot,
            reply,
        })
        .await
    }

    pub async fn snapshot_purge(&self, name: &VolumeName) -> Result<VolumeView> {
        self.call(name, |reply| VolumeMessage::SnapshotPurge { reply })
            .await
    }

    /// Starts a backup of `snapshot`; returns the backup name.
    pub async fn snapshot_backup(
        &self,
        name: &VolumeName,
        snapshot: String,
        labels: BTreeMap<String, String>,
    ) -> Result<String> {
        self.call(name, |reply| VolumeMessage::SnapshotBackup {
            snapshot,
            labels,
            reply,
        })
        .await
    }

    // =========================================================================
    // Backups
    // =========================================================================

    async fn backup_target(&self) -> Result<BackupTarget> {
        let target = self.deps.settings.read().await.backup_target.clone();
        if target.is_empty() {
            return Err(ManagerError::BackupTargetNotSet);
        }
        Ok(BackupTarget::parse(&target)?)
    }

    pub async fn backup_volume_list(&self) -> Result<Vec<BackupVolume>> {
        let target = self.backup_target().await?;
        Ok(self.deps.backups.list_backup_volumes(&target).await?)
    }

    pub async fn backup_volume_get(&self, volume: &str) -> Result<BackupVolume> {
        let target = self.backup_target().await?;
        Ok(self.deps.backups.get_backup_volume(&target, volume).await?)
    }

    pub async fn backup_volume_delete(&self, volume: &str) -> Result<()> {
        let target = self.backup_target().await?;
        self.deps
            .backups
            .delete_backup_volume(&target, volume)
            .await?;
        info!(volume, "Backup volume deleted");
        Ok(())
    }

    pub async fn backup_list(&self, volume: &str) -> Result<Vec<Backup>> {
        let target = self.backup_target().await?;
        Ok(self.deps.backups.list_backups(&target, volume).await?)
    }

    pub async fn backup_get(&self, volume: &str, backup: &str) -> Result<Backup> {
        let target = self.backup_target().await?;
        Ok(self.deps.backups.get_backup(&target, volume, backup).await?)
    }

    pub async fn backup_delete(&self, volume: &str, backup: &str) -> Result<()> {
        let target = self.backup_target().await?;
        self.deps
            .backups
            .delete_backup(&target, volume, backup)
            .await?;
        info!(volume, backup, "Backup deleted");
        Ok(())
    }

    // =========================================================================
    // Nodes and instance managers
    // =========================================================================

    pub async fn node_create(&self, spec: NodeSpec) -> Result<Node> {
        let node = spec.into_node();
        let mut nodes = self.deps.scheduler.nodes().write().await;
        if nodes.contains_key(&node.name) {
            return Err(ManagerError::AlreadyExists {
                kind: "node",
                name: node.name.to_string(),
            });
        }
        info!(node = %node.name, address = %node.address, disks = node.disks.len(), "Node registered");
        nodes.insert(node.name.clone(), node.clone());
        Ok(node)
    }

    pub async fn node_list(&self) -> Vec<Node> {
        self.deps
            .scheduler
            .nodes()
            .read()
            .await
            .values()
            .cloned()
            .collect()
    }

    pub async fn node_get(&self, name: &NodeName) -> Result<Node> {
        self.deps
            .scheduler
            .nodes()
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ManagerError::not_found("node", name.as_str()))
    }

    pub async fn node_update(&self, name: &NodeName, update: NodeUpdate) -> Result<Node> {
        let mut nodes = self.deps.scheduler.nodes().write().await;
        let node = nodes
            .get_mut(name)
            .ok_or_else(|| ManagerError::not_found("node", name.as_str()))?;
        if let Some(allow) = update.allow_scheduling {
            node.allow_scheduling = allow;
        }
        if let Some(tags) = update.tags {
            node.tags = tags;
        }
        Ok(node.clone())
    }

    /// Replaces the node's disk set. Disks still holding replicas cannot be
    /// removed.
    pub async fn disk_update(
        &self,
        name: &NodeName,
        disks: BTreeMap<String, DiskSpec>,
    ) -> Result<Node> {
        let mut nodes = self.deps.scheduler.nodes().write().await;
        let node = nodes
            .get_mut(name)
            .ok_or_else(|| ManagerError::not_found("node", name.as_str()))?;

        if let Some((disk, _)) = node
            .disks
            .iter()
            .find(|(id, disk)| !disks.contains_key(*id) && !disk.scheduled_replica.is_empty())
        {
            return Err(ManagerError::invalid_state(format!(
                "disk {disk} on node {name} still holds replicas"
            )));
        }
        node.disks = disks
            .into_iter()
            .map(|(id, spec)| {
                let disk = spec.into_disk(node.disks.get(&id));
                (id, disk)
            })
            .collect();
        info!(node = %name, disks = node.disks.len(), "Node disks updated");
        Ok(node.clone())
    }

    pub async fn reset_disks(&self) -> Vec<Node> {
        self.deps.scheduler.reset_disks().await
    }

    pub async fn instance_manager_get(&self, name: &str) -> Result<InstanceManagerView> {
        let node_id = self
            .deps
            .scheduler
            .nodes()
            .read()
            .await
            .values()
            .find(|node| node.instance_manager_name == name)
            .map(|node| node.name.clone())
            .ok_or_else(|| ManagerError::not_found("instance manager", name))?;
        let instances = self.deps.runtime.list_instances(name).await?;
        Ok(InstanceManagerView {
            name: name.to_string(),
            node_id,
            instances,
        })
    }

    /// Kills a process inside an instance manager.
    #[instrument(skip(self))]
    pub async fn instance_delete(&self, instance_manager: &str, instance: &str) -> Result<()> {
        self.deps
            .runtime
            .delete_instance(instance_manager, instance)
            .await?;
        warn!(instance_manager, instance, "Instance deleted");
        Ok(())
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub async fn setting_list(&self) -> Vec<Setting> {
        self.deps.settings.read().await.list()
    }

    pub async fn setting_get(&self, name: &str) -> Result<Setting> {
        self.deps.settings.read().await.get(name)
    }

    pub async fn setting_update(&self, name: &str, value: &str) -> Result<Setting> {
        let setting = self.deps.settings.write().await.set(name, value)?;
        info!(setting = name, value, "Setting updated");
        Ok(setting)
    }

    // =========================================================================
    // Data path
    // =========================================================================

    /// Engine serving I/O for the volume.
    async fn serving_engine(&self, name: &VolumeName) -> Result<String> {
        let view = self.get(name).await?;
        match view.engine() {
            Some(engine) if engine.running && !engine.endpoint.is_empty() => {
                Ok(engine.name.to_string())
            }
            _ => Err(ManagerError::invalid_state(format!(
                "volume {name} has no frontend endpoint"
            ))),
        }
    }

    pub async fn write(&self, name: &VolumeName, offset: u64, data: &[u8]) -> Result<()> {
        let engine = self.serving_engine(name).await?;
        Ok(self.deps.runtime.write_at(&engine, offset, data).await?)
    }

    pub async fn read(&self, name: &VolumeName, offset: u64, len: usize) -> Result<Vec<u8>> {
        let engine = self.serving_engine(name).await?;
        Ok(self.deps.runtime.read_at(&engine, offset, len).await?)
    }

    pub async fn checksum(&self, name: &VolumeName) -> Result<String> {
        let engine = self.serving_engine(name).await?;
        Ok(self.deps.runtime.checksum(&engine).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backupstore::MemoryBackupStore;
    use crate::events::EventBus;
    use crate::model::Disk;
    use crate::runtime::MockRuntime;
    use crate::scheduler::ReplicaScheduler;
    use crate::expansion::{find_markers, write_marker};
    use crate::runtime::InstanceRuntime;
    use crate::settings::{Settings, AUTO_SALVAGE, BACKUP_TARGET};
    use holdfast_events::{ProgressState, Robustness, VolumeEvent, VolumeState};
    use std::path::Path;

    struct Harness {
        manager: Arc<VolumeManager>,
        runtime: Arc<MockRuntime>,
        _shutdown: watch::Sender<bool>,
        _dir: tempfile::TempDir,
    }

    async fn harness(nodes: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::default().shared();
        let registry = Arc::new(RwLock::new(BTreeMap::new()));
        let scheduler = ReplicaScheduler::new(registry, settings.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runtime = Arc::new(MockRuntime::new().with_step_delay(Duration::from_millis(5)));
        let deps = VolumeDeps {
            runtime: runtime.clone(),
            backups: Arc::new(MemoryBackupStore::new()),
            scheduler,
            settings,
            events: EventBus::new(),
            local_node: NodeName::parse("node-1").unwrap(),
        };
        let manager = VolumeManager::new(deps, shutdown_rx.clone());
        manager.spawn_reconciler(Duration::from_millis(20), shutdown_rx);

        for i in 1..=nodes {
            let name = format!("node-{i}");
            let path = dir.path().join(&name);
            let mut spec = NodeSpec {
                name: NodeName::parse(&name).unwrap(),
                address: format!("10.0.0.{i}"),
                allow_scheduling: true,
                tags: Vec::new(),
                disks: BTreeMap::new(),
            };
            spec.disks.insert(
                "default-disk".to_string(),
                DiskSpec {
                    path: path.to_string_lossy().into_owned(),
                    storage_maximum: 1 << 30,
                    storage_reserved: 0,
                    allow_scheduling: true,
                    tags: Vec::new(),
                },
            );
            manager.node_create(spec).await.unwrap();
        }

        Harness {
            manager,
            runtime,
            _shutdown: shutdown_tx,
            _dir: dir,
        }
    }

    async fn wait_for<F>(manager: &VolumeManager, name: &VolumeName, mut done: F) -> VolumeView
    where
        F: FnMut(&VolumeView) -> bool,
    {
        for _ in 0..200 {
            let view = manager.get(name).await.unwrap();
            if done(&view) {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("volume {name} did not reach the expected state");
    }

    fn vol(name: &str) -> VolumeName {
        VolumeName::parse(name).unwrap()
    }

    fn node(name: &str) -> NodeName {
        NodeName::parse(name).unwrap()
    }

    fn is_healthy(view: &VolumeView) -> bool {
        view.volume.state == VolumeState::Attached && view.volume.robustness == Robustness::Healthy
    }

    async fn attached(h: &Harness, name: &VolumeName) -> VolumeView {
        h.manager
            .create(VolumeSpec::new(name.clone(), 16 << 20))
            .await
            .unwrap();
        h.manager.attach(name, node("node-1"), false).await.unwrap();
        wait_for(&h.manager, name, is_healthy).await
    }

    async fn detached(h: &Harness, name: &VolumeName) -> VolumeView {
        h.manager.detach(name, false).await.unwrap();
        wait_for(&h.manager, name, |v| v.volume.state == VolumeState::Detached).await
    }

    async fn crash_all(h: &Harness, view: &VolumeView) -> Vec<String> {
        let mut crashed = Vec::new();
        for replica in &view.replicas {
            let name = replica.name.to_string();
            h.manager
                .instance_delete(&replica.instance_manager_name, &name)
                .await
                .unwrap();
            crashed.push(name);
        }
        crashed
    }

    /// Snapshots an attached volume and waits for the backup to land.
    async fn backup(h: &Harness, name: &VolumeName) -> Backup {
        let snapshot = h
            .manager
            .snapshot_create(name, None, BTreeMap::new())
            .await
            .unwrap();
        let backup = h
            .manager
            .snapshot_backup(name, snapshot.name, BTreeMap::new())
            .await
            .unwrap();
        for _ in 0..200 {
            let backups = h.manager.backup_list(name.as_str()).await.unwrap_or_default();
            if let Some(found) = backups.into_iter().find(|b| b.name == backup) {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("backup {backup} of {name} never landed");
    }

    async fn assert_scheduled(h: &Harness, bytes: u64) {
        for node in h.manager.node_list().await {
            assert_eq!(node.disks["default-disk"].storage_scheduled, bytes, "{}", node.name);
        }
    }

    #[tokio::test]
    async fn test_create_schedules_replicas_on_distinct_nodes() {
        let h = harness(3).await;
        let view = h
            .manager
            .create(VolumeSpec::new(vol("vol-a"), 16 << 20))
            .await
            .unwrap();

        assert_eq!(view.replicas.len(), 3);
        let mut hosts: Vec<_> = view.replicas.iter().map(|r| r.host_id.clone()).collect();
        hosts.sort();
        hosts.dedup();
        assert_eq!(hosts.len(), 3);
        assert!(view.volume.conditions.scheduled.status);
        assert_eq!(view.volume.state, VolumeState::Detached);

        let err = h
            .manager
            .create(VolumeSpec::new(vol("vol-a"), 16 << 20))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_scheduling_failure_sets_condition() {
        let h = harness(2).await;
        let view = h
            .manager
            .create(VolumeSpec::new(vol("vol-b"), 16 << 20))
            .await
            .unwrap();
        assert_eq!(view.replicas.len(), 2);
        assert!(!view.volume.conditions.scheduled.status);
        assert_eq!(
            view.volume.conditions.scheduled.reason,
            crate::model::REASON_REPLICA_SCHEDULING_FAILURE
        );
    }

    #[tokio::test]
    async fn test_attach_is_idempotent_and_write_reads_back() {
        let h = harness(3).await;
        let name = vol("vol-c");
        h.manager
            .create(VolumeSpec::new(name.clone(), 16 << 20))
            .await
            .unwrap();
        let host = NodeName::parse("node-1").unwrap();
        h.manager.attach(&name, host.clone(), false).await.unwrap();
        let view = wait_for(&h.manager, &name, |v| {
            v.volume.robustness == Robustness::Healthy
        })
        .await;
        let engine = view.engine().unwrap().name;

        h.manager.attach(&name, host, false).await.unwrap();
        let view = h.manager.get(&name).await.unwrap();
        assert_eq!(view.engine().unwrap().name, engine);
        assert_eq!(view.controllers.len(), 1);
        assert_eq!(view.engine().unwrap().endpoint, "/dev/holdfast/vol-c");

        let other = NodeName::parse("node-2").unwrap();
        let err = h.manager.attach(&name, other, false).await.unwrap_err();
        assert!(matches!(err, ManagerError::InvalidState(_)));

        h.manager.write(&name, 8192, b"holdfast").await.unwrap();
        let data = h.manager.read(&name, 8192, 8).await.unwrap();
        assert_eq!(data, b"holdfast");
    }

    #[tokio::test]
    async fn test_expand_requires_detached() {
        let h = harness(3).await;
        let name = vol("vol-d");
        h.manager
            .create(VolumeSpec::new(name.clone(), 16 << 20))
            .await
            .unwrap();

        let err = h.manager.expand(&name, 8 << 20).await.unwrap_err();
        assert!(matches!(err, ManagerError::InvalidArgument(_)));

        h.manager.expand(&name, 32 << 20).await.unwrap();
        let view = wait_for(&h.manager, &name, |v| v.volume.size == 32 << 20).await;
        assert!(view.replicas.iter().all(|r| r.size == 32 << 20));

        h.manager
            .attach(&name, NodeName::parse("node-1").unwrap(), false)
            .await
            .unwrap();
        wait_for(&h.manager, &name, |v| v.volume.state == VolumeState::Attached).await;
        let err = h.manager.expand(&name, 64 << 20).await.unwrap_err();
        assert!(matches!(err, ManagerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_delete_releases_capacity() {
        let h = harness(3).await;
        let name = vol("vol-e");
        h.manager
            .create(VolumeSpec::new(name.clone(), 16 << 20))
            .await
            .unwrap();
        h.manager.delete(&name).await.unwrap();

        assert!(matches!(
            h.manager.get(&name).await,
            Err(ManagerError::NotFound { .. })
        ));
        for node in h.manager.node_list().await {
            for disk in node.disks.values() {
                assert_eq!(disk.storage_scheduled, 0);
                assert!(disk.scheduled_replica.is_empty());
            }
        }
    }

    #[tokio::test]
    async fn test_backup_requires_target() {
        let h = harness(3).await;
        assert!(matches!(
            h.manager.backup_volume_list().await,
            Err(ManagerError::BackupTargetNotSet)
        ));
        h.manager
            .setting_update(BACKUP_TARGET, "mem://unit")
            .await
            .unwrap();
        assert!(h.manager.backup_volume_list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disk_update_keeps_disks_with_replicas() {
        let h = harness(3).await;
        h.manager
            .create(VolumeSpec::new(vol("vol-f"), 16 << 20))
            .await
            .unwrap();
        let node = NodeName::parse("node-1").unwrap();
        let err = h
            .manager
            .disk_update(&node, BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::InvalidState(_)));

        let current = h.manager.node_get(&node).await.unwrap();
        let disk: &Disk = current.disks.values().next().unwrap();
        let mut disks = BTreeMap::new();
        disks.insert(
            "default-disk".to_string(),
            DiskSpec {
                path: disk.path.clone(),
                storage_maximum: 2 << 30,
                storage_reserved: 0,
                allow_scheduling: true,
                tags: vec!["ssd".to_string()],
            },
        );
        let updated = h.manager.disk_update(&node, disks).await.unwrap();
        let disk = &updated.disks["default-disk"];
        assert_eq!(disk.storage_maximum, 2 << 30);
        assert_eq!(disk.storage_scheduled, 16 << 20);
    }

    #[tokio::test]
    async fn test_oversized_requests_are_rejected() {
        let h = harness(3).await;
        let err = h
            .manager
            .create(VolumeSpec::new(vol("vol-huge"), u64::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::InvalidArgument(_)));
        assert!(h.manager.get(&vol("vol-huge")).await.is_err());

        let name = vol("vol-g");
        h.manager
            .create(VolumeSpec::new(name.clone(), 16 << 20))
            .await
            .unwrap();
        for size in [u64::MAX, u64::MAX - 100, crate::model::MAX_VOLUME_SIZE + 1] {
            let err = h.manager.expand(&name, size).await.unwrap_err();
            assert!(matches!(err, ManagerError::InvalidArgument(_)), "{size}");
        }

        // The volume's actor is still serving.
        h.manager.expand(&name, 32 << 20).await.unwrap();
        wait_for(&h.manager, &name, |v| v.volume.size == 32 << 20).await;
    }

    #[tokio::test]
    async fn test_migration_runs_two_engines_until_confirmed() {
        let h = harness(3).await;
        let name = vol("vol-mig");
        attached(&h, &name).await;
        h.manager.write(&name, 0, b"migrate").await.unwrap();

        let view = h.manager.migrate(&name, node("node-2")).await.unwrap();
        assert_eq!(view.controllers.len(), 2);
        assert!(view
            .controllers
            .iter()
            .all(|e| e.running && !e.endpoint.is_empty()));
        let origin = view.controllers[0].name;
        let target = view.controllers[1].name;
        assert_ne!(origin, target);
        assert_eq!(view.controllers[1].host_id, Some(node("node-2")));

        let err = h.manager.detach(&name, false).await.unwrap_err();
        assert!(matches!(err, ManagerError::InvalidState(_)));

        let view = h.manager.confirm_migration(&name).await.unwrap();
        assert_eq!(view.controllers.len(), 1);
        assert_eq!(view.controllers[0].name, target);
        assert_eq!(view.volume.node_id, Some(node("node-2")));
        assert_eq!(h.manager.read(&name, 0, 7).await.unwrap(), b"migrate");
    }

    #[tokio::test]
    async fn test_migration_rollback_keeps_origin() {
        let h = harness(3).await;
        let name = vol("vol-back");
        let view = attached(&h, &name).await;
        let origin = view.engine().unwrap().name;

        let view = h.manager.migrate(&name, node("node-3")).await.unwrap();
        assert_eq!(view.controllers.len(), 2);
        // Asking again for the same target is a no-op.
        let view = h.manager.migrate(&name, node("node-3")).await.unwrap();
        assert_eq!(view.controllers.len(), 2);
        let err = h.manager.migrate(&name, node("node-2")).await.unwrap_err();
        assert!(matches!(err, ManagerError::InvalidState(_)));

        let view = h.manager.rollback_migration(&name).await.unwrap();
        assert_eq!(view.controllers.len(), 1);
        assert_eq!(view.controllers[0].name, origin);
        assert_eq!(view.volume.node_id, Some(node("node-1")));

        let err = h.manager.confirm_migration(&name).await.unwrap_err();
        assert!(matches!(err, ManagerError::InvalidState(_)));
        wait_for(&h.manager, &name, is_healthy).await;
    }

    #[tokio::test]
    async fn test_all_replicas_crashed_needs_salvage() {
        let h = harness(3).await;
        h.manager.setting_update(AUTO_SALVAGE, "false").await.unwrap();
        let name = vol("vol-salvage");
        let view = attached(&h, &name).await;
        h.manager.write(&name, 4096, b"survivor").await.unwrap();

        let crashed = crash_all(&h, &view).await;
        let view = wait_for(&h.manager, &name, |v| {
            v.volume.state == VolumeState::Detached && v.volume.robustness == Robustness::Faulted
        })
        .await;
        assert!(view.replicas.iter().all(|r| r.is_failed()));

        let err = h.manager.attach(&name, node("node-1"), false).await.unwrap_err();
        assert!(matches!(err, ManagerError::InvalidState(_)));
        let err = h.manager.salvage(&name, Vec::new()).await.unwrap_err();
        assert!(matches!(err, ManagerError::InvalidArgument(_)));

        let view = h.manager.salvage(&name, crashed).await.unwrap();
        assert_eq!(view.volume.robustness, Robustness::Unknown);
        assert!(view.replicas.iter().all(|r| !r.is_failed()));

        h.manager.attach(&name, node("node-1"), false).await.unwrap();
        wait_for(&h.manager, &name, is_healthy).await;
        assert_eq!(h.manager.read(&name, 4096, 8).await.unwrap(), b"survivor");
    }

    #[tokio::test]
    async fn test_auto_salvage_reattaches_faulted_volume() {
        let h = harness(3).await;
        let name = vol("vol-auto");
        let view = attached(&h, &name).await;
        h.manager.write(&name, 0, b"auto").await.unwrap();
        let mut events = h.manager.subscribe();

        let mut crashed = crash_all(&h, &view).await;
        let (automatic, salvaged) = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let envelope = events.recv().await.unwrap();
                if let VolumeEvent::Salvaged(payload) = &envelope.payload {
                    return (payload.automatic, payload.replicas.len());
                }
            }
        })
        .await
        .unwrap();
        assert!(automatic);
        assert_eq!(salvaged, 3);

        let view = wait_for(&h.manager, &name, is_healthy).await;
        let mut replicas: Vec<String> = view.replicas.iter().map(|r| r.name.to_string()).collect();
        replicas.sort();
        crashed.sort();
        assert_eq!(replicas, crashed);
        assert_eq!(view.volume.node_id, Some(node("node-1")));
        assert_eq!(h.manager.read(&name, 0, 4).await.unwrap(), b"auto");
    }

    #[tokio::test]
    async fn test_stale_expansion_marker_blocks_one_attempt() {
        let h = harness(3).await;
        let name = vol("vol-marker");
        let view = h
            .manager
            .create(VolumeSpec::new(name.clone(), 16 << 20))
            .await
            .unwrap();
        for replica in &view.replicas {
            write_marker(Path::new(&replica.data_path), 32 << 20)
                .await
                .unwrap();
        }

        h.manager.expand(&name, 32 << 20).await.unwrap();
        let view = wait_for(&h.manager, &name, |v| {
            v.engine()
                .is_some_and(|e| e.last_expansion_failed_at.is_some())
        })
        .await;
        assert_eq!(view.volume.size, 16 << 20);
        assert!(!view.engine().unwrap().last_expansion_error.is_empty());
        for replica in &view.replicas {
            assert!(find_markers(Path::new(&replica.data_path))
                .await
                .unwrap()
                .is_empty());
        }
        assert_scheduled(&h, 16 << 20).await;

        h.manager.expand(&name, 32 << 20).await.unwrap();
        let view = wait_for(&h.manager, &name, |v| v.volume.size == 32 << 20).await;
        assert!(view.replicas.iter().all(|r| r.size == 32 << 20));
        assert_scheduled(&h, 32 << 20).await;
    }

    #[tokio::test]
    async fn test_attach_rolls_back_interrupted_expansion() {
        let h = harness(3).await;
        let name = vol("vol-recover");
        let view = attached(&h, &name).await;
        h.manager.write(&name, 0, b"before crash").await.unwrap();
        let checksum = h.manager.checksum(&name).await.unwrap();
        detached(&h, &name).await;

        // Images grown, markers left behind, size never committed.
        for replica in &view.replicas {
            h.runtime
                .expand_replica(&replica.name.to_string(), 32 << 20)
                .await
                .unwrap();
            write_marker(Path::new(&replica.data_path), 32 << 20)
                .await
                .unwrap();
        }

        h.manager.attach(&name, node("node-1"), false).await.unwrap();
        let view = wait_for(&h.manager, &name, is_healthy).await;
        assert_eq!(view.volume.size, 16 << 20);
        for replica in &view.replicas {
            assert!(find_markers(Path::new(&replica.data_path))
                .await
                .unwrap()
                .is_empty());
        }
        assert_eq!(h.manager.checksum(&name).await.unwrap(), checksum);
        assert_scheduled(&h, 16 << 20).await;
    }

    #[tokio::test]
    async fn test_failed_rebuild_is_retried_on_a_new_replica() {
        let h = harness(3).await;
        let name = vol("vol-rebuild");
        let view = attached(&h, &name).await;
        h.manager.write(&name, 0, b"rebuild me").await.unwrap();
        let original: Vec<String> = view.replicas.iter().map(|r| r.name.to_string()).collect();

        h.runtime.fail_next_rebuild();
        let victim = view.replicas[0].clone();
        h.manager
            .instance_delete(&victim.instance_manager_name, &victim.name.to_string())
            .await
            .unwrap();

        let view = wait_for(&h.manager, &name, |v| {
            v.engine().is_some_and(|e| {
                e.rebuild_status
                    .iter()
                    .any(|s| s.progress.state == ProgressState::Error)
            })
        })
        .await;
        let failed_target = view
            .engine()
            .unwrap()
            .rebuild_status
            .iter()
            .find(|s| s.progress.state == ProgressState::Error)
            .unwrap()
            .replica;
        assert!(!original.contains(&failed_target.to_string()));

        let view = wait_for(&h.manager, &name, |v| {
            is_healthy(v)
                && v.replicas.len() == 3
                && v.replicas
                    .iter()
                    .all(|r| r.name != failed_target && r.name != victim.name)
        })
        .await;
        assert!(view
            .engine()
            .unwrap()
            .rebuild_status
            .iter()
            .all(|s| s.progress.state != ProgressState::Error));
        assert_eq!(h.manager.read(&name, 0, 10).await.unwrap(), b"rebuild me");
    }

    #[tokio::test]
    async fn test_standby_volume_follows_source_until_activated() {
        let h = harness(3).await;
        h.manager.setting_update(BACKUP_TARGET, "mem://unit").await.unwrap();
        let src = vol("vol-src");
        attached(&h, &src).await;
        h.manager.write(&src, 0, b"first").await.unwrap();
        let first = backup(&h, &src).await;

        let dr = vol("vol-dr");
        let mut spec = VolumeSpec::new(dr.clone(), 0);
        spec.from_backup = first.url.clone();
        spec.standby = true;
        h.manager.create(spec).await.unwrap();

        let err = h
            .manager
            .activate(&dr, Some(Frontend::Blockdev))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::IncrementalRestoreInProgress { .. }));
        assert_eq!(err.code(), "incremental_restore_in_progress");

        wait_for(&h.manager, &dr, |v| {
            !v.volume.initial_restoration_required
                && v.engine()
                    .is_some_and(|e| e.last_restored_backup == first.name)
        })
        .await;

        // Grow the source and back it up again; the standby grows with it.
        detached(&h, &src).await;
        h.manager.expand(&src, 32 << 20).await.unwrap();
        wait_for(&h.manager, &src, |v| v.volume.size == 32 << 20).await;
        h.manager.attach(&src, node("node-1"), false).await.unwrap();
        wait_for(&h.manager, &src, is_healthy).await;
        h.manager.write(&src, 20 << 20, b"second").await.unwrap();
        let second = backup(&h, &src).await;
        assert_eq!(second.volume_size, 32 << 20);

        let view = wait_for(&h.manager, &dr, |v| {
            v.volume.size == 32 << 20
                && v.engine().is_some_and(|e| {
                    e.size == 32 << 20 && e.last_restored_backup == second.name && !e.is_restoring()
                })
        })
        .await;
        assert!(view.volume.standby);
        assert!(view.replicas.iter().all(|r| r.size == 32 << 20));

        let view = h.manager.activate(&dr, Some(Frontend::Blockdev)).await.unwrap();
        assert!(!view.volume.standby);
        wait_for(&h.manager, &dr, |v| v.volume.state == VolumeState::Detached).await;
        h.manager.attach(&dr, node("node-2"), false).await.unwrap();
        wait_for(&h.manager, &dr, is_healthy).await;
        assert_eq!(h.manager.read(&dr, 20 << 20, 6).await.unwrap(), b"second");
    }
}
