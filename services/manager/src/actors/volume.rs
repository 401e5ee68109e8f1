//! Volume actor: the single writer for one volume.
//!
//! Every control operation arrives as a message carrying a reply channel.
//! Handlers validate, apply the accepted state change, reply, and only then
//! perform the slow part (starting processes, launching jobs). A periodic
//! `Tick` reconciles the volume against the instance runtime, and job
//! progress arrives as `Report` messages fed from the runtime's sink.
//!
//! Two outward channels carry state:
//! - a `watch` of [`VolumeView`] that API readers poll
//! - the [`EventBus`], one enveloped event per transition

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use holdfast_events::{
    BackupCompletedPayload, BackupFailedPayload, ExpansionFailedPayload, Frontend,
    MigrationFinishedPayload, MigrationStartedPayload, ProgressState, RebuildFinishedPayload,
    RebuildStartedPayload, ReplicaFailedPayload, ReplicaMode, RestoreCompletedPayload, Robustness,
    RobustnessChangedPayload, SnapshotCreatedPayload, SnapshotPurgedPayload,
    VolumeActivatedPayload, VolumeCreatedPayload, VolumeAttachedPayload, VolumeAttachingPayload, VolumeDeletedPayload,
    VolumeDetachedPayload, VolumeEvent, VolumeExpandedPayload, VolumeSalvagedPayload, VolumeState,
};
use holdfast_id::{AggregateSeq, BackupId, NodeName, ReplicaId, SnapshotId};
use holdfast_reconcile::RetryTracker;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, instrument, warn};

use super::framework::{Actor, ActorContext, ActorError, ActorHandle, BackoffPolicy};
use crate::backupstore::{parse_backup_url, BackupStore, BackupTarget, NewBackup};
use crate::error::{ManagerError, Result};
use crate::events::EventBus;
use crate::expansion;
use crate::machine::derive_robustness;
use crate::model::{
    endpoint_for, BackupStatus, Engine, Node, ProgressRecord, PurgeStatus, RebuildStatus, Replica,
    RestoreStatus, Snapshot, SnapshotChain, Volume, VolumeRecord, VolumeView,
    REASON_REPLICA_SCHEDULING_FAILURE, VOLUME_HEAD,
};
use crate::runtime::{
    BackupJob, EngineProcessSpec, InstanceRuntime, JobEvent, JobKind, JobReport, PurgeJob,
    RebuildJob, ReplicaProcessSpec, RestoreJob,
};
use crate::scheduler::ReplicaScheduler;
use crate::settings::SharedSettings;

/// Label carrying the volume's Kubernetes binding on every backup.
pub const KUBERNETES_STATUS_LABEL: &str = "KubernetesStatus";

/// Label carrying the base image of VM volumes on every backup.
pub const BASE_IMAGE_LABEL: &str = "ranchervm-base-image";

pub type Reply<T> = oneshot::Sender<Result<T>>;

#[derive(Debug)]
pub enum VolumeMessage {
    Attach {
        host: NodeName,
        disable_frontend: bool,
        reply: Reply<VolumeView>,
    },
    Detach {
        force: bool,
        reply: Reply<VolumeView>,
    },
    Expand {
        size: u64,
        reply: Reply<VolumeView>,
    },
    Migrate {
        host: NodeName,
        reply: Reply<VolumeView>,
    },
    ConfirmMigration {
        reply: Reply<VolumeView>,
    },
    RollbackMigration {
        reply: Reply<VolumeView>,
    },
    Activate {
        frontend: Option<Frontend>,
        reply: Reply<VolumeView>,
    },
    Salvage {
        replicas: Vec<String>,
        reply: Reply<VolumeView>,
    },
    UpdateReplicaCount {
        count: u32,
        reply: Reply<VolumeView>,
    },
    SnapshotCreate {
        name: Option<String>,
        labels: BTreeMap<String, String>,
        reply: Reply<Snapshot>,
    },
    SnapshotList {
        reply: Reply<Vec<Snapshot>>,
    },
    SnapshotDelete {
        name: String,
        reply: Reply<()>,
    },
    SnapshotPurge {
        reply: Reply<VolumeView>,
    },
    SnapshotBackup {
        snapshot: String,
        labels: BTreeMap<String, String>,
        reply: Reply<String>,
    },
    PvCreate {
        pv_name: String,
        reply: Reply<VolumeView>,
    },
    PvcCreate {
        namespace: String,
        pvc_name: String,
        reply: Reply<VolumeView>,
    },
    Delete {
        reply: Reply<()>,
    },
    Report(JobReport),
    Tick,
}

/// Collaborators shared by every volume actor.
#[derive(Clone)]
pub struct VolumeDeps {
    pub runtime: Arc<dyn InstanceRuntime>,
    pub backups: Arc<dyn BackupStore>,
    pub scheduler: ReplicaScheduler,
    pub settings: SharedSettings,
    pub events: EventBus,
    /// Node used for internal attachments such as initial restores.
    pub local_node: NodeName,
}

/// Schedules replicas for a volume that has never held data.
///
/// Returns true when the record changed.
pub(crate) async fn schedule_missing(
    scheduler: &ReplicaScheduler,
    record: &mut VolumeRecord,
) -> bool {
    let mut changed = false;
    while active_replicas(&record.replicas) < record.volume.number_of_replicas as usize {
        match provision_replica(scheduler, &record.volume, &record.replicas).await {
            Ok(replica) => {
                record.replicas.push(replica);
                changed = true;
            }
            Err(e) => {
                changed |= record.volume.conditions.scheduled.set(
                    false,
                    REASON_REPLICA_SCHEDULING_FAILURE,
                    &e.to_string(),
                );
                return changed;
            }
        }
    }
    changed | record.volume.conditions.scheduled.set(true, "", "")
}

/// Places a new replica and creates its data directory.
pub(crate) async fn provision_replica(
    scheduler: &ReplicaScheduler,
    volume: &Volume,
    existing: &[Replica],
) -> Result<Replica> {
    let name = ReplicaId::new();
    let placement = scheduler.place(volume, &name.to_string(), existing).await?;
    let data_path = format!(
        "{}/replicas/{}-{}",
        placement.disk_path.trim_end_matches('/'),
        volume.name,
        name
    );

    let replica = Replica {
        name,
        volume_name: volume.name.clone(),
        host_id: placement.node,
        disk_name: placement.disk_name,
        disk_path: placement.disk_path,
        data_path,
        size: volume.size,
        instance_manager_name: placement.instance_manager_name,
        mode: None,
        running: false,
        failed_at: None,
        healthy_at: None,
    };
    if let Err(e) = tokio::fs::create_dir_all(&replica.data_path).await {
        scheduler.release(&replica).await;
        return Err(e.into());
    }
    Ok(replica)
}

fn active_replicas(replicas: &[Replica]) -> usize {
    replicas.iter().filter(|r| !r.is_failed()).count()
}

/// Outcome of a finished restore round.
enum RestoreRound {
    Running,
    Complete,
    Failed,
}

pub struct VolumeActor {
    deps: VolumeDeps,
    record: VolumeRecord,
    snapshots: SnapshotChain,
    view_tx: watch::Sender<VolumeView>,
    seq: AggregateSeq,
    handle: ActorHandle<VolumeMessage>,
    reports_tx: mpsc::UnboundedSender<JobReport>,
    reports_rx: Option<mpsc::UnboundedReceiver<JobReport>>,
    rebuild_retries: RetryTracker,
    backoff: BackoffPolicy,
    next_rebuild_at: Option<Instant>,
    /// Host and frontend of the last successful attach; used to reattach
    /// after an automatic salvage.
    last_attach: Option<(NodeName, bool)>,
    /// Backups in flight, by backup name.
    pending_backups: HashMap<String, BackupTarget>,
}

impl VolumeActor {
    pub fn new(
        deps: VolumeDeps,
        record: VolumeRecord,
        view_tx: watch::Sender<VolumeView>,
        handle: ActorHandle<VolumeMessage>,
    ) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            deps,
            record,
            snapshots: SnapshotChain::new(),
            view_tx,
            seq: AggregateSeq::FIRST,
            handle,
            reports_tx,
            reports_rx: Some(reports_rx),
            rebuild_retries: RetryTracker::default(),
            backoff: BackoffPolicy::default(),
            next_rebuild_at: None,
            last_attach: None,
            pending_backups: HashMap::new(),
        }
    }

    /// Emits the creation event; called once before the actor is spawned.
    pub(crate) fn announce(&mut self) {
        let volume = &self.record.volume;
        let payload = VolumeCreatedPayload {
            volume: volume.name.clone(),
            size: volume.size,
            number_of_replicas: volume.number_of_replicas,
            frontend: volume.frontend,
            standby: volume.standby,
            from_backup: (!volume.from_backup.is_empty()).then(|| volume.from_backup.clone()),
        };
        self.emit(VolumeEvent::Created(payload));
    }

    fn volume_name(&self) -> String {
        self.record.volume.name.to_string()
    }

    fn view(&self) -> VolumeView {
        self.record.view()
    }

    fn publish_view(&self) {
        let view = self.record.view();
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }

    fn emit(&mut self, event: VolumeEvent) {
        let name = self.volume_name();
        self.deps.events.publish(&name, self.seq, event);
        self.seq = self.seq.next();
    }

    fn set_robustness(&mut self, robustness: Robustness) {
        let from = self.record.volume.robustness;
        if from == robustness {
            return;
        }
        self.record.volume.robustness = robustness;
        info!(volume = %self.record.volume.name, %from, to = %robustness, "Robustness changed");
        let volume = self.record.volume.name.clone();
        self.emit(VolumeEvent::RobustnessChanged(RobustnessChangedPayload {
            volume,
            from,
            to: robustness,
        }));
    }

    fn refresh_robustness(&mut self) {
        let derived = derive_robustness(
            self.record.volume.state,
            &self.record.replicas,
            self.record.volume.number_of_replicas,
        );
        self.set_robustness(derived);
        self.sync_mode_map();
    }

    fn sync_mode_map(&mut self) {
        if !self.record.engine.running {
            return;
        }
        self.record.engine.replica_mode_map = self
            .record
            .replicas
            .iter()
            .filter_map(|r| r.mode.map(|mode| (r.name.to_string(), mode)))
            .collect();
    }

    async fn node(&self, host: &NodeName) -> Result<Node> {
        self.deps
            .scheduler
            .nodes()
            .read()
            .await
            .get(host)
            .cloned()
            .ok_or_else(|| ManagerError::not_found("node", host.as_str()))
    }

    fn first_healthy_replica(&self) -> Option<String> {
        self.record
            .replicas
            .iter()
            .find(|r| r.is_healthy_rw())
            .map(|r| r.name.to_string())
    }

    async fn backup_target(&self) -> Result<BackupTarget> {
        let target = self.deps.settings.read().await.backup_target.clone();
        if target.is_empty() {
            return Err(ManagerError::BackupTargetNotSet);
        }
        Ok(BackupTarget::parse(&target)?)
    }

    // =========================================================================
    // Attach / detach
    // =========================================================================

    /// Validates an attach request. Returns false when already attached to
    /// the requested host.
    async fn accept_attach(&mut self, host: &NodeName, disable_frontend: bool) -> Result<bool> {
        let volume = &self.record.volume;
        match volume.state {
            VolumeState::Attached | VolumeState::Attaching => {
                return match &volume.node_id {
                    Some(current) if current == host => Ok(false),
                    Some(current) => Err(ManagerError::invalid_state(format!(
                        "volume {} is already attached to {current}",
                        volume.name
                    ))),
                    None => Err(ManagerError::invalid_state(format!(
                        "volume {} is attaching",
                        volume.name
                    ))),
                };
            }
            VolumeState::Detached => {}
            other => {
                return Err(ManagerError::invalid_state(format!(
                    "cannot attach volume {} while {other}",
                    volume.name
                )))
            }
        }
        if volume.standby {
            return Err(ManagerError::invalid_state(format!(
                "volume {} is a standby volume; activate it first",
                volume.name
            )));
        }
        if volume.initial_restoration_required {
            return Err(ManagerError::invalid_state(format!(
                "volume {} is still restoring from {}",
                volume.name, volume.from_backup
            )));
        }
        if volume.robustness == Robustness::Faulted {
            return Err(ManagerError::invalid_state(format!(
                "volume {} is faulted; salvage it first",
                volume.name
            )));
        }
        if active_replicas(&self.record.replicas) == 0 {
            return Err(ManagerError::invalid_state(format!(
                "volume {} has no scheduled replica",
                volume.name
            )));
        }
        self.node(host).await?;

        self.begin_attach(host.clone(), disable_frontend);
        Ok(true)
    }

    fn begin_attach(&mut self, host: NodeName, disable_frontend: bool) {
        self.record.volume.state = VolumeState::Attaching;
        self.record.volume.node_id = Some(host.clone());
        self.record.volume.disable_frontend = disable_frontend;
        let volume = self.record.volume.name.clone();
        self.emit(VolumeEvent::Attaching(VolumeAttachingPayload {
            volume,
            host_id: host,
            disable_frontend,
        }));
        self.publish_view();
    }

    #[instrument(skip(self), fields(volume = %self.record.volume.name))]
    async fn do_attach(&mut self, host: NodeName, disable_frontend: bool) {
        if let Err(e) = self.start_engine(&host, disable_frontend).await {
            warn!(host = %host, error = %e, "Attach failed");
            self.teardown("attach failed").await;
        }
        self.publish_view();
    }

    async fn start_engine(&mut self, host: &NodeName, disable_frontend: bool) -> Result<()> {
        let runtime = self.deps.runtime.clone();
        let node = self.node(host).await?;
        let nodes = self.deps.scheduler.nodes().read().await.clone();

        let active: Vec<Replica> = self
            .record
            .replicas
            .iter()
            .filter(|r| !r.is_failed())
            .cloned()
            .collect();
        expansion::recover_interrupted(runtime.as_ref(), &active, self.record.volume.size).await?;

        let now = Utc::now();
        let volume_name = self.volume_name();
        let mut started = Vec::new();
        let mut failed = Vec::new();
        for replica in self.record.replicas.iter_mut().filter(|r| !r.is_failed()) {
            let spec = ReplicaProcessSpec {
                name: replica.name.to_string(),
                volume: volume_name.clone(),
                instance_manager: replica.instance_manager_name.clone(),
                data_path: replica.data_path.clone(),
                size: replica.size,
            };
            match runtime.start_replica(&spec).await {
                Ok(()) => {
                    replica.running = true;
                    started.push(replica.name.to_string());
                }
                Err(e) => {
                    warn!(replica = %replica.name, error = %e, "Failed to start replica");
                    replica.mark_failed(now);
                    failed.push((replica.name, replica.host_id.clone(), e.to_string()));
                }
            }
        }
        for (replica, host_id, reason) in failed {
            self.emit_replica_failed(replica, host_id, reason);
        }
        if started.is_empty() {
            return Err(ManagerError::invalid_state(format!(
                "no replica of volume {volume_name} could be started"
            )));
        }

        let volume = &self.record.volume;
        let frontend = (!disable_frontend).then_some(volume.frontend);
        let spec = EngineProcessSpec {
            name: self.record.engine.name.to_string(),
            volume: volume_name.clone(),
            instance_manager: node.instance_manager_name.clone(),
            frontend,
            endpoint: endpoint_for(frontend, &volume_name, &node.address),
            size: volume.size,
            replicas: started.clone(),
        };
        let endpoint = runtime.start_engine(&spec).await?;

        let size = volume.size;
        let image = volume.current_image.clone();
        let engine = &mut self.record.engine;
        engine.host_id = Some(host.clone());
        engine.instance_manager_name = node.instance_manager_name.clone();
        engine.running = true;
        engine.endpoint = endpoint.clone();
        engine.size = size;
        engine.current_image = image;
        engine.replica_address_map.clear();

        for replica in self
            .record
            .replicas
            .iter_mut()
            .filter(|r| started.contains(&r.name.to_string()))
        {
            replica.mode = Some(ReplicaMode::ReadWrite);
            replica.healthy_at.get_or_insert(now);
            let address = nodes
                .get(&replica.host_id)
                .map(|n| n.address.clone())
                .unwrap_or_default();
            self.record
                .engine
                .replica_address_map
                .insert(replica.name.to_string(), format!("tcp://{address}/{}", replica.name));
        }

        let volume = &mut self.record.volume;
        volume.state = VolumeState::Attached;
        volume.node_id = Some(host.clone());
        volume.disable_frontend = disable_frontend;
        self.last_attach = Some((host.clone(), disable_frontend));
        self.refresh_robustness();

        info!(
            volume = %volume_name,
            host = %host,
            endpoint = %endpoint,
            replicas = started.len(),
            "Volume attached"
        );
        let engine_id = self.record.engine.name;
        self.emit(VolumeEvent::Attached(VolumeAttachedPayload {
            volume: self.record.volume.name.clone(),
            host_id: host.clone(),
            engine: engine_id,
            endpoint,
        }));
        Ok(())
    }

    async fn accept_detach(&mut self, force: bool) -> Result<bool> {
        let volume = &self.record.volume;
        match volume.state {
            VolumeState::Detached => return Ok(false),
            VolumeState::Attached => {}
            other => {
                return Err(ManagerError::invalid_state(format!(
                    "cannot detach volume {} while {other}",
                    volume.name
                )))
            }
        }
        if volume.standby && !force {
            return Err(ManagerError::invalid_state(format!(
                "volume {} is a standby volume; activate it first",
                volume.name
            )));
        }
        if self.record.migration_engine.is_some() {
            return Err(ManagerError::invalid_state(format!(
                "volume {} is migrating; confirm or roll back first",
                volume.name
            )));
        }
        if !force && self.record.engine.is_rebuilding() {
            return Err(ManagerError::invalid_state(format!(
                "volume {} is rebuilding a replica",
                volume.name
            )));
        }
        if !force && self.record.engine.is_restoring() {
            return Err(ManagerError::invalid_state(format!(
                "volume {} is restoring",
                volume.name
            )));
        }
        self.record.volume.state = VolumeState::Detaching;
        self.publish_view();
        Ok(true)
    }

    /// Stops the engine(s) and replica processes. Replica records and data
    /// stay; in-flight rebuild targets are failed since they never caught up.
    #[instrument(skip(self), fields(volume = %self.record.volume.name))]
    async fn teardown(&mut self, reason: &str) {
        let runtime = self.deps.runtime.clone();
        let now = Utc::now();

        let mut failed = Vec::new();
        let rebuilding: Vec<String> = self
            .record
            .engine
            .rebuild_status
            .iter()
            .filter(|s| s.is_active())
            .map(|s| s.replica.to_string())
            .collect();
        for status in self.record.engine.rebuild_status.iter_mut() {
            status.fail(reason);
        }
        for status in self.record.engine.restore_status.iter_mut() {
            status.fail(reason);
        }
        for status in self.record.engine.backup_status.iter_mut() {
            status.fail(reason);
        }
        for replica in self.record.replicas.iter_mut() {
            let incomplete = replica.mode == Some(ReplicaMode::WriteOnly)
                || rebuilding.contains(&replica.name.to_string());
            if incomplete && !replica.is_failed() {
                replica.mark_failed(now);
                failed.push((replica.name, replica.host_id.clone(), reason.to_string()));
            }
        }

        if let Some(target) = self.record.migration_engine.take() {
            if let Err(e) = runtime.stop_engine(&target.name.to_string()).await {
                warn!(engine = %target.name, error = %e, "Failed to stop migration engine");
            }
        }
        if let Err(e) = runtime.stop_engine(&self.record.engine.name.to_string()).await {
            warn!(engine = %self.record.engine.name, error = %e, "Failed to stop engine");
        }
        for replica in self.record.replicas.iter_mut() {
            if replica.running {
                if let Err(e) = runtime.stop_replica(&replica.name.to_string()).await {
                    warn!(replica = %replica.name, error = %e, "Failed to stop replica");
                }
            }
            replica.running = false;
            if !replica.is_failed() {
                replica.mode = None;
            }
        }
        self.record.engine.mark_stopped();

        let volume = &mut self.record.volume;
        volume.state = VolumeState::Detached;
        volume.node_id = None;

        for (replica, host_id, reason) in failed {
            self.emit_replica_failed(replica, host_id, reason);
        }
        self.refresh_robustness();
        let robustness = self.record.volume.robustness;
        info!(reason, %robustness, "Volume detached");
        let volume = self.record.volume.name.clone();
        self.emit(VolumeEvent::Detached(VolumeDetachedPayload { volume, robustness }));
    }

    fn emit_replica_failed(&mut self, replica: ReplicaId, host_id: NodeName, reason: String) {
        warn!(volume = %self.record.volume.name, replica = %replica, reason = %reason, "Replica failed");
        let volume = self.record.volume.name.clone();
        self.emit(VolumeEvent::ReplicaFailed(ReplicaFailedPayload {
            volume,
            replica,
            host_id,
            reason,
        }));
    }

    // =========================================================================
    // Expansion
    // =========================================================================

    fn accept_expand(&self, size: u64) -> Result<u64> {
        let volume = &self.record.volume;
        if volume.state != VolumeState::Detached {
            return Err(ManagerError::invalid_state(format!(
                "volume {} must be detached to expand",
                volume.name
            )));
        }
        if volume.initial_restoration_required {
            return Err(ManagerError::invalid_state(format!(
                "volume {} is still restoring",
                volume.name
            )));
        }
        let size = crate::model::validate_size(size)?;
        if size <= volume.size {
            return Err(ManagerError::invalid_argument(format!(
                "new size {size} must be larger than current size {}",
                volume.size
            )));
        }
        Ok(size)
    }

    #[instrument(skip(self), fields(volume = %self.record.volume.name))]
    async fn do_expand(&mut self, new_size: u64) {
        let old_size = self.record.volume.size;
        let active: Vec<Replica> = self
            .record
            .replicas
            .iter()
            .filter(|r| !r.is_failed())
            .cloned()
            .collect();

        let result = expansion::expand_replicas(
            self.deps.runtime.as_ref(),
            &self.deps.scheduler,
            &active,
            old_size,
            new_size,
        )
        .await;

        let volume = self.record.volume.name.clone();
        match result {
            Ok(()) => {
                self.commit_size(new_size, &active);
                info!(old_size, new_size, "Volume expanded");
                self.emit(VolumeEvent::Expanded(VolumeExpandedPayload {
                    volume,
                    old_size,
                    new_size,
                }));
            }
            Err(e) => {
                warn!(new_size, error = %e, "Volume expansion failed");
                self.record.engine.last_expansion_failed_at = Some(Utc::now());
                self.record.engine.last_expansion_error = e.to_string();
                self.emit(VolumeEvent::ExpansionFailed(ExpansionFailedPayload {
                    volume,
                    requested_size: new_size,
                    error: e.to_string(),
                }));
            }
        }
        self.publish_view();
    }

    fn commit_size(&mut self, new_size: u64, expanded: &[Replica]) {
        self.record.volume.size = new_size;
        self.record.engine.size = new_size;
        for replica in self.record.replicas.iter_mut() {
            if expanded.iter().any(|r| r.name == replica.name) {
                replica.size = new_size;
            }
        }
    }

    /// Grows an attached standby volume to follow a larger backup.
    async fn grow_standby(&mut self, new_size: u64) -> Result<()> {
        let old_size = self.record.volume.size;
        let active: Vec<Replica> = self
            .record
            .replicas
            .iter()
            .filter(|r| !r.is_failed())
            .cloned()
            .collect();
        self.deps
            .scheduler
            .charge_expansion(&active, new_size - old_size)
            .await?;
        for replica in &active {
            self.deps
                .runtime
                .expand_replica(&replica.name.to_string(), new_size)
                .await?;
        }
        self.commit_size(new_size, &active);
        info!(volume = %self.record.volume.name, old_size, new_size, "Standby volume expanded");
        let volume = self.record.volume.name.clone();
        self.emit(VolumeEvent::Expanded(VolumeExpandedPayload {
            volume,
            old_size,
            new_size,
        }));
        Ok(())
    }

    // =========================================================================
    // Migration
    // =========================================================================

    async fn migrate(&mut self, host: NodeName) -> Result<()> {
        let volume = &self.record.volume;
        if volume.state != VolumeState::Attached || volume.robustness != Robustness::Healthy {
            return Err(ManagerError::invalid_state(format!(
                "volume {} must be attached and healthy to migrate",
                volume.name
            )));
        }
        if volume.disable_frontend {
            return Err(ManagerError::invalid_state(format!(
                "volume {} has no frontend to migrate",
                volume.name
            )));
        }
        if let Some(target) = &self.record.migration_engine {
            return match &target.host_id {
                Some(current) if *current == host => Ok(()),
                _ => Err(ManagerError::invalid_state(format!(
                    "volume {} is already migrating",
                    volume.name
                ))),
            };
        }
        let from_host = volume.node_id.clone().ok_or_else(|| {
            ManagerError::invalid_state(format!("volume {} has no host", volume.name))
        })?;
        if from_host == host {
            return Err(ManagerError::invalid_argument(format!(
                "volume {} is already on {host}",
                volume.name
            )));
        }
        let node = self.node(&host).await?;

        let volume_name = self.volume_name();
        let frontend = volume.effective_frontend();
        let mut target = Engine::new(volume.size, &volume.current_image);
        let replicas: Vec<String> = self
            .record
            .replicas
            .iter()
            .filter(|r| r.is_healthy_rw())
            .map(|r| r.name.to_string())
            .collect();
        let spec = EngineProcessSpec {
            name: target.name.to_string(),
            volume: volume_name.clone(),
            instance_manager: node.instance_manager_name.clone(),
            frontend,
            endpoint: endpoint_for(frontend, &volume_name, &node.address),
            size: volume.size,
            replicas: replicas.clone(),
        };
        target.endpoint = self.deps.runtime.start_engine(&spec).await?;
        target.host_id = Some(host.clone());
        target.instance_manager_name = node.instance_manager_name;
        target.running = true;
        target.replica_mode_map = replicas
            .into_iter()
            .map(|r| (r, ReplicaMode::ReadWrite))
            .collect();
        target.replica_address_map = self.record.engine.replica_address_map.clone();
        let engine = target.name;
        self.record.migration_engine = Some(target);

        info!(volume = %volume_name, from = %from_host, to = %host, "Migration started");
        self.emit(VolumeEvent::MigrationStarted(MigrationStartedPayload {
            volume: self.record.volume.name.clone(),
            from_host,
            to_host: host,
            engine,
        }));
        Ok(())
    }

    async fn confirm_migration(&mut self) -> Result<()> {
        let Some(mut target) = self.record.migration_engine.take() else {
            return Err(ManagerError::invalid_state(format!(
                "volume {} is not migrating",
                self.record.volume.name
            )));
        };
        let origin = self.record.engine.name.to_string();
        if let Err(e) = self.deps.runtime.stop_engine(&origin).await {
            self.record.migration_engine = Some(target);
            return Err(e.into());
        }

        let old = &self.record.engine;
        target.last_restored_backup = old.last_restored_backup.clone();
        target.requested_backup_restore = old.requested_backup_restore.clone();
        target.last_expansion_failed_at = old.last_expansion_failed_at;
        target.last_expansion_error = old.last_expansion_error.clone();
        target.backup_status = old.backup_status.clone();
        let host = target.host_id.clone();
        self.record.engine = target;

        let host = host.ok_or_else(|| ManagerError::invalid_state("migration engine has no host"))?;
        self.record.volume.node_id = Some(host.clone());
        let disable_frontend = self.record.volume.disable_frontend;
        self.last_attach = Some((host.clone(), disable_frontend));

        info!(volume = %self.record.volume.name, host = %host, "Migration confirmed");
        let volume = self.record.volume.name.clone();
        self.emit(VolumeEvent::MigrationConfirmed(MigrationFinishedPayload {
            volume,
            host_id: host,
        }));
        Ok(())
    }

    async fn rollback_migration(&mut self) -> Result<()> {
        let Some(target) = self.record.migration_engine.take() else {
            return Err(ManagerError::invalid_state(format!(
                "volume {} is not migrating",
                self.record.volume.name
            )));
        };
        if let Err(e) = self.deps.runtime.stop_engine(&target.name.to_string()).await {
            self.record.migration_engine = Some(target);
            return Err(e.into());
        }
        let host = self.record.volume.node_id.clone().ok_or_else(|| {
            ManagerError::invalid_state("volume lost its host during migration")
        })?;
        info!(volume = %self.record.volume.name, "Migration rolled back");
        let volume = self.record.volume.name.clone();
        self.emit(VolumeEvent::MigrationRolledBack(MigrationFinishedPayload {
            volume,
            host_id: host,
        }));
        Ok(())
    }

    // =========================================================================
    // Standby activation and salvage
    // =========================================================================

    fn accept_activate(&mut self, frontend: Option<Frontend>) -> Result<()> {
        let volume = &self.record.volume;
        if !volume.standby {
            return Err(ManagerError::invalid_state(format!(
                "volume {} is not a standby volume",
                volume.name
            )));
        }
        if frontend.is_some_and(|f| f != Frontend::Blockdev) {
            return Err(ManagerError::invalid_argument(
                "standby volumes are activated with the blockdev frontend",
            ));
        }
        let engine = &self.record.engine;
        if engine.is_restoring()
            || volume.initial_restoration_required
            || engine.last_restored_backup != volume.last_backup
        {
            return Err(ManagerError::IncrementalRestoreInProgress {
                volume: volume.name.to_string(),
                last_restored: engine.last_restored_backup.clone(),
                last_backup: volume.last_backup.clone(),
            });
        }

        let volume = &mut self.record.volume;
        volume.standby = false;
        volume.frontend = Frontend::Blockdev;
        self.record.engine.last_restored_backup.clear();
        self.record.engine.requested_backup_restore.clear();

        info!(volume = %self.record.volume.name, "Standby volume activated");
        let volume = self.record.volume.name.clone();
        self.emit(VolumeEvent::Activated(VolumeActivatedPayload {
            volume,
            frontend: Frontend::Blockdev,
        }));
        Ok(())
    }

    fn salvage(&mut self, names: &[String]) -> Result<()> {
        let volume = &self.record.volume;
        if volume.state != VolumeState::Detached || volume.robustness != Robustness::Faulted {
            return Err(ManagerError::invalid_state(format!(
                "volume {} must be detached and faulted to salvage",
                volume.name
            )));
        }
        if names.is_empty() {
            return Err(ManagerError::invalid_argument("no replica named for salvage"));
        }
        for name in names {
            let replica = self
                .record
                .replica(name)
                .ok_or_else(|| ManagerError::not_found("replica", name.as_str()))?;
            if !replica.is_failed() {
                return Err(ManagerError::invalid_argument(format!(
                    "replica {name} has not failed"
                )));
            }
        }
        let salvaged = self.restore_replicas(names);
        self.after_salvage(salvaged, false);
        Ok(())
    }

    /// Clears the failure on the named replicas.
    fn restore_replicas(&mut self, names: &[String]) -> Vec<ReplicaId> {
        let mut salvaged = Vec::new();
        for name in names {
            if let Some(replica) = self.record.replica_mut(name) {
                replica.failed_at = None;
                replica.mode = None;
                salvaged.push(replica.name);
            }
        }
        salvaged
    }

    fn after_salvage(&mut self, replicas: Vec<ReplicaId>, automatic: bool) {
        self.rebuild_retries.clear(&self.volume_name());
        self.next_rebuild_at = None;
        self.refresh_robustness();
        info!(
            volume = %self.record.volume.name,
            replicas = replicas.len(),
            automatic,
            "Volume salvaged"
        );
        let volume = self.record.volume.name.clone();
        self.emit(VolumeEvent::Salvaged(VolumeSalvagedPayload {
            volume,
            replicas,
            automatic,
        }));
    }

    // =========================================================================
    // Snapshots and backups
    // =========================================================================

    fn require_engine(&self) -> Result<String> {
        if !self.record.engine.running || self.record.volume.state != VolumeState::Attached {
            return Err(ManagerError::invalid_state(format!(
                "volume {} must be attached",
                self.record.volume.name
            )));
        }
        Ok(self.record.engine.name.to_string())
    }

    async fn create_snapshot(
        &mut self,
        name: Option<String>,
        labels: BTreeMap<String, String>,
    ) -> Result<Snapshot> {
        let engine = self.require_engine()?;
        let name = name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| SnapshotId::new().to_string());
        if name == VOLUME_HEAD || self.snapshots.get(&name).is_ok() {
            return Err(ManagerError::AlreadyExists {
                kind: "snapshot",
                name,
            });
        }
        self.deps.runtime.snapshot(&engine, &name).await?;
        let snapshot = self
            .snapshots
            .create(Some(name), labels, true, self.record.volume.size)?;

        debug!(volume = %self.record.volume.name, snapshot = %snapshot.name, "Snapshot created");
        let volume = self.record.volume.name.clone();
        self.emit(VolumeEvent::SnapshotCreated(SnapshotCreatedPayload {
            volume,
            snapshot: snapshot.name.clone(),
        }));
        Ok(snapshot)
    }

    async fn start_purge(&mut self) -> Result<()> {
        self.require_engine()?;
        if self.record.engine.is_purging() {
            return Ok(());
        }
        let snapshots = self.snapshots.purgeable();
        let replicas: Vec<String> = self
            .record
            .replicas
            .iter()
            .filter(|r| r.is_healthy_rw())
            .map(|r| r.name.to_string())
            .collect();

        self.record.engine.purge_status.clear();
        for replica in &replicas {
            let job = PurgeJob {
                replica: replica.clone(),
                snapshots: snapshots.clone(),
            };
            self.deps
                .runtime
                .start_purge(job, self.reports_tx.clone())
                .await?;
            let id = self.replica_id(replica)?;
            self.record.engine.purge_status.push(PurgeStatus::started(id));
        }
        info!(
            volume = %self.record.volume.name,
            snapshots = snapshots.len(),
            replicas = replicas.len(),
            "Snapshot purge started"
        );
        if replicas.is_empty() {
            self.finish_purge();
        }
        Ok(())
    }

    fn finish_purge(&mut self) {
        let removed = self.snapshots.purge();
        let volume = self.record.volume.name.clone();
        self.emit(VolumeEvent::SnapshotPurged(SnapshotPurgedPayload {
            volume,
            removed,
        }));
    }

    fn replica_id(&self, name: &str) -> Result<ReplicaId> {
        self.record
            .replica(name)
            .map(|r| r.name)
            .ok_or_else(|| ManagerError::not_found("replica", name))
    }

    fn backup_labels(&self, user: BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut labels = user;
        let volume = &self.record.volume;
        labels.insert(
            KUBERNETES_STATUS_LABEL.to_string(),
            serde_json::to_string(&volume.kubernetes_status).unwrap_or_default(),
        );
        if !volume.base_image.is_empty() {
            labels.insert(BASE_IMAGE_LABEL.to_string(), volume.base_image.clone());
        }
        labels
    }

    async fn start_backup(
        &mut self,
        snapshot_name: String,
        labels: BTreeMap<String, String>,
    ) -> Result<String> {
        let target = self.backup_target().await?;
        let engine = self.require_engine()?;
        let snapshot = self.snapshots.get(&snapshot_name)?.clone();
        if snapshot.name == VOLUME_HEAD || snapshot.removed {
            return Err(ManagerError::invalid_argument(format!(
                "snapshot {snapshot_name} cannot be backed up"
            )));
        }
        let replica = self.first_healthy_replica().ok_or_else(|| {
            ManagerError::invalid_state(format!(
                "volume {} has no healthy replica",
                self.record.volume.name
            ))
        })?;

        let volume = &self.record.volume;
        let name = BackupId::new().to_string();
        let backup = NewBackup {
            name: name.clone(),
            snapshot_name: snapshot.name.clone(),
            snapshot_created: snapshot.created,
            volume_name: volume.name.to_string(),
            volume_size: volume.size,
            volume_created: volume.created,
            labels: self.backup_labels(labels),
        };
        let job = BackupJob {
            engine,
            replica: replica.clone(),
            snapshot: snapshot.name.clone(),
            target: target.clone(),
            backup,
            store: self.deps.backups.clone(),
        };
        self.deps
            .runtime
            .start_backup(job, self.reports_tx.clone())
            .await?;

        let replica_id = self.replica_id(&replica)?;
        self.record.engine.backup_status.push(BackupStatus::started(
            name.clone(),
            snapshot.name,
            replica_id,
        ));
        self.pending_backups.insert(name.clone(), target);
        info!(volume = %self.record.volume.name, backup = %name, "Backup started");
        Ok(name)
    }

    // =========================================================================
    // Job reports
    // =========================================================================

    async fn on_report(&mut self, report: JobReport) {
        match report.kind.clone() {
            JobKind::Rebuild => self.on_rebuild_report(report).await,
            JobKind::Backup { backup } => self.on_backup_report(&backup, report).await,
            JobKind::Restore { .. } => self.on_restore_report(report).await,
            JobKind::Purge => self.on_purge_report(report),
        }
        self.publish_view();
    }

    async fn on_rebuild_report(&mut self, report: JobReport) {
        let Some(status) = self
            .record
            .engine
            .rebuild_status
            .iter_mut()
            .find(|s| s.replica.to_string() == report.replica)
        else {
            debug!(replica = %report.replica, "Rebuild report for unknown replica");
            return;
        };

        let key = self.record.volume.name.to_string();
        match report.event {
            JobEvent::Progress(progress) => {
                status.advance(progress);
            }
            JobEvent::Completed => {
                if !status.complete() {
                    return;
                }
                let replica = status.replica;
                if let Some(r) = self.record.replica_mut(&report.replica) {
                    r.mode = Some(ReplicaMode::ReadWrite);
                    r.healthy_at = Some(Utc::now());
                }
                self.rebuild_retries.clear(&key);
                self.next_rebuild_at = None;
                self.refresh_robustness();
                info!(volume = %key, replica = %replica, "Rebuild completed");
                self.emit(VolumeEvent::RebuildCompleted(RebuildFinishedPayload {
                    volume: self.record.volume.name.clone(),
                    replica,
                    error: None,
                }));
            }
            JobEvent::Failed(error) => {
                if !status.fail(&error) {
                    return;
                }
                let replica = status.replica;
                if let Some(r) = self.record.replica_mut(&report.replica) {
                    r.mark_failed(Utc::now());
                }
                let engine = self.record.engine.name.to_string();
                if let Err(e) = self.deps.runtime.remove_replica(&engine, &report.replica).await {
                    debug!(replica = %replica, error = %e, "Failed to detach replica from engine");
                }
                if let Err(e) = self.deps.runtime.stop_replica(&report.replica).await {
                    debug!(replica = %replica, error = %e, "Failed to stop replica");
                }
                self.rebuild_retries.record_failure(&key);
                let attempt = self.rebuild_retries.failures(&key);
                self.next_rebuild_at = Some(Instant::now() + self.backoff.delay(attempt));
                self.refresh_robustness();
                warn!(volume = %key, replica = %replica, error = %error, "Rebuild failed");
                self.emit(VolumeEvent::RebuildFailed(RebuildFinishedPayload {
                    volume: self.record.volume.name.clone(),
                    replica,
                    error: Some(error),
                }));
            }
        }
    }

    async fn on_backup_report(&mut self, backup: &str, report: JobReport) {
        let Some(status) = self
            .record
            .engine
            .backup_status
            .iter_mut()
            .find(|s| s.id == backup)
        else {
            return;
        };

        match report.event {
            JobEvent::Progress(progress) => {
                status.advance(progress);
            }
            JobEvent::Completed => {
                let snapshot = status.snapshot.clone();
                let Some(target) = self.pending_backups.remove(backup) else {
                    return;
                };
                let volume_name = self.volume_name();
                let record = match self
                    .deps
                    .backups
                    .get_backup(&target, &volume_name, backup)
                    .await
                {
                    Ok(record) => record,
                    Err(e) => {
                        self.fail_backup(backup, &snapshot, &e.to_string());
                        return;
                    }
                };
                if let Some(status) = self
                    .record
                    .engine
                    .backup_status
                    .iter_mut()
                    .find(|s| s.id == backup)
                {
                    status.backup_url = record.url.clone();
                    status.complete();
                }
                self.record.volume.last_backup = record.name.clone();
                self.record.volume.last_backup_at = Some(record.created);
                info!(volume = %volume_name, backup = %backup, url = %record.url, "Backup completed");
                self.emit(VolumeEvent::BackupCompleted(BackupCompletedPayload {
                    volume: self.record.volume.name.clone(),
                    snapshot,
                    backup: record.name,
                    url: record.url,
                }));
            }
            JobEvent::Failed(error) => {
                let snapshot = status.snapshot.clone();
                self.pending_backups.remove(backup);
                self.fail_backup(backup, &snapshot, &error);
            }
        }
    }

    fn fail_backup(&mut self, backup: &str, snapshot: &str, error: &str) {
        if let Some(status) = self
            .record
            .engine
            .backup_status
            .iter_mut()
            .find(|s| s.id == backup)
        {
            status.fail(error);
        }
        warn!(volume = %self.record.volume.name, backup = %backup, error = %error, "Backup failed");
        let volume = self.record.volume.name.clone();
        self.emit(VolumeEvent::BackupFailed(BackupFailedPayload {
            volume,
            snapshot: snapshot.to_string(),
            error: error.to_string(),
        }));
    }

    async fn on_restore_report(&mut self, report: JobReport) {
        let Some(status) = self
            .record
            .engine
            .restore_status
            .iter_mut()
            .find(|s| s.replica.to_string() == report.replica && s.is_active())
        else {
            return;
        };
        let finished = match report.event {
            JobEvent::Progress(progress) => {
                status.advance(progress);
                false
            }
            JobEvent::Completed => status.complete(),
            JobEvent::Failed(error) => {
                warn!(replica = %report.replica, error = %error, "Restore failed on replica");
                status.fail(&error)
            }
        };
        if finished {
            match self.restore_round() {
                RestoreRound::Complete => self.finish_restore().await,
                RestoreRound::Failed => {
                    warn!(volume = %self.record.volume.name, "Restore round finished with errors");
                }
                RestoreRound::Running => {}
            }
        }
    }

    fn restore_round(&self) -> RestoreRound {
        let statuses = &self.record.engine.restore_status;
        if statuses.iter().any(|s| s.is_active()) {
            return RestoreRound::Running;
        }
        if statuses.iter().all(|s| s.state() == ProgressState::Complete) {
            RestoreRound::Complete
        } else {
            RestoreRound::Failed
        }
    }

    async fn finish_restore(&mut self) {
        let backup = self.record.engine.requested_backup_restore.clone();
        self.record.engine.last_restored_backup = backup.clone();
        let initial = std::mem::replace(&mut self.record.volume.initial_restoration_required, false);

        info!(volume = %self.record.volume.name, backup = %backup, initial, "Restore completed");
        let volume = self.record.volume.name.clone();
        self.emit(VolumeEvent::RestoreCompleted(RestoreCompletedPayload {
            volume,
            backup,
            incremental: !initial,
        }));

        if !self.record.volume.standby {
            self.teardown("restore completed").await;
        }
    }

    fn on_purge_report(&mut self, report: JobReport) {
        let Some(status) = self
            .record
            .engine
            .purge_status
            .iter_mut()
            .find(|s| s.replica.to_string() == report.replica)
        else {
            return;
        };
        let finished = match report.event {
            JobEvent::Progress(progress) => {
                status.advance(progress);
                false
            }
            JobEvent::Completed => status.complete(),
            JobEvent::Failed(error) => status.fail(&error),
        };
        let statuses = &self.record.engine.purge_status;
        if finished && statuses.iter().all(|s| s.state().is_terminal()) {
            if statuses.iter().all(|s| s.state() == ProgressState::Complete) {
                self.finish_purge();
            } else {
                warn!(volume = %self.record.volume.name, "Snapshot purge finished with errors");
            }
        }
    }

    /// Starts a restore of `backup_url` on every healthy replica.
    async fn start_restore(&mut self, backup_url: String, backup: String) -> Result<()> {
        let replicas: Vec<ReplicaId> = self
            .record
            .replicas
            .iter()
            .filter(|r| r.is_healthy_rw())
            .map(|r| r.name)
            .collect();
        if replicas.is_empty() {
            return Err(ManagerError::invalid_state(format!(
                "volume {} has no replica to restore into",
                self.record.volume.name
            )));
        }

        let last_restored = self.record.engine.last_restored_backup.clone();
        self.record.engine.restore_status.clear();
        self.record.engine.requested_backup_restore = backup.clone();
        for replica in replicas {
            let job = RestoreJob {
                replica: replica.to_string(),
                backup_url: backup_url.clone(),
                store: self.deps.backups.clone(),
            };
            match self
                .deps
                .runtime
                .start_restore(job, self.reports_tx.clone())
                .await
            {
                Ok(()) => self.record.engine.restore_status.push(RestoreStatus::started(
                    replica,
                    backup_url.clone(),
                    last_restored.clone(),
                )),
                Err(e) => {
                    let mut status =
                        RestoreStatus::started(replica, backup_url.clone(), last_restored.clone());
                    status.fail(&e.to_string());
                    self.record.engine.restore_status.push(status);
                }
            }
        }
        info!(volume = %self.record.volume.name, backup = %backup, "Restore started");
        Ok(())
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    async fn tick(&mut self) {
        match self.record.volume.state {
            VolumeState::Attached => self.tick_attached().await,
            VolumeState::Detached => self.tick_detached().await,
            _ => {}
        }
        self.rebuild_retries.prune();
        self.publish_view();
    }

    /// Live instance names per instance manager; `None` when unknown.
    async fn live_instances(&self) -> HashMap<String, Option<Vec<String>>> {
        let mut live = HashMap::new();
        for replica in &self.record.replicas {
            let im = &replica.instance_manager_name;
            if im.is_empty() || live.contains_key(im) {
                continue;
            }
            let names = self
                .deps
                .runtime
                .list_instances(im)
                .await
                .ok()
                .map(|instances| instances.into_iter().map(|i| i.name).collect());
            live.insert(im.clone(), names);
        }
        live
    }

    async fn tick_attached(&mut self) {
        let runtime = self.deps.runtime.clone();
        let engine = self.record.engine.name.to_string();

        let modes = match runtime.engine_replicas(&engine).await {
            Ok(modes) => modes,
            Err(e) => {
                warn!(volume = %self.record.volume.name, error = %e, "Engine lost");
                let reattach = self.last_attach.clone();
                self.teardown("engine lost").await;
                if let Some((host, disable_frontend)) = reattach {
                    if self.record.volume.robustness != Robustness::Faulted {
                        self.begin_attach(host.clone(), disable_frontend);
                        self.do_attach(host, disable_frontend).await;
                    }
                }
                return;
            }
        };
        let live = self.live_instances().await;
        self.detect_failures(&engine, &modes, &live).await;

        if self.record.healthy_rw_count() == 0 {
            warn!(volume = %self.record.volume.name, "No healthy replica left");
            self.teardown("all replicas failed").await;
            self.set_robustness(Robustness::Faulted);
            return;
        }

        self.refresh_robustness();
        self.follow_backup_volume().await;
        self.maybe_start_rebuild().await;
        self.cleanup_replicas(&engine, &live).await;
        self.refresh_robustness();
    }

    async fn detect_failures(
        &mut self,
        engine: &str,
        modes: &BTreeMap<String, ReplicaMode>,
        live: &HashMap<String, Option<Vec<String>>>,
    ) {
        let now = Utc::now();
        let mut failed = Vec::new();
        for replica in self.record.replicas.iter_mut() {
            if replica.is_failed() || replica.mode.is_none() {
                continue;
            }
            let name = replica.name.to_string();
            let listed = live
                .get(&replica.instance_manager_name)
                .and_then(|names| names.as_ref())
                .map(|names| names.contains(&name));
            let reason = match (modes.get(&name), listed) {
                (_, Some(false)) => Some("replica process is gone"),
                (None, _) => Some("replica left the engine"),
                (Some(ReplicaMode::Error), _) => Some("engine marked replica ERR"),
                (Some(mode), _) => {
                    replica.mode = Some(*mode);
                    replica.running = true;
                    None
                }
            };
            if let Some(reason) = reason {
                replica.mark_failed(now);
                failed.push((replica.name, replica.host_id.clone(), reason.to_string()));
            }
        }

        for (replica, host_id, reason) in failed {
            let name = replica.to_string();
            for status in self
                .record
                .engine
                .rebuild_status
                .iter_mut()
                .filter(|s| s.replica == replica || s.from_replica == replica)
            {
                status.fail(&reason);
            }
            if let Err(e) = self.deps.runtime.remove_replica(engine, &name).await {
                debug!(replica = %name, error = %e, "Replica already gone from engine");
            }
            if let Err(e) = self.deps.runtime.stop_replica(&name).await {
                debug!(replica = %name, error = %e, "Failed to stop replica");
            }
            self.emit_replica_failed(replica, host_id, reason);
        }
    }

    async fn maybe_start_rebuild(&mut self) {
        let engine = &self.record.engine;
        if engine.is_rebuilding() || engine.is_restoring() || self.record.migration_engine.is_some()
        {
            return;
        }
        let volume = &self.record.volume;
        if volume.robustness == Robustness::Faulted
            || active_replicas(&self.record.replicas) >= volume.number_of_replicas as usize
        {
            return;
        }
        let key = volume.name.to_string();
        if self.rebuild_retries.is_exhausted(&key) {
            return;
        }
        if self.next_rebuild_at.is_some_and(|at| Instant::now() < at) {
            return;
        }
        let Some(source) = self.first_healthy_replica() else {
            return;
        };

        let mut replica =
            match provision_replica(&self.deps.scheduler, volume, &self.record.replicas).await {
                Ok(replica) => replica,
                Err(e) => {
                    if self.record.volume.conditions.scheduled.set(
                        false,
                        REASON_REPLICA_SCHEDULING_FAILURE,
                        &e.to_string(),
                    ) {
                        warn!(volume = %key, error = %e, "Cannot schedule replacement replica");
                    }
                    return;
                }
            };
        self.record.volume.conditions.scheduled.set(true, "", "");

        if let Err(e) = self.launch_rebuild(&mut replica, &source).await {
            warn!(volume = %key, replica = %replica.name, error = %e, "Failed to start rebuild");
            self.destroy_replica(&replica).await;
            self.rebuild_retries.record_failure(&key);
            let attempt = self.rebuild_retries.failures(&key);
            self.next_rebuild_at = Some(Instant::now() + self.backoff.delay(attempt));
            return;
        }

        let replica_id = replica.name;
        let from_replica = self.replica_id(&source).unwrap_or(replica_id);
        self.record.replicas.push(replica);
        self.record
            .engine
            .rebuild_status
            .retain(|s| s.state() != ProgressState::Complete);
        self.record
            .engine
            .rebuild_status
            .push(RebuildStatus::started(replica_id, from_replica));
        self.refresh_robustness();

        info!(volume = %key, replica = %replica_id, from = %from_replica, "Rebuild started");
        self.emit(VolumeEvent::RebuildStarted(RebuildStartedPayload {
            volume: self.record.volume.name.clone(),
            replica: replica_id,
            from_replica,
        }));
    }

    async fn launch_rebuild(&self, replica: &mut Replica, source: &str) -> Result<()> {
        let runtime = &self.deps.runtime;
        let engine = self.record.engine.name.to_string();
        let name = replica.name.to_string();

        runtime
            .start_replica(&ReplicaProcessSpec {
                name: name.clone(),
                volume: self.volume_name(),
                instance_manager: replica.instance_manager_name.clone(),
                data_path: replica.data_path.clone(),
                size: replica.size,
            })
            .await?;
        replica.running = true;
        runtime
            .add_replica(&engine, &name, ReplicaMode::WriteOnly)
            .await?;
        replica.mode = Some(ReplicaMode::WriteOnly);
        runtime
            .start_rebuild(
                RebuildJob {
                    engine,
                    replica: name,
                    from_replica: source.to_string(),
                },
                self.reports_tx.clone(),
            )
            .await?;
        Ok(())
    }

    /// Removes failed replicas once the volume is back at full strength and
    /// trims replicas beyond the target count.
    async fn cleanup_replicas(&mut self, engine: &str, live: &HashMap<String, Option<Vec<String>>>) {
        let target = self.record.volume.number_of_replicas as usize;
        if self.record.engine.is_rebuilding() || self.record.healthy_rw_count() < target {
            return;
        }

        let mut removed = Vec::new();
        let mut healthy_kept = 0usize;
        for replica in &self.record.replicas {
            if replica.is_failed() {
                let known = live
                    .get(&replica.instance_manager_name)
                    .and_then(|names| names.as_deref());
                if replica.is_definitively_failed(known) || replica.instance_manager_name.is_empty()
                {
                    removed.push(replica.clone());
                }
            } else if replica.is_healthy_rw() {
                healthy_kept += 1;
                if healthy_kept > target {
                    removed.push(replica.clone());
                }
            }
        }

        for replica in removed {
            let name = replica.name.to_string();
            if !replica.is_failed() {
                if let Err(e) = self.deps.runtime.remove_replica(engine, &name).await {
                    warn!(replica = %name, error = %e, "Failed to remove replica from engine");
                    continue;
                }
            }
            self.destroy_replica(&replica).await;
            self.record.replicas.retain(|r| r.name != replica.name);
            self.record
                .engine
                .rebuild_status
                .retain(|s| s.replica != replica.name);
            info!(volume = %self.record.volume.name, replica = %name, "Replica removed");
        }
    }

    /// Stops a replica, drops its data and returns its capacity.
    async fn destroy_replica(&self, replica: &Replica) {
        let name = replica.name.to_string();
        let runtime = &self.deps.runtime;
        if let Err(e) = runtime.stop_replica(&name).await {
            debug!(replica = %name, error = %e, "Failed to stop replica");
        }
        if let Err(e) = runtime.remove_replica_data(&name).await {
            warn!(replica = %name, error = %e, "Failed to remove replica data");
        }
        self.deps.scheduler.release(replica).await;
        match tokio::fs::remove_dir_all(&replica.data_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(replica = %name, error = %e, "Failed to remove replica directory"),
        }
    }

    /// Keeps a standby volume restoring the newest backup of its source.
    async fn follow_backup_volume(&mut self) {
        let volume = &self.record.volume;
        if !volume.standby
            || volume.initial_restoration_required
            || self.record.engine.is_restoring()
        {
            return;
        }
        let source = match parse_backup_url(&volume.from_backup) {
            Ok(source) => source,
            Err(e) => {
                warn!(volume = %volume.name, error = %e, "Standby volume has an invalid source");
                return;
            }
        };
        let backup_volume = match self
            .deps
            .backups
            .get_backup_volume(&source.target, &source.volume)
            .await
        {
            Ok(bv) => bv,
            Err(e) => {
                debug!(volume = %volume.name, error = %e, "Backup volume unavailable");
                return;
            }
        };

        if !backup_volume.last_backup_name.is_empty()
            && backup_volume.last_backup_name != self.record.volume.last_backup
        {
            self.record.volume.last_backup = backup_volume.last_backup_name.clone();
            self.record.volume.last_backup_at = backup_volume.last_backup_at;
        }

        let last_backup = self.record.volume.last_backup.clone();
        let engine = &self.record.engine;
        let failed_before = engine.requested_backup_restore == last_backup
            && engine
                .restore_status
                .iter()
                .any(|s| s.state() == ProgressState::Error);
        if last_backup.is_empty() || engine.last_restored_backup == last_backup || failed_before {
            return;
        }

        if backup_volume.size > self.record.volume.size {
            if let Err(e) = self.grow_standby(backup_volume.size).await {
                warn!(volume = %self.record.volume.name, error = %e, "Cannot grow standby volume");
                return;
            }
        }
        let url = source.target.backup_url(&source.volume, &last_backup);
        if let Err(e) = self.start_restore(url, last_backup).await {
            warn!(volume = %self.record.volume.name, error = %e, "Incremental restore not started");
        }
    }

    async fn tick_detached(&mut self) {
        let volume = &self.record.volume;

        if volume.robustness == Robustness::Faulted {
            self.try_auto_salvage().await;
            return;
        }

        let never_attached = self.record.replicas.iter().all(|r| r.healthy_at.is_none());
        if never_attached && active_replicas(&self.record.replicas) < volume.number_of_replicas as usize {
            schedule_missing(&self.deps.scheduler, &mut self.record).await;
        }

        let volume = &self.record.volume;
        let restore_failed = self
            .record
            .engine
            .restore_status
            .iter()
            .any(|s| s.state() == ProgressState::Error);
        if volume.initial_restoration_required
            && !restore_failed
            && active_replicas(&self.record.replicas) > 0
        {
            self.begin_initial_restore().await;
        }
    }

    async fn begin_initial_restore(&mut self) {
        let source = match parse_backup_url(&self.record.volume.from_backup) {
            Ok(source) => source,
            Err(e) => {
                warn!(volume = %self.record.volume.name, error = %e, "Invalid restore source");
                return;
            }
        };
        let host = {
            let nodes = self.deps.scheduler.nodes().read().await;
            if nodes.contains_key(&self.deps.local_node) {
                Some(self.deps.local_node.clone())
            } else {
                nodes.keys().next().cloned()
            }
        };
        let Some(host) = host else {
            return;
        };

        self.begin_attach(host.clone(), true);
        self.do_attach(host, true).await;
        if self.record.volume.state != VolumeState::Attached {
            return;
        }

        let url = source.target.backup_url(&source.volume, &source.backup);
        if let Err(e) = self.start_restore(url, source.backup).await {
            warn!(volume = %self.record.volume.name, error = %e, "Initial restore not started");
            self.teardown("restore failed to start").await;
        }
    }

    async fn try_auto_salvage(&mut self) {
        if !self.deps.settings.read().await.auto_salvage {
            return;
        }
        let candidates: Vec<String> = self
            .record
            .replicas
            .iter()
            .filter(|r| r.is_failed() && r.healthy_at.is_some())
            .map(|r| r.name.to_string())
            .collect();
        if candidates.is_empty() {
            return;
        }
        let salvaged = self.restore_replicas(&candidates);
        self.after_salvage(salvaged, true);

        let reattach = self.last_attach.clone();
        if let Some((host, disable_frontend)) = reattach {
            self.begin_attach(host.clone(), disable_frontend);
            self.do_attach(host, disable_frontend).await;
        }
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    async fn delete(&mut self) -> Result<()> {
        let volume = &self.record.volume;
        let internal = volume.standby || volume.initial_restoration_required;
        if volume.state != VolumeState::Detached && !internal {
            return Err(ManagerError::invalid_state(format!(
                "volume {} must be detached before deletion",
                volume.name
            )));
        }
        if volume.state != VolumeState::Detached {
            self.teardown("volume deleted").await;
        }

        self.record.volume.state = VolumeState::Deleting;
        self.publish_view();
        let replicas = std::mem::take(&mut self.record.replicas);
        for replica in &replicas {
            self.destroy_replica(replica).await;
        }

        info!(volume = %self.record.volume.name, replicas = replicas.len(), "Volume deleted");
        let volume = self.record.volume.name.clone();
        self.emit(VolumeEvent::Deleted(VolumeDeletedPayload { volume }));
        Ok(())
    }
}

#[async_trait]
impl Actor for VolumeActor {
    type Message = VolumeMessage;

    fn name(&self) -> &str {
        "volume"
    }

    async fn on_start(&mut self, _ctx: &mut ActorContext) -> std::result::Result<(), ActorError> {
        let Some(mut reports) = self.reports_rx.take() else {
            return Err(ActorError::Permanent("report channel already taken".into()));
        };
        let handle = self.handle.clone();
        tokio::spawn(async move {
            while let Some(report) = reports.recv().await {
                if handle.send(VolumeMessage::Report(report)).await.is_err() {
                    break;
                }
            }
        });
        self.publish_view();
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: VolumeMessage,
        _ctx: &mut ActorContext,
    ) -> std::result::Result<bool, ActorError> {
        match msg {
            VolumeMessage::Attach {
                host,
                disable_frontend,
                reply,
            } => match self.accept_attach(&host, disable_frontend).await {
                Ok(start) => {
                    let _ = reply.send(Ok(self.view()));
                    if start {
                        self.do_attach(host, disable_frontend).await;
                    }
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            VolumeMessage::Detach { force, reply } => match self.accept_detach(force).await {
                Ok(stop) => {
                    let _ = reply.send(Ok(self.view()));
                    if stop {
                        self.teardown("detach requested").await;
                        self.publish_view();
                    }
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            VolumeMessage::Expand { size, reply } => match self.accept_expand(size) {
                Ok(size) => {
                    let _ = reply.send(Ok(self.view()));
                    self.do_expand(size).await;
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            VolumeMessage::Migrate { host, reply } => {
                let result = self.migrate(host).await.map(|()| self.view());
                self.publish_view();
                let _ = reply.send(result);
            }
            VolumeMessage::ConfirmMigration { reply } => {
                let result = self.confirm_migration().await.map(|()| self.view());
                self.publish_view();
                let _ = reply.send(result);
            }
            VolumeMessage::RollbackMigration { reply } => {
                let result = self.rollback_migration().await.map(|()| self.view());
                self.publish_view();
                let _ = reply.send(result);
            }
            VolumeMessage::Activate { frontend, reply } => match self.accept_activate(frontend) {
                Ok(()) => {
                    let _ = reply.send(Ok(self.view()));
                    if self.record.volume.state == VolumeState::Attached {
                        self.teardown("standby volume activated").await;
                    }
                    self.publish_view();
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            VolumeMessage::Salvage { replicas, reply } => {
                let result = self.salvage(&replicas).map(|()| self.view());
                self.publish_view();
                let _ = reply.send(result);
            }
            VolumeMessage::UpdateReplicaCount { count, reply } => {
                let result = if count == 0 || count > crate::settings::MAX_REPLICA_COUNT {
                    Err(ManagerError::invalid_argument(format!(
                        "replica count must be between 1 and {}",
                        crate::settings::MAX_REPLICA_COUNT
                    )))
                } else {
                    self.record.volume.number_of_replicas = count;
                    self.refresh_robustness();
                    self.publish_view();
                    Ok(self.view())
                };
                let _ = reply.send(result);
            }
            VolumeMessage::SnapshotCreate {
                name,
                labels,
                reply,
            } => {
                let result = self.create_snapshot(name, labels).await;
                let _ = reply.send(result);
            }
            VolumeMessage::SnapshotList { reply } => {
                let _ = reply.send(Ok(self.snapshots.list()));
            }
            VolumeMessage::SnapshotDelete { name, reply } => {
                let _ = reply.send(self.snapshots.mark_removed(&name));
            }
            VolumeMessage::SnapshotPurge { reply } => {
                let result = self.start_purge().await.map(|()| self.view());
                self.publish_view();
                let _ = reply.send(result);
            }
            VolumeMessage::SnapshotBackup {
                snapshot,
                labels,
                reply,
            } => {
                let result = self.start_backup(snapshot, labels).await;
                self.publish_view();
                let _ = reply.send(result);
            }
            VolumeMessage::PvCreate { pv_name, reply } => {
                let status = &mut self.record.volume.kubernetes_status;
                let result = if !status.pv_name.is_empty() && status.pv_name != pv_name {
                    Err(ManagerError::invalid_state(format!(
                        "volume already has PV {}",
                        status.pv_name
                    )))
                } else {
                    status.pv_name = pv_name;
                    if status.pvc_name.is_empty() {
                        status.pv_status = "Available".to_string();
                    }
                    self.publish_view();
                    Ok(self.view())
                };
                let _ = reply.send(result);
            }
            VolumeMessage::PvcCreate {
                namespace,
                pvc_name,
                reply,
            } => {
                let status = &mut self.record.volume.kubernetes_status;
                let result = if status.pv_name.is_empty() {
                    Err(ManagerError::invalid_state(
                        "create a PV for the volume before its PVC",
                    ))
                } else {
                    status.namespace = namespace;
                    status.pvc_name = pvc_name;
                    status.pv_status = "Bound".to_string();
                    status.last_pvc_ref_at.clear();
                    self.publish_view();
                    Ok(self.view())
                };
                let _ = reply.send(result);
            }
            VolumeMessage::Delete { reply } => {
                let result = self.delete().await;
                let deleted = result.is_ok();
                let _ = reply.send(result);
                return Ok(!deleted);
            }
            VolumeMessage::Report(report) => self.on_report(report).await,
            VolumeMessage::Tick => self.tick().await,
        }
        Ok(true)
    }
}
