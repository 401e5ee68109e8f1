//! Bounded waits over the volume view.
//!
//! Every wait polls `GET /v1/volumes/{name}` (or a neighbouring read) with
//! the client's [`PollPolicy`] and fails with a timeout once the attempts
//! run out. The manager never enforces these bounds itself.

use std::cell::RefCell;

use holdfast_events::{ProgressState, ReplicaMode, Robustness, VolumeState};
use holdfast_manager::model::{
    endpoint_for, BackupStatus, KubernetesStatus, VolumeView, REASON_REPLICA_SCHEDULING_FAILURE,
};
use holdfast_reconcile::{poll_until, PollPolicy, ProgressMonitor};
use tracing::debug;

use crate::client::ManagerClient;
use crate::error::{ClientError, Result};

/// Polls the volume until `done` holds.
pub async fn wait_for_volume<F>(
    client: &ManagerClient,
    name: &str,
    what: &str,
    policy: &PollPolicy,
    done: F,
) -> Result<VolumeView>
where
    F: Fn(&VolumeView) -> bool,
{
    let resource = format!("volume {name} {what}");
    let done = &done;
    poll_until(policy, &resource, move || async move {
        let view = client.volume_get(name).await?;
        Ok::<_, ClientError>(done(&view).then_some(view))
    })
    .await
}

fn all_replicas_running(view: &VolumeView) -> bool {
    view.replicas.iter().all(|r| r.running && r.failed_at.is_none())
}

pub async fn wait_for_volume_state(
    client: &ManagerClient,
    name: &str,
    state: VolumeState,
) -> Result<VolumeView> {
    wait_for_volume(client, name, &format!("state {state}"), client.poll_policy(), |v| {
        v.volume.state == state
    })
    .await
}

/// Attached, healthy, serving its frontend and every replica running.
pub async fn wait_for_volume_healthy(client: &ManagerClient, name: &str) -> Result<VolumeView> {
    wait_for_volume(client, name, "healthy", client.poll_policy(), |v| {
        v.volume.state == VolumeState::Attached
            && v.volume.robustness == Robustness::Healthy
            && v.engine().is_some_and(|e| e.running && !e.endpoint.is_empty())
            && all_replicas_running(v)
    })
    .await
}

/// Attached and healthy with the frontend disabled.
pub async fn wait_for_volume_healthy_no_frontend(
    client: &ManagerClient,
    name: &str,
) -> Result<VolumeView> {
    wait_for_volume(client, name, "healthy without frontend", client.poll_policy(), |v| {
        v.volume.state == VolumeState::Attached
            && v.volume.robustness == Robustness::Healthy
            && v.volume.disable_frontend
            && v.engine().is_some_and(|e| e.running && e.endpoint.is_empty())
            && all_replicas_running(v)
    })
    .await
}

pub async fn wait_for_volume_degraded(client: &ManagerClient, name: &str) -> Result<VolumeView> {
    wait_for_volume(client, name, "degraded", client.poll_policy(), |v| {
        v.volume.state == VolumeState::Attached && v.volume.robustness == Robustness::Degraded
    })
    .await
}

pub async fn wait_for_volume_faulted(client: &ManagerClient, name: &str) -> Result<VolumeView> {
    wait_for_volume(client, name, "faulted", client.poll_policy(), |v| {
        v.volume.state == VolumeState::Detached && v.volume.robustness == Robustness::Faulted
    })
    .await
}

pub async fn wait_for_volume_detached(client: &ManagerClient, name: &str) -> Result<VolumeView> {
    wait_for_volume_state(client, name, VolumeState::Detached).await
}

/// Detached with robustness `unknown`, i.e. detached cleanly rather than faulted.
pub async fn wait_for_volume_detached_unknown(
    client: &ManagerClient,
    name: &str,
) -> Result<VolumeView> {
    wait_for_volume(client, name, "detached (unknown)", client.poll_policy(), |v| {
        v.volume.state == VolumeState::Detached && v.volume.robustness == Robustness::Unknown
    })
    .await
}

/// Waits until the volume no longer exists.
pub async fn wait_for_volume_delete(client: &ManagerClient, name: &str) -> Result<()> {
    let resource = format!("volume {name} deleted");
    poll_until(client.poll_policy(), &resource, move || async move {
        match client.volume_get(name).await {
            Ok(_) => Ok(None),
            Err(e) if e.is_not_found() => Ok(Some(())),
            Err(e) => Err(e),
        }
    })
    .await
}

/// Waits for the endpoint the frontend should expose and returns it.
pub async fn wait_for_volume_endpoint(client: &ManagerClient, name: &str) -> Result<String> {
    let view = wait_for_volume(client, name, "endpoint", client.poll_policy(), |v| {
        v.volume.state == VolumeState::Attached
            && v.engine().is_some_and(|e| e.running && !e.endpoint.is_empty())
    })
    .await?;
    let engine = view
        .engine()
        .ok_or_else(|| ClientError::check(format!("volume {name} has no engine")))?;
    let host = engine
        .host_id
        .as_ref()
        .ok_or_else(|| ClientError::check(format!("engine of {name} has no host")))?;
    let node = client.node_get(host.as_str()).await?;
    let expected = endpoint_for(view.volume.effective_frontend(), name, &node.address);
    if engine.endpoint != expected {
        return Err(ClientError::check(format!(
            "volume {name} endpoint is {}, expected {expected}",
            engine.endpoint
        )));
    }
    Ok(engine.endpoint.clone())
}

pub async fn wait_for_volume_replica_count(
    client: &ManagerClient,
    name: &str,
    count: usize,
) -> Result<VolumeView> {
    wait_for_volume(client, name, &format!("{count} replicas"), client.poll_policy(), |v| {
        v.replicas.len() == count
    })
    .await
}

/// Every replica, and the engine's view of it, is in `mode`.
pub async fn wait_for_volume_replicas_mode(
    client: &ManagerClient,
    name: &str,
    mode: ReplicaMode,
) -> Result<VolumeView> {
    wait_for_volume(client, name, &format!("replicas {mode}"), client.poll_policy(), |v| {
        let Some(engine) = v.engine() else {
            return false;
        };
        !v.replicas.is_empty()
            && v.replicas.iter().all(|r| {
                r.mode == Some(mode)
                    && engine.replica_mode_map.get(&r.name.to_string()) == Some(&mode)
            })
    })
    .await
}

/// Volume and engine both report `size`.
pub async fn wait_for_volume_expansion(
    client: &ManagerClient,
    name: &str,
    size: u64,
) -> Result<VolumeView> {
    wait_for_volume(client, name, &format!("size {size}"), client.poll_policy(), |v| {
        v.volume.state == VolumeState::Detached
            && v.volume.size == size
            && v.engine().is_some_and(|e| e.size == size)
    })
    .await
}

/// A standby volume grown to `size` to follow its backup volume. Unlike
/// [`wait_for_volume_expansion`] the volume stays attached while it grows.
pub async fn wait_for_dr_volume_expansion(
    client: &ManagerClient,
    name: &str,
    size: u64,
) -> Result<VolumeView> {
    let what = format!("standby size {size}");
    wait_for_volume(client, name, &what, client.backup_poll_policy(), |v| {
        v.volume.standby && v.volume.size == size && v.engine().is_some_and(|e| e.size == size)
    })
    .await
}

/// Waits until the engine records a failed expansion; returns its error text.
pub async fn wait_for_expansion_failure(client: &ManagerClient, name: &str) -> Result<String> {
    let view = wait_for_volume(client, name, "expansion failure", client.poll_policy(), |v| {
        v.engine().is_some_and(|e| e.last_expansion_failed_at.is_some())
    })
    .await?;
    Ok(view
        .engine()
        .map(|e| e.last_expansion_error.clone())
        .unwrap_or_default())
}

/// A rebuild in flight: `replica` is being filled from `from_replica`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildStart {
    pub from_replica: String,
    pub replica: String,
}

/// Waits for a rebuild in flight.
///
/// A volume that never records a rebuild entry is an error once the policy
/// runs out.
pub async fn wait_for_rebuild_start(client: &ManagerClient, name: &str) -> Result<RebuildStart> {
    let view = wait_for_volume(client, name, "rebuild start", client.poll_policy(), |v| {
        v.engine()
            .is_some_and(|e| e.rebuild_status.iter().any(|s| s.is_rebuilding))
    })
    .await?;
    view.engine()
        .and_then(|e| e.rebuild_status.iter().find(|s| s.is_rebuilding))
        .map(|s| RebuildStart {
            from_replica: s.from_replica.to_string(),
            replica: s.replica.to_string(),
        })
        .ok_or_else(|| ClientError::check(format!("volume {name} has no rebuild entry")))
}

/// No rebuild in flight and the volume back to healthy.
pub async fn wait_for_rebuild_complete(client: &ManagerClient, name: &str) -> Result<VolumeView> {
    let view = wait_for_volume(client, name, "rebuild complete", client.poll_policy(), |v| {
        v.volume.robustness == Robustness::Healthy
            && v.engine()
                .is_some_and(|e| e.rebuild_status.iter().all(|s| !s.is_rebuilding))
    })
    .await?;
    let errored = view
        .engine()
        .into_iter()
        .flat_map(|e| e.rebuild_status.iter())
        .find(|s| s.progress.state == ProgressState::Error);
    if let Some(status) = errored {
        return Err(ClientError::check(format!(
            "rebuild of {} failed: {}",
            status.replica, status.progress.error
        )));
    }
    Ok(view)
}

/// The replica is stopped or marked failed (or already cleaned up).
pub async fn wait_for_replica_failed(
    client: &ManagerClient,
    name: &str,
    replica: &str,
) -> Result<VolumeView> {
    wait_for_volume(client, name, &format!("replica {replica} failed"), client.poll_policy(), |v| {
        v.replicas
            .iter()
            .find(|r| r.name.to_string() == replica)
            .is_none_or(|r| !r.running || r.failed_at.is_some())
    })
    .await
}

pub async fn wait_for_replica_running(
    client: &ManagerClient,
    name: &str,
    replica: &str,
) -> Result<VolumeView> {
    wait_for_volume(client, name, &format!("replica {replica} running"), client.poll_policy(), |v| {
        v.replicas.iter().any(|r| {
            r.name.to_string() == replica
                && r.running
                && r.failed_at.is_none()
                && r.mode == Some(ReplicaMode::ReadWrite)
        })
    })
    .await
}

/// Waits for the backup of `snapshot` to complete and returns its status.
pub async fn wait_for_backup_completion(
    client: &ManagerClient,
    name: &str,
    snapshot: &str,
) -> Result<BackupStatus> {
    let resource = format!("backup of {name}/{snapshot}");
    poll_until(client.backup_poll_policy(), &resource, move || async move {
        let view = client.volume_get(name).await?;
        let Some(status) = view
            .engine()
            .and_then(|e| e.backup_status.iter().find(|s| s.snapshot == snapshot))
        else {
            return Ok(None);
        };
        match status.progress.state {
            ProgressState::Complete if status.progress.progress == 100 => Ok(Some(status.clone())),
            ProgressState::Error => Err(ClientError::check(format!(
                "backup of {snapshot} failed: {}",
                status.progress.error
            ))),
            _ => Ok(None),
        }
    })
    .await
}

/// The engine has restored `backup` and no restore is running.
pub async fn wait_for_volume_restoration_completed(
    client: &ManagerClient,
    name: &str,
    backup: &str,
) -> Result<VolumeView> {
    wait_for_volume(client, name, &format!("restored {backup}"), client.backup_poll_policy(), |v| {
        !v.volume.initial_restoration_required
            && v.controllers.iter().any(|e| e.last_restored_backup == backup)
            && v.controllers.iter().all(|e| !e.is_restoring())
    })
    .await
}

/// Follows a restore to completion, failing if any replica's progress goes
/// backwards or a replica reports an error.
pub async fn monitor_restore_progress(client: &ManagerClient, name: &str) -> Result<VolumeView> {
    let monitor = RefCell::new(ProgressMonitor::new());
    let monitor = &monitor;
    let resource = format!("restore of {name}");
    poll_until(client.backup_poll_policy(), &resource, move || async move {
        let view = client.volume_get(name).await?;
        let Some(engine) = view.engine() else {
            return Ok(None);
        };
        for status in &engine.restore_status {
            if status.progress.state == ProgressState::Error {
                return Err(ClientError::check(format!(
                    "restore on {} failed: {}",
                    status.replica, status.progress.error
                )));
            }
            monitor
                .borrow_mut()
                .observe(&status.replica.to_string(), status.progress.progress)?;
        }
        debug!(volume = name, entries = engine.restore_status.len(), "Restore progress");
        let done = !view.volume.initial_restoration_required
            && !engine.restore_status.is_empty()
            && engine
                .restore_status
                .iter()
                .all(|s| s.progress.state == ProgressState::Complete);
        let detached_after_restore = view.volume.state == VolumeState::Detached
            && !view.volume.initial_restoration_required
            && !monitor.borrow().is_empty();
        Ok((done || detached_after_restore).then_some(view))
    })
    .await
}

/// Purge finished and none of `removed` remain in the chain.
pub async fn wait_for_snapshot_purge(
    client: &ManagerClient,
    name: &str,
    removed: &[&str],
) -> Result<()> {
    let resource = format!("snapshot purge of {name}");
    poll_until(client.poll_policy(), &resource, move || async move {
        let view = client.volume_get(name).await?;
        if view.engine().is_some_and(|e| e.is_purging()) {
            return Ok(None);
        }
        let snapshots = client.snapshot_list(name).await?;
        let remaining = snapshots
            .iter()
            .any(|s| removed.contains(&s.name.as_str()));
        Ok::<_, ClientError>((!remaining).then_some(()))
    })
    .await
}

/// Both the origin and the target engine are running.
pub async fn wait_for_volume_migration_ready(
    client: &ManagerClient,
    name: &str,
) -> Result<VolumeView> {
    wait_for_volume(client, name, "migration ready", client.poll_policy(), |v| {
        v.controllers.len() == 2 && v.controllers.iter().all(|e| e.running)
    })
    .await
}

/// One engine left, running on `node`.
pub async fn wait_for_volume_migration_node(
    client: &ManagerClient,
    name: &str,
    node: &str,
) -> Result<VolumeView> {
    wait_for_volume(client, name, &format!("migrated to {node}"), client.poll_policy(), |v| {
        v.controllers.len() == 1
            && v.volume.node_id.as_ref().is_some_and(|n| n.as_str() == node)
            && v.controllers[0]
                .host_id
                .as_ref()
                .is_some_and(|n| n.as_str() == node)
            && v.controllers[0].running
    })
    .await
}

/// Waits until every non-empty field of `expected` matches the volume's
/// recorded Kubernetes status.
pub async fn wait_for_volume_kubernetes_status(
    client: &ManagerClient,
    name: &str,
    expected: &KubernetesStatus,
) -> Result<VolumeView> {
    wait_for_volume(client, name, "kubernetes status", client.poll_policy(), |v| {
        kubernetes_status_matches(&v.volume.kubernetes_status, expected)
    })
    .await
}

fn kubernetes_status_matches(actual: &KubernetesStatus, expected: &KubernetesStatus) -> bool {
    let field = |want: &str, got: &str| want.is_empty() || want == got;
    field(&expected.pv_name, &actual.pv_name)
        && field(&expected.pv_status, &actual.pv_status)
        && field(&expected.namespace, &actual.namespace)
        && field(&expected.pvc_name, &actual.pvc_name)
        && field(&expected.last_pvc_ref_at, &actual.last_pvc_ref_at)
        && field(&expected.last_pod_ref_at, &actual.last_pod_ref_at)
        && (expected.workloads_status.is_empty()
            || expected.workloads_status == actual.workloads_status)
}

/// The scheduled condition reports a placement failure.
pub async fn wait_for_scheduling_failure(client: &ManagerClient, name: &str) -> Result<VolumeView> {
    wait_for_volume(client, name, "scheduling failure", client.poll_policy(), |v| {
        !v.volume.conditions.scheduled.status
            && v.volume.conditions.scheduled.reason == REASON_REPLICA_SCHEDULING_FAILURE
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn status(pv: &str, pv_status: &str, ns: &str, pvc: &str) -> KubernetesStatus {
        KubernetesStatus {
            pv_name: pv.to_string(),
            pv_status: pv_status.to_string(),
            namespace: ns.to_string(),
            pvc_name: pvc.to_string(),
            ..KubernetesStatus::default()
        }
    }

    #[rstest]
    #[case(status("pv-a", "", "", ""), true)]
    #[case(status("pv-a", "Bound", "", ""), true)]
    #[case(status("pv-a", "Available", "", ""), false)]
    #[case(status("", "", "default", "claim"), true)]
    #[case(status("", "", "other", ""), false)]
    #[case(KubernetesStatus::default(), true)]
    fn test_kubernetes_status_matching_ignores_empty_fields(
        #[case] expected: KubernetesStatus,
        #[case] matches: bool,
    ) {
        let actual = status("pv-a", "Bound", "default", "claim");
        assert_eq!(kubernetes_status_matches(&actual, &expected), matches);
    }
}
