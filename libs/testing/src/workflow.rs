//! Multi-step flows shared by integration tests.

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};

use holdfast_events::{Frontend, VolumeState};
use holdfast_manager::backupstore::{parse_backup_url, Backup, BackupVolume};
use holdfast_manager::expansion::write_marker;
use holdfast_manager::model::{IscsiEndpoint, KubernetesStatus, Node, VolumeSpec, VolumeView};
use holdfast_manager::settings::STORAGE_RESERVED_PERCENTAGE_FOR_DEFAULT_DISK;
use holdfast_reconcile::poll_until;
use tracing::info;

use crate::client::ManagerClient;
use crate::data::{write_volume_random_data, VolumeData};
use crate::error::{ClientError, Result};
use crate::wait::{
    wait_for_backup_completion, wait_for_volume, wait_for_volume_delete, wait_for_volume_detached,
    wait_for_volume_endpoint, wait_for_volume_expansion, wait_for_volume_healthy,
    wait_for_volume_kubernetes_status,
};

/// What [`create_backup`] produced.
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub backup_volume: BackupVolume,
    pub backup: Backup,
    pub snapshot: String,
    pub data: VolumeData,
}

/// Creates a volume, waits for it to settle detached and checks the
/// fields the request set.
pub async fn create_and_check_volume(client: &ManagerClient, spec: &VolumeSpec) -> Result<VolumeView> {
    let name = spec.name.as_str();
    client.volume_create(spec).await?;
    let view = wait_for_volume_detached(client, name).await?;

    let volume = &view.volume;
    if let Some(count) = spec.number_of_replicas {
        if volume.number_of_replicas != count {
            return Err(ClientError::check(format!(
                "volume {name} has {} replicas configured, requested {count}",
                volume.number_of_replicas
            )));
        }
    }
    if volume.frontend != spec.frontend {
        return Err(ClientError::check(format!(
            "volume {name} frontend is {:?}, requested {:?}",
            volume.frontend, spec.frontend
        )));
    }
    if volume.base_image != spec.base_image || volume.from_backup != spec.from_backup {
        return Err(ClientError::check(format!(
            "volume {name} does not carry the requested source"
        )));
    }
    if spec.from_backup.is_empty() && volume.size != spec.size {
        return Err(ClientError::check(format!(
            "volume {name} size is {}, requested {}",
            volume.size, spec.size
        )));
    }
    Ok(view)
}

/// Snapshot, write, snapshot again and back up the second snapshot.
///
/// Checks that the backup carries `labels` and that the volume records it
/// as its last backup.
pub async fn create_backup(
    client: &ManagerClient,
    name: &str,
    labels: &BTreeMap<String, String>,
    used: &mut Vec<Range<u64>>,
) -> Result<BackupOutcome> {
    client.snapshot_create(name, None, &BTreeMap::new()).await?;
    let data = write_volume_random_data(client, name, used).await?;
    let snapshot = client.snapshot_create(name, None, &BTreeMap::new()).await?;

    let accepted = client.snapshot_backup(name, &snapshot.name, labels).await?;
    wait_for_backup_completion(client, name, &snapshot.name).await?;
    let (backup_volume, backup) = find_backup(client, name, &snapshot.name).await?;
    if backup.name != accepted.backup {
        return Err(ClientError::check(format!(
            "backup of {} is {}, accepted as {}",
            snapshot.name, backup.name, accepted.backup
        )));
    }

    for (key, value) in labels {
        if backup.labels.get(key) != Some(value) {
            return Err(ClientError::check(format!(
                "backup {} is missing label {key}={value}",
                backup.name
            )));
        }
    }

    let backup_name = backup.name.clone();
    wait_for_volume(
        client,
        name,
        &format!("last backup {backup_name}"),
        client.backup_poll_policy(),
        |v| v.volume.last_backup == backup_name && v.volume.last_backup_at.is_some(),
    )
    .await?;

    info!(volume = name, backup = %backup.name, "Backup created");
    Ok(BackupOutcome {
        backup_volume,
        backup,
        snapshot: snapshot.name,
        data,
    })
}

/// Finds the backup taken from `snapshot` of `volume`.
pub async fn find_backup(
    client: &ManagerClient,
    volume: &str,
    snapshot: &str,
) -> Result<(BackupVolume, Backup)> {
    let resource = format!("backup of {volume}/{snapshot}");
    poll_until(client.backup_poll_policy(), &resource, move || async move {
        let backup_volume = match client.backup_volume_get(volume).await {
            Ok(bv) => bv,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let backups = client.backup_list(volume).await?;
        Ok(backups
            .into_iter()
            .find(|b| b.snapshot_name == snapshot)
            .map(|b| (backup_volume, b)))
    })
    .await
}

/// Deletes a backup and waits until the store stops listing it.
pub async fn delete_backup(client: &ManagerClient, volume: &str, backup: &str) -> Result<()> {
    client.backup_delete(volume, backup).await?;
    let resource = format!("backup {backup} deleted");
    poll_until(client.backup_poll_policy(), &resource, move || async move {
        match client.backup_list(volume).await {
            Ok(backups) => Ok(backups.iter().all(|b| b.name != backup).then_some(())),
            Err(e) if e.is_not_found() => Ok(Some(())),
            Err(e) => Err(e),
        }
    })
    .await
}

/// Waits for a standby volume to catch up with its backup volume, then
/// activates it and waits for it to come back detached.
pub async fn activate_standby_volume(client: &ManagerClient, name: &str) -> Result<VolumeView> {
    let view = client.volume_get(name).await?;
    if !view.volume.standby {
        return Err(ClientError::check(format!("volume {name} is not a standby volume")));
    }
    let source = parse_backup_url(&view.volume.from_backup)
        .map_err(|e| ClientError::check(format!("volume {name} has an invalid source: {e}")))?;
    let backup_volume = client.backup_volume_get(&source.volume).await?;
    let last_backup = backup_volume.last_backup_name;

    wait_for_volume(
        client,
        name,
        &format!("caught up with {last_backup}"),
        client.backup_poll_policy(),
        |v| {
            !v.volume.initial_restoration_required
                && v.volume.last_backup == last_backup
                && v.engine().is_some_and(|e| {
                    e.last_restored_backup == last_backup && !e.is_restoring()
                })
        },
    )
    .await?;

    client.activate(name, Some(Frontend::Blockdev)).await?;
    wait_for_volume(client, name, "activated", client.poll_policy(), |v| {
        !v.volume.standby
            && v.volume.frontend == Frontend::Blockdev
            && v.volume.state == VolumeState::Detached
    })
    .await
}

/// Expands an attached volume: detach, grow it, then attach it back to the
/// node it was serving from.
pub async fn expand_attached_volume(client: &ManagerClient, name: &str, size: u64) -> Result<VolumeView> {
    let view = wait_for_volume_healthy(client, name).await?;
    let host = view
        .engine()
        .and_then(|e| e.host_id.clone())
        .ok_or_else(|| ClientError::check(format!("volume {name} has no engine host")))?;

    client.detach(name, false).await?;
    wait_for_volume_detached(client, name).await?;
    client.expand(name, size).await?;
    wait_for_volume_expansion(client, name, size).await?;
    client.attach(name, host.as_str(), false).await?;
    wait_for_volume_healthy(client, name).await
}

/// Detaches and deletes a volume; a volume that is already gone is fine.
pub async fn cleanup_volume(client: &ManagerClient, name: &str) -> Result<()> {
    let view = match client.volume_get(name).await {
        Ok(view) => view,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };
    if view.volume.state != VolumeState::Detached {
        client.detach(name, true).await?;
        wait_for_volume_detached(client, name).await?;
    }
    client.volume_delete(name).await?;
    wait_for_volume_delete(client, name).await
}

/// Waits for the endpoint and validates its shape for the frontend.
pub async fn check_volume_endpoint(client: &ManagerClient, name: &str) -> Result<String> {
    let endpoint = wait_for_volume_endpoint(client, name).await?;
    if endpoint.starts_with("iscsi://") {
        let parsed = IscsiEndpoint::parse(&endpoint)
            .map_err(|e| ClientError::check(format!("endpoint of {name}: {e}")))?;
        if !parsed.target.ends_with(name) {
            return Err(ClientError::check(format!(
                "iSCSI target {} does not name volume {name}",
                parsed.target
            )));
        }
    }
    Ok(endpoint)
}

/// Kills every replica process of the volume. Returns the replica names.
pub async fn crash_replica_processes(client: &ManagerClient, name: &str) -> Result<Vec<String>> {
    let view = client.volume_get(name).await?;
    let mut crashed = Vec::with_capacity(view.replicas.len());
    for replica in &view.replicas {
        let replica_name = replica.name.to_string();
        client
            .instance_delete(&replica.instance_manager_name, &replica_name)
            .await?;
        crashed.push(replica_name);
    }
    Ok(crashed)
}

/// Leaves a `volume-snap-expand-<size>.img.meta.tmp` marker in every replica
/// directory, as an expansion that crashed mid-way would. The next expansion
/// to `size` fails and clears the markers, so the attempt after it succeeds.
///
/// Only meaningful against an in-process manager sharing this filesystem.
pub async fn fail_replica_expansion(
    client: &ManagerClient,
    name: &str,
    size: u64,
) -> Result<Vec<PathBuf>> {
    let view = client.volume_get(name).await?;
    let mut markers = Vec::with_capacity(view.replicas.len());
    for replica in &view.replicas {
        let marker = write_marker(Path::new(&replica.data_path), size)
            .await
            .map_err(|e| {
                ClientError::check(format!(
                    "cannot leave an expansion marker for {}: {e}",
                    replica.name
                ))
            })?;
        markers.push(marker);
    }
    info!(volume = name, size, replicas = markers.len(), "Expansion markers planted");
    Ok(markers)
}

pub async fn create_pv_for_volume(client: &ManagerClient, name: &str, pv_name: &str) -> Result<VolumeView> {
    client.pv_create(name, pv_name).await?;
    let expected = KubernetesStatus {
        pv_name: pv_name.to_string(),
        pv_status: "Available".to_string(),
        ..KubernetesStatus::default()
    };
    wait_for_volume_kubernetes_status(client, name, &expected).await
}

pub async fn create_pvc_for_volume(
    client: &ManagerClient,
    name: &str,
    namespace: &str,
    pvc_name: &str,
) -> Result<VolumeView> {
    client.pvc_create(name, namespace, pvc_name).await?;
    let expected = KubernetesStatus {
        pv_status: "Bound".to_string(),
        namespace: namespace.to_string(),
        pvc_name: pvc_name.to_string(),
        ..KubernetesStatus::default()
    };
    wait_for_volume_kubernetes_status(client, name, &expected).await
}

/// Resets every disk's reservation and verifies the result.
pub async fn reset_disks_for_all_nodes(client: &ManagerClient) -> Result<Vec<Node>> {
    let setting = client
        .setting_get(STORAGE_RESERVED_PERCENTAGE_FOR_DEFAULT_DISK)
        .await?;
    let pct: u64 = setting
        .value
        .parse()
        .map_err(|e| ClientError::check(format!("invalid reserved percentage: {e}")))?;

    let nodes = client.reset_disks().await?;
    for node in &nodes {
        for (id, disk) in &node.disks {
            if disk.storage_reserved != disk.storage_maximum * pct / 100 || !disk.tags.is_empty() {
                return Err(ClientError::check(format!(
                    "disk {id} on {} was not reset",
                    node.name
                )));
            }
        }
    }
    Ok(nodes)
}
