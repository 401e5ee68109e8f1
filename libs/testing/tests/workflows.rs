//! Workflow helpers driven against an in-process manager.

use std::collections::BTreeMap;
use std::time::Duration;

use holdfast_events::{Frontend, ReplicaMode, Robustness, VolumeState};
use holdfast_id::VolumeName;
use holdfast_manager::model::{VolumeSpec, VolumeView};
use holdfast_manager::settings::{AUTO_SALVAGE, BACKUP_TARGET};
use holdfast_reconcile::PollPolicy;
use holdfast_testing::*;

const SIZE: u64 = 16 << 20;

fn spec(name: &str) -> VolumeSpec {
    VolumeSpec::new(VolumeName::parse(name).unwrap(), SIZE)
}

async fn setup() -> (TestServer, ManagerClient) {
    let server = TestServer::start().await.unwrap();
    let client = server
        .client()
        .with_poll_policy(PollPolicy::new(250, Duration::from_millis(20)))
        .with_backup_poll_policy(PollPolicy::new(500, Duration::from_millis(20)));
    (server, client)
}

async fn attached(client: &ManagerClient, name: &str) -> VolumeView {
    create_and_check_volume(client, &spec(name)).await.unwrap();
    client.attach(name, "node-1", false).await.unwrap();
    wait_for_volume_healthy(client, name).await.unwrap()
}

#[tokio::test]
async fn test_attach_write_read_and_cleanup() {
    let (_server, client) = setup().await;
    let view = attached(&client, "vol-data").await;
    assert_eq!(view.replicas.len(), 3);

    let endpoint = check_volume_endpoint(&client, "vol-data").await.unwrap();
    assert_eq!(endpoint, "/dev/holdfast/vol-data");
    wait_for_volume_replicas_mode(&client, "vol-data", ReplicaMode::ReadWrite)
        .await
        .unwrap();

    let mut used = Vec::new();
    let first = write_volume_random_data(&client, "vol-data", &mut used).await.unwrap();
    let second = write_volume_random_data(&client, "vol-data", &mut used).await.unwrap();
    check_volume_data(&client, "vol-data", &first).await.unwrap();
    check_volume_data(&client, "vol-data", &second).await.unwrap();

    let checksum = volume_checksum(&client, "vol-data").await.unwrap();
    assert_eq!(checksum, volume_checksum(&client, "vol-data").await.unwrap());

    cleanup_volume(&client, "vol-data").await.unwrap();
    assert!(client.volume_get("vol-data").await.unwrap_err().is_not_found());
    // Cleaning up twice is harmless.
    cleanup_volume(&client, "vol-data").await.unwrap();
}

#[tokio::test]
async fn test_disabled_frontend_has_no_endpoint() {
    let (_server, client) = setup().await;
    create_and_check_volume(&client, &spec("vol-nofe")).await.unwrap();
    client.attach("vol-nofe", "node-2", true).await.unwrap();
    let view = wait_for_volume_healthy_no_frontend(&client, "vol-nofe")
        .await
        .unwrap();
    assert_eq!(view.engine().unwrap().endpoint, "");

    let err = client.write("vol-nofe", 0, b"x").await.unwrap_err();
    assert_eq!(err.status(), Some(409));

    client.detach("vol-nofe", false).await.unwrap();
    wait_for_volume_detached_unknown(&client, "vol-nofe").await.unwrap();
}

#[tokio::test]
async fn test_backup_then_restore_into_new_volume() {
    let (_server, client) = setup().await;
    client.setting_update(BACKUP_TARGET, "mem://default").await.unwrap();
    attached(&client, "vol-src").await;

    let mut labels = BTreeMap::new();
    labels.insert("purpose".to_string(), "restore-test".to_string());
    let mut used = Vec::new();
    let outcome = create_backup(&client, "vol-src", &labels, &mut used).await.unwrap();
    assert_eq!(outcome.backup.labels["purpose"], "restore-test");
    assert!(outcome.backup.labels.contains_key("KubernetesStatus"));
    assert_eq!(outcome.backup_volume.name, "vol-src");

    let mut restore = spec("vol-restored");
    restore.size = 0;
    restore.from_backup = outcome.backup.url.clone();
    client.volume_create(&restore).await.unwrap();
    let view = wait_for_volume_restoration_completed(&client, "vol-restored", &outcome.backup.name)
        .await
        .unwrap();
    assert_eq!(view.volume.size, SIZE);
    assert_eq!(view.volume.last_backup, outcome.backup.name);

    let view = wait_for_volume_detached(&client, "vol-restored").await.unwrap();
    assert_eq!(view.volume.state, VolumeState::Detached);
    client.attach("vol-restored", "node-2", false).await.unwrap();
    wait_for_volume_healthy(&client, "vol-restored").await.unwrap();
    check_volume_data(&client, "vol-restored", &outcome.data)
        .await
        .unwrap();

    delete_backup(&client, "vol-src", &outcome.backup.name)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_crashed_replica_is_replaced() {
    let (_server, client) = setup().await;
    let view = attached(&client, "vol-crash").await;
    let mut used = Vec::new();
    let data = write_volume_random_data(&client, "vol-crash", &mut used).await.unwrap();

    let victim = &view.replicas[0];
    let victim_name = victim.name.to_string();
    client
        .instance_delete(&victim.instance_manager_name, &victim_name)
        .await
        .unwrap();

    wait_for_replica_failed(&client, "vol-crash", &victim_name)
        .await
        .unwrap();
    let view = wait_for_volume(&client, "vol-crash", "replaced", client.poll_policy(), |v| {
        v.volume.robustness == Robustness::Healthy
            && v.replicas.len() == 3
            && v.replicas.iter().all(|r| r.running && r.failed_at.is_none())
            && v.replicas.iter().all(|r| r.name.to_string() != victim_name)
    })
    .await
    .unwrap();
    assert_eq!(view.replicas.len(), 3);

    wait_for_rebuild_complete(&client, "vol-crash").await.unwrap();
    check_volume_data(&client, "vol-crash", &data).await.unwrap();
}

#[tokio::test]
async fn test_expand_attached_volume_reattaches() {
    let (_server, client) = setup().await;
    attached(&client, "vol-grow").await;

    let view = expand_attached_volume(&client, "vol-grow", 2 * SIZE).await.unwrap();
    assert_eq!(view.volume.size, 2 * SIZE);
    assert_eq!(view.engine().unwrap().size, 2 * SIZE);
}

#[tokio::test]
async fn test_snapshot_purge_removes_deleted_snapshots() {
    let (_server, client) = setup().await;
    attached(&client, "vol-snap").await;

    let none = BTreeMap::new();
    let first = client
        .snapshot_create("vol-snap", Some("snap-1"), &none)
        .await
        .unwrap();
    client.write("vol-snap", 0, b"between").await.unwrap();
    client
        .snapshot_create("vol-snap", Some("snap-2"), &none)
        .await
        .unwrap();

    client.snapshot_delete("vol-snap", &first.name).await.unwrap();
    let listed = client.snapshot_list("vol-snap").await.unwrap();
    assert!(listed.iter().any(|s| s.name == "snap-1" && s.removed));

    client.snapshot_purge("vol-snap").await.unwrap();
    wait_for_snapshot_purge(&client, "vol-snap", &["snap-1"])
        .await
        .unwrap();
    let listed = client.snapshot_list("vol-snap").await.unwrap();
    assert!(listed.iter().any(|s| s.name == "snap-2"));
}

#[tokio::test]
async fn test_kubernetes_status_recording() {
    let (_server, client) = setup().await;
    create_and_check_volume(&client, &spec("vol-k8s")).await.unwrap();

    let view = create_pv_for_volume(&client, "vol-k8s", "pv-k8s").await.unwrap();
    assert_eq!(view.volume.kubernetes_status.pv_status, "Available");

    let view = create_pvc_for_volume(&client, "vol-k8s", "apps", "claim-k8s")
        .await
        .unwrap();
    assert_eq!(view.volume.kubernetes_status.pv_name, "pv-k8s");
    assert_eq!(view.volume.kubernetes_status.pvc_name, "claim-k8s");
}

#[tokio::test]
async fn test_scheduling_failure_is_reported() {
    let (_server, client) = setup().await;
    let mut four = spec("vol-four");
    four.number_of_replicas = Some(4);
    client.volume_create(&four).await.unwrap();

    let view = wait_for_scheduling_failure(&client, "vol-four").await.unwrap();
    assert_eq!(view.replicas.len(), 3);
}

#[tokio::test]
async fn test_reset_disks_applies_reserved_percentage() {
    let (_server, client) = setup().await;
    let nodes = reset_disks_for_all_nodes(&client).await.unwrap();
    assert_eq!(nodes.len(), 3);
    let disk = &nodes[0].disks[DEFAULT_DISK];
    assert_eq!(disk.storage_reserved, disk.storage_maximum * 30 / 100);
}

#[tokio::test]
async fn test_wait_times_out_with_bounded_policy() {
    let (_server, client) = setup().await;
    create_and_check_volume(&client, &spec("vol-idle")).await.unwrap();

    let client = client.with_poll_policy(PollPolicy::new(3, Duration::from_millis(5)));
    let err = wait_for_volume_healthy(&client, "vol-idle").await.unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_migration_confirm_then_rollback() {
    let (_server, client) = setup().await;
    attached(&client, "vol-mig").await;
    client.write("vol-mig", 0, b"migrate").await.unwrap();

    client.migrate("vol-mig", "node-2").await.unwrap();
    let view = wait_for_volume_migration_ready(&client, "vol-mig").await.unwrap();
    assert!(view.controllers.iter().all(|e| !e.endpoint.is_empty()));

    client.confirm_migration("vol-mig").await.unwrap();
    let view = wait_for_volume_migration_node(&client, "vol-mig", "node-2")
        .await
        .unwrap();
    assert_eq!(view.controllers.len(), 1);
    assert_eq!(client.read("vol-mig", 0, 7).await.unwrap(), b"migrate");

    client.migrate("vol-mig", "node-3").await.unwrap();
    wait_for_volume_migration_ready(&client, "vol-mig").await.unwrap();
    client.rollback_migration("vol-mig").await.unwrap();
    wait_for_volume_migration_node(&client, "vol-mig", "node-2")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_faulted_volume_is_salvaged() {
    let (_server, client) = setup().await;
    client.setting_update(AUTO_SALVAGE, "false").await.unwrap();
    attached(&client, "vol-fault").await;
    let mut used = Vec::new();
    let data = write_volume_random_data(&client, "vol-fault", &mut used).await.unwrap();

    let crashed = crash_replica_processes(&client, "vol-fault").await.unwrap();
    assert_eq!(crashed.len(), 3);
    wait_for_volume_faulted(&client, "vol-fault").await.unwrap();
    let err = client.attach("vol-fault", "node-1", false).await.unwrap_err();
    assert_eq!(err.status(), Some(409));

    client.salvage("vol-fault", &crashed).await.unwrap();
    client.attach("vol-fault", "node-1", false).await.unwrap();
    wait_for_volume_healthy(&client, "vol-fault").await.unwrap();
    check_volume_data(&client, "vol-fault", &data).await.unwrap();
}

#[tokio::test]
async fn test_standby_volume_follows_and_activates() {
    let (_server, client) = setup().await;
    client.setting_update(BACKUP_TARGET, "mem://default").await.unwrap();
    attached(&client, "vol-primary").await;
    let none = BTreeMap::new();
    let mut used = Vec::new();
    let first = create_backup(&client, "vol-primary", &none, &mut used).await.unwrap();

    let mut standby = spec("vol-standby");
    standby.size = 0;
    standby.from_backup = first.backup.url.clone();
    standby.standby = true;
    client.volume_create(&standby).await.unwrap();
    let err = client
        .activate("vol-standby", Some(Frontend::Blockdev))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(409));
    assert_eq!(err.code(), Some("incremental_restore_in_progress"));

    let view = monitor_restore_progress(&client, "vol-standby").await.unwrap();
    assert!(!view.volume.initial_restoration_required);
    assert!(view.volume.standby);

    expand_attached_volume(&client, "vol-primary", 2 * SIZE).await.unwrap();
    let second = create_backup(&client, "vol-primary", &none, &mut used).await.unwrap();
    let view = wait_for_dr_volume_expansion(&client, "vol-standby", 2 * SIZE)
        .await
        .unwrap();
    assert!(view.replicas.iter().all(|r| r.size == 2 * SIZE));

    let view = activate_standby_volume(&client, "vol-standby").await.unwrap();
    assert_eq!(view.volume.size, 2 * SIZE);
    client.attach("vol-standby", "node-2", false).await.unwrap();
    wait_for_volume_healthy(&client, "vol-standby").await.unwrap();
    check_volume_data(&client, "vol-standby", &first.data).await.unwrap();
    check_volume_data(&client, "vol-standby", &second.data).await.unwrap();
}

#[tokio::test]
async fn test_expansion_retries_after_stale_marker() {
    let (_server, client) = setup().await;
    create_and_check_volume(&client, &spec("vol-marker")).await.unwrap();
    let markers = fail_replica_expansion(&client, "vol-marker", 2 * SIZE)
        .await
        .unwrap();
    assert_eq!(markers.len(), 3);

    client.expand("vol-marker", 2 * SIZE).await.unwrap();
    let error = wait_for_expansion_failure(&client, "vol-marker").await.unwrap();
    assert!(!error.is_empty());
    assert!(markers.iter().all(|m| !m.exists()));
    assert_eq!(client.volume_get("vol-marker").await.unwrap().volume.size, SIZE);

    client.expand("vol-marker", 2 * SIZE).await.unwrap();
    wait_for_volume_expansion(&client, "vol-marker", 2 * SIZE)
        .await
        .unwrap();
    // The delta is charged once, by the attempt that committed.
    for node in client.node_list().await.unwrap() {
        assert_eq!(node.disks[DEFAULT_DISK].storage_scheduled, 2 * SIZE);
    }
}

#[tokio::test]
async fn test_rebuild_start_names_source_and_target() {
    let server = TestServer::start_with(TestServerConfig {
        job_step: Duration::from_millis(100),
        ..TestServerConfig::default()
    })
    .await
    .unwrap();
    let client = server
        .client()
        .with_poll_policy(PollPolicy::new(250, Duration::from_millis(20)));
    let view = attached(&client, "vol-source").await;
    let victim = view.replicas[0].name.to_string();
    let survivors: Vec<String> = view.replicas[1..].iter().map(|r| r.name.to_string()).collect();
    client
        .instance_delete(&view.replicas[0].instance_manager_name, &victim)
        .await
        .unwrap();

    let rebuild = wait_for_rebuild_start(&client, "vol-source").await.unwrap();
    assert!(survivors.contains(&rebuild.from_replica));
    assert_ne!(rebuild.replica, victim);
    assert!(!survivors.contains(&rebuild.replica));
    wait_for_rebuild_complete(&client, "vol-source").await.unwrap();
}

#[tokio::test]
async fn test_rebuild_start_times_out_on_idle_volume() {
    let (_server, client) = setup().await;
    create_and_check_volume(&client, &spec("vol-quiet")).await.unwrap();

    let client = client.with_poll_policy(PollPolicy::new(3, Duration::from_millis(5)));
    let err = wait_for_rebuild_start(&client, "vol-quiet").await.unwrap_err();
    assert!(err.is_timeout());
}
