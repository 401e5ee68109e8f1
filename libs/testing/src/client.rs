//! Typed HTTP handle for the manager's control API.
//!
//! The handle is constructed explicitly and passed to every helper; nothing
//! in this crate reads a process-wide client or endpoint.

use std::collections::BTreeMap;

use holdfast_events::Frontend;
use holdfast_manager::api::error::ProblemDetails;
use holdfast_manager::backupstore::{Backup, BackupVolume};
use holdfast_manager::manager::InstanceManagerView;
use holdfast_manager::model::{
    DiskSpec, Node, NodeSpec, NodeUpdate, Snapshot, VolumeSpec, VolumeView,
};
use holdfast_manager::settings::Setting;
use holdfast_reconcile::PollPolicy;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{ClientError, Result};

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct DataResponse {
    data: String,
}

#[derive(Debug, Deserialize)]
struct ChecksumResponse {
    checksum: String,
}

/// Answer to a backup request: the backup name to look for later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupAccepted {
    pub volume: String,
    pub snapshot: String,
    pub backup: String,
}

#[derive(Debug, Clone)]
pub struct ManagerClient {
    http: reqwest::Client,
    base_url: String,
    poll: PollPolicy,
    backup_poll: PollPolicy,
}

impl ManagerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll: PollPolicy::default(),
            backup_poll: PollPolicy::backup(),
        }
    }

    /// Overrides the policy used by state waits.
    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.poll = policy;
        self
    }

    /// Overrides the policy used by backup and restore waits.
    pub fn with_backup_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.backup_poll = policy;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn poll_policy(&self) -> &PollPolicy {
        &self.poll
    }

    pub fn backup_poll_policy(&self) -> &PollPolicy {
        &self.backup_poll
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, format!("{}{path}", self.base_url))
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await?;
        debug!(status = status.as_u16(), body = %body, "Request failed");
        match serde_json::from_str::<ProblemDetails>(&body) {
            Ok(problem) => Err(ClientError::Api { problem }),
            Err(_) => Err(ClientError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            }),
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = Self::check(builder.send().await?).await?;
        Ok(response.json().await?)
    }

    async fn send_empty(&self, builder: RequestBuilder) -> Result<()> {
        Self::check(builder.send().await?).await?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.request(Method::GET, path)).await
    }

    async fn list<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let list: ListResponse<T> = self.get(path).await?;
        Ok(list.items)
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &impl Serialize) -> Result<T> {
        self.send(self.request(Method::POST, path).json(body)).await
    }

    async fn put<T: DeserializeOwned>(&self, path: &str, body: &impl Serialize) -> Result<T> {
        self.send(self.request(Method::PUT, path).json(body)).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.send_empty(self.request(Method::DELETE, path)).await
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Whether `/readyz` answers 200.
    pub async fn ready(&self) -> Result<bool> {
        let response = self.request(Method::GET, "/readyz").send().await?;
        Ok(response.status() == StatusCode::OK)
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    pub async fn volume_create(&self, spec: &VolumeSpec) -> Result<VolumeView> {
        self.post("/v1/volumes", spec).await
    }

    pub async fn volume_list(&self) -> Result<Vec<VolumeView>> {
        self.list("/v1/volumes").await
    }

    pub async fn volume_get(&self, name: &str) -> Result<VolumeView> {
        self.get(&format!("/v1/volumes/{name}")).await
    }

    pub async fn volume_delete(&self, name: &str) -> Result<()> {
        self.delete(&format!("/v1/volumes/{name}")).await
    }

    pub async fn attach(&self, name: &str, host: &str, disable_frontend: bool) -> Result<VolumeView> {
        self.post(
            &format!("/v1/volumes/{name}/attach"),
            &json!({ "hostId": host, "disableFrontend": disable_frontend }),
        )
        .await
    }

    pub async fn detach(&self, name: &str, force: bool) -> Result<VolumeView> {
        self.post(&format!("/v1/volumes/{name}/detach"), &json!({ "force": force }))
            .await
    }

    pub async fn expand(&self, name: &str, size: u64) -> Result<VolumeView> {
        self.post(&format!("/v1/volumes/{name}/expand"), &json!({ "size": size }))
            .await
    }

    pub async fn migrate(&self, name: &str, node: &str) -> Result<VolumeView> {
        self.post(&format!("/v1/volumes/{name}/migrate"), &json!({ "nodeId": node }))
            .await
    }

    pub async fn confirm_migration(&self, name: &str) -> Result<VolumeView> {
        self.post(&format!("/v1/volumes/{name}/migration/confirm"), &json!({}))
            .await
    }

    pub async fn rollback_migration(&self, name: &str) -> Result<VolumeView> {
        self.post(&format!("/v1/volumes/{name}/migration/rollback"), &json!({}))
            .await
    }

    pub async fn activate(&self, name: &str, frontend: Option<Frontend>) -> Result<VolumeView> {
        self.post(
            &format!("/v1/volumes/{name}/activate"),
            &json!({ "frontend": frontend }),
        )
        .await
    }

    pub async fn salvage(&self, name: &str, replicas: &[String]) -> Result<VolumeView> {
        self.post(&format!("/v1/volumes/{name}/salvage"), &json!({ "names": replicas }))
            .await
    }

    pub async fn update_replica_count(&self, name: &str, count: u32) -> Result<VolumeView> {
        self.post(
            &format!("/v1/volumes/{name}/replica-count"),
            &json!({ "replicaCount": count }),
        )
        .await
    }

    pub async fn pv_create(&self, name: &str, pv_name: &str) -> Result<VolumeView> {
        self.post(&format!("/v1/volumes/{name}/pv"), &json!({ "pvName": pv_name }))
            .await
    }

    pub async fn pvc_create(&self, name: &str, namespace: &str, pvc_name: &str) -> Result<VolumeView> {
        self.post(
            &format!("/v1/volumes/{name}/pvc"),
            &json!({ "namespace": namespace, "pvcName": pvc_name }),
        )
        .await
    }

    // =========================================================================
    // Snapshots and backups
    // =========================================================================

    pub async fn snapshot_create(
        &self,
        name: &str,
        snapshot: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Snapshot> {
        self.post(
            &format!("/v1/volumes/{name}/snapshots"),
            &json!({ "name": snapshot, "labels": labels }),
        )
        .await
    }

    pub async fn snapshot_list(&self, name: &str) -> Result<Vec<Snapshot>> {
        self.list(&format!("/v1/volumes/{name}/snapshots")).await
    }

    pub async fn snapshot_delete(&self, name: &str, snapshot: &str) -> Result<()> {
        self.delete(&format!("/v1/volumes/{name}/snapshots/{snapshot}"))
            .await
    }

    pub async fn snapshot_purge(&self, name: &str) -> Result<VolumeView> {
        self.post(&format!("/v1/volumes/{name}/snapshots/purge"), &json!({}))
            .await
    }

    pub async fn snapshot_backup(
        &self,
        name: &str,
        snapshot: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<BackupAccepted> {
        self.post(
            &format!("/v1/volumes/{name}/snapshots/{snapshot}/backup"),
            &json!({ "labels": labels }),
        )
        .await
    }

    pub async fn backup_volume_list(&self) -> Result<Vec<BackupVolume>> {
        self.list("/v1/backupvolumes").await
    }

    pub async fn backup_volume_get(&self, volume: &str) -> Result<BackupVolume> {
        self.get(&format!("/v1/backupvolumes/{volume}")).await
    }

    pub async fn backup_volume_delete(&self, volume: &str) -> Result<()> {
        self.delete(&format!("/v1/backupvolumes/{volume}")).await
    }

    pub async fn backup_list(&self, volume: &str) -> Result<Vec<Backup>> {
        self.list(&format!("/v1/backupvolumes/{volume}/backups"))
            .await
    }

    pub async fn backup_get(&self, volume: &str, backup: &str) -> Result<Backup> {
        self.get(&format!("/v1/backupvolumes/{volume}/backups/{backup}"))
            .await
    }

    pub async fn backup_delete(&self, volume: &str, backup: &str) -> Result<()> {
        self.delete(&format!("/v1/backupvolumes/{volume}/backups/{backup}"))
            .await
    }

    // =========================================================================
    // Nodes and instance managers
    // =========================================================================

    pub async fn node_create(&self, spec: &NodeSpec) -> Result<Node> {
        self.post("/v1/nodes", spec).await
    }

    pub async fn node_list(&self) -> Result<Vec<Node>> {
        self.list("/v1/nodes").await
    }

    pub async fn node_get(&self, name: &str) -> Result<Node> {
        self.get(&format!("/v1/nodes/{name}")).await
    }

    pub async fn node_update(&self, name: &str, update: &NodeUpdate) -> Result<Node> {
        self.put(&format!("/v1/nodes/{name}"), update).await
    }

    pub async fn disk_update(&self, name: &str, disks: &BTreeMap<String, DiskSpec>) -> Result<Node> {
        self.put(&format!("/v1/nodes/{name}/disks"), disks).await
    }

    pub async fn reset_disks(&self) -> Result<Vec<Node>> {
        let list: ListResponse<Node> = self.post("/v1/nodes/reset-disks", &json!({})).await?;
        Ok(list.items)
    }

    pub async fn instance_manager_get(&self, name: &str) -> Result<InstanceManagerView> {
        self.get(&format!("/v1/instancemanagers/{name}")).await
    }

    pub async fn instance_delete(&self, instance_manager: &str, instance: &str) -> Result<()> {
        self.delete(&format!(
            "/v1/instancemanagers/{instance_manager}/instances/{instance}"
        ))
        .await
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub async fn setting_list(&self) -> Result<Vec<Setting>> {
        self.list("/v1/settings").await
    }

    pub async fn setting_get(&self, name: &str) -> Result<Setting> {
        self.get(&format!("/v1/settings/{name}")).await
    }

    pub async fn setting_update(&self, name: &str, value: &str) -> Result<Setting> {
        self.put(&format!("/v1/settings/{name}"), &json!({ "value": value }))
            .await
    }

    // =========================================================================
    // Data path
    // =========================================================================

    pub async fn write(&self, name: &str, offset: u64, data: &[u8]) -> Result<()> {
        self.send_empty(
            self.request(Method::POST, &format!("/v1/volumes/{name}/data/write"))
                .json(&json!({ "offset": offset, "data": hex::encode(data) })),
        )
        .await
    }

    pub async fn read(&self, name: &str, offset: u64, length: usize) -> Result<Vec<u8>> {
        let response: DataResponse = self
            .post(
                &format!("/v1/volumes/{name}/data/read"),
                &json!({ "offset": offset, "length": length }),
            )
            .await?;
        hex::decode(&response.data)
            .map_err(|e| ClientError::check(format!("read returned invalid hex: {e}")))
    }

    pub async fn checksum(&self, name: &str) -> Result<String> {
        let response: ChecksumResponse = self
            .get(&format!("/v1/volumes/{name}/data/checksum"))
            .await?;
        Ok(response.checksum)
    }

    /// Raw JSON of any GET endpoint.
    pub async fn get_raw(&self, path: &str) -> Result<Value> {
        self.get(path).await
    }
}
