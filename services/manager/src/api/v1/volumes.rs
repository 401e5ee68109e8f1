//! Volume API endpoints.
//!
//! Mutating operations are accepted synchronously and complete in the
//! background; callers poll `GET /v1/volumes/{name}` for the outcome.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use holdfast_events::Frontend;
use holdfast_id::NodeName;
use serde::{Deserialize, Serialize};

use super::{volume_name, DeleteResponse, ListResponse};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::model::{VolumeSpec, VolumeView};
use crate::state::AppState;

/// /v1/volumes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_volumes).post(create_volume))
        .route("/{name}", get(get_volume).delete(delete_volume))
        .route("/{name}/attach", post(attach))
        .route("/{name}/detach", post(detach))
        .route("/{name}/expand", post(expand))
        .route("/{name}/migrate", post(migrate))
        .route("/{name}/migration/confirm", post(confirm_migration))
        .route("/{name}/migration/rollback", post(rollback_migration))
        .route("/{name}/activate", post(activate))
        .route("/{name}/salvage", post(salvage))
        .route("/{name}/replica-count", post(update_replica_count))
        .route("/{name}/pv", post(pv_create))
        .route("/{name}/pvc", post(pvc_create))
        .route("/{name}/data/write", post(write_data))
        .route("/{name}/data/read", post(read_data))
        .route("/{name}/data/checksum", get(checksum))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachRequest {
    pub host_id: NodeName,
    #[serde(default)]
    pub disable_frontend: bool,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DetachRequest {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ExpandRequest {
    pub size: u64,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrateRequest {
    pub node_id: NodeName,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ActivateRequest {
    #[serde(default)]
    pub frontend: Option<Frontend>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SalvageRequest {
    pub names: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaCountRequest {
    pub replica_count: u32,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PvRequest {
    #[serde(default)]
    pub pv_name: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PvcRequest {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub pvc_name: String,
}

/// Block data travels hex encoded.
#[derive(Debug, Deserialize, Serialize)]
pub struct WriteRequest {
    pub offset: u64,
    pub data: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ReadRequest {
    pub offset: u64,
    pub length: usize,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DataResponse {
    pub offset: u64,
    pub data: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ChecksumResponse {
    pub checksum: String,
}

fn accepted(view: VolumeView) -> (StatusCode, Json<VolumeView>) {
    (StatusCode::ACCEPTED, Json(view))
}

// =============================================================================
// Handlers
// =============================================================================

/// GET /v1/volumes
async fn list_volumes(State(state): State<AppState>) -> Json<ListResponse<VolumeView>> {
    Json(ListResponse {
        items: state.manager().list().await,
    })
}

/// POST /v1/volumes
async fn create_volume(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(spec): Json<VolumeSpec>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state
        .manager()
        .create(spec)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// GET /v1/volumes/{name}
async fn get_volume(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> Result<Json<VolumeView>, ApiError> {
    let name = volume_name(&ctx, &name)?;
    let view = state.manager().get(&name).await.map_err(|e| ctx.error(e))?;
    Ok(Json(view))
}

/// DELETE /v1/volumes/{name}
async fn delete_volume(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let name = volume_name(&ctx, &name)?;
    state
        .manager()
        .delete(&name)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(DeleteResponse { ok: true }))
}

/// POST /v1/volumes/{name}/attach
async fn attach(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(req): Json<AttachRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = volume_name(&ctx, &name)?;
    let view = state
        .manager()
        .attach(&name, req.host_id, req.disable_frontend)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(accepted(view))
}

/// POST /v1/volumes/{name}/detach
async fn detach(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(req): Json<DetachRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = volume_name(&ctx, &name)?;
    let view = state
        .manager()
        .detach(&name, req.force)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(accepted(view))
}

/// POST /v1/volumes/{name}/expand
async fn expand(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(req): Json<ExpandRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = volume_name(&ctx, &name)?;
    let view = state
        .manager()
        .expand(&name, req.size)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(accepted(view))
}

/// POST /v1/volumes/{name}/migrate
async fn migrate(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(req): Json<MigrateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = volume_name(&ctx, &name)?;
    let view = state
        .manager()
        .migrate(&name, req.node_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(accepted(view))
}

/// POST /v1/volumes/{name}/migration/confirm
async fn confirm_migration(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let name = volume_name(&ctx, &name)?;
    let view = state
        .manager()
        .confirm_migration(&name)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(accepted(view))
}

/// POST /v1/volumes/{name}/migration/rollback
async fn rollback_migration(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let name = volume_name(&ctx, &name)?;
    let view = state
        .manager()
        .rollback_migration(&name)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(accepted(view))
}

/// POST /v1/volumes/{name}/activate
async fn activate(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(req): Json<ActivateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = volume_name(&ctx, &name)?;
    let view = state
        .manager()
        .activate(&name, req.frontend)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(accepted(view))
}

/// POST /v1/volumes/{name}/salvage
async fn salvage(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(req): Json<SalvageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = volume_name(&ctx, &name)?;
    let view = state
        .manager()
        .salvage(&name, req.names)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(accepted(view))
}

/// POST /v1/volumes/{name}/replica-count
async fn update_replica_count(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(req): Json<ReplicaCountRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = volume_name(&ctx, &name)?;
    let view = state
        .manager()
        .update_replica_count(&name, req.replica_count)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(accepted(view))
}

/// POST /v1/volumes/{name}/pv
async fn pv_create(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(req): Json<PvRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = volume_name(&ctx, &name)?;
    let view = state
        .manager()
        .pv_create(&name, req.pv_name)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(accepted(view))
}

/// POST /v1/volumes/{name}/pvc
async fn pvc_create(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(req): Json<PvcRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = volume_name(&ctx, &name)?;
    let view = state
        .manager()
        .pvc_create(&name, req.namespace, req.pvc_name)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(accepted(view))
}

/// POST /v1/volumes/{name}/data/write
async fn write_data(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(req): Json<WriteRequest>,
) -> Result<StatusCode, ApiError> {
    let name = volume_name(&ctx, &name)?;
    let data = hex::decode(&req.data).map_err(|e| {
        ApiError::bad_request("invalid_data", format!("data must be hex encoded: {e}"))
            .with_request_id(ctx.request_id.clone())
    })?;
    state
        .manager()
        .write(&name, req.offset, &data)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/volumes/{name}/data/read
async fn read_data(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(req): Json<ReadRequest>,
) -> Result<Json<DataResponse>, ApiError> {
    let name = volume_name(&ctx, &name)?;
    let data = state
        .manager()
        .read(&name, req.offset, req.length)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(DataResponse {
        offset: req.offset,
        data: hex::encode(data),
    }))
}

/// GET /v1/volumes/{name}/data/checksum
async fn checksum(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> Result<Json<ChecksumResponse>, ApiError> {
    let name = volume_name(&ctx, &name)?;
    let checksum = state
        .manager()
        .checksum(&name)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ChecksumResponse { checksum }))
}
