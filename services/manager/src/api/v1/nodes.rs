//! Node registry endpoints.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};

use super::{node_name, ListResponse};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::model::{DiskSpec, Node, NodeSpec, NodeUpdate};
use crate::state::AppState;

/// /v1/nodes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_nodes).post(create_node))
        .route("/reset-disks", post(reset_disks))
        .route("/{name}", get(get_node).put(update_node))
        .route("/{name}/disks", put(update_disks))
}

async fn list_nodes(State(state): State<AppState>) -> Json<ListResponse<Node>> {
    Json(ListResponse {
        items: state.manager().node_list().await,
    })
}

async fn create_node(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(spec): Json<NodeSpec>,
) -> Result<impl IntoResponse, ApiError> {
    let node = state
        .manager()
        .node_create(spec)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok((StatusCode::CREATED, Json(node)))
}

async fn get_node(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> Result<Json<Node>, ApiError> {
    let name = node_name(&ctx, &name)?;
    let node = state
        .manager()
        .node_get(&name)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(node))
}

async fn update_node(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(update): Json<NodeUpdate>,
) -> Result<Json<Node>, ApiError> {
    let name = node_name(&ctx, &name)?;
    let node = state
        .manager()
        .node_update(&name, update)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(node))
}

async fn update_disks(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(disks): Json<BTreeMap<String, DiskSpec>>,
) -> Result<Json<Node>, ApiError> {
    let name = node_name(&ctx, &name)?;
    let node = state
        .manager()
        .disk_update(&name, disks)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(node))
}

async fn reset_disks(State(state): State<AppState>) -> Json<ListResponse<Node>> {
    Json(ListResponse {
        items: state.manager().reset_disks().await,
    })
}
