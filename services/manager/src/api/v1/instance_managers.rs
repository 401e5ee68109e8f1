//! Instance manager inspection and process kill, used for fault injection.

use axum::{
    extract::{Path, State},
    routing::{delete, get},
    Json, Router,
};

use super::DeleteResponse;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::manager::InstanceManagerView;
use crate::state::AppState;

/// /v1/instancemanagers
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/{name}", get(get_instance_manager))
        .route("/{name}/instances/{instance}", delete(delete_instance))
}

async fn get_instance_manager(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> Result<Json<InstanceManagerView>, ApiError> {
    let view = state
        .manager()
        .instance_manager_get(&name)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(view))
}

async fn delete_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((name, instance)): Path<(String, String)>,
) -> Result<Json<DeleteResponse>, ApiError> {
    state
        .manager()
        .instance_delete(&name, &instance)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(DeleteResponse { ok: true }))
}
