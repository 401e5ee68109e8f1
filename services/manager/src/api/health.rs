//! Health check endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentHealth>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentHealth {
    pub scheduler: ComponentStatus,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentStatus {
    /// "ok" or "unavailable".
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

fn response(status: &str, components: Option<ComponentHealth>) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        service: "holdfast-manager".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components,
    }
}

async fn healthz() -> impl IntoResponse {
    Json(response("ok", None))
}

/// Ready once at least one node accepts replicas.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let schedulable = state
        .manager()
        .node_list()
        .await
        .iter()
        .filter(|node| node.allow_scheduling && !node.disks.is_empty())
        .count();

    let ok = schedulable > 0;
    let components = ComponentHealth {
        scheduler: ComponentStatus {
            status: if ok { "ok" } else { "unavailable" }.to_string(),
            message: (!ok).then(|| "no schedulable node registered".to_string()),
        },
    };
    let body = response(if ok { "ok" } else { "degraded" }, Some(components));
    if ok {
        (StatusCode::OK, Json(body))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use holdfast_id::NodeName;
    use tokio::sync::{watch, RwLock};
    use tower::ServiceExt;

    use super::*;
    use crate::actors::VolumeDeps;
    use crate::api::create_router;
    use crate::backupstore::MemoryBackupStore;
    use crate::events::EventBus;
    use crate::manager::VolumeManager;
    use crate::runtime::MockRuntime;
    use crate::scheduler::ReplicaScheduler;
    use crate::settings::Settings;

    fn empty_router() -> (Router, watch::Sender<bool>) {
        let settings = Settings::default().shared();
        let deps = VolumeDeps {
            runtime: Arc::new(MockRuntime::new()),
            backups: Arc::new(MemoryBackupStore::new()),
            scheduler: ReplicaScheduler::new(Arc::new(RwLock::new(BTreeMap::new())), settings.clone()),
            settings,
            events: EventBus::new(),
            local_node: NodeName::parse("node-1").unwrap(),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = VolumeManager::new(deps, shutdown_rx);
        (create_router(AppState::new(manager)), shutdown_tx)
    }

    #[tokio::test]
    async fn test_readyz_without_nodes_is_unavailable() {
        let (router, _shutdown) = empty_router();
        let response = router
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let (router, _shutdown) = empty_router();
        let response = router
            .oneshot(Request::get("/v2/volumes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let response = healthz().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_livez_returns_ok() {
        let response = livez().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
