use axum::{
    Json,
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Serialize;
use tracing::warn;

use pkg_constants::registry::{NODE_KEY_PREFIX, node_key};
use pkg_registry::RegistryError;
use pkg_types::node::Node;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ClusterInfo {
    pub endpoint: String,
    pub controller_id: String,
    pub version: String,
    pub node_count: usize,
}

/// GET /api/v1/cluster/info — controller metadata.
pub async fn cluster_info(State(state): State<AppState>) -> impl IntoResponse {
    let nodes = state
        .registry
        .list::<Node>(NODE_KEY_PREFIX)
        .await
        .unwrap_or_default();
    let info = ClusterInfo {
        endpoint: format!("http://{}", state.listen_addr),
        controller_id: state.controller_id.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node_count: nodes.len(),
    };
    (StatusCode::OK, Json(info)).into_response()
}

/// GET /api/v1/nodes — list all nodes.
pub async fn list_nodes(State(state): State<AppState>) -> impl IntoResponse {
    match state.registry.list::<Node>(NODE_KEY_PREFIX).await {
        Ok(entries) => {
            let nodes: Vec<Node> = entries.into_iter().map(|(_, n, _)| n).collect();
            (StatusCode::OK, Json(nodes)).into_response()
        }
        Err(e) => {
            warn!("Failed to list nodes: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to list nodes").into_response()
        }
    }
}

/// GET /api/v1/nodes/{name}
pub async fn get_node(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> impl IntoResponse {
    match state.registry.get::<Node>(&node_key(&name)).await {
        Ok((node, _)) => (StatusCode::OK, Json(node)).into_response(),
        Err(RegistryError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, "Node not found").into_response()
        }
        Err(e) => {
            warn!("Failed to get node {}: {}", name, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to get node").into_response()
        }
    }
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
