use axum::{
    Router,
    routing::{delete, get, post},
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::AppState;
use crate::handlers::{cluster, resources, watch};

/// Build the controller's REST API router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(cluster::healthz))
        .route("/api/v1/cluster/info", get(cluster::cluster_info))
        .route("/api/v1/watch", get(watch::watch_events))
        // Nodes are read-only: the node controller owns their lifecycle
        .route("/api/v1/nodes", get(cluster::list_nodes))
        .route("/api/v1/nodes/{name}", get(cluster::get_node))
        .route(
            "/api/v1/namespaces/{ns}/pods",
            post(resources::create_pod).get(resources::list_pods),
        )
        .route(
            "/api/v1/namespaces/{ns}/pods/{name}",
            get(resources::get_pod).delete(resources::delete_pod),
        )
        .route(
            "/api/v1/namespaces/{ns}/configmaps",
            post(resources::create_configmap).get(resources::list_configmaps),
        )
        .route(
            "/api/v1/namespaces/{ns}/configmaps/{name}",
            delete(resources::delete_configmap),
        )
        .route(
            "/api/v1/namespaces/{ns}/secrets",
            post(resources::create_secret).get(resources::list_secrets),
        )
        .route(
            "/api/v1/namespaces/{ns}/secrets/{name}",
            delete(resources::delete_secret),
        )
        .with_state(state)
}

/// Serve the API until the process exits.
pub async fn start_server(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state);
    info!("Starting API server on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
