use axum::{
    Json,
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use tracing::{info, warn};

use pkg_constants::registry::{POD_KEY_PREFIX, pod_key};
use pkg_registry::RegistryError;
use pkg_types::configmap::ConfigMap;
use pkg_types::pod::{Pod, PodPhase};
use pkg_types::secret::Secret;

use crate::AppState;

// ============================================================
// Pods
// ============================================================

pub async fn create_pod(
    State(state): State<AppState>,
    AxumPath(ns): AxumPath<String>,
    Json(mut pod): Json<Pod>,
) -> impl IntoResponse {
    pod.namespace = ns.clone();
    pod.create();
    pod.status = Default::default();

    let key = pod_key(&ns, &pod.name);
    match state.registry.create(&key, &pod).await {
        Ok(_) => {
            info!("Created pod {} (uid={})", pod.full_name(), pod.uid);
            (StatusCode::CREATED, Json(pod)).into_response()
        }
        Err(RegistryError::VersionConflict(_)) => {
            (StatusCode::CONFLICT, "Pod already exists").into_response()
        }
        Err(e) => {
            warn!("Failed to create pod {}: {}", key, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to create pod").into_response()
        }
    }
}

pub async fn list_pods(
    State(state): State<AppState>,
    AxumPath(ns): AxumPath<String>,
) -> impl IntoResponse {
    let prefix = format!("{}{}/", POD_KEY_PREFIX, ns);
    match state.registry.list::<Pod>(&prefix).await {
        Ok(entries) => {
            let pods: Vec<Pod> = entries.into_iter().map(|(_, p, _)| p).collect();
            (StatusCode::OK, Json(pods)).into_response()
        }
        Err(e) => {
            warn!("Failed to list pods in {}: {}", ns, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to list pods").into_response()
        }
    }
}

pub async fn get_pod(
    State(state): State<AppState>,
    AxumPath((ns, name)): AxumPath<(String, String)>,
) -> impl IntoResponse {
    match state.registry.get::<Pod>(&pod_key(&ns, &name)).await {
        Ok((pod, _)) => (StatusCode::OK, Json(pod)).into_response(),
        Err(RegistryError::NotFound(_)) => (StatusCode::NOT_FOUND, "Pod not found").into_response(),
        Err(e) => {
            warn!("Failed to get pod {}/{}: {}", ns, name, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to get pod").into_response()
        }
    }
}

/// Deleting a pod marks it Terminated; the controllers release its node
/// and the record stays readable until it is garbage collected.
pub async fn delete_pod(
    State(state): State<AppState>,
    AxumPath((ns, name)): AxumPath<(String, String)>,
) -> impl IntoResponse {
    let key = pod_key(&ns, &name);
    loop {
        let (mut pod, version) = match state.registry.get::<Pod>(&key).await {
            Ok(found) => found,
            Err(RegistryError::NotFound(_)) => {
                return (StatusCode::NOT_FOUND, "Pod not found").into_response();
            }
            Err(e) => {
                warn!("Failed to load pod {}: {}", key, e);
                return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to delete pod")
                    .into_response();
            }
        };
        pod.set_phase(PodPhase::Terminated);
        match state.registry.update(&key, version, &pod).await {
            Ok(_) => {
                info!("Terminated pod {}/{}", ns, name);
                return (StatusCode::OK, Json(pod)).into_response();
            }
            Err(RegistryError::VersionConflict(_)) => continue,
            Err(e) => {
                warn!("Failed to terminate pod {}: {}", key, e);
                return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to delete pod")
                    .into_response();
            }
        }
    }
}

// ============================================================
// ConfigMaps
// ============================================================

pub async fn create_configmap(
    State(state): State<AppState>,
    AxumPath(ns): AxumPath<String>,
    Json(mut cm): Json<ConfigMap>,
) -> impl IntoResponse {
    cm.namespace = ns;
    cm.created_at = Some(Utc::now());
    info!("Stored configmap {}/{}", cm.namespace, cm.name);
    state.resources.put_configmap(cm.clone());
    (StatusCode::CREATED, Json(cm)).into_response()
}

pub async fn list_configmaps(
    State(state): State<AppState>,
    AxumPath(ns): AxumPath<String>,
) -> impl IntoResponse {
    (StatusCode::OK, Json(state.resources.list_configmaps(&ns))).into_response()
}

pub async fn delete_configmap(
    State(state): State<AppState>,
    AxumPath((ns, name)): AxumPath<(String, String)>,
) -> impl IntoResponse {
    state.resources.delete_configmap(&ns, &name);
    StatusCode::OK.into_response()
}

// ============================================================
// Secrets
// ============================================================

pub async fn create_secret(
    State(state): State<AppState>,
    AxumPath(ns): AxumPath<String>,
    Json(mut secret): Json<Secret>,
) -> impl IntoResponse {
    secret.namespace = ns;
    secret.created_at = Some(Utc::now());
    info!("Stored secret {}/{}", secret.namespace, secret.name);
    state.resources.put_secret(secret.clone());
    (StatusCode::CREATED, Json(secret)).into_response()
}

pub async fn list_secrets(
    State(state): State<AppState>,
    AxumPath(ns): AxumPath<String>,
) -> impl IntoResponse {
    // Secret values stay server-side; only names are listed
    let names: Vec<String> = state
        .resources
        .list_secrets(&ns)
        .into_iter()
        .map(|s| s.name)
        .collect();
    (StatusCode::OK, Json(names)).into_response()
}

pub async fn delete_secret(
    State(state): State<AppState>,
    AxumPath((ns, name)): AxumPath<(String, String)>,
) -> impl IntoResponse {
    state.resources.delete_secret(&ns, &name);
    StatusCode::OK.into_response()
}
