pub mod handlers;
pub mod server;

use pkg_registry::{Registry, ResourceManager};

/// Shared application state injected into all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub resources: ResourceManager,
    pub controller_id: String,
    pub listen_addr: String,
}
