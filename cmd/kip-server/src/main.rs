use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use pkg_api::AppState;
use pkg_api::server::start_server;
use pkg_cloud::CloudClient;
use pkg_cloud::cloudinit::CloudInitFile;
use pkg_cloud::fake::{FakeCloudClient, default_catalog};
use pkg_cloud::image::BootImageTags;
use pkg_cloud::selector::InstanceSelector;
use pkg_constants::cloud::CELL_AGENT_PORT;
use pkg_constants::registry::CONTROLLER_ID_KEY;
use pkg_controllers::binder::Binder;
use pkg_controllers::dispatch::{ClusterDns, Dispatcher};
use pkg_controllers::node::{NodeController, NodeControllerConfig};
use pkg_controllers::pod::{PodController, PodControllerConfig};
use pkg_nodeclient::{HttpNodeClientFactory, NodeClientFactory};
use pkg_registry::{Registry, RegistryError, ResourceManager};
use pkg_types::config::{ServerConfigFile, load_config_file};

#[derive(Parser, Debug)]
#[command(name = "kip-server", about = "kip cell controller")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = "/etc/kip/config.yaml")]
    config: String,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Directory for registry storage
    #[arg(long)]
    data_dir: Option<String>,

    /// Stable controller id used to tag cloud instances
    #[arg(long)]
    controller_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let file_cfg: ServerConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);

    // Merge: CLI args > config file > defaults
    let port = cli.port.or(file_cfg.port).unwrap_or(6422);
    let data_dir = cli
        .data_dir
        .or(file_cfg.data_dir.clone())
        .unwrap_or_else(|| "/var/lib/kip/data".to_string());

    info!("Starting kip-server");
    info!("  Port:      {}", port);
    info!("  Data dir:  {}", data_dir);

    let registry = Registry::new(&data_dir).await?;
    let controller_id = resolve_controller_id(
        &registry,
        cli.controller_id.or(file_cfg.controller_id.clone()),
    )
    .await?;
    info!("  Controller id: {}", controller_id);

    // The in-process cloud ships as the local/dev provider; real SDK
    // adapters plug in behind the same trait.
    let cloud: Arc<dyn CloudClient> = Arc::new(FakeCloudClient::new());
    cloud
        .ensure_security_groups(vec![], vec![CELL_AGENT_PORT])
        .await
        .map_err(|e| anyhow::anyhow!("ensuring security groups: {}", e))?;

    let factory: Arc<dyn NodeClientFactory> =
        Arc::new(HttpNodeClientFactory::new(Duration::from_secs(30))?);
    let resources = ResourceManager::new();

    let boot_image_tags = file_cfg
        .boot_image_tags
        .as_deref()
        .map(BootImageTags::from_name)
        .unwrap_or_else(|| BootImageTags::from_name("elotl-itzo"));
    let cloud_init = CloudInitFile::new(file_cfg.cloud_init_file.as_deref().unwrap_or(""))?;
    let network_agent_kubeconfig = match &file_cfg.network_agent_kubeconfig {
        Some(path) => Some(std::fs::read(path)?),
        None => None,
    };

    let node_controller = Arc::new(NodeController::new(
        registry.clone(),
        cloud.clone(),
        factory.clone(),
        cloud_init,
        NodeControllerConfig {
            controller_id: controller_id.clone(),
            boot_image_tags,
            itzo_url: file_cfg.itzo_url.clone().unwrap_or_default(),
            itzo_version: file_cfg.itzo_version.clone().unwrap_or_default(),
            cell_config: file_cfg.cell_config.clone(),
            idle_node_timeout: Duration::from_secs(file_cfg.idle_node_timeout_secs.unwrap_or(90)),
            reuse_cleaned_nodes: file_cfg.reuse_cleaned_nodes.unwrap_or(false),
            ..Default::default()
        },
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        resources.clone(),
        factory.clone(),
        Some(ClusterDns::default()),
        network_agent_kubeconfig,
    ));
    let pod_controller = Arc::new(PodController::new(
        registry.clone(),
        InstanceSelector::new(default_catalog()),
        Binder::new(registry.clone()),
        dispatcher,
        node_controller.clone(),
        factory,
        PodControllerConfig {
            default_instance_type: file_cfg.default_instance_type.clone().unwrap_or_default(),
            ..Default::default()
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let node_loop = node_controller.start(shutdown_rx.clone());
    let pod_loop = pod_controller.start(shutdown_rx);

    let state = AppState {
        registry: registry.clone(),
        resources,
        controller_id,
        listen_addr: format!("0.0.0.0:{}", port),
    };
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tokio::select! {
        result = start_server(addr, state) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    // Stop the reconcile loops and give in-flight ticks a grace period.
    // Cleaning nodes may not reach Terminated before exit; the next start
    // reconciles them against the cloud lister.
    let _ = shutdown_tx.send(true);
    let grace = tokio::time::timeout(Duration::from_secs(10), async {
        let _ = node_loop.await;
        let _ = pod_loop.await;
    })
    .await;
    if grace.is_err() {
        warn!("Reconcile loops did not stop in time, exiting anyway");
    }
    registry.close().await?;
    Ok(())
}

/// Use the configured controller id, or the one persisted from an earlier
/// run, or generate and persist a fresh one.
async fn resolve_controller_id(
    registry: &Registry,
    configured: Option<String>,
) -> anyhow::Result<String> {
    if let Some(id) = configured {
        return Ok(id);
    }
    match registry.get::<String>(CONTROLLER_ID_KEY).await {
        Ok((id, _)) => Ok(id),
        Err(RegistryError::NotFound(_)) => {
            let id = format!("kip-{}", &Uuid::new_v4().to_string()[..8]);
            registry.create(CONTROLLER_ID_KEY, &id).await?;
            Ok(id)
        }
        Err(e) => Err(e.into()),
    }
}
