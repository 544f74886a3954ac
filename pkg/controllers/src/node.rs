//! Node lifecycle controller.
//!
//! Runs the per-node state machine:
//!
//! ```text
//! Creating -> Created -> Available -> Claimed -> Cleaning -> Terminating -> Terminated
//! ```
//!
//! Any non-terminal state may jump to Cleaning or Terminating on failure
//! or explicit terminate; Terminated is absorbing. Each reconcile tick
//! lists cloud instances, diffs them against the registry's node set, and
//! advances every node through the machine. Per-node work goes through a
//! worker pool keyed by node uid so ticks never touch one node twice
//! concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use pkg_cloud::cloudinit::CloudInitFile;
use pkg_cloud::image::BootImageTags;
use pkg_cloud::CloudClient;
use pkg_constants::cloud::{
    CONTROLLER_TAG_KEY, NAME_TAG_KEY, NAMESPACE_TAG_KEY, NAMETAG_TAG_KEY, POD_NAME_TAG_KEY,
};
use pkg_constants::registry::{NODE_KEY_PREFIX, POD_KEY_PREFIX, node_key, pod_key};
use pkg_nodeclient::NodeClientFactory;
use pkg_registry::{Registry, RegistryError};
use pkg_types::node::{Node, NodePhase, NodeSpec};
use pkg_types::pod::{Pod, PodPhase, SpotPolicy};

use crate::backoff::BackoffTracker;
use crate::worker::KeyedWorkerPool;

/// Consecutive cloud-list misses before a node is declared gone.
const MAX_CLOUD_LIST_MISSES: u32 = 2;

pub struct NodeControllerConfig {
    pub controller_id: String,
    pub boot_image_tags: BootImageTags,
    pub itzo_url: String,
    pub itzo_version: String,
    pub cell_config: HashMap<String, String>,
    /// IAM instance profile assigned to new instances; empty means none.
    pub instance_profile: String,
    pub reconcile_interval: Duration,
    /// How long an Available node may sit unclaimed before cleanup.
    pub idle_node_timeout: Duration,
    /// How long a Created node gets to pass its first health probe.
    pub boot_deadline: Duration,
    /// Cleaned nodes go back to Available instead of terminating.
    pub reuse_cleaned_nodes: bool,
}

impl Default for NodeControllerConfig {
    fn default() -> Self {
        Self {
            controller_id: String::new(),
            boot_image_tags: BootImageTags::default(),
            itzo_url: String::new(),
            itzo_version: String::new(),
            cell_config: HashMap::new(),
            instance_profile: String::new(),
            reconcile_interval: Duration::from_secs(5),
            idle_node_timeout: Duration::from_secs(90),
            boot_deadline: Duration::from_secs(300),
            reuse_cleaned_nodes: false,
        }
    }
}

pub struct NodeController {
    registry: Registry,
    cloud: Arc<dyn CloudClient>,
    factory: Arc<dyn NodeClientFactory>,
    cloud_init: CloudInitFile,
    config: NodeControllerConfig,
    pool: KeyedWorkerPool,
    backoff: Mutex<BackoffTracker>,
    /// Consecutive ticks each node's instance was absent from the cloud list.
    misses: Mutex<HashMap<String, u32>>,
    /// When each Available node was last seen unclaimed.
    idle_since: Mutex<HashMap<String, Instant>>,
}

impl NodeController {
    pub fn new(
        registry: Registry,
        cloud: Arc<dyn CloudClient>,
        factory: Arc<dyn NodeClientFactory>,
        cloud_init: CloudInitFile,
        config: NodeControllerConfig,
    ) -> Self {
        Self {
            registry,
            cloud,
            factory,
            cloud_init,
            config,
            pool: KeyedWorkerPool::new(8),
            backoff: Mutex::new(BackoffTracker::new()),
            misses: Mutex::new(HashMap::new()),
            idle_since: Mutex::new(HashMap::new()),
        }
    }

    /// Run the reconcile loop until shutdown.
    pub fn start(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "NodeController started (interval={:?})",
                self.config.reconcile_interval
            );
            let mut interval = tokio::time::interval(self.config.reconcile_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.clone().tick().await {
                            warn!("NodeController reconcile error: {}", e);
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("NodeController shutting down");
                        return;
                    }
                }
            }
        })
    }

    /// Create a node record for a pod that has no available node. The
    /// record starts in Creating; this tick loop boots it.
    pub async fn request_node(&self, pod: &Pod, instance_type: &str) -> anyhow::Result<String> {
        let boot_image = self
            .cloud
            .get_image_id(&self.config.boot_image_tags)
            .await
            .map_err(|e| anyhow::anyhow!("resolving boot image: {}", e))?;
        let node = Node::new(NodeSpec {
            instance_type: instance_type.to_string(),
            boot_image,
            terminate: false,
            spot: pod.spec.spot.policy == SpotPolicy::Always,
            resources: pod.spec.resources.clone(),
            placement: pod.spec.placement.clone(),
            nametag: pod.full_name(),
        });
        self.registry.create(&node_key(&node.name), &node).await?;
        info!(
            "Requested node {} ({}) for pod {}",
            node.name,
            instance_type,
            pod.full_name()
        );
        Ok(node.name)
    }

    /// One reconciliation pass over the node set.
    pub async fn tick(self: Arc<Self>) -> anyhow::Result<()> {
        let cloud_ids: HashSet<String> = self
            .cloud
            .list_instances()
            .await
            .map_err(|e| anyhow::anyhow!("listing instances: {}", e))?
            .into_iter()
            .map(|i| i.id)
            .collect();
        let nodes = self.registry.list::<Node>(NODE_KEY_PREFIX).await?;
        let pods = self.registry.list::<Pod>(POD_KEY_PREFIX).await?;
        let pod_names: HashSet<String> = pods.iter().map(|(_, p, _)| p.name.clone()).collect();

        let mut tasks = JoinSet::new();
        for (key, node, version) in nodes {
            let in_cloud =
                !node.status.instance_id.is_empty() && cloud_ids.contains(&node.status.instance_id);
            let bound_pod_exists =
                node.status.bound_pod_name.is_empty() || pod_names.contains(&node.status.bound_pod_name);
            let this = self.clone();
            let uid = node.uid.clone();
            tasks.spawn(async move {
                this.pool
                    .clone()
                    .run(&uid, || async {
                        if let Err(e) = this
                            .handle_node(&key, node, version, in_cloud, bound_pod_exists)
                            .await
                        {
                            warn!("Node reconcile error on {}: {}", key, e);
                        }
                    })
                    .await;
            });
        }
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    async fn handle_node(
        &self,
        key: &str,
        mut node: Node,
        version: u64,
        in_cloud: bool,
        bound_pod_exists: bool,
    ) -> anyhow::Result<()> {
        // A booted instance that disappears from the cloud lister twice in
        // a row is gone, whatever phase we thought it was in.
        if !node.status.instance_id.is_empty() && node.status.phase != NodePhase::Terminated {
            if !in_cloud {
                let misses = {
                    let mut misses = self.misses.lock().unwrap();
                    let m = misses.entry(node.name.clone()).or_insert(0);
                    *m += 1;
                    *m
                };
                if misses >= MAX_CLOUD_LIST_MISSES {
                    warn!(
                        "Node {} instance {} missing from cloud, terminating",
                        node.name, node.status.instance_id
                    );
                    node.set_phase(NodePhase::Terminated);
                    self.update(key, version, &node).await;
                    return Ok(());
                }
            } else {
                self.misses.lock().unwrap().remove(&node.name);
            }
        }

        match node.status.phase {
            NodePhase::Creating => self.handle_creating(key, node, version).await,
            NodePhase::Created => self.handle_created(key, node, version).await,
            NodePhase::Available => self.handle_available(key, node, version).await,
            NodePhase::Claimed => {
                // The idle clock restarts if this node ever becomes
                // Available again
                self.idle_since.lock().unwrap().remove(&node.name);
                if !bound_pod_exists {
                    warn!(
                        "Node {} is bound to missing pod {}, unbinding",
                        node.name, node.status.bound_pod_name
                    );
                    node.status.bound_pod_name = String::new();
                    node.set_phase(NodePhase::Cleaning);
                    self.update(key, version, &node).await;
                }
                Ok(())
            }
            NodePhase::Cleaning => self.handle_cleaning(key, node, version, in_cloud).await,
            NodePhase::Terminating => self.handle_terminating(key, node, version).await,
            NodePhase::Terminated => {
                if !in_cloud {
                    // Observed absent for at least one poll cycle: drop the record
                    debug!("Deleting terminated node {}", node.name);
                    self.registry.delete(key).await?;
                    self.misses.lock().unwrap().remove(&node.name);
                    self.idle_since.lock().unwrap().remove(&node.name);
                }
                Ok(())
            }
        }
    }

    async fn handle_creating(&self, key: &str, mut node: Node, version: u64) -> anyhow::Result<()> {
        if !self.backoff.lock().unwrap().ready(&node.name, Instant::now()) {
            return Ok(());
        }

        let mut version = version;
        if node.status.instance_id.is_empty() {
            let user_data = match self.render_cloud_init() {
                Ok(data) => data,
                Err(e) => {
                    // Render failures abort before any cloud call
                    self.fail_boot(key, &mut node, version, &format!("cloud-init: {}", e))
                        .await;
                    return Ok(());
                }
            };
            let started = if node.spec.spot {
                self.cloud.start_spot_node(&node, &user_data).await
            } else {
                self.cloud.start_node(&node, &user_data).await
            };
            match started {
                Ok(result) => {
                    node.status.instance_id = result.instance_id;
                    node.spec.placement.availability_zone = result.availability_zone;
                    match self.update_checked(key, version, &node).await {
                        Some(v) => version = v,
                        None => return Ok(()),
                    }
                    self.tag_instance(&node).await;
                    self.apply_instance_options(&node).await;
                }
                Err(e) if e.is_permanent() => {
                    self.fail_boot(key, &mut node, version, &e.to_string()).await;
                    return Ok(());
                }
                Err(e) => {
                    let delay = self
                        .backoff
                        .lock()
                        .unwrap()
                        .failure(&node.name, Instant::now());
                    warn!(
                        "Transient error starting node {}: {} (retry in {:?})",
                        node.name, e, delay
                    );
                    return Ok(());
                }
            }
        }

        match self.cloud.wait_for_running(&node).await {
            Ok(addresses) => {
                node.status.addresses = addresses;
                node.set_phase(NodePhase::Created);
                self.update(key, version, &node).await;
                self.backoff.lock().unwrap().clear(&node.name);
            }
            Err(e) => {
                warn!(
                    "Node {} did not reach running: {}, cleaning up",
                    node.name, e
                );
                node.set_phase(NodePhase::Cleaning);
                self.update(key, version, &node).await;
            }
        }
        Ok(())
    }

    async fn handle_created(&self, key: &str, mut node: Node, version: u64) -> anyhow::Result<()> {
        if !self.backoff.lock().unwrap().ready(&node.name, Instant::now()) {
            return Ok(());
        }
        let result: Result<(), String> = async {
            let groups = self.cloud.get_boot_security_group_ids();
            if !groups.is_empty() {
                self.cloud
                    .attach_security_groups(&node, groups)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            if !self.config.instance_profile.is_empty() {
                self.cloud
                    .assign_instance_profile(&node, &self.config.instance_profile)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            let client = self
                .factory
                .client(&node.status.addresses)
                .map_err(|e| e.to_string())?;
            client.health().await.map_err(|e| e.to_string())
        }
        .await;

        match result {
            Ok(()) => {
                node.set_phase(NodePhase::Available);
                self.update(key, version, &node).await;
                self.backoff.lock().unwrap().clear(&node.name);
                info!("Node {} is available", node.name);
            }
            Err(e) => {
                let booted_at = node.created_at.map(|t| t.timestamp()).unwrap_or(0);
                let age = chrono::Utc::now().timestamp() - booted_at;
                if age > self.config.boot_deadline.as_secs() as i64 {
                    warn!(
                        "Node {} failed its boot deadline ({}), cleaning up",
                        node.name, e
                    );
                    node.set_phase(NodePhase::Cleaning);
                    self.update(key, version, &node).await;
                } else {
                    self.backoff
                        .lock()
                        .unwrap()
                        .failure(&node.name, Instant::now());
                    debug!("Node {} not healthy yet: {}", node.name, e);
                }
            }
        }
        Ok(())
    }

    async fn handle_available(
        &self,
        key: &str,
        mut node: Node,
        version: u64,
    ) -> anyhow::Result<()> {
        if node.spec.terminate {
            node.set_phase(NodePhase::Cleaning);
            self.update(key, version, &node).await;
            self.idle_since.lock().unwrap().remove(&node.name);
            return Ok(());
        }
        let idle_for = {
            let mut idle = self.idle_since.lock().unwrap();
            let since = idle.entry(node.name.clone()).or_insert_with(Instant::now);
            since.elapsed()
        };
        if idle_for >= self.config.idle_node_timeout {
            info!(
                "Node {} idle for {:?}, cleaning up",
                node.name, idle_for
            );
            node.set_phase(NodePhase::Cleaning);
            self.update(key, version, &node).await;
            self.idle_since.lock().unwrap().remove(&node.name);
        }
        Ok(())
    }

    async fn handle_cleaning(
        &self,
        key: &str,
        mut node: Node,
        version: u64,
        in_cloud: bool,
    ) -> anyhow::Result<()> {
        node.status.bound_pod_name = String::new();
        // Spot capacity is never re-used; the discount came with an
        // interruption clock.
        let reusable = self.config.reuse_cleaned_nodes && !node.spec.spot && in_cloud;
        if reusable {
            let healthy = match self.factory.client(&node.status.addresses) {
                Ok(client) => client.health().await.is_ok(),
                Err(_) => false,
            };
            if healthy {
                node.set_phase(NodePhase::Available);
                self.update(key, version, &node).await;
                self.idle_since.lock().unwrap().remove(&node.name);
                info!("Node {} cleaned and back to available", node.name);
                return Ok(());
            }
        }
        node.set_phase(NodePhase::Terminating);
        self.update(key, version, &node).await;
        Ok(())
    }

    async fn handle_terminating(
        &self,
        key: &str,
        mut node: Node,
        version: u64,
    ) -> anyhow::Result<()> {
        if !node.status.instance_id.is_empty() {
            // Stopping can take minutes; never block the tick on it
            let cloud = self.cloud.clone();
            let instance_id = node.status.instance_id.clone();
            tokio::spawn(async move {
                if let Err(e) = cloud.stop_instance(&instance_id).await {
                    warn!("Error stopping instance {}: {}", instance_id, e);
                }
            });
        }
        node.set_phase(NodePhase::Terminated);
        self.update(key, version, &node).await;
        Ok(())
    }

    fn render_cloud_init(&self) -> Result<String, pkg_cloud::cloudinit::CloudInitError> {
        let mut file = self.cloud_init.clone();
        file.reset_instance_data();
        file.add_agent_url(&self.config.itzo_url);
        file.add_agent_version(&self.config.itzo_version);
        file.add_cell_config(&self.config.cell_config)?;
        let bytes = file.contents()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn tag_instance(&self, node: &Node) {
        let (namespace, pod_name) = match node.spec.nametag.split_once('/') {
            Some((ns, name)) => (ns.to_string(), name.to_string()),
            None => (String::new(), node.spec.nametag.clone()),
        };
        let mut tags = HashMap::new();
        tags.insert(CONTROLLER_TAG_KEY.to_string(), self.config.controller_id.clone());
        tags.insert(NAME_TAG_KEY.to_string(), node.name.clone());
        tags.insert(NAMESPACE_TAG_KEY.to_string(), namespace);
        tags.insert(NAMETAG_TAG_KEY.to_string(), node.spec.nametag.clone());
        tags.insert(POD_NAME_TAG_KEY.to_string(), pod_name);
        if let Err(e) = self
            .cloud
            .add_instance_tags(&node.status.instance_id, tags)
            .await
        {
            warn!("Could not tag instance {}: {}", node.status.instance_id, e);
        }
    }

    /// Post-boot instance knobs: sustained CPU and root volume size.
    async fn apply_instance_options(&self, node: &Node) {
        if let Some(enabled) = node.spec.resources.sustained_cpu {
            if let Err(e) = self.cloud.set_sustained_cpu(node, enabled).await {
                warn!("Could not set sustained cpu on {}: {}", node.name, e);
            }
        }
        if let Some(size) = node.spec.resources.volume_size_gib() {
            if !self.cloud.get_attributes().fixed_size_volume {
                if let Err(e) = self.cloud.resize_volume(node, size).await {
                    warn!("Could not resize volume on {}: {}", node.name, e);
                }
            }
        }
    }

    /// Boot failed permanently: surface the message on the owning pod and
    /// send the node to Terminating.
    async fn fail_boot(&self, key: &str, node: &mut Node, version: u64, message: &str) {
        warn!("Node {} failed to boot: {}", node.name, message);
        if let Some((namespace, pod_name)) = node.spec.nametag.split_once('/') {
            let pod_key = pod_key(namespace, pod_name);
            match self.registry.get::<Pod>(&pod_key).await {
                Ok((mut pod, pod_version)) => {
                    pod.status.start_failures += 1;
                    pod.status.reason = message.to_string();
                    pod.set_phase(PodPhase::Failed);
                    if let Err(e) = self.registry.update(&pod_key, pod_version, &pod).await {
                        warn!("Could not fail pod {}: {}", pod_key, e);
                    }
                }
                Err(RegistryError::NotFound(_)) => {}
                Err(e) => warn!("Could not load pod for failed node {}: {}", node.name, e),
            }
        }
        node.set_phase(if node.status.instance_id.is_empty() {
            NodePhase::Terminating
        } else {
            NodePhase::Cleaning
        });
        self.update(key, version, node).await;
    }

    async fn update(&self, key: &str, version: u64, node: &Node) {
        self.update_checked(key, version, node).await;
    }

    /// Write the node back; a version conflict means someone else updated
    /// it this tick and the next tick will see the fresh record.
    async fn update_checked(&self, key: &str, version: u64, node: &Node) -> Option<u64> {
        match self.registry.update(key, version, node).await {
            Ok(v) => Some(v),
            Err(RegistryError::VersionConflict(_)) => {
                debug!("Node {} changed concurrently, skipping write", key);
                None
            }
            Err(e) => {
                warn!("Error writing node {}: {}", key, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_cloud::CloudError;
    use pkg_cloud::fake::FakeCloudClient;
    use pkg_nodeclient::fake::FakeNodeClientFactory;
    use pkg_types::pod::PodSpec;

    struct Fixture {
        registry: Registry,
        cloud: Arc<FakeCloudClient>,
        agent_factory: FakeNodeClientFactory,
        controller: Arc<NodeController>,
    }

    async fn make_fixture(config: NodeControllerConfig) -> Fixture {
        let registry = Registry::new_in_memory().await.unwrap();
        let cloud = Arc::new(FakeCloudClient::new());
        let agent_factory = FakeNodeClientFactory::new();
        let controller = Arc::new(NodeController::new(
            registry.clone(),
            cloud.clone(),
            Arc::new(agent_factory.clone()),
            CloudInitFile::default(),
            config,
        ));
        Fixture {
            registry,
            cloud,
            agent_factory,
            controller,
        }
    }

    fn test_config() -> NodeControllerConfig {
        NodeControllerConfig {
            controller_id: "kip-test".to_string(),
            boot_image_tags: BootImageTags::from_name("elotl-itzo"),
            itzo_url: "https://example.com/itzo".to_string(),
            ..Default::default()
        }
    }

    fn make_pod(name: &str) -> Pod {
        Pod {
            name: name.to_string(),
            namespace: "default".to_string(),
            uid: format!("{}-uid", name),
            labels: Default::default(),
            created_at: None,
            spec: PodSpec::default(),
            status: Default::default(),
        }
    }

    async fn get_node(fixture: &Fixture, name: &str) -> Node {
        let (node, _): (Node, u64) = fixture.registry.get(&node_key(name)).await.unwrap();
        node
    }

    #[tokio::test]
    async fn test_node_boots_to_available() {
        let fixture = make_fixture(test_config()).await;
        let pod = make_pod("p");
        fixture
            .registry
            .create(&pod_key("default", "p"), &pod)
            .await
            .unwrap();
        let name = fixture
            .controller
            .request_node(&pod, "t3.micro")
            .await
            .unwrap();

        // Tick 1: Creating -> started -> Created with instance id + addresses
        fixture.controller.clone().tick().await.unwrap();
        let node = get_node(&fixture, &name).await;
        assert_eq!(node.status.phase, NodePhase::Created);
        assert!(!node.status.instance_id.is_empty());
        assert!(!node.status.addresses.is_empty());

        // Instance is tagged with the controller id and pod name
        let instance = fixture
            .cloud
            .instances
            .get(&node.status.instance_id)
            .unwrap()
            .clone();
        assert_eq!(instance.tags.get(CONTROLLER_TAG_KEY).unwrap(), "kip-test");
        assert_eq!(instance.tags.get(POD_NAME_TAG_KEY).unwrap(), "p");

        // Tick 2: Created -> health probe -> Available
        fixture.controller.clone().tick().await.unwrap();
        let node = get_node(&fixture, &name).await;
        assert_eq!(node.status.phase, NodePhase::Available);
    }

    #[tokio::test]
    async fn test_permanent_boot_failure_fails_owning_pod() {
        let fixture = make_fixture(test_config()).await;
        let pod = make_pod("p");
        fixture
            .registry
            .create(&pod_key("default", "p"), &pod)
            .await
            .unwrap();
        let name = fixture
            .controller
            .request_node(&pod, "t3.micro")
            .await
            .unwrap();
        fixture
            .cloud
            .fail_next_start(CloudError::Permanent("quota exceeded".to_string()));

        fixture.controller.clone().tick().await.unwrap();

        let (pod, _): (Pod, u64) = fixture
            .registry
            .get(&pod_key("default", "p"))
            .await
            .unwrap();
        assert_eq!(pod.status.phase, PodPhase::Failed);
        assert!(pod.status.reason.contains("quota exceeded"));
        assert_eq!(pod.status.start_failures, 1);

        let node = get_node(&fixture, &name).await;
        assert!(matches!(
            node.status.phase,
            NodePhase::Terminating | NodePhase::Terminated
        ));
    }

    #[tokio::test]
    async fn test_transient_boot_failure_retries() {
        let fixture = make_fixture(test_config()).await;
        let pod = make_pod("p");
        fixture
            .registry
            .create(&pod_key("default", "p"), &pod)
            .await
            .unwrap();
        let name = fixture
            .controller
            .request_node(&pod, "t3.micro")
            .await
            .unwrap();
        fixture
            .cloud
            .fail_next_start(CloudError::Transient("throttled".to_string()));

        fixture.controller.clone().tick().await.unwrap();
        let node = get_node(&fixture, &name).await;
        assert_eq!(node.status.phase, NodePhase::Creating);
        assert!(node.status.instance_id.is_empty());

        let (pod, _): (Pod, u64) = fixture
            .registry
            .get(&pod_key("default", "p"))
            .await
            .unwrap();
        assert_eq!(pod.status.phase, PodPhase::Waiting);
    }

    #[tokio::test]
    async fn test_idle_available_node_is_cleaned_and_terminated() {
        let config = NodeControllerConfig {
            idle_node_timeout: Duration::ZERO,
            ..test_config()
        };
        let fixture = make_fixture(config).await;
        let pod = make_pod("p");
        let name = fixture
            .controller
            .request_node(&pod, "t3.micro")
            .await
            .unwrap();
        fixture.controller.clone().tick().await.unwrap();
        fixture.controller.clone().tick().await.unwrap();
        assert_eq!(
            get_node(&fixture, &name).await.status.phase,
            NodePhase::Available
        );

        // Idle timeout of zero: Cleaning, then Terminating, then Terminated
        fixture.controller.clone().tick().await.unwrap();
        assert_eq!(
            get_node(&fixture, &name).await.status.phase,
            NodePhase::Cleaning
        );
        fixture.controller.clone().tick().await.unwrap();
        assert_eq!(
            get_node(&fixture, &name).await.status.phase,
            NodePhase::Terminating
        );
        fixture.controller.clone().tick().await.unwrap();
        let node = get_node(&fixture, &name).await;
        assert_eq!(node.status.phase, NodePhase::Terminated);

        // The detached stop eventually removes the instance
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fixture.cloud.list_instances().await.unwrap().is_empty());

        // Once the instance is gone from the lister the record is deleted
        fixture.controller.clone().tick().await.unwrap();
        assert!(fixture
            .registry
            .get::<Node>(&node_key(&name))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_instance_missing_two_ticks_is_terminated() {
        let fixture = make_fixture(test_config()).await;
        let pod = make_pod("p");
        let name = fixture
            .controller
            .request_node(&pod, "t3.micro")
            .await
            .unwrap();
        fixture.controller.clone().tick().await.unwrap();
        fixture.controller.clone().tick().await.unwrap();
        let node = get_node(&fixture, &name).await;
        assert_eq!(node.status.phase, NodePhase::Available);

        fixture.cloud.lose_instance(&node.status.instance_id);

        fixture.controller.clone().tick().await.unwrap();
        assert_eq!(
            get_node(&fixture, &name).await.status.phase,
            NodePhase::Available,
            "one miss is not enough"
        );
        fixture.controller.clone().tick().await.unwrap();
        assert_eq!(
            get_node(&fixture, &name).await.status.phase,
            NodePhase::Terminated
        );
    }

    #[tokio::test]
    async fn test_claimed_node_with_missing_pod_is_unbound() {
        let fixture = make_fixture(test_config()).await;
        let pod = make_pod("p");
        let name = fixture
            .controller
            .request_node(&pod, "t3.micro")
            .await
            .unwrap();
        fixture.controller.clone().tick().await.unwrap();

        // Claim the node for a pod that does not exist in the registry
        let key = node_key(&name);
        let (mut node, version): (Node, u64) = fixture.registry.get(&key).await.unwrap();
        node.status.phase = NodePhase::Claimed;
        node.status.bound_pod_name = "ghost".to_string();
        fixture.registry.update(&key, version, &node).await.unwrap();

        fixture.controller.clone().tick().await.unwrap();
        let node = get_node(&fixture, &name).await;
        assert_eq!(node.status.phase, NodePhase::Cleaning);
        assert!(node.status.bound_pod_name.is_empty());
    }

    #[tokio::test]
    async fn test_cleaned_node_reused_when_configured() {
        let config = NodeControllerConfig {
            reuse_cleaned_nodes: true,
            ..test_config()
        };
        let fixture = make_fixture(config).await;
        let pod = make_pod("p");
        let name = fixture
            .controller
            .request_node(&pod, "t3.micro")
            .await
            .unwrap();
        fixture.controller.clone().tick().await.unwrap();

        let key = node_key(&name);
        let (mut node, version): (Node, u64) = fixture.registry.get(&key).await.unwrap();
        node.status.phase = NodePhase::Cleaning;
        node.status.bound_pod_name = "done".to_string();
        fixture.registry.update(&key, version, &node).await.unwrap();

        fixture.controller.clone().tick().await.unwrap();
        let node = get_node(&fixture, &name).await;
        assert_eq!(node.status.phase, NodePhase::Available);
        assert!(node.status.bound_pod_name.is_empty());

        // Spot nodes are never reused
        let (mut node, version): (Node, u64) = fixture.registry.get(&key).await.unwrap();
        node.spec.spot = true;
        node.status.phase = NodePhase::Cleaning;
        fixture.registry.update(&key, version, &node).await.unwrap();
        fixture.controller.clone().tick().await.unwrap();
        assert_eq!(
            get_node(&fixture, &name).await.status.phase,
            NodePhase::Terminating
        );
    }

    #[tokio::test]
    async fn test_unhealthy_agent_keeps_node_created_until_deadline() {
        let config = NodeControllerConfig {
            boot_deadline: Duration::from_secs(3600),
            ..test_config()
        };
        let fixture = make_fixture(config).await;
        fixture.agent_factory.agent.set_healthy(false);
        let pod = make_pod("p");
        let name = fixture
            .controller
            .request_node(&pod, "t3.micro")
            .await
            .unwrap();
        fixture.controller.clone().tick().await.unwrap();
        fixture.controller.clone().tick().await.unwrap();
        assert_eq!(
            get_node(&fixture, &name).await.status.phase,
            NodePhase::Created
        );
    }
}
