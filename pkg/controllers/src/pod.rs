//! Pod lifecycle controller.
//!
//! Drives each pod from Waiting to Running: picks an instance type,
//! requests a node when none is available, claims through the binder,
//! dispatches volumes and units, and for running pods syncs unit statuses
//! from the cell agent to derive terminal phases. Terminal pods get their
//! node released for cleaning.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use pkg_constants::registry::{NODE_KEY_PREFIX, POD_KEY_PREFIX, node_key};
use pkg_nodeclient::NodeClientFactory;
use pkg_registry::{Registry, RegistryError};
use pkg_cloud::selector::InstanceSelector;
use pkg_types::node::{Node, NodePhase};
use pkg_types::pod::{Pod, PodPhase, RestartPolicy, UnitState, UnitStatus};

use crate::backoff::BackoffTracker;
use crate::binder::{BindError, Binder, pick_node};
use crate::dispatch::Dispatcher;
use crate::node::NodeController;
use crate::worker::KeyedWorkerPool;

pub struct PodControllerConfig {
    pub reconcile_interval: Duration,
    /// Instance type used when a pod specifies neither a type nor
    /// resources; empty means let selection pick the cheapest.
    pub default_instance_type: String,
    /// Dispatch failures tolerated before the pod goes Failed.
    pub start_failure_limit: i32,
}

impl Default for PodControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(5),
            default_instance_type: String::new(),
            start_failure_limit: 5,
        }
    }
}

pub struct PodController {
    registry: Registry,
    selector: InstanceSelector,
    binder: Binder,
    dispatcher: Arc<Dispatcher>,
    node_controller: Arc<NodeController>,
    factory: Arc<dyn NodeClientFactory>,
    config: PodControllerConfig,
    pool: KeyedWorkerPool,
    backoff: Mutex<BackoffTracker>,
}

impl PodController {
    pub fn new(
        registry: Registry,
        selector: InstanceSelector,
        binder: Binder,
        dispatcher: Arc<Dispatcher>,
        node_controller: Arc<NodeController>,
        factory: Arc<dyn NodeClientFactory>,
        config: PodControllerConfig,
    ) -> Self {
        Self {
            registry,
            selector,
            binder,
            dispatcher,
            node_controller,
            factory,
            config,
            pool: KeyedWorkerPool::new(8),
            backoff: Mutex::new(BackoffTracker::new()),
        }
    }

    pub fn start(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "PodController started (interval={:?})",
                self.config.reconcile_interval
            );
            let mut interval = tokio::time::interval(self.config.reconcile_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.clone().tick().await {
                            warn!("PodController reconcile error: {}", e);
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("PodController shutting down");
                        return;
                    }
                }
            }
        })
    }

    /// One reconciliation pass over the pod set.
    pub async fn tick(self: Arc<Self>) -> anyhow::Result<()> {
        let pods = self.registry.list::<Pod>(POD_KEY_PREFIX).await?;
        let nodes: Arc<Vec<Node>> = Arc::new(
            self.registry
                .list::<Node>(NODE_KEY_PREFIX)
                .await?
                .into_iter()
                .map(|(_, n, _)| n)
                .collect(),
        );

        let mut tasks = JoinSet::new();
        for (key, pod, version) in pods {
            let this = self.clone();
            let nodes = nodes.clone();
            let uid = pod.uid.clone();
            tasks.spawn(async move {
                this.pool
                    .clone()
                    .run(&uid, || async {
                        if let Err(e) = this.handle_pod(&key, pod, version, &nodes).await {
                            warn!("Pod reconcile error on {}: {}", key, e);
                        }
                    })
                    .await;
            });
        }
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    async fn handle_pod(
        &self,
        key: &str,
        pod: Pod,
        version: u64,
        nodes: &[Node],
    ) -> anyhow::Result<()> {
        match pod.status.phase {
            PodPhase::Waiting => self.handle_waiting(key, pod, version, nodes).await,
            PodPhase::Dispatching => self.handle_dispatching(key, pod, version).await,
            PodPhase::Running => self.handle_running(key, pod, version).await,
            _ => self.handle_terminal(pod).await,
        }
    }

    async fn handle_waiting(
        &self,
        key: &str,
        mut pod: Pod,
        version: u64,
        nodes: &[Node],
    ) -> anyhow::Result<()> {
        let instance_type = if pod.spec.instance_type.is_empty()
            && pod.spec.resources == Default::default()
        {
            self.config.default_instance_type.clone()
        } else {
            pod.spec.instance_type.clone()
        };
        let ranked = match self.selector.resolve(
            &instance_type,
            &pod.spec.resources,
            pod.spec.spot.policy,
            &pod.spec.placement,
        ) {
            Ok(ranked) => ranked,
            Err(e) => {
                // No SKU can ever satisfy this spec; no node is created
                warn!("Pod {} is unschedulable: {}", pod.full_name(), e);
                pod.status.reason = e.to_string();
                pod.set_phase(PodPhase::Failed);
                self.update(key, version, &pod).await;
                return Ok(());
            }
        };

        if let Some(node) = pick_node(&pod, &ranked, nodes) {
            match self
                .binder
                .claim(&pod.namespace, &pod.name, &node.name)
                .await
            {
                Ok(()) => return Ok(()),
                Err(BindError::ClaimConflict(msg)) => {
                    debug!("Claim for {} lost the race: {}", pod.full_name(), msg);
                    return Ok(());
                }
                Err(BindError::Registry(e)) => return Err(e.into()),
            }
        }

        // No claimable node; make sure one is on the way
        let pending = nodes.iter().any(|n| {
            n.spec.nametag == pod.full_name()
                && matches!(
                    n.status.phase,
                    NodePhase::Creating | NodePhase::Created | NodePhase::Available
                )
        });
        if !pending {
            if !self.backoff.lock().unwrap().ready(&pod.uid, Instant::now()) {
                return Ok(());
            }
            if let Err(e) = self.node_controller.request_node(&pod, &ranked[0]).await {
                warn!("Could not request node for {}: {}", pod.full_name(), e);
                self.backoff
                    .lock()
                    .unwrap()
                    .failure(&pod.uid, Instant::now());
            }
        }
        Ok(())
    }

    async fn handle_dispatching(
        &self,
        key: &str,
        mut pod: Pod,
        version: u64,
    ) -> anyhow::Result<()> {
        let node = match self.bound_node(&pod).await? {
            Some(node) => node,
            None => {
                self.requeue(key, &mut pod, version, "bound node is gone")
                    .await;
                return Ok(());
            }
        };
        if !self.backoff.lock().unwrap().ready(&pod.uid, Instant::now()) {
            return Ok(());
        }

        match self.dispatcher.dispatch(&pod, &node).await {
            Ok(()) => {
                pod.set_phase(PodPhase::Running);
                self.update(key, version, &pod).await;
                self.backoff.lock().unwrap().clear(&pod.uid);
            }
            Err(e) if e.is_permanent() => {
                warn!("Dispatch of {} failed permanently: {}", pod.full_name(), e);
                pod.status.start_failures += 1;
                pod.status.reason = format!("VolumeMissing: {}", e);
                pod.set_phase(PodPhase::Failed);
                self.update(key, version, &pod).await;
                if let Err(e) = self
                    .binder
                    .release(&pod.namespace, &pod.name, &node.name)
                    .await
                {
                    warn!("Could not release node {}: {}", node.name, e);
                }
            }
            Err(e) => {
                pod.status.start_failures += 1;
                if pod.status.start_failures >= self.config.start_failure_limit {
                    warn!(
                        "Dispatch of {} kept failing ({}), giving up",
                        pod.full_name(),
                        e
                    );
                    pod.status.reason = format!("DispatchTimeout: {}", e);
                    pod.set_phase(PodPhase::Failed);
                    self.update(key, version, &pod).await;
                    if let Err(e) = self
                        .binder
                        .release(&pod.namespace, &pod.name, &node.name)
                        .await
                    {
                        warn!("Could not release node {}: {}", node.name, e);
                    }
                } else {
                    // Stay in Dispatching; the deploys are idempotent
                    let delay = self
                        .backoff
                        .lock()
                        .unwrap()
                        .failure(&pod.uid, Instant::now());
                    warn!(
                        "Dispatch of {} failed: {} (retry in {:?})",
                        pod.full_name(),
                        e,
                        delay
                    );
                    self.update(key, version, &pod).await;
                }
            }
        }
        Ok(())
    }

    async fn handle_running(&self, key: &str, mut pod: Pod, version: u64) -> anyhow::Result<()> {
        let node = match self.bound_node(&pod).await? {
            Some(node) => node,
            None => {
                self.requeue(key, &mut pod, version, "bound node is gone")
                    .await;
                return Ok(());
            }
        };
        let client = match self.factory.client(&node.status.addresses) {
            Ok(client) => client,
            Err(e) => {
                warn!("No agent client for {}: {}", pod.full_name(), e);
                return Ok(());
            }
        };
        let reply = match client.status(&pod.name).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!("Status sync for {} failed: {}", pod.full_name(), e);
                return Ok(());
            }
        };
        pod.status.unit_statuses = reply.unit_statuses;
        pod.status.init_unit_statuses = reply.init_unit_statuses;
        if let Some(phase) =
            unit_verdict(&pod.status.unit_statuses, pod.spec.restart_policy)
        {
            info!("Pod {} finished: {}", pod.full_name(), phase);
            pod.set_phase(phase);
        }
        self.update(key, version, &pod).await;
        Ok(())
    }

    /// A pod that reached a terminal phase releases its node for cleaning.
    async fn handle_terminal(&self, pod: Pod) -> anyhow::Result<()> {
        if pod.status.bound_node_name.is_empty() {
            return Ok(());
        }
        match self
            .binder
            .release(&pod.namespace, &pod.name, &pod.status.bound_node_name)
            .await
        {
            Ok(()) => {}
            Err(BindError::Registry(RegistryError::NotFound(_))) => {
                // Node record already gone; clear the dangling reference
                if let Err(e) = self.binder.clear_pod_binding(&pod.namespace, &pod.name).await {
                    warn!("Could not clear binding of {}: {}", pod.full_name(), e);
                }
            }
            Err(e) => warn!(
                "Could not release node {} of terminal pod {}: {}",
                pod.status.bound_node_name,
                pod.full_name(),
                e
            ),
        }
        Ok(())
    }

    async fn bound_node(&self, pod: &Pod) -> anyhow::Result<Option<Node>> {
        if pod.status.bound_node_name.is_empty() {
            return Ok(None);
        }
        match self
            .registry
            .get::<Node>(&node_key(&pod.status.bound_node_name))
            .await
        {
            Ok((node, _)) => {
                let usable = node.status.bound_pod_name == pod.name
                    && matches!(
                        node.status.phase,
                        NodePhase::Claimed | NodePhase::Available
                    );
                Ok(usable.then_some(node))
            }
            Err(RegistryError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Invariant violation (§ pod bound to a vanished or terminal node):
    /// log, unbind, and send the pod back to Waiting.
    async fn requeue(&self, key: &str, pod: &mut Pod, version: u64, why: &str) {
        warn!("Re-queueing pod {}: {}", pod.full_name(), why);
        pod.status.bound_node_name = String::new();
        pod.status.bound_instance_id = String::new();
        pod.status.addresses.clear();
        pod.status.start_failures += 1;
        pod.status.phase = PodPhase::Waiting;
        pod.status.last_phase_change = Some(chrono::Utc::now());
        self.update(key, version, pod).await;
    }

    async fn update(&self, key: &str, version: u64, pod: &Pod) {
        match self.registry.update(key, version, pod).await {
            Ok(_) => {}
            Err(RegistryError::VersionConflict(_)) => {
                debug!("Pod {} changed concurrently, skipping write", key);
            }
            Err(e) => warn!("Error writing pod {}: {}", key, e),
        }
    }
}

/// Terminal phase implied by the unit statuses, if any.
fn unit_verdict(units: &[UnitStatus], policy: RestartPolicy) -> Option<PodPhase> {
    if units.is_empty() {
        return None;
    }
    let mut all_succeeded = true;
    let mut any_failed = false;
    for unit in units {
        match &unit.state {
            UnitState::Terminated(t) => {
                if t.exit_code != 0 {
                    all_succeeded = false;
                    any_failed = true;
                }
            }
            _ => return None,
        }
    }
    match policy {
        // Units are restarted forever; the pod never finishes on its own
        RestartPolicy::Always => None,
        RestartPolicy::OnFailure => {
            if all_succeeded {
                Some(PodPhase::Succeeded)
            } else {
                // Failed units restart until they succeed
                None
            }
        }
        RestartPolicy::Never => {
            if any_failed {
                Some(PodPhase::Failed)
            } else {
                Some(PodPhase::Succeeded)
            }
        }
    }
}
