//! Atomic pod/node binding.
//!
//! A claim updates both records or neither: the pod moves to Dispatching
//! with its bound node recorded, the node moves to Claimed with its bound
//! pod recorded, committed together through the registry's two-key
//! compare-and-swap. Concurrent claims on the same node race on the
//! version check; exactly one wins.

use thiserror::Error;
use tracing::{info, warn};

use pkg_constants::registry::{node_key, pod_key};
use pkg_registry::{Registry, RegistryError};
use pkg_types::node::{Node, NodePhase};
use pkg_types::pod::{Pod, PodPhase, SpotPolicy};

#[derive(Debug, Error)]
pub enum BindError {
    /// Lost the race or the pair was no longer claimable. Retried by the
    /// caller with fresh reads; never surfaced to users.
    #[error("claim conflict: {0}")]
    ClaimConflict(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

const MAX_CLAIM_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct Binder {
    registry: Registry,
}

impl Binder {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Claim `node_name` for the pod. On success the pod is Dispatching
    /// and the node Claimed.
    pub async fn claim(
        &self,
        namespace: &str,
        pod_name: &str,
        node_name: &str,
    ) -> Result<(), BindError> {
        let pod_key = pod_key(namespace, pod_name);
        let node_key = node_key(node_name);
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let (mut pod, pod_version) = self.registry.get::<Pod>(&pod_key).await?;
            let (mut node, node_version) = self.registry.get::<Node>(&node_key).await?;

            if pod.status.phase != PodPhase::Waiting || !pod.status.bound_node_name.is_empty() {
                return Err(BindError::ClaimConflict(format!(
                    "pod {} is not claimable (phase {})",
                    pod.full_name(),
                    pod.status.phase
                )));
            }
            if node.status.phase != NodePhase::Available || node.is_claimed() {
                return Err(BindError::ClaimConflict(format!(
                    "node {} is not claimable (phase {})",
                    node.name, node.status.phase
                )));
            }

            pod.status.bound_node_name = node.name.clone();
            pod.status.bound_instance_id = node.status.instance_id.clone();
            pod.status.addresses = node.status.addresses.clone();
            pod.set_phase(PodPhase::Dispatching);
            node.status.bound_pod_name = pod.name.clone();
            node.set_phase(NodePhase::Claimed);

            match self
                .registry
                .update_pair(
                    (pod_key.as_str(), pod_version, &pod),
                    (node_key.as_str(), node_version, &node),
                )
                .await
            {
                Ok(_) => {
                    info!("Claimed node {} for pod {}", node_name, pod.full_name());
                    return Ok(());
                }
                Err(RegistryError::VersionConflict(key)) => {
                    warn!("Claim of {} raced on {}, retrying", node_name, key);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(BindError::ClaimConflict(format!(
            "claim of {} kept racing",
            node_name
        )))
    }

    /// Undo a claim: the node is unbound and moves to Cleaning, the pod's
    /// binding fields are cleared. The pod's phase is left alone; callers
    /// set terminal phases before releasing.
    pub async fn release(
        &self,
        namespace: &str,
        pod_name: &str,
        node_name: &str,
    ) -> Result<(), BindError> {
        let pod_key = pod_key(namespace, pod_name);
        let node_key = node_key(node_name);
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let (mut pod, pod_version) = self.registry.get::<Pod>(&pod_key).await?;
            let (mut node, node_version) = self.registry.get::<Node>(&node_key).await?;

            pod.status.bound_node_name = String::new();
            pod.status.bound_instance_id = String::new();
            node.status.bound_pod_name = String::new();
            node.set_phase(NodePhase::Cleaning);

            match self
                .registry
                .update_pair(
                    (pod_key.as_str(), pod_version, &pod),
                    (node_key.as_str(), node_version, &node),
                )
                .await
            {
                Ok(_) => {
                    info!("Released node {} from pod {}", node_name, pod.full_name());
                    return Ok(());
                }
                Err(RegistryError::VersionConflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(BindError::ClaimConflict(format!(
            "release of {} kept racing",
            node_name
        )))
    }

    /// Clear a pod's binding fields when its node record no longer exists.
    pub async fn clear_pod_binding(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> Result<(), BindError> {
        let pod_key = pod_key(namespace, pod_name);
        let (mut pod, version) = self.registry.get::<Pod>(&pod_key).await?;
        pod.status.bound_node_name = String::new();
        pod.status.bound_instance_id = String::new();
        self.registry.update(&pod_key, version, &pod).await?;
        Ok(())
    }

    /// Unbind a node whose pod record no longer exists. The node moves to
    /// Cleaning.
    pub async fn force_unbind_node(&self, node_name: &str) -> Result<(), BindError> {
        let node_key = node_key(node_name);
        let (mut node, version) = self.registry.get::<Node>(&node_key).await?;
        node.status.bound_pod_name = String::new();
        node.set_phase(NodePhase::Cleaning);
        self.registry.update(&node_key, version, &node).await?;
        Ok(())
    }
}

/// Pairing policy: among Available nodes satisfying the pod, prefer one
/// in the pod's requested AZ, then the one backed by the cheapest
/// acceptable instance type (smallest over-allocation).
pub fn pick_node<'a>(pod: &Pod, ranked_types: &[String], nodes: &'a [Node]) -> Option<&'a Node> {
    let want_spot = pod.spec.spot.policy == SpotPolicy::Always;
    let want_az = &pod.spec.placement.availability_zone;

    let mut candidates: Vec<(&Node, usize, bool)> = nodes
        .iter()
        .filter(|n| {
            n.status.phase == NodePhase::Available
                && !n.is_claimed()
                && !n.spec.terminate
                && n.spec.spot == want_spot
        })
        .filter_map(|n| {
            let rank = ranked_types
                .iter()
                .position(|t| *t == n.spec.instance_type)?;
            let az_match =
                want_az.is_empty() || n.spec.placement.availability_zone == *want_az;
            Some((n, rank, az_match))
        })
        .collect();

    candidates.sort_by_key(|(_, rank, az_match)| (!az_match, *rank));
    candidates.first().map(|(n, _, _)| *n)
}
