use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::NetworkAddress;
use crate::pod::PlacementSpec;
use crate::resource::ResourceSpec;

/// Last observed phase of a node. The phase is monotonic along the happy
/// path; any non-terminal state may jump to Cleaning or Terminating on
/// failure or explicit terminate.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodePhase {
    /// The cloud instance is being booted.
    #[default]
    Creating,
    /// The instance is running and has addresses.
    Created,
    /// The cell agent answered a health probe; ready for a pod.
    Available,
    /// Bound to a pod.
    Claimed,
    /// Pod data is being wiped off the instance.
    Cleaning,
    /// The instance is being stopped.
    Terminating,
    /// Gone. Absorbing.
    Terminated,
}

impl NodePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodePhase::Terminated)
    }
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodePhase::Creating => "Creating",
            NodePhase::Created => "Created",
            NodePhase::Available => "Available",
            NodePhase::Claimed => "Claimed",
            NodePhase::Cleaning => "Cleaning",
            NodePhase::Terminating => "Terminating",
            NodePhase::Terminated => "Terminated",
        };
        write!(f, "{}", s)
    }
}

/// Desired behavior of a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Cloud instance type backing this node.
    pub instance_type: String,
    /// Cloud image the instance boots from.
    pub boot_image: String,
    /// Set when the node has been asked to terminate.
    #[serde(default)]
    pub terminate: bool,
    /// This is a spot instance.
    #[serde(default)]
    pub spot: bool,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub placement: PlacementSpec,
    /// Namespaced name of the pod this node was booted for. Written onto
    /// the instance tags and used to surface boot failures on that pod.
    #[serde(default)]
    pub nametag: String,
}

/// Last observed status of a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub phase: NodePhase,
    /// Cloud instance id. Assigned before the node leaves Creating.
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub addresses: Vec<NetworkAddress>,
    /// Name of the pod bound to this node. Non-empty iff phase is Claimed.
    #[serde(default)]
    pub bound_pod_name: String,
}

/// A node is a cloud instance that can run one pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    pub spec: NodeSpec,
    #[serde(default)]
    pub status: NodeStatus,
}

impl Node {
    /// Build a new node record in Creating phase.
    pub fn new(spec: NodeSpec) -> Self {
        let uid = Uuid::new_v4().to_string();
        Self {
            name: format!("node-{}", &uid[..8]),
            uid,
            created_at: Some(Utc::now()),
            spec,
            status: NodeStatus::default(),
        }
    }

    /// Record a phase transition. Terminated is absorbing.
    pub fn set_phase(&mut self, phase: NodePhase) {
        if self.status.phase.is_terminal() {
            return;
        }
        self.status.phase = phase;
    }

    pub fn is_claimed(&self) -> bool {
        !self.status.bound_pod_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminated_is_absorbing() {
        let mut node = Node::new(NodeSpec::default());
        node.set_phase(NodePhase::Terminated);
        node.set_phase(NodePhase::Available);
        assert_eq!(node.status.phase, NodePhase::Terminated);
    }

    #[test]
    fn test_new_node_starts_creating() {
        let node = Node::new(NodeSpec::default());
        assert_eq!(node.status.phase, NodePhase::Creating);
        assert!(node.name.starts_with("node-"));
        assert!(!node.uid.is_empty());
    }
}
