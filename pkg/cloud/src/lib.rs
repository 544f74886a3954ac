//! Cloud provider abstraction.
//!
//! `CloudClient` is the capability surface the controllers program
//! against; concrete SDK adapters (AWS/GCE/Azure) live outside this repo.
//! A scriptable in-process implementation ships in [`fake`] for tests and
//! local development.

pub mod cloudinit;
pub mod fake;
pub mod image;
pub mod selector;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use pkg_types::address::NetworkAddress;
use pkg_types::node::Node;

use crate::image::BootImageTags;

/// Cloud call failure, split by whether a retry can help.
#[derive(Debug, Clone, Error)]
pub enum CloudError {
    /// Throttling, timeouts, eventual consistency. Retried with backoff.
    #[error("transient cloud error: {0}")]
    Transient(String),
    /// Quota exceeded, invalid instance type, unauthorized. Surfaced on
    /// the owning pod.
    #[error("permanent cloud error: {0}")]
    Permanent(String),
}

impl CloudError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, CloudError::Permanent(_))
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;

/// Per-provider facts consulted during instance selection and placement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudAttributes {
    pub provider: String,
    pub region: String,
    /// Root volumes cannot be resized on this provider.
    pub fixed_size_volume: bool,
    pub max_instance_security_groups: usize,
}

/// Where a subnet hands out addresses by default.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubnetAddressAffinity {
    Public,
    Private,
    #[default]
    Any,
}

/// Cached facts about one subnet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetAttributes {
    pub name: String,
    pub id: String,
    pub cidr: String,
    pub availability_zone: String,
    pub address_affinity: SubnetAddressAffinity,
    pub available_addresses: i64,
}

/// Result of booting an instance.
#[derive(Debug, Clone)]
pub struct StartNodeResult {
    pub instance_id: String,
    pub availability_zone: String,
}

/// One instance as seen by the cloud lister.
#[derive(Debug, Clone)]
pub struct CloudInstance {
    pub id: String,
    pub node_name: String,
}

/// Capability surface of a cloud provider. Implementations are
/// thread-safe and stateless except for the cached boot security group
/// list. Every operation must be idempotent; retries are automatic.
#[async_trait]
pub trait CloudClient: Send + Sync {
    fn set_boot_security_group_ids(&self, ids: Vec<String>);
    fn get_boot_security_group_ids(&self) -> Vec<String>;

    /// Boot an on-demand instance for the node. `cloud_init` is the
    /// rendered user data.
    async fn start_node(&self, node: &Node, cloud_init: &str) -> Result<StartNodeResult>;

    /// Boot a spot instance for the node.
    async fn start_spot_node(&self, node: &Node, cloud_init: &str) -> Result<StartNodeResult>;

    /// Stop an instance. Can take minutes; always called from a detached
    /// task.
    async fn stop_instance(&self, instance_id: &str) -> Result<()>;

    /// Poll until the instance reports addresses or the provider deadline
    /// expires.
    async fn wait_for_running(&self, node: &Node) -> Result<Vec<NetworkAddress>>;

    async fn ensure_security_groups(
        &self,
        extra_cidrs: Vec<String>,
        extra_ports: Vec<u16>,
    ) -> Result<()>;
    async fn attach_security_groups(&self, node: &Node, groups: Vec<String>) -> Result<()>;
    async fn assign_instance_profile(&self, node: &Node, profile: &str) -> Result<()>;

    async fn list_instances(&self) -> Result<Vec<CloudInstance>>;
    async fn list_instances_filter_id(&self, ids: Vec<String>) -> Result<Vec<CloudInstance>>;

    async fn resize_volume(&self, node: &Node, size_gib: u32) -> Result<()>;
    async fn get_registry_auth(&self) -> Result<(String, String)>;

    /// Resolve the newest boot image matching the tag filter.
    async fn get_image_id(&self, tags: &BootImageTags) -> Result<String>;

    async fn set_sustained_cpu(&self, node: &Node, enabled: bool) -> Result<()>;
    async fn add_instance_tags(
        &self,
        instance_id: &str,
        tags: HashMap<String, String>,
    ) -> Result<()>;

    async fn modify_source_dest_check(&self, instance_id: &str, enabled: bool) -> Result<()>;
    async fn add_route(&self, dest_cidr: &str, instance_id: &str) -> Result<()>;
    async fn remove_route(&self, dest_cidr: &str) -> Result<()>;

    fn get_vpc_cidrs(&self) -> Vec<String>;
    async fn get_subnets(&self) -> Result<Vec<SubnetAttributes>>;
    async fn get_availability_zones(&self) -> Result<Vec<String>>;
    fn get_attributes(&self) -> CloudAttributes;
}
