//! In-process cloud used by tests and local development. No real
//! instances; every operation succeeds unless a failure is scripted.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use pkg_types::address::{NetworkAddress, NetworkAddressType};
use pkg_types::node::Node;

use crate::image::{BootImageTags, Image, best_image};
use crate::selector::Sku;
use crate::{
    CloudAttributes, CloudClient, CloudError, CloudInstance, Result, StartNodeResult,
    SubnetAddressAffinity, SubnetAttributes,
};

/// One simulated instance.
#[derive(Debug, Clone)]
pub struct FakeInstance {
    pub id: String,
    pub node_name: String,
    pub instance_type: String,
    pub spot: bool,
    pub availability_zone: String,
    pub tags: HashMap<String, String>,
    pub sustained_cpu: Option<bool>,
    pub security_groups: Vec<String>,
    pub instance_profile: String,
}

/// Scriptable `CloudClient` covering the full capability surface.
pub struct FakeCloudClient {
    attrs: CloudAttributes,
    zones: Vec<String>,
    boot_security_groups: RwLock<Vec<String>>,
    images: RwLock<Vec<Image>>,
    pub instances: DashMap<String, FakeInstance>,
    next_id: AtomicU64,
    fail_next_start: Mutex<Option<CloudError>>,
}

impl FakeCloudClient {
    pub fn new() -> Self {
        Self {
            attrs: CloudAttributes {
                provider: "fake".to_string(),
                region: "us-east-1".to_string(),
                fixed_size_volume: false,
                max_instance_security_groups: 5,
            },
            zones: vec!["us-east-1a".to_string(), "us-east-1b".to_string()],
            boot_security_groups: RwLock::new(Vec::new()),
            images: RwLock::new(vec![Image {
                id: "img-default".to_string(),
                name: "elotl-itzo-1-20240101-010000".to_string(),
            }]),
            instances: DashMap::new(),
            next_id: AtomicU64::new(1),
            fail_next_start: Mutex::new(None),
        }
    }

    /// Replace the listed boot images.
    pub fn set_images(&self, images: Vec<Image>) {
        *self.images.write().unwrap() = images;
    }

    /// Make the next start call fail with the given error.
    pub fn fail_next_start(&self, err: CloudError) {
        *self.fail_next_start.lock().unwrap() = Some(err);
    }

    /// Drop an instance behind the controller's back, as if the cloud
    /// reclaimed it.
    pub fn lose_instance(&self, instance_id: &str) {
        self.instances.remove(instance_id);
    }

    fn start(&self, node: &Node, spot: bool) -> Result<StartNodeResult> {
        if let Some(err) = self.fail_next_start.lock().unwrap().take() {
            return Err(err);
        }
        let id = format!("i-{:08x}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let availability_zone = if node.spec.placement.availability_zone.is_empty() {
            self.zones[0].clone()
        } else {
            node.spec.placement.availability_zone.clone()
        };
        info!("[fake] start instance {} for node {}", id, node.name);
        self.instances.insert(
            id.clone(),
            FakeInstance {
                id: id.clone(),
                node_name: node.name.clone(),
                instance_type: node.spec.instance_type.clone(),
                spot,
                availability_zone: availability_zone.clone(),
                tags: HashMap::new(),
                sustained_cpu: None,
                security_groups: Vec::new(),
                instance_profile: String::new(),
            },
        );
        Ok(StartNodeResult {
            instance_id: id,
            availability_zone,
        })
    }
}

impl Default for FakeCloudClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudClient for FakeCloudClient {
    fn set_boot_security_group_ids(&self, ids: Vec<String>) {
        *self.boot_security_groups.write().unwrap() = ids;
    }

    fn get_boot_security_group_ids(&self) -> Vec<String> {
        self.boot_security_groups.read().unwrap().clone()
    }

    async fn start_node(&self, node: &Node, _cloud_init: &str) -> Result<StartNodeResult> {
        self.start(node, false)
    }

    async fn start_spot_node(&self, node: &Node, _cloud_init: &str) -> Result<StartNodeResult> {
        self.start(node, true)
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        info!("[fake] stop instance {}", instance_id);
        self.instances.remove(instance_id);
        Ok(())
    }

    async fn wait_for_running(&self, node: &Node) -> Result<Vec<NetworkAddress>> {
        let id = &node.status.instance_id;
        if !self.instances.contains_key(id) {
            return Err(CloudError::Transient(format!(
                "instance {} not running",
                id
            )));
        }
        let n = self.next_id.load(Ordering::Relaxed);
        Ok(vec![
            NetworkAddress::new(NetworkAddressType::PrivateIP, &format!("10.0.0.{}", n)),
            NetworkAddress::new(NetworkAddressType::PublicIP, &format!("54.0.0.{}", n)),
        ])
    }

    async fn ensure_security_groups(
        &self,
        _extra_cidrs: Vec<String>,
        _extra_ports: Vec<u16>,
    ) -> Result<()> {
        Ok(())
    }

    async fn attach_security_groups(&self, node: &Node, groups: Vec<String>) -> Result<()> {
        if let Some(mut inst) = self.instances.get_mut(&node.status.instance_id) {
            inst.security_groups = groups;
        }
        Ok(())
    }

    async fn assign_instance_profile(&self, node: &Node, profile: &str) -> Result<()> {
        if let Some(mut inst) = self.instances.get_mut(&node.status.instance_id) {
            inst.instance_profile = profile.to_string();
        }
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<CloudInstance>> {
        Ok(self
            .instances
            .iter()
            .map(|e| CloudInstance {
                id: e.id.clone(),
                node_name: e.node_name.clone(),
            })
            .collect())
    }

    async fn list_instances_filter_id(&self, ids: Vec<String>) -> Result<Vec<CloudInstance>> {
        Ok(self
            .instances
            .iter()
            .filter(|e| ids.contains(&e.id))
            .map(|e| CloudInstance {
                id: e.id.clone(),
                node_name: e.node_name.clone(),
            })
            .collect())
    }

    async fn resize_volume(&self, _node: &Node, _size_gib: u32) -> Result<()> {
        Ok(())
    }

    async fn get_registry_auth(&self) -> Result<(String, String)> {
        Ok(("AWS".to_string(), "fake-token".to_string()))
    }

    async fn get_image_id(&self, tags: &BootImageTags) -> Result<String> {
        let images = self.images.read().unwrap().clone();
        best_image(&images, tags).map_err(|e| CloudError::Permanent(e.to_string()))
    }

    async fn set_sustained_cpu(&self, node: &Node, enabled: bool) -> Result<()> {
        if let Some(mut inst) = self.instances.get_mut(&node.status.instance_id) {
            inst.sustained_cpu = Some(enabled);
        }
        Ok(())
    }

    async fn add_instance_tags(
        &self,
        instance_id: &str,
        tags: HashMap<String, String>,
    ) -> Result<()> {
        if let Some(mut inst) = self.instances.get_mut(instance_id) {
            inst.tags.extend(tags);
        }
        Ok(())
    }

    async fn modify_source_dest_check(&self, _instance_id: &str, _enabled: bool) -> Result<()> {
        Ok(())
    }

    async fn add_route(&self, _dest_cidr: &str, _instance_id: &str) -> Result<()> {
        Ok(())
    }

    async fn remove_route(&self, _dest_cidr: &str) -> Result<()> {
        Ok(())
    }

    fn get_vpc_cidrs(&self) -> Vec<String> {
        vec!["10.0.0.0/16".to_string()]
    }

    async fn get_subnets(&self) -> Result<Vec<SubnetAttributes>> {
        Ok(self
            .zones
            .iter()
            .enumerate()
            .map(|(i, az)| SubnetAttributes {
                name: format!("subnet-{}", az),
                id: format!("subnet-{:04x}", i),
                cidr: format!("10.0.{}.0/24", i),
                availability_zone: az.clone(),
                address_affinity: SubnetAddressAffinity::Any,
                available_addresses: 250,
            })
            .collect())
    }

    async fn get_availability_zones(&self) -> Result<Vec<String>> {
        Ok(self.zones.clone())
    }

    fn get_attributes(&self) -> CloudAttributes {
        self.attrs.clone()
    }
}

/// Small built-in catalog for the fake provider.
pub fn default_catalog() -> Vec<Sku> {
    vec![
        Sku {
            instance_type: "t3.micro".to_string(),
            price: 0.0104,
            cpu: 2.0,
            memory_gib: 1.0,
            gpus: 0,
            burstable: true,
            spot: true,
            availability_zones: vec![],
        },
        Sku {
            instance_type: "t3.small".to_string(),
            price: 0.0208,
            cpu: 2.0,
            memory_gib: 2.0,
            gpus: 0,
            burstable: true,
            spot: true,
            availability_zones: vec![],
        },
        Sku {
            instance_type: "c5.large".to_string(),
            price: 0.085,
            cpu: 2.0,
            memory_gib: 4.0,
            gpus: 0,
            burstable: false,
            spot: true,
            availability_zones: vec![],
        },
        Sku {
            instance_type: "m5.large".to_string(),
            price: 0.096,
            cpu: 2.0,
            memory_gib: 8.0,
            gpus: 0,
            burstable: false,
            spot: true,
            availability_zones: vec![],
        },
        Sku {
            instance_type: "p2.xlarge".to_string(),
            price: 0.90,
            cpu: 4.0,
            memory_gib: 61.0,
            gpus: 1,
            burstable: false,
            spot: false,
            availability_zones: vec![],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::node::NodeSpec;

    fn make_node(instance_type: &str) -> Node {
        Node::new(NodeSpec {
            instance_type: instance_type.to_string(),
            boot_image: "img-default".to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_start_list_stop_round_trip() {
        let cloud = FakeCloudClient::new();
        let node = make_node("t3.micro");
        let result = cloud.start_node(&node, "#cloud-config\n").await.unwrap();
        assert!(result.instance_id.starts_with("i-"));

        let listed = cloud.list_instances().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].node_name, node.name);

        cloud.stop_instance(&result.instance_id).await.unwrap();
        assert!(cloud.list_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scripted_start_failure() {
        let cloud = FakeCloudClient::new();
        cloud.fail_next_start(CloudError::Permanent("quota exceeded".to_string()));
        let err = cloud
            .start_node(&make_node("t3.micro"), "")
            .await
            .unwrap_err();
        assert!(err.is_permanent());
        // Next start works again
        assert!(cloud.start_node(&make_node("t3.micro"), "").await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_running_returns_addresses() {
        let cloud = FakeCloudClient::new();
        let mut node = make_node("t3.micro");
        let result = cloud.start_node(&node, "").await.unwrap();
        node.status.instance_id = result.instance_id;
        let addrs = cloud.wait_for_running(&node).await.unwrap();
        assert!(!addrs.is_empty());
    }
}
