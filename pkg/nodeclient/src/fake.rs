//! In-memory cell agent used by controller tests. Records every deploy
//! and launch; failures are scripted per call.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use pkg_types::address::NetworkAddress;
use pkg_types::pod::PodSpec;

use crate::{NodeClient, NodeClientError, NodeClientFactory, PodStatusReply, Result};

#[derive(Default)]
pub struct FakeNodeClient {
    /// (pod, volume) -> last deployed package bytes.
    pub deploys: DashMap<(String, String), Vec<u8>>,
    /// Pod names launched, in order.
    pub launches: Mutex<Vec<String>>,
    /// Scripted reply for `status` calls, keyed by pod name.
    pub status_replies: DashMap<String, PodStatusReply>,
    healthy: AtomicBool,
    fail_next_deploy: Mutex<Option<NodeClientError>>,
    fail_next_launch: Mutex<Option<NodeClientError>>,
}

impl FakeNodeClient {
    pub fn new() -> Self {
        let client = Self::default();
        client.healthy.store(true, Ordering::Relaxed);
        client
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn fail_next_deploy(&self, err: NodeClientError) {
        *self.fail_next_deploy.lock().unwrap() = Some(err);
    }

    pub fn fail_next_launch(&self, err: NodeClientError) {
        *self.fail_next_launch.lock().unwrap() = Some(err);
    }

    pub fn launched(&self, pod_name: &str) -> bool {
        self.launches.lock().unwrap().iter().any(|p| p == pod_name)
    }

    pub fn package(&self, pod_name: &str, volume_name: &str) -> Option<Vec<u8>> {
        self.deploys
            .get(&(pod_name.to_string(), volume_name.to_string()))
            .map(|e| e.value().clone())
    }
}

#[async_trait]
impl NodeClient for FakeNodeClient {
    async fn deploy(&self, pod_name: &str, volume_name: &str, package: Vec<u8>) -> Result<()> {
        if let Some(err) = self.fail_next_deploy.lock().unwrap().take() {
            return Err(err);
        }
        self.deploys
            .insert((pod_name.to_string(), volume_name.to_string()), package);
        Ok(())
    }

    async fn launch(&self, pod_name: &str, _spec: &PodSpec) -> Result<()> {
        if let Some(err) = self.fail_next_launch.lock().unwrap().take() {
            return Err(err);
        }
        self.launches.lock().unwrap().push(pod_name.to_string());
        Ok(())
    }

    async fn status(&self, pod_name: &str) -> Result<PodStatusReply> {
        self.status_replies
            .get(pod_name)
            .map(|e| e.value().clone())
            .ok_or_else(|| NodeClientError::Status {
                status: 404,
                body: format!("pod {} not found", pod_name),
            })
    }

    async fn health(&self) -> Result<()> {
        if self.healthy.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(NodeClientError::Unreachable("agent not ready".to_string()))
        }
    }
}

/// Factory handing out one shared fake agent regardless of address.
#[derive(Clone)]
pub struct FakeNodeClientFactory {
    pub agent: Arc<FakeNodeClient>,
}

impl FakeNodeClientFactory {
    pub fn new() -> Self {
        Self {
            agent: Arc::new(FakeNodeClient::new()),
        }
    }
}

impl Default for FakeNodeClientFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeClientFactory for FakeNodeClientFactory {
    fn client(&self, addresses: &[NetworkAddress]) -> Result<Arc<dyn NodeClient>> {
        if addresses.is_empty() {
            return Err(NodeClientError::NoAddress);
        }
        Ok(self.agent.clone())
    }
}
