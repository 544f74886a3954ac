//! HTTP client for the cell agent (itzo) running inside each instance.
//!
//! The agent exposes a small REST API on every cell:
//! - `POST /deploy/{podName}/{volumeName}` — gzip-tar package body;
//!   successive deploys for the same (pod, volume) overwrite atomically
//! - `POST /launch/{podName}` — serialized pod spec
//! - `GET /status/{podName}` — unit statuses
//! - `GET /healthz` — liveness probe used before a node goes Available

pub mod fake;

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use pkg_constants::cloud::CELL_AGENT_PORT;
use pkg_types::address::{NetworkAddress, dispatch_address};
use pkg_types::pod::{PodSpec, UnitStatus};

#[derive(Debug, Error)]
pub enum NodeClientError {
    #[error("cell agent unreachable: {0}")]
    Unreachable(String),
    #[error("cell agent returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("no usable address for cell agent")]
    NoAddress,
    #[error("bad response: {0}")]
    BadResponse(String),
}

pub type Result<T> = std::result::Result<T, NodeClientError>;

/// Unit statuses as reported by `GET /status/{podName}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodStatusReply {
    #[serde(default)]
    pub unit_statuses: Vec<UnitStatus>,
    #[serde(default)]
    pub init_unit_statuses: Vec<UnitStatus>,
}

/// Operations the controller performs against one cell agent.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Upload a deploy package. Overwrites any previous package for the
    /// same (pod, volume) pair.
    async fn deploy(&self, pod_name: &str, volume_name: &str, package: Vec<u8>) -> Result<()>;

    /// Start the pod's units on the cell.
    async fn launch(&self, pod_name: &str, spec: &PodSpec) -> Result<()>;

    /// Fetch unit statuses for a launched pod.
    async fn status(&self, pod_name: &str) -> Result<PodStatusReply>;

    /// Liveness probe.
    async fn health(&self) -> Result<()>;
}

/// Hands out a `NodeClient` for a node's addresses. Controllers depend on
/// this trait so tests can substitute an in-memory agent.
pub trait NodeClientFactory: Send + Sync {
    fn client(&self, addresses: &[NetworkAddress]) -> Result<Arc<dyn NodeClient>>;
}

/// reqwest-backed `NodeClient`.
pub struct HttpNodeClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpNodeClient {
    pub fn new(client: reqwest::Client, address: &str) -> Self {
        Self {
            client,
            base_url: format!("http://{}:{}", address, CELL_AGENT_PORT),
        }
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(NodeClientError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn deploy(&self, pod_name: &str, volume_name: &str, package: Vec<u8>) -> Result<()> {
        let url = format!("{}/deploy/{}/{}", self.base_url, pod_name, volume_name);
        debug!("Deploying {} bytes to {}", package.len(), url);
        let response = self
            .client
            .post(&url)
            .body(package)
            .send()
            .await
            .map_err(|e| NodeClientError::Unreachable(e.to_string()))?;
        self.check(response).await?;
        Ok(())
    }

    async fn launch(&self, pod_name: &str, spec: &PodSpec) -> Result<()> {
        let url = format!("{}/launch/{}", self.base_url, pod_name);
        debug!("Launching pod {} via {}", pod_name, url);
        let response = self
            .client
            .post(&url)
            .json(spec)
            .send()
            .await
            .map_err(|e| NodeClientError::Unreachable(e.to_string()))?;
        self.check(response).await?;
        Ok(())
    }

    async fn status(&self, pod_name: &str) -> Result<PodStatusReply> {
        let url = format!("{}/status/{}", self.base_url, pod_name);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| NodeClientError::Unreachable(e.to_string()))?;
        let response = self.check(response).await?;
        response
            .json()
            .await
            .map_err(|e| NodeClientError::BadResponse(e.to_string()))
    }

    async fn health(&self) -> Result<()> {
        let url = format!("{}/healthz", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| NodeClientError::Unreachable(e.to_string()))?;
        self.check(response).await?;
        Ok(())
    }
}

/// Factory producing `HttpNodeClient`s over a shared connection pool.
pub struct HttpNodeClientFactory {
    client: reqwest::Client,
}

impl HttpNodeClientFactory {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl NodeClientFactory for HttpNodeClientFactory {
    fn client(&self, addresses: &[NetworkAddress]) -> Result<Arc<dyn NodeClient>> {
        let address = dispatch_address(addresses).ok_or(NodeClientError::NoAddress)?;
        Ok(Arc::new(HttpNodeClient::new(
            self.client.clone(),
            address,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::address::NetworkAddressType;

    #[test]
    fn test_factory_requires_an_address() {
        let factory = HttpNodeClientFactory::new(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            factory.client(&[]),
            Err(NodeClientError::NoAddress)
        ));
        let addrs = vec![NetworkAddress::new(NetworkAddressType::PrivateIP, "10.0.0.1")];
        assert!(factory.client(&addrs).is_ok());
    }

    #[test]
    fn test_base_url_uses_agent_port() {
        let client = HttpNodeClient::new(reqwest::Client::new(), "10.0.0.1");
        assert_eq!(client.base_url, "http://10.0.0.1:6421");
    }
}
