//! Pod dispatch: materialize volumes on the cell agent and start units.
//!
//! Dispatch is idempotent. Successive deploys for the same (pod, volume)
//! overwrite atomically on the agent side, so a retry after a partial
//! failure re-uploads everything and launches again.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use pkg_constants::volumes::{
    KUBECONFIG_PACKAGE_PATH, KUBECONFIG_VOLUME_NAME, RESOLVCONF_PACKAGE_PATH,
    RESOLVCONF_VOLUME_NAME,
};
use pkg_nodeclient::{NodeClientError, NodeClientFactory};
use pkg_registry::ResourceManager;
use pkg_types::configmap::ConfigMap;
use pkg_types::node::{Node, NodePhase};
use pkg_types::pod::{DnsConfigOption, DnsPolicy, Pod};
use pkg_types::secret::Secret;
use pkg_types::volume::VolumeSource;

use crate::package::{
    self, DnsConfig, PackageError, PackageFile, configmap_files, make_deploy_package, secret_files,
};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("node {node} is not claimed for pod {pod}")]
    NotClaimed { node: String, pod: String },
    #[error("{kind} {namespace}/{name} referenced by volume {volume} does not exist")]
    VolumeMissing {
        kind: &'static str,
        namespace: String,
        name: String,
        volume: String,
    },
    #[error(transparent)]
    Package(#[from] PackageError),
    #[error("cell agent: {0}")]
    Agent(#[from] NodeClientError),
}

impl DispatchError {
    /// Permanent failures move the pod to Failed; transient ones leave it
    /// in Dispatching for retry.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DispatchError::VolumeMissing { .. } | DispatchError::Package(_)
        )
    }
}

/// Cluster-level DNS handed to pods with a ClusterFirst policy.
#[derive(Debug, Clone, Default)]
pub struct ClusterDns {
    pub servers: Vec<String>,
    pub searches: Vec<String>,
}

pub struct Dispatcher {
    resources: ResourceManager,
    factory: Arc<dyn NodeClientFactory>,
    cluster_dns: Option<ClusterDns>,
    /// Serialized kubeconfig deployed to every cell for the network agent.
    network_agent_kubeconfig: Option<Vec<u8>>,
}

impl Dispatcher {
    pub fn new(
        resources: ResourceManager,
        factory: Arc<dyn NodeClientFactory>,
        cluster_dns: Option<ClusterDns>,
        network_agent_kubeconfig: Option<Vec<u8>>,
    ) -> Self {
        Self {
            resources,
            factory,
            cluster_dns,
            network_agent_kubeconfig,
        }
    }

    /// Push the pod's volumes and launch its units on the claimed node.
    pub async fn dispatch(&self, pod: &Pod, node: &Node) -> Result<(), DispatchError> {
        if node.status.phase != NodePhase::Claimed
            || node.status.bound_pod_name != pod.name
            || node.status.addresses.is_empty()
        {
            return Err(DispatchError::NotClaimed {
                node: node.name.clone(),
                pod: pod.full_name(),
            });
        }
        let client = self.factory.client(&node.status.addresses)?;

        for vol in &pod.spec.volumes {
            let files = match &vol.source {
                VolumeSource::ConfigMap(cm_vol) => {
                    let optional = cm_vol.optional.unwrap_or(false);
                    let cm = match self.resources.get_configmap(&pod.namespace, &cm_vol.name) {
                        Some(cm) => cm,
                        None if optional => ConfigMap {
                            name: cm_vol.name.clone(),
                            namespace: pod.namespace.clone(),
                            ..Default::default()
                        },
                        None => {
                            return Err(DispatchError::VolumeMissing {
                                kind: "configmap",
                                namespace: pod.namespace.clone(),
                                name: cm_vol.name.clone(),
                                volume: vol.name.clone(),
                            });
                        }
                    };
                    configmap_files(cm_vol, &cm)?
                }
                VolumeSource::Secret(sec_vol) => {
                    let optional = sec_vol.optional.unwrap_or(false);
                    let secret = match self
                        .resources
                        .get_secret(&pod.namespace, &sec_vol.secret_name)
                    {
                        Some(secret) => secret,
                        None if optional => Secret {
                            name: sec_vol.secret_name.clone(),
                            namespace: pod.namespace.clone(),
                            ..Default::default()
                        },
                        None => {
                            return Err(DispatchError::VolumeMissing {
                                kind: "secret",
                                namespace: pod.namespace.clone(),
                                name: sec_vol.secret_name.clone(),
                                volume: vol.name.clone(),
                            });
                        }
                    };
                    secret_files(sec_vol, &secret)?
                }
                // Everything else is materialized by the agent itself.
                _ => continue,
            };
            let payload = make_deploy_package(&files)?;
            debug!(
                "Deploying volume {} for pod {} ({} bytes)",
                vol.name,
                pod.full_name(),
                payload.len()
            );
            client.deploy(&pod.name, &vol.name, payload).await?;
        }

        if let Some(dns) = self.resolved_dns(pod) {
            let mut files = HashMap::new();
            files.insert(
                RESOLVCONF_PACKAGE_PATH.to_string(),
                PackageFile {
                    data: package::create_resolvconf(&dns),
                    mode: 0o644,
                },
            );
            let payload = make_deploy_package(&files)?;
            client
                .deploy(&pod.name, RESOLVCONF_VOLUME_NAME, payload)
                .await?;
        }

        if let Some(kubeconfig) = &self.network_agent_kubeconfig {
            let mut files = HashMap::new();
            files.insert(
                KUBECONFIG_PACKAGE_PATH.to_string(),
                PackageFile {
                    data: kubeconfig.clone(),
                    mode: 0o600,
                },
            );
            let payload = make_deploy_package(&files)?;
            client
                .deploy(&pod.name, KUBECONFIG_VOLUME_NAME, payload)
                .await?;
        }

        client.launch(&pod.name, &pod.spec).await?;
        info!("Launched pod {} on node {}", pod.full_name(), node.name);
        Ok(())
    }

    /// DNS parameters to render for this pod, or `None` when the cell's
    /// own settings apply and no file is generated.
    fn resolved_dns(&self, pod: &Pod) -> Option<DnsConfig> {
        let mut dns = match pod.spec.dns_policy {
            DnsPolicy::Default => return None,
            DnsPolicy::ClusterFirst => match &self.cluster_dns {
                Some(cluster) => DnsConfig {
                    servers: cluster.servers.clone(),
                    searches: cluster.searches.clone(),
                    options: Vec::new(),
                },
                // No cluster DNS configured: fall back to instance settings
                None if pod.spec.dns_config.is_none() => return None,
                None => DnsConfig::default(),
            },
            DnsPolicy::None => DnsConfig::default(),
        };
        if let Some(config) = &pod.spec.dns_config {
            dns.servers.extend(config.nameservers.iter().cloned());
            dns.searches.extend(config.searches.iter().cloned());
            dns.options
                .extend(config.options.iter().map(option_string));
        }
        dns.servers = dedup(dns.servers);
        dns.searches = dedup(dns.searches);
        dns.options = dedup(dns.options);
        Some(dns)
    }
}

fn option_string(option: &DnsConfigOption) -> String {
    match &option.value {
        Some(value) => format!("{}:{}", option.name, value),
        None => option.name.clone(),
    }
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.into_iter().filter(|i| seen.insert(i.clone())).collect()
}
