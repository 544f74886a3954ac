use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Server configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// port: 6421
/// data-dir: /var/lib/kip/data
/// controller-id: kip-prod-1
/// boot-image-tags: elotl-itzo
/// itzo-version: latest
/// reuse-cleaned-nodes: false
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfigFile {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    /// Stable per-deployment id used to tag and filter cloud instances.
    #[serde(default, alias = "controller-id")]
    pub controller_id: Option<String>,
    /// Image name filter, dash-separated tag prefix (e.g. "elotl-itzo").
    #[serde(default, alias = "boot-image-tags")]
    pub boot_image_tags: Option<String>,
    /// URL the cell downloads the agent binary from.
    #[serde(default, alias = "itzo-url")]
    pub itzo_url: Option<String>,
    #[serde(default, alias = "itzo-version")]
    pub itzo_version: Option<String>,
    /// Instance type used when a pod specifies neither type nor resources.
    #[serde(default, alias = "default-instance-type")]
    pub default_instance_type: Option<String>,
    /// How long an Available node may sit unclaimed before cleanup.
    #[serde(default, alias = "idle-node-timeout-secs")]
    pub idle_node_timeout_secs: Option<u64>,
    /// Whether cleaned nodes go back to Available instead of terminating.
    #[serde(default, alias = "reuse-cleaned-nodes")]
    pub reuse_cleaned_nodes: Option<bool>,
    /// Extra key/values written into the cell config file at boot.
    #[serde(default, alias = "cell-config")]
    pub cell_config: HashMap<String, String>,
    /// Path to a user cloud-init file merged into the rendered user data.
    #[serde(default, alias = "cloud-init-file")]
    pub cloud_init_file: Option<String>,
    /// Path to a kubeconfig deployed to cells for the network agent.
    #[serde(default, alias = "network-agent-kubeconfig")]
    pub network_agent_kubeconfig: Option<String>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}
