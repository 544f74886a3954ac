//! Reserved volume names understood by the cell agent.

/// Deploy package carrying the network agent's kubeconfig.
pub const KUBECONFIG_VOLUME_NAME: &str = "kubeconfig";

/// Path of the kubeconfig file inside its package.
pub const KUBECONFIG_PACKAGE_PATH: &str = "kubeconfig/kubeconfig";

/// Deploy package carrying the generated /etc/resolv.conf.
pub const RESOLVCONF_VOLUME_NAME: &str = "resolvconf";

/// Path of the resolv.conf file inside its package.
pub const RESOLVCONF_PACKAGE_PATH: &str = "/etc/resolv.conf";
