//! State store key layout.

pub const POD_KEY_PREFIX: &str = "/registry/pods/";
pub const NODE_KEY_PREFIX: &str = "/registry/nodes/";

/// Key holding the generated controller id when none was configured.
pub const CONTROLLER_ID_KEY: &str = "/registry/controller-id";

pub fn pod_key(namespace: &str, name: &str) -> String {
    format!("{}{}/{}", POD_KEY_PREFIX, namespace, name)
}

pub fn node_key(name: &str) -> String {
    format!("{}{}", NODE_KEY_PREFIX, name)
}
