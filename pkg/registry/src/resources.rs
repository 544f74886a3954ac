use dashmap::DashMap;
use std::sync::Arc;

use pkg_types::configmap::ConfigMap;
use pkg_types::secret::Secret;

/// In-memory configmap/secret cache shared read-only with the pod
/// dispatchers. Populated by the API as objects are created or updated.
///
/// Thread-safe via `DashMap`; lookups clone so readers never hold a shard
/// lock across an await point.
#[derive(Clone, Default)]
pub struct ResourceManager {
    configmaps: Arc<DashMap<(String, String), ConfigMap>>,
    secrets: Arc<DashMap<(String, String), Secret>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_configmap(&self, cm: ConfigMap) {
        self.configmaps
            .insert((cm.namespace.clone(), cm.name.clone()), cm);
    }

    pub fn get_configmap(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.configmaps
            .get(&(namespace.to_string(), name.to_string()))
            .map(|e| e.value().clone())
    }

    pub fn delete_configmap(&self, namespace: &str, name: &str) {
        self.configmaps
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn list_configmaps(&self, namespace: &str) -> Vec<ConfigMap> {
        self.configmaps
            .iter()
            .filter(|e| e.key().0 == namespace)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn put_secret(&self, secret: Secret) {
        self.secrets
            .insert((secret.namespace.clone(), secret.name.clone()), secret);
    }

    pub fn get_secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.secrets
            .get(&(namespace.to_string(), name.to_string()))
            .map(|e| e.value().clone())
    }

    pub fn delete_secret(&self, namespace: &str, name: &str) {
        self.secrets
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn list_secrets(&self, namespace: &str) -> Vec<Secret> {
        self.secrets
            .iter()
            .filter(|e| e.key().0 == namespace)
            .map(|e| e.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_configmap_round_trip() {
        let rm = ResourceManager::new();
        let mut data = HashMap::new();
        data.insert("a".to_string(), "A".to_string());
        rm.put_configmap(ConfigMap {
            name: "cm".to_string(),
            namespace: "default".to_string(),
            data,
            ..Default::default()
        });
        let got = rm.get_configmap("default", "cm").unwrap();
        assert_eq!(got.data.get("a").unwrap(), "A");
        assert!(rm.get_configmap("other", "cm").is_none());
    }

    #[test]
    fn test_secret_scoped_by_namespace() {
        let rm = ResourceManager::new();
        rm.put_secret(Secret {
            name: "s".to_string(),
            namespace: "a".to_string(),
            ..Default::default()
        });
        rm.put_secret(Secret {
            name: "s".to_string(),
            namespace: "b".to_string(),
            ..Default::default()
        });
        assert_eq!(rm.list_secrets("a").len(), 1);
        rm.delete_secret("a", "s");
        assert!(rm.get_secret("a", "s").is_none());
        assert!(rm.get_secret("b", "s").is_some());
    }
}
