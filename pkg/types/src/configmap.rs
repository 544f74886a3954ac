use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configuration data projected into pods as files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigMap {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    /// UTF-8 values.
    #[serde(default)]
    pub data: HashMap<String, String>,
    /// Non-UTF-8 values.
    #[serde(default)]
    pub binary_data: HashMap<String, Vec<u8>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl ConfigMap {
    /// Look up a key in `data` first, then `binary_data`.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(s) = self.data.get(key) {
            return Some(s.clone().into_bytes());
        }
        self.binary_data.get(key).cloned()
    }
}
