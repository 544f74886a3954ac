use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Sensitive data projected into pods as files.
///
/// `data` holds raw bytes: values arriving over the API are decoded
/// upstream and stored as-is. The package builder never re-decodes them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub data: HashMap<String, Vec<u8>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Secret {
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.get(key).cloned()
    }
}
