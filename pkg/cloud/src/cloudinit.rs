use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;
use thiserror::Error;

/// Hard ceiling most providers put on instance user data.
pub const MAX_CLOUD_INIT_SIZE: usize = 16_000;

const CLOUD_CONFIG_HEADER: &str = "#cloud-config\n";

pub const AGENT_VERSION_PATH: &str = "/tmp/itzo/itzo_version";
pub const AGENT_URL_PATH: &str = "/tmp/itzo/itzo_url";
pub const CELL_CONFIG_PATH: &str = "/tmp/itzo/cell_config.yaml";

#[derive(Debug, Error)]
pub enum CloudInitError {
    #[error("could not load user cloud-init file {path}: {source}")]
    LoadUserData {
        path: String,
        source: anyhow::Error,
    },
    #[error("cloud-init yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("cloud-init data length {0} is over {MAX_CLOUD_INIT_SIZE} bytes")]
    TooLarge(usize),
}

/// One `write_files` entry in a cloud-config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WriteFile {
    content: String,
    path: String,
    owner: String,
    permissions: String,
}

/// Renders instance user data: the operator's own cloud-config merged with
/// the files the controller writes under `/tmp/itzo` for the cell agent
/// bootstrap.
#[derive(Debug, Clone, Default)]
pub struct CloudInitFile {
    user_data: serde_yaml::Mapping,
    cell_files: BTreeMap<String, WriteFile>,
}

impl CloudInitFile {
    /// Load the operator's cloud-config from `path`; empty path means none.
    pub fn new(path: &str) -> Result<Self, CloudInitError> {
        let mut file = Self::default();
        if !path.is_empty() {
            let contents =
                std::fs::read_to_string(path).map_err(|e| CloudInitError::LoadUserData {
                    path: path.to_string(),
                    source: e.into(),
                })?;
            file.user_data = serde_yaml::from_str(&contents)?;
        }
        Ok(file)
    }

    /// Drop per-instance files, keeping the user's config.
    pub fn reset_instance_data(&mut self) {
        self.cell_files.clear();
    }

    fn add_file(&mut self, content: &str, path: &str, permissions: &str) {
        self.cell_files.insert(
            path.to_string(),
            WriteFile {
                content: content.to_string(),
                path: path.to_string(),
                owner: "root".to_string(),
                permissions: permissions.to_string(),
            },
        );
    }

    /// Record the agent version the cell should download. Bare semver
    /// versions get the leading `v` the release artifacts are named with.
    pub fn add_agent_version(&mut self, version: &str) {
        if version.is_empty() {
            return;
        }
        let mut version = version.to_string();
        if version != "latest"
            && !version.starts_with('v')
            && version.chars().next().is_some_and(|c| c.is_ascii_digit())
        {
            version = format!("v{}", version);
        }
        self.add_file(&version, AGENT_VERSION_PATH, "0444");
    }

    pub fn add_agent_url(&mut self, url: &str) {
        if url.is_empty() {
            return;
        }
        self.add_file(url, AGENT_URL_PATH, "0444");
    }

    /// Extra key/values the agent reads at boot.
    pub fn add_cell_config(&mut self, cfg: &HashMap<String, String>) -> Result<(), CloudInitError> {
        if cfg.is_empty() {
            return Ok(());
        }
        // BTreeMap so the rendered yaml is stable
        let sorted: BTreeMap<&String, &String> = cfg.iter().collect();
        let yaml = serde_yaml::to_string(&sorted)?;
        self.add_file(&yaml, CELL_CONFIG_PATH, "0444");
        Ok(())
    }

    /// Render the merged `#cloud-config` document. Fails loudly when the
    /// result exceeds the provider user-data bound; this runs before any
    /// cloud call.
    pub fn contents(&self) -> Result<Vec<u8>, CloudInitError> {
        let mut merged = self.user_data.clone();
        let write_files_key = serde_yaml::Value::String("write_files".to_string());
        let mut files: Vec<serde_yaml::Value> = match merged.get(&write_files_key) {
            Some(serde_yaml::Value::Sequence(seq)) => seq.clone(),
            _ => Vec::new(),
        };
        for wf in self.cell_files.values() {
            files.push(serde_yaml::to_value(wf)?);
        }
        if !files.is_empty() {
            merged.insert(write_files_key, serde_yaml::Value::Sequence(files));
        }
        let body = serde_yaml::to_string(&merged)?;
        let mut out = CLOUD_CONFIG_HEADER.as_bytes().to_vec();
        out.extend_from_slice(body.as_bytes());
        if out.len() > MAX_CLOUD_INIT_SIZE {
            return Err(CloudInitError::TooLarge(out.len()));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contents_start_with_header() {
        let mut f = CloudInitFile::default();
        f.add_agent_url("https://example.com/itzo");
        let out = f.contents().unwrap();
        assert!(out.starts_with(b"#cloud-config\n"));
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains(AGENT_URL_PATH));
    }

    #[test]
    fn test_agent_version_gets_v_prefix() {
        let mut f = CloudInitFile::default();
        f.add_agent_version("1.2.3");
        let s = String::from_utf8(f.contents().unwrap()).unwrap();
        assert!(s.contains("v1.2.3"));

        let mut f = CloudInitFile::default();
        f.add_agent_version("latest");
        let s = String::from_utf8(f.contents().unwrap()).unwrap();
        assert!(s.contains("latest"));
        assert!(!s.contains("vlatest"));
    }

    #[test]
    fn test_oversized_render_fails() {
        let mut f = CloudInitFile::default();
        let big = "x".repeat(MAX_CLOUD_INIT_SIZE + 1);
        f.add_file(&big, "/tmp/big", "0444");
        assert!(matches!(
            f.contents().unwrap_err(),
            CloudInitError::TooLarge(_)
        ));
    }

    #[test]
    fn test_reset_instance_data_keeps_user_files() {
        let mut f = CloudInitFile::default();
        f.user_data = serde_yaml::from_str("write_files:\n  - path: /etc/motd\n    content: hi\n")
            .unwrap();
        f.add_agent_url("https://example.com/itzo");
        f.reset_instance_data();
        let s = String::from_utf8(f.contents().unwrap()).unwrap();
        assert!(s.contains("/etc/motd"));
        assert!(!s.contains(AGENT_URL_PATH));
    }

    #[test]
    fn test_cell_config_written_under_agent_dir() {
        let mut f = CloudInitFile::default();
        let mut cfg = HashMap::new();
        cfg.insert("cloudProvider".to_string(), "aws".to_string());
        f.add_cell_config(&cfg).unwrap();
        let s = String::from_utf8(f.contents().unwrap()).unwrap();
        assert!(s.contains(CELL_CONFIG_PATH));
        assert!(s.contains("cloudProvider"));
    }
}
