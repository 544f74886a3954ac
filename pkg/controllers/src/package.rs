//! Deploy package construction.
//!
//! The cell agent consumes volumes as gzip-compressed tar streams where
//! every file is rooted at `./ROOTFS/<path>`, owned by uid=gid=0, with
//! regular files only. This module builds those packages from configmaps,
//! secrets, kubeconfigs, and generated resolv.conf data.

use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::HashMap;
use tar::{EntryType, Header};
use thiserror::Error;

use pkg_types::configmap::ConfigMap;
use pkg_types::secret::Secret;
use pkg_types::volume::{
    ConfigMapVolumeSource, DEFAULT_VOLUME_FILE_MODE, KeyToPath, SecretVolumeSource,
};

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("volume {volume} references non-existent key {key} in {namespace}/{name}")]
    MissingKey {
        volume: String,
        namespace: String,
        name: String,
        key: String,
    },
    #[error("archive error: {0}")]
    Archive(#[from] std::io::Error),
}

/// One file going into a deploy package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFile {
    pub data: Vec<u8>,
    pub mode: u32,
}

/// Build a tar.gz stream from package files. Entry order follows map
/// iteration; deterministic output is not required.
pub fn make_deploy_package(
    contents: &HashMap<String, PackageFile>,
) -> Result<Vec<u8>, PackageError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, file) in contents {
        let tar_path = format!("./ROOTFS/{}", path.trim_start_matches('/'));
        let mut header = Header::new_gnu();
        header.set_path(&tar_path)?;
        header.set_mode(file.mode);
        header.set_size(file.data.len() as u64);
        header.set_uid(0);
        header.set_gid(0);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder.append(&header, file.data.as_slice())?;
    }
    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Expand a projection item list: an empty list means one item per key in
/// the source.
fn effective_items(items: &[KeyToPath], keys: Vec<String>) -> Vec<KeyToPath> {
    if items.is_empty() {
        keys.into_iter()
            .map(|key| KeyToPath {
                key,
                path: String::new(),
                mode: None,
            })
            .collect()
    } else {
        items.to_vec()
    }
}

fn project_items(
    volume: &str,
    namespace: &str,
    name: &str,
    items: Vec<KeyToPath>,
    default_mode: u32,
    optional: bool,
    lookup: impl Fn(&str) -> Option<Vec<u8>>,
) -> Result<HashMap<String, PackageFile>, PackageError> {
    let mut files = HashMap::new();
    for item in items {
        let data = match lookup(&item.key) {
            Some(data) => data,
            None => {
                if optional {
                    continue;
                }
                return Err(PackageError::MissingKey {
                    volume: volume.to_string(),
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    key: item.key,
                });
            }
        };
        let mode = item.mode.unwrap_or(default_mode);
        let archive_path = if item.path.is_empty() {
            item.key.clone()
        } else {
            item.path.clone()
        };
        files.insert(archive_path, PackageFile { data, mode });
    }
    Ok(files)
}

/// Package files for a configmap volume. Keys resolve against `data`
/// first, then `binary_data`.
pub fn configmap_files(
    vol: &ConfigMapVolumeSource,
    cm: &ConfigMap,
) -> Result<HashMap<String, PackageFile>, PackageError> {
    let default_mode = vol.default_mode.unwrap_or(DEFAULT_VOLUME_FILE_MODE);
    let optional = vol.optional.unwrap_or(false);
    let mut keys: Vec<String> = cm.data.keys().cloned().collect();
    keys.extend(cm.binary_data.keys().cloned());
    let items = effective_items(&vol.items, keys);
    project_items(
        &vol.name,
        &cm.namespace,
        &cm.name,
        items,
        default_mode,
        optional,
        |key| cm.get(key),
    )
}

/// Package files for a secret volume. Same rules, on `data` only; values
/// are raw bytes and are written as-is.
pub fn secret_files(
    vol: &SecretVolumeSource,
    secret: &Secret,
) -> Result<HashMap<String, PackageFile>, PackageError> {
    let default_mode = vol.default_mode.unwrap_or(DEFAULT_VOLUME_FILE_MODE);
    let optional = vol.optional.unwrap_or(false);
    let keys: Vec<String> = secret.data.keys().cloned().collect();
    let items = effective_items(&vol.items, keys);
    project_items(
        &vol.secret_name,
        &secret.namespace,
        &secret.name,
        items,
        default_mode,
        optional,
        |key| secret.get(key),
    )
}

/// Resolved DNS parameters for one pod, ready to render.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsConfig {
    pub servers: Vec<String>,
    pub searches: Vec<String>,
    pub options: Vec<String>,
}

/// Render resolv.conf bytes. Zero nameservers legally produce an empty
/// file.
pub fn create_resolvconf(dns: &DnsConfig) -> Vec<u8> {
    let mut out = String::new();
    for server in &dns.servers {
        out.push_str(&format!("nameserver {}\n", server));
    }
    if !dns.searches.is_empty() {
        out.push_str(&format!("search {}\n", dns.searches.join(" ")));
    }
    if !dns.options.is_empty() {
        out.push_str(&format!("options {}\n", dns.options.join(" ")));
    }
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tar::Archive;

    /// Unpack a deploy package into (path, mode, data) entries.
    fn read_package(package: &[u8]) -> Vec<(String, u32, Vec<u8>)> {
        let mut archive = Archive::new(GzDecoder::new(package));
        let mut entries = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().to_string();
            let mode = entry.header().mode().unwrap();
            assert_eq!(entry.header().uid().unwrap(), 0);
            assert_eq!(entry.header().gid().unwrap(), 0);
            assert_eq!(entry.header().entry_type(), EntryType::Regular);
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            entries.push((path, mode, data));
        }
        entries.sort();
        entries
    }

    fn make_configmap() -> ConfigMap {
        let mut cm = ConfigMap {
            name: "cm".to_string(),
            namespace: "default".to_string(),
            ..Default::default()
        };
        cm.data.insert("a".to_string(), "A".to_string());
        cm.data.insert("b".to_string(), "B".to_string());
        cm.binary_data.insert("c".to_string(), vec![0x01, 0x02]);
        cm
    }

    #[test]
    fn test_configmap_projects_all_keys_by_default() {
        let vol = ConfigMapVolumeSource {
            name: "cm".to_string(),
            items: vec![],
            default_mode: None,
            optional: None,
        };
        let files = configmap_files(&vol, &make_configmap()).unwrap();
        let package = make_deploy_package(&files).unwrap();
        let entries = read_package(&package);
        assert_eq!(
            entries,
            vec![
                ("./ROOTFS/a".to_string(), 0o644, b"A".to_vec()),
                ("./ROOTFS/b".to_string(), 0o644, b"B".to_vec()),
                ("./ROOTFS/c".to_string(), 0o644, vec![0x01, 0x02]),
            ]
        );
    }

    #[test]
    fn test_configmap_selective_projection_with_remap() {
        let vol = ConfigMapVolumeSource {
            name: "cm".to_string(),
            items: vec![
                KeyToPath {
                    key: "a".to_string(),
                    path: "x/y".to_string(),
                    mode: None,
                },
                KeyToPath {
                    key: "missing".to_string(),
                    path: String::new(),
                    mode: None,
                },
            ],
            default_mode: None,
            optional: Some(true),
        };
        let files = configmap_files(&vol, &make_configmap()).unwrap();
        let package = make_deploy_package(&files).unwrap();
        let entries = read_package(&package);
        assert_eq!(
            entries,
            vec![("./ROOTFS/x/y".to_string(), 0o644, b"A".to_vec())]
        );
    }

    #[test]
    fn test_configmap_missing_key_fails_when_required() {
        let vol = ConfigMapVolumeSource {
            name: "cm".to_string(),
            items: vec![KeyToPath {
                key: "missing".to_string(),
                path: String::new(),
                mode: None,
            }],
            default_mode: None,
            optional: None,
        };
        let err = configmap_files(&vol, &make_configmap()).unwrap_err();
        assert!(matches!(err, PackageError::MissingKey { ref key, .. } if key == "missing"));
    }

    #[test]
    fn test_item_mode_overrides_default() {
        let vol = ConfigMapVolumeSource {
            name: "cm".to_string(),
            items: vec![
                KeyToPath {
                    key: "a".to_string(),
                    path: String::new(),
                    mode: Some(0o400),
                },
                KeyToPath {
                    key: "b".to_string(),
                    path: String::new(),
                    mode: None,
                },
            ],
            default_mode: Some(0o600),
            optional: None,
        };
        let files = configmap_files(&vol, &make_configmap()).unwrap();
        assert_eq!(files.get("a").unwrap().mode, 0o400);
        assert_eq!(files.get("b").unwrap().mode, 0o600);
    }

    #[test]
    fn test_secret_optional_missing_key_skipped() {
        let mut secret = Secret {
            name: "s".to_string(),
            namespace: "default".to_string(),
            ..Default::default()
        };
        secret.data.insert("token".to_string(), b"t0ps3cret".to_vec());
        let vol = SecretVolumeSource {
            secret_name: "s".to_string(),
            items: vec![
                KeyToPath {
                    key: "token".to_string(),
                    path: String::new(),
                    mode: None,
                },
                KeyToPath {
                    key: "missing".to_string(),
                    path: String::new(),
                    mode: None,
                },
            ],
            default_mode: None,
            optional: Some(true),
        };
        let files = secret_files(&vol, &secret).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files.get("token").unwrap().data, b"t0ps3cret".to_vec());
    }

    #[test]
    fn test_secret_bytes_written_as_is() {
        // Raw bytes, not base64: what is stored is what lands in the tar
        let mut secret = Secret {
            name: "s".to_string(),
            namespace: "default".to_string(),
            ..Default::default()
        };
        secret.data.insert("bin".to_string(), vec![0xde, 0xad, 0xbe, 0xef]);
        let vol = SecretVolumeSource {
            secret_name: "s".to_string(),
            items: vec![],
            default_mode: None,
            optional: None,
        };
        let files = secret_files(&vol, &secret).unwrap();
        let package = make_deploy_package(&files).unwrap();
        let entries = read_package(&package);
        assert_eq!(entries[0].2, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_resolvconf_rendering() {
        let dns = DnsConfig {
            servers: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
            searches: vec!["svc.cluster.local".to_string()],
            options: vec!["ndots:5".to_string()],
        };
        assert_eq!(
            create_resolvconf(&dns),
            b"nameserver 1.1.1.1\nnameserver 8.8.8.8\nsearch svc.cluster.local\noptions ndots:5\n"
                .to_vec()
        );
    }

    #[test]
    fn test_resolvconf_empty_config_is_legal() {
        assert!(create_resolvconf(&DnsConfig::default()).is_empty());
    }

    #[test]
    fn test_absolute_paths_rooted_under_rootfs() {
        let mut files = HashMap::new();
        files.insert(
            "/etc/resolv.conf".to_string(),
            PackageFile {
                data: b"nameserver 1.1.1.1\n".to_vec(),
                mode: 0o644,
            },
        );
        let package = make_deploy_package(&files).unwrap();
        let entries = read_package(&package);
        assert_eq!(entries[0].0, "./ROOTFS/etc/resolv.conf");
    }
}
