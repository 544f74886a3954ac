use serde::{Deserialize, Serialize};

/// Default file mode for projected configmap/secret entries.
pub const DEFAULT_VOLUME_FILE_MODE: u32 = 0o644;

/// Volume mount in a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Name of the volume (must match a Volume in the pod spec)
    pub name: String,
    /// Path inside the unit to mount the volume
    pub mount_path: String,
}

/// Maps a string key to a path within a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyToPath {
    /// The key to project.
    pub key: String,
    /// Relative path to map the key to. Empty means use the key itself.
    #[serde(default)]
    pub path: String,
    /// Mode bits for this file. `None` means use the volume's default mode.
    #[serde(default)]
    pub mode: Option<u32>,
}

/// Adapts a configmap into a volume: each selected key becomes a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMapVolumeSource {
    /// Name of the configmap in the pod's namespace.
    pub name: String,
    /// Keys to project. Empty means project every key in the source.
    #[serde(default)]
    pub items: Vec<KeyToPath>,
    /// Default mode bits for created files. `None` means 0644.
    #[serde(default)]
    pub default_mode: Option<u32>,
    /// Whether the configmap or its keys may be missing.
    #[serde(default)]
    pub optional: Option<bool>,
}

/// Adapts a secret into a volume. Same projection rules as configmaps,
/// applied to the secret's `data` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretVolumeSource {
    /// Name of the secret in the pod's namespace.
    pub secret_name: String,
    #[serde(default)]
    pub items: Vec<KeyToPath>,
    #[serde(default)]
    pub default_mode: Option<u32>,
    #[serde(default)]
    pub optional: Option<bool>,
}

/// Backing medium for an emptyDir.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum StorageMedium {
    /// Disk-backed scratch space.
    #[default]
    Default,
    /// tmpfs.
    Memory,
}

/// Scratch volume created when the pod starts, deleted when it stops.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyDir {
    #[serde(default)]
    pub medium: StorageMedium,
    /// Size limit in bytes, only meaningful for tmpfs.
    #[serde(default)]
    pub size_limit: i64,
}

/// A file or directory from a deployed package mapped into a unit's rootfs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagePath {
    pub path: String,
}

/// Pre-existing file or directory on the instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostPath {
    pub path: String,
}

/// One source projected into a projected volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeProjection {
    #[serde(default)]
    pub config_map: Option<ConfigMapVolumeSource>,
    #[serde(default)]
    pub secret: Option<SecretVolumeSource>,
}

/// Several configmap/secret sources projected into one volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectedVolumeSource {
    pub sources: Vec<VolumeProjection>,
    #[serde(default)]
    pub default_mode: Option<u32>,
}

/// Volume source. The controller materializes `ConfigMap` and `Secret`
/// itself; the other variants are handed to the cell agent as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    EmptyDir(EmptyDir),
    PackagePath(PackagePath),
    ConfigMap(ConfigMapVolumeSource),
    Secret(SecretVolumeSource),
    HostPath(HostPath),
    Projected(ProjectedVolumeSource),
}

/// Named volume in a pod spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub source: VolumeSource,
}
