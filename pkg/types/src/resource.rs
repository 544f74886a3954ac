use serde::{Deserialize, Serialize};

/// Resource requirements for the node that will run a pod.
///
/// CPU is a string so fractional amounts can be expressed for shared-CPU
/// instance families (e.g. "0.5"). Memory is a quantity with a `Gi` suffix
/// (e.g. "3Gi"). VolumeSize is the root volume size in GiB.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    #[serde(default)]
    pub cpu: String,
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub gpu: String,
    #[serde(default)]
    pub volume_size: String,
    /// Refuse burstable / shared-CPU instance families.
    #[serde(default)]
    pub dedicated_cpu: bool,
    /// Unlimited CPU for burstable instances. Tri-state: `None` means
    /// provider default, never coerced to `false`.
    #[serde(default)]
    pub sustained_cpu: Option<bool>,
    /// Launch the node without a public IP address.
    #[serde(default)]
    pub private_ip_only: bool,
}

impl ResourceSpec {
    /// Parsed CPU request in cores, or `None` when unset.
    pub fn cpu_cores(&self) -> Option<f64> {
        parse_cpu(&self.cpu)
    }

    /// Parsed memory request in GiB, or `None` when unset.
    pub fn memory_gib(&self) -> Option<f64> {
        parse_memory(&self.memory)
    }

    /// Parsed GPU count, treating unset as zero.
    pub fn gpu_count(&self) -> u32 {
        self.gpu.trim().parse().unwrap_or(0)
    }

    /// Parsed root volume size in GiB, or `None` when unset.
    pub fn volume_size_gib(&self) -> Option<u32> {
        let s = self.volume_size.trim();
        if s.is_empty() {
            return None;
        }
        s.trim_end_matches("Gi").parse().ok()
    }
}

/// Parse a CPU quantity: plain decimal cores, fractional allowed ("0.5").
pub fn parse_cpu(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    s.parse::<f64>().ok().filter(|v| *v >= 0.0)
}

/// Parse a memory quantity in GiB. Accepts "3Gi" or a bare number of GiB.
pub fn parse_memory(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let numeric = s.strip_suffix("Gi").unwrap_or(s);
    numeric.trim().parse::<f64>().ok().filter(|v| *v >= 0.0)
}
