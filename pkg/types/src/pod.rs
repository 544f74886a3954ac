use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::address::NetworkAddress;
use crate::resource::ResourceSpec;
use crate::volume::{Volume, VolumeMount};

// --- Units ---

/// Environment variable exported inside a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Network protocol for a unit port.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Protocol {
    #[default]
    TCP,
    UDP,
    SCTP,
}

/// Network port opened for a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerPort {
    #[serde(default)]
    pub name: String,
    /// Port exposed on the cell, when different from the unit port.
    #[serde(default)]
    pub host_port: i32,
    pub container_port: i32,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub host_ip: String,
}

/// Capabilities added to or dropped from a unit's processes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub drop: Vec<String>,
}

/// Unit-level security settings, overriding the pod's where set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityContext {
    #[serde(default)]
    pub capabilities: Option<Capabilities>,
    #[serde(default)]
    pub run_as_user: Option<i64>,
    #[serde(default)]
    pub run_as_group: Option<i64>,
}

/// Command the cell agent execs inside the unit; exit 0 means healthy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecAction {
    #[serde(default)]
    pub command: Vec<String>,
}

/// Custom header sent with HTTP probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

/// HTTP GET the cell agent performs against the unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpGetAction {
    #[serde(default)]
    pub path: String,
    pub port: i32,
    /// Host to connect to; defaults to the pod IP.
    #[serde(default)]
    pub host: String,
    /// "HTTP" or "HTTPS"; empty means HTTP.
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub http_headers: Vec<HttpHeader>,
}

/// TCP connect the cell agent attempts against the unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TcpSocketAction {
    pub port: i32,
    #[serde(default)]
    pub host: String,
}

/// Health check the cell agent runs against a unit. Exactly one of the
/// action fields is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Probe {
    #[serde(default)]
    pub exec: Option<ExecAction>,
    #[serde(default)]
    pub http_get: Option<HttpGetAction>,
    #[serde(default)]
    pub tcp_socket: Option<TcpSocketAction>,
    #[serde(default)]
    pub initial_delay_seconds: i32,
    #[serde(default)]
    pub timeout_seconds: i32,
    #[serde(default)]
    pub period_seconds: i32,
    #[serde(default)]
    pub success_threshold: i32,
    #[serde(default)]
    pub failure_threshold: i32,
}

/// Units run applications. A pod consists of one or more units, all
/// executed on the same cell.
///
/// Ports, the security context, and the probes are pass-through: the
/// controller never interprets them, it ships them to the cell agent
/// inside the launch body and the agent enforces them on the instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub security_context: Option<SecurityContext>,
    /// Unit is restarted if this probe fails.
    #[serde(default)]
    pub liveness_probe: Option<Probe>,
    /// Unit is unready while this probe fails.
    #[serde(default)]
    pub readiness_probe: Option<Probe>,
    /// No other probes run until this one succeeds.
    #[serde(default)]
    pub startup_probe: Option<Probe>,
}

// --- Unit status ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitStateWaiting {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub start_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitStateRunning {
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitStateTerminated {
    pub exit_code: i32,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: String,
}

/// One possible state of a unit. Exactly one variant is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnitState {
    Waiting(UnitStateWaiting),
    Running(UnitStateRunning),
    Terminated(UnitStateTerminated),
}

impl Default for UnitState {
    fn default() -> Self {
        UnitState::Waiting(UnitStateWaiting::default())
    }
}

/// Last observed status of a single unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitStatus {
    pub name: String,
    #[serde(default)]
    pub state: UnitState,
    #[serde(default)]
    pub restart_count: i32,
    #[serde(default)]
    pub image: String,
}

// --- Spot / placement / DNS ---

/// Whether a spot instance may be used for a pod.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum SpotPolicy {
    Always,
    #[default]
    Never,
}

/// Spot policy wrapper on the pod spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodSpot {
    #[serde(default)]
    pub policy: SpotPolicy,
}

/// Where a pod's node will be placed in the infrastructure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlacementSpec {
    #[serde(default)]
    pub availability_zone: String,
}

/// How a pod's DNS is configured.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum DnsPolicy {
    /// Cluster DNS first, falling back to the instance's settings.
    #[default]
    ClusterFirst,
    /// Use the instance's own DNS settings; no resolv.conf is generated.
    Default,
    /// Empty DNS settings, populated only from `dns_config`.
    None,
}

/// DNS resolver option, e.g. `ndots:5`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfigOption {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// Extra DNS parameters merged with those generated from the DNS policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodDnsConfig {
    #[serde(default)]
    pub nameservers: Vec<String>,
    #[serde(default)]
    pub searches: Vec<String>,
    #[serde(default)]
    pub options: Vec<DnsConfigOption>,
}

/// Host file entry injected into the pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostAlias {
    pub ip: String,
    #[serde(default)]
    pub hostnames: Vec<String>,
}

/// Pod-level security settings passed through to the cell agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodSecurityContext {
    #[serde(default)]
    pub run_as_user: Option<i64>,
    #[serde(default)]
    pub run_as_group: Option<i64>,
    #[serde(default)]
    pub supplemental_groups: Vec<i64>,
    #[serde(default)]
    pub sysctls: Vec<Sysctl>,
}

/// Kernel parameter set inside the pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sysctl {
    pub name: String,
    pub value: String,
}

// --- Pod phase ---

/// Last observed phase of the pod.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PodPhase {
    /// Waiting for a node to run on.
    #[default]
    Waiting,
    /// A node is claimed and the app is being started on it.
    Dispatching,
    /// Up and running.
    Running,
    /// All units returned success. Terminal.
    Succeeded,
    /// A unit failed or a dispatch error occurred. Terminal.
    Failed,
    /// Stopped by request. Terminal.
    Terminated,
}

impl PodPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PodPhase::Succeeded | PodPhase::Failed | PodPhase::Terminated
        )
    }
}

impl std::fmt::Display for PodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PodPhase::Waiting => "Waiting",
            PodPhase::Dispatching => "Dispatching",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Terminated => "Terminated",
        };
        write!(f, "{}", s)
    }
}

/// Restart policy for all units in a pod. Exited units are restarted with
/// an exponential back-off delay (10s, 20s, 40s, ...) capped at five
/// minutes; the delay is reset after 10 minutes of success.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    Never,
}

// --- Pod spec / status ---

/// Desired behavior of a pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodSpec {
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    pub units: Vec<Unit>,
    #[serde(default)]
    pub init_units: Vec<Unit>,
    /// Secrets used for authenticating image pulls.
    #[serde(default)]
    pub image_pull_secrets: Vec<String>,
    /// Explicit cloud instance type. Takes precedence over `resources`.
    #[serde(default)]
    pub instance_type: String,
    #[serde(default)]
    pub spot: PodSpot,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub placement: PlacementSpec,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub security_context: Option<PodSecurityContext>,
    #[serde(default)]
    pub dns_policy: DnsPolicy,
    #[serde(default)]
    pub dns_config: Option<PodDnsConfig>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub subdomain: String,
    #[serde(default)]
    pub host_aliases: Vec<HostAlias>,
}

/// Last observed status of a pod. Maintained by the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
    /// Time of the last phase change.
    #[serde(default)]
    pub last_phase_change: Option<DateTime<Utc>>,
    /// Name of the node running this pod. Non-empty iff the phase is
    /// Dispatching or Running.
    #[serde(default)]
    pub bound_node_name: String,
    /// Cloud instance id of the node running this pod.
    #[serde(default)]
    pub bound_instance_id: String,
    #[serde(default)]
    pub addresses: Vec<NetworkAddress>,
    /// Failures encountered while trying to start this pod.
    #[serde(default)]
    pub start_failures: i32,
    /// Why the pod is in its current phase, when that phase is Failed.
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub unit_statuses: Vec<UnitStatus>,
    #[serde(default)]
    pub init_unit_statuses: Vec<UnitStatus>,
}

/// A pod is a collection of units that run on the same cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    /// Immutable once assigned; distinguishes same-named pods across time.
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

impl Pod {
    /// Fill in identity fields on creation.
    pub fn create(&mut self) {
        if self.uid.is_empty() {
            self.uid = Uuid::new_v4().to_string();
        }
        if self.namespace.is_empty() {
            self.namespace = "default".to_string();
        }
        self.created_at = Some(Utc::now());
    }

    /// Record a phase transition with its timestamp. Terminal phases are
    /// never left.
    pub fn set_phase(&mut self, phase: PodPhase) {
        if self.status.phase.is_terminal() || self.status.phase == phase {
            return;
        }
        self.status.phase = phase;
        self.status.last_phase_change = Some(Utc::now());
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pod() -> Pod {
        Pod {
            name: "p".to_string(),
            namespace: "default".to_string(),
            uid: "uid-1".to_string(),
            labels: HashMap::new(),
            created_at: None,
            spec: PodSpec::default(),
            status: PodStatus::default(),
        }
    }

    #[test]
    fn test_terminal_phase_is_sticky() {
        let mut pod = make_pod();
        pod.set_phase(PodPhase::Failed);
        assert_eq!(pod.status.phase, PodPhase::Failed);
        pod.set_phase(PodPhase::Running);
        assert_eq!(pod.status.phase, PodPhase::Failed);
    }

    #[test]
    fn test_phase_change_stamps_time() {
        let mut pod = make_pod();
        assert!(pod.status.last_phase_change.is_none());
        pod.set_phase(PodPhase::Dispatching);
        assert!(pod.status.last_phase_change.is_some());
    }

    #[test]
    fn test_unit_passthrough_fields_survive_launch_body() {
        // Ports, capabilities, and probes ride the serialized spec to the
        // cell agent untouched
        let unit = Unit {
            name: "web".to_string(),
            image: "nginx:latest".to_string(),
            command: vec![],
            args: vec![],
            env: vec![],
            volume_mounts: vec![],
            ports: vec![ContainerPort {
                name: "http".to_string(),
                host_port: 0,
                container_port: 8080,
                protocol: Protocol::TCP,
                host_ip: String::new(),
            }],
            working_dir: String::new(),
            security_context: Some(SecurityContext {
                capabilities: Some(Capabilities {
                    add: vec!["NET_BIND_SERVICE".to_string()],
                    drop: vec!["ALL".to_string()],
                }),
                run_as_user: Some(1000),
                run_as_group: None,
            }),
            liveness_probe: Some(Probe {
                http_get: Some(HttpGetAction {
                    path: "/healthz".to_string(),
                    port: 8080,
                    ..Default::default()
                }),
                period_seconds: 10,
                ..Default::default()
            }),
            readiness_probe: None,
            startup_probe: None,
        };
        let body = serde_json::to_string(&unit).unwrap();
        let parsed: Unit = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.ports[0].container_port, 8080);
        assert_eq!(parsed.ports[0].protocol, Protocol::TCP);
        let caps = parsed
            .security_context
            .as_ref()
            .unwrap()
            .capabilities
            .as_ref()
            .unwrap();
        assert_eq!(caps.add, vec!["NET_BIND_SERVICE".to_string()]);
        let probe = parsed.liveness_probe.as_ref().unwrap();
        assert_eq!(probe.http_get.as_ref().unwrap().path, "/healthz");
        assert_eq!(probe.period_seconds, 10);
    }
}
