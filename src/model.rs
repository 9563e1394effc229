//! Canonical entity schema shared by the description parser, the topology
//! engine, the providers, and the registry.
//!
//! One type per domain concept (Host, Guest, Task, Topology, Range) rather
//! than the legacy-plus-modern duplication the original tool carried.

use std::collections::HashMap;

use facet::Facet;

/// A physical or hypervisor machine that will run guests.
#[derive(Debug, Clone, Facet)]
pub struct Host {
    pub id: String,
    pub mgmt_addr: String,
    pub virbr_addr: String,
    pub account: String,
}

/// What hypervisor backs a guest template. `Aws` is reserved for a future
/// cloud provider and is rejected by every provider implemented here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum BaseVmKind {
    Kvm,
    Aws,
}

/// A guest template: the description of a VM, as opposed to a concrete
/// instance cloned from it (see [`CloneSettings`]).
#[derive(Debug, Clone, Facet)]
pub struct GuestTemplate {
    pub id: String,
    pub basevm_host: String,
    pub basevm_config_file: Option<String>,
    pub basevm_type: BaseVmKind,
    pub basevm_os_type: String,
    pub ip_addr: Option<String>,
    pub root_passwd: Option<String>,
    pub tasks: Vec<Task>,
}

/// Parameters for `add_account` / `modify_account`.
#[derive(Debug, Clone, Facet)]
pub struct AccountTask {
    pub account: String,
    pub passwd: Option<String>,
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, Facet)]
pub struct InstallPackageTask {
    pub name: String,
    pub version: Option<String>,
    pub package_manager: String,
}

#[derive(Debug, Clone, Facet)]
pub struct CopyContentTask {
    pub src: String,
    pub dst: String,
}

#[derive(Debug, Clone, Facet)]
pub struct ExecuteProgramTask {
    pub program: String,
    pub args: Vec<String>,
    pub interpreter: String,
}

#[derive(Debug, Clone, Facet)]
pub struct EmulateAttackTask {
    pub attack_type: String,
    pub target_account: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Facet)]
pub struct EmulateMalwareTask {
    pub malware_name: String,
    pub mode: String,
}

#[derive(Debug, Clone, Facet)]
pub struct TrafficCaptureTask {
    pub interface: String,
    pub duration_s: u32,
}

#[derive(Debug, Clone, Facet)]
pub struct FirewallRule {
    pub src_network: String,
    pub dst_network: String,
    pub action: String,
}

#[derive(Debug, Clone, Facet)]
pub struct FirewallRulesTask {
    pub rules: Vec<FirewallRule>,
}

/// A tagged variant from the closed task set. Exhaustive matches at
/// the executor make an unknown kind a parse-time error, not a runtime one.
#[derive(Debug, Clone, Facet)]
pub enum Task {
    AddAccount(AccountTask),
    ModifyAccount(AccountTask),
    InstallPackage(InstallPackageTask),
    CopyContent(CopyContentTask),
    ExecuteProgram(ExecuteProgramTask),
    EmulateAttack(EmulateAttackTask),
    EmulateMalware(EmulateMalwareTask),
    EmulateTrafficCapture(TrafficCaptureTask),
    FirewallRules(FirewallRulesTask),
}

impl Task {
    pub fn kind(&self) -> &'static str {
        match self {
            Task::AddAccount(_) => "add_account",
            Task::ModifyAccount(_) => "modify_account",
            Task::InstallPackage(_) => "install_package",
            Task::CopyContent(_) => "copy_content",
            Task::ExecuteProgram(_) => "execute_program",
            Task::EmulateAttack(_) => "emulate_attack",
            Task::EmulateMalware(_) => "emulate_malware",
            Task::EmulateTrafficCapture(_) => "emulate_traffic_capture",
            Task::FirewallRules(_) => "firewall_rules",
        }
    }
}

/// A named virtual network: member NICs of the form `<guest>.<nic>`, an
/// optional gateway NIC, and an optional explicit subnet.
#[derive(Debug, Clone, Facet)]
pub struct NetworkDecl {
    pub name: String,
    pub members: Vec<String>,
    pub gateway_member: Option<String>,
    pub subnet: Option<String>,
}

#[derive(Debug, Clone, Facet)]
pub struct ForwardingRule {
    pub src_network: String,
    pub dst_network: String,
}

#[derive(Debug, Clone, Facet)]
pub struct Topology {
    pub networks: Vec<NetworkDecl>,
    pub forwarding_rules: Vec<ForwardingRule>,
}

/// One guest instantiation under a host within `clone_settings`.
#[derive(Debug, Clone, Facet)]
pub struct GuestClone {
    pub guest_id: String,
    pub number: u32,
    pub entry_point: bool,
}

#[derive(Debug, Clone, Facet)]
pub struct HostClone {
    pub host_id: String,
    pub instance_number: u32,
    pub guests: Vec<GuestClone>,
    pub topology: Topology,
}

/// Replication factors and entry-point markers for one range.
#[derive(Debug, Clone, Facet)]
pub struct CloneSettings {
    pub range_id: String,
    pub hosts: Vec<HostClone>,
}

/// The full parsed description file: three top-level sections in order.
#[derive(Debug, Clone, Facet)]
pub struct Description {
    pub host_settings: Vec<Host>,
    pub guest_settings: Vec<GuestTemplate>,
    pub clone_settings: Vec<CloneSettings>,
}

/// Parses a range description YAML file.
pub fn load_description(path: &std::path::Path) -> Result<Description, crate::error::RangeError> {
    let contents = std::fs::read_to_string(path).map_err(|source| crate::error::RangeError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    facet_yaml::from_str(&contents).map_err(|e| crate::error::RangeError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Lifecycle status, monotonic along the happy path except that `Error` is
/// reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum RangeStatus {
    Creating,
    Active,
    Stopping,
    Stopped,
    Error,
    Destroyed,
}

impl std::fmt::Display for RangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RangeStatus::Creating => "CREATING",
            RangeStatus::Active => "ACTIVE",
            RangeStatus::Stopping => "STOPPING",
            RangeStatus::Stopped => "STOPPED",
            RangeStatus::Error => "ERROR",
            RangeStatus::Destroyed => "DESTROYED",
        };
        f.write_str(s)
    }
}

impl RangeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RangeStatus::Destroyed | RangeStatus::Error)
    }
}

/// A single task's outcome, aggregated per range but never by itself
/// fatal to range creation (none are currently marked critical).
#[derive(Debug, Clone, Facet)]
pub struct TaskResult {
    pub task_id: String,
    pub kind: String,
    pub guest: String,
    pub success: bool,
    pub message: String,
    pub output: String,
    pub elapsed_ms: u64,
}

/// Persisted range metadata — `ranges_metadata.json`.
#[derive(Debug, Clone, Facet)]
pub struct RangeMetadata {
    pub range_id: String,
    pub display_name: String,
    pub description: String,
    pub created_at: String,
    pub last_modified: String,
    pub owner: String,
    pub tags: HashMap<String, String>,
    pub status: RangeStatus,
    pub provider_uri: Option<String>,
    pub ip_assignments: HashMap<String, String>,
    pub task_results: Vec<TaskResult>,
}

/// Persisted per-range resource ownership — `ranges_resources.json`. This is
/// the sole source of truth a provider may consult before reclaiming
/// anything; it may never garbage-collect a resource not listed here.
#[derive(Debug, Clone, Facet, Default)]
pub struct RangeResources {
    pub host_ids: Vec<String>,
    pub domain_names: Vec<String>,
    pub disk_paths: Vec<String>,
    pub network_names: Vec<String>,
    pub tunnel_ids: Vec<String>,
}

impl RangeResources {
    pub fn is_empty(&self) -> bool {
        self.host_ids.is_empty()
            && self.domain_names.is_empty()
            && self.disk_paths.is_empty()
            && self.network_names.is_empty()
            && self.tunnel_ids.is_empty()
    }
}

/// A published, SSH-reachable tuple fronting a specific guest instance.
#[derive(Debug, Clone, Facet)]
pub struct EntryPoint {
    pub range_id: String,
    pub instance_id: String,
    pub guest_id: String,
    pub published_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub account: String,
    pub password: String,
    pub tunnel_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum TunnelKind {
    Direct,
    GatewayMediated,
}

/// A tunnel's remote process markers, used for teardown (`pkill -f <marker>`).
#[derive(Debug, Clone, Facet)]
pub struct Tunnel {
    pub tunnel_id: String,
    pub kind: TunnelKind,
    pub markers: Vec<String>,
}

/// Per-domain discovered or requested placement, returned by the KVM
/// provider after a guest is cloned.
#[derive(Debug, Clone)]
pub struct ProvisionedGuest {
    pub guest_id: String,
    pub domain_name: String,
    pub disk_path: std::path::PathBuf,
    pub mac: String,
    pub ip: Option<String>,
}
