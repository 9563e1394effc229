//! Create flow: ∅ → CREATING → ACTIVE (or ERROR on any failing
//! step, with best-effort partial cleanup).

use std::collections::HashMap;
use std::sync::Arc;

use crate::cli::NetworkModeArg;
use crate::config::EnvSettings;
use crate::domain_xml::{self, NicOverride};
use crate::error::RangeError;
use crate::gateway::{AccessNotification, GatewayService};
use crate::logging::utc_timestamp;
use crate::model::{
    CloneSettings, Description, GuestTemplate, Host, HostClone, RangeMetadata, RangeResources, RangeStatus, Task,
    TaskResult, Topology,
};
use crate::provider::kvm::{self, KvmProvider};
use crate::provider::{CreateGuestSpec, Provider};
use crate::registry::Registry;
use crate::ssh::{Credentials, Dial, SshPool};
use crate::tasks::{self, GuestContext};
use crate::topology;

const DEFAULT_MEMORY_KIB: u64 = 2 * 1024 * 1024;
const DEFAULT_VCPUS: u32 = 2;
const DEFAULT_DISK_SIZE: &str = "10G";
const TASK_FANOUT: usize = 4;

pub struct CreateContext<'a> {
    pub registry: &'a Registry,
    pub provider: &'a KvmProvider,
    pub settings: &'a EnvSettings,
    pub gateway: &'a GatewayService,
    pub ssh_pool: &'a Arc<SshPool>,
}

pub struct CreateOutcome {
    pub metadata: RangeMetadata,
    pub notification: AccessNotification,
    pub dry_run: bool,
}

/// Picks the clone settings entry to act on: the one matching an explicit
/// `--range-id` override, or the sole entry when there is exactly one
/// (multi-range description files are out of scope for a single `create`
/// invocation — see DESIGN.md).
fn pick_clone_settings<'a>(
    description: &'a Description,
    range_id_override: Option<&str>,
) -> Result<&'a CloneSettings, RangeError> {
    if let Some(id) = range_id_override {
        return description
            .clone_settings
            .iter()
            .find(|c| c.range_id == id)
            .ok_or_else(|| RangeError::Validation {
                message: format!("no clone_settings entry for range id '{id}'"),
            });
    }
    match description.clone_settings.len() {
        1 => Ok(&description.clone_settings[0]),
        0 => Err(RangeError::Validation {
            message: "description has no clone_settings entries".into(),
        }),
        _ => Err(RangeError::Validation {
            message: "description has multiple clone_settings entries; pass --range-id to pick one".into(),
        }),
    }
}

/// Suffix applied to a base guest id for host-instance `instance` (1-based,
/// from `HostClone::instance_number`) and guest-replica `replica` (1-based,
/// from `GuestClone::number`). `(1, 1)` is the unreplicated case and gets
/// no suffix at all, so a description with `instance_number: 1` and
/// `number: 1` everywhere expands to exactly the ids it named.
fn replica_suffix(instance: u32, replica: u32) -> String {
    match (instance, replica) {
        (1, 1) => String::new(),
        (1, r) => format!("~{r}"),
        (i, 1) => format!("@{i}"),
        (i, r) => format!("@{i}~{r}"),
    }
}

/// Expands `instance_number`/`number` replication into extra guest
/// template instances and mirrors them into the topology's network
/// membership lists so replicas attach to the same networks as their base
/// guest. `instance_number` multiplies an entire host's guest set (spec.md
/// §3's per-host replication factor); `number` multiplies a single guest
/// within each of those host instances. Replicas never inherit a preset
/// static IP; they're assigned the next free address in their network.
/// Returns, alongside the expanded guests and topology, a map from each
/// expanded guest id to its 1-based host-instance number, so callers can
/// derive a real `EntryPoint.instance_id` instead of reusing `guest_id`.
fn expand_replicas(
    host_clone: &HostClone,
    guest_templates: &HashMap<&str, &GuestTemplate>,
) -> Result<(Vec<GuestTemplate>, HashMap<String, u32>, Topology), RangeError> {
    let host_instances = host_clone.instance_number.max(1);
    let mut expanded_guests = Vec::new();
    let mut instance_of: HashMap<String, u32> = HashMap::new();
    let mut replica_counts: HashMap<String, u32> = HashMap::new();

    for guest_clone in &host_clone.guests {
        let template = guest_templates
            .get(guest_clone.guest_id.as_str())
            .ok_or_else(|| RangeError::Validation {
                message: format!("guest_settings has no entry for '{}'", guest_clone.guest_id),
            })?;
        let count = guest_clone.number.max(1);
        replica_counts.insert(guest_clone.guest_id.clone(), count);
        for instance in 1..=host_instances {
            for replica in 1..=count {
                let mut expanded = (*template).clone();
                let suffix = replica_suffix(instance, replica);
                if !suffix.is_empty() {
                    expanded.id = format!("{}{suffix}", guest_clone.guest_id);
                    expanded.ip_addr = None;
                }
                instance_of.insert(expanded.id.clone(), instance);
                expanded_guests.push(expanded);
            }
        }
    }

    let mut expanded_topology = host_clone.topology.clone();
    for network in &mut expanded_topology.networks {
        let mut extra = Vec::new();
        for member in &network.members {
            let (base, nic) = member.split_once('.').unwrap_or((member.as_str(), ""));
            if let Some(&count) = replica_counts.get(base) {
                for instance in 1..=host_instances {
                    for replica in 1..=count {
                        let suffix = replica_suffix(instance, replica);
                        if !suffix.is_empty() {
                            extra.push(format!("{base}{suffix}.{nic}"));
                        }
                    }
                }
            }
        }
        network.members.extend(extra);
    }

    Ok((expanded_guests, instance_of, expanded_topology))
}

/// Decides NIC attachment for a guest per spec.md §4.4's network-mode
/// policy table (`domain_xml::network_mode_for`): the CLI's requested
/// mode only ever offers an existing bridge when the guest's own
/// base-VM config declares one, and only session-scoped libvirt URIs
/// ever get to use it.
async fn build_interfaces(
    mac: &str,
    network_mode: NetworkModeArg,
    enable_ssh: bool,
    basevm_config_file: Option<&str>,
    libvirt_uri: &str,
) -> Vec<NicOverride> {
    let requested_bridge = if network_mode == NetworkModeArg::Bridge {
        match basevm_config_file {
            Some(path) => tokio::fs::read_to_string(path)
                .await
                .ok()
                .and_then(|xml| domain_xml::extract_template_bridge(&xml)),
            None => None,
        }
    } else {
        None
    };

    let bridge_exists = match &requested_bridge {
        Some(bridge) => kvm::bridge_exists_on_host(bridge).await,
        None => false,
    };

    let mode = domain_xml::network_mode_for(
        enable_ssh,
        requested_bridge.as_deref(),
        crate::disk::acl::is_system_uri(libvirt_uri),
        bridge_exists,
    );
    vec![NicOverride {
        mac: mac.to_string(),
        mode,
    }]
}

/// Runs the create flow. On success the range is ACTIVE in the registry;
/// on failure it is ERROR with whatever resources were already recorded,
/// and a best-effort cleanup of those resources has already been
/// attempted. `dry_run` performs every
/// validation step and issues no libvirt calls, registry writes, or file
/// writes at all.
pub async fn run(
    ctx: &CreateContext<'_>,
    description: &Description,
    range_id_override: Option<String>,
    dry_run: bool,
    network_mode: NetworkModeArg,
    enable_ssh: bool,
) -> Result<CreateOutcome, RangeError> {
    let clone = pick_clone_settings(description, range_id_override.as_deref())?;
    let range_id = range_id_override.unwrap_or_else(|| clone.range_id.clone());

    let guest_by_id: HashMap<&str, &GuestTemplate> =
        description.guest_settings.iter().map(|g| (g.id.as_str(), g)).collect();
    let host_by_id: HashMap<&str, &Host> = description.host_settings.iter().map(|h| (h.id.as_str(), h)).collect();

    if dry_run {
        for host_clone in &clone.hosts {
            if !host_by_id.contains_key(host_clone.host_id.as_str()) {
                return Err(RangeError::Validation {
                    message: format!("host_settings has no entry for '{}'", host_clone.host_id),
                });
            }
            let (expanded_guests, _instance_of, expanded_topology) = expand_replicas(host_clone, &guest_by_id)?;
            topology::plan_topology(&range_id, &expanded_topology, &expanded_guests)?;
        }
        return Ok(CreateOutcome {
            metadata: preview_metadata(&range_id),
            notification: AccessNotification { lines: vec![] },
            dry_run: true,
        });
    }

    if ctx.registry.exists(&range_id) {
        return Err(RangeError::RangeExists { range_id });
    }

    let now = utc_timestamp();
    ctx.registry.insert_new(RangeMetadata {
        range_id: range_id.clone(),
        display_name: range_id.clone(),
        description: String::new(),
        created_at: now.clone(),
        last_modified: now,
        owner: ctx.settings.user_email.clone(),
        tags: HashMap::new(),
        status: RangeStatus::Creating,
        provider_uri: Some(ctx.settings.libvirt_uri.clone()),
        ip_assignments: HashMap::new(),
        task_results: vec![],
    })?;

    let range_dir = crate::paths::range_dir(std::path::Path::new(&ctx.settings.cyber_range_dir), &range_id);
    tokio::fs::create_dir_all(&range_dir)
        .await
        .map_err(|e| RangeError::Io {
            context: format!("creating {}", range_dir.display()),
            source: e,
        })?;

    match provision(ctx, &range_id, &range_dir, clone, &guest_by_id, &host_by_id, network_mode, enable_ssh).await {
        Ok((resources, ip_assignments, task_results, entry_points)) => {
            let notification = ctx.gateway.access_notification(&entry_points);
            ctx.registry.update_metadata(&range_id, |m| {
                m.status = RangeStatus::Active;
                m.ip_assignments = ip_assignments;
                m.task_results = task_results;
                m.last_modified = utc_timestamp();
            })?;
            ctx.registry.update_resources(&range_id, |r| *r = resources)?;
            Ok(CreateOutcome {
                metadata: ctx.registry.get_metadata(&range_id).expect("range just written"),
                notification,
                dry_run: false,
            })
        }
        Err((error, resources)) => {
            crate::orchestrator::safe::safe_execute_or(
                "cleanup_after_create_failure",
                &range_id,
                (),
                cleanup_resources(ctx, &range_id, &resources),
            )
            .await;
            ctx.registry.update_resources(&range_id, |r| *r = resources)?;
            ctx.registry.update_metadata(&range_id, |m| {
                m.status = RangeStatus::Error;
                m.last_modified = utc_timestamp();
            })?;
            Err(error)
        }
    }
}

fn preview_metadata(range_id: &str) -> RangeMetadata {
    RangeMetadata {
        range_id: range_id.to_string(),
        display_name: range_id.to_string(),
        description: String::new(),
        created_at: String::new(),
        last_modified: String::new(),
        owner: String::new(),
        tags: HashMap::new(),
        status: RangeStatus::Creating,
        provider_uri: None,
        ip_assignments: HashMap::new(),
        task_results: vec![],
    }
}

type ProvisionOutcome = (
    RangeResources,
    HashMap<String, String>,
    Vec<TaskResult>,
    Vec<crate::model::EntryPoint>,
);

/// The fallible body of range creation, separated from `run` so the
/// caller can capture however much of `RangeResources` was recorded
/// before the failure and clean those specific resources up.
async fn provision(
    ctx: &CreateContext<'_>,
    range_id: &str,
    range_dir: &std::path::Path,
    clone: &CloneSettings,
    guest_by_id: &HashMap<&str, &GuestTemplate>,
    host_by_id: &HashMap<&str, &Host>,
    network_mode: NetworkModeArg,
    enable_ssh: bool,
) -> Result<ProvisionOutcome, (RangeError, RangeResources)> {
    let mut resources = RangeResources::default();
    let mut ip_assignments = HashMap::new();
    let mut task_results = Vec::new();
    let mut entry_points = Vec::new();

    for host_clone in &clone.hosts {
        let host = match host_by_id.get(host_clone.host_id.as_str()) {
            Some(h) => *h,
            None => {
                return Err((
                    RangeError::Validation {
                        message: format!("host_settings has no entry for '{}'", host_clone.host_id),
                    },
                    resources,
                ))
            }
        };

        let (expanded_guests, instance_of, expanded_topology) = match expand_replicas(host_clone, guest_by_id) {
            Ok(v) => v,
            Err(e) => return Err((e, resources)),
        };
        let plan = match topology::plan_topology(range_id, &expanded_topology, &expanded_guests) {
            Ok(p) => p,
            Err(e) => return Err((e, resources)),
        };
        ip_assignments.extend(plan.ip_assignments.clone());
        resources.host_ids.push(host.id.clone());

        for network in &plan.networks {
            if let Err(e) = crate::orchestrator::safe::safe_execute(
                "ensure_network",
                range_id,
                kvm::ensure_network(&ctx.settings.libvirt_uri, network),
            )
            .await
            {
                return Err((e, resources));
            }
            resources.network_names.push(network.name.clone());
        }

        let mut specs = Vec::with_capacity(expanded_guests.len());
        for guest in &expanded_guests {
            let placeholder_mac = "52:54:00:00:00:00";
            specs.push(CreateGuestSpec {
                guest_id: guest.id.clone(),
                basevm_config_file: guest.basevm_config_file.clone(),
                host: host.clone(),
                memory_kib: DEFAULT_MEMORY_KIB,
                vcpus: DEFAULT_VCPUS,
                disk_size: DEFAULT_DISK_SIZE.into(),
                interfaces: build_interfaces(
                    placeholder_mac,
                    network_mode,
                    enable_ssh,
                    guest.basevm_config_file.as_deref(),
                    &ctx.settings.libvirt_uri,
                )
                .await,
                seed_user_data: String::new(),
            });
        }

        let provisioned = match crate::orchestrator::safe::safe_execute(
            "create_guests",
            range_id,
            ctx.provider.create_guests(range_id, &specs),
        )
        .await
        {
            Ok(p) => p,
            Err(e) => return Err((e, resources)),
        };
        resources
            .domain_names
            .extend(provisioned.iter().map(|p| p.domain_name.clone()));
        resources
            .disk_paths
            .extend(provisioned.iter().map(|p| p.disk_path.display().to_string()));

        let mut guest_runs = Vec::with_capacity(provisioned.len());
        for guest in &provisioned {
            let ip = ctx
                .provider
                .get_vm_ip(&guest.domain_name, &guest.mac)
                .await
                .unwrap_or_else(|_| plan.ip_assignments.get(&guest.guest_id).cloned().unwrap_or_default());
            ip_assignments.insert(guest.guest_id.clone(), ip.clone());

            let Some(template) = guest_by_id.get(base_id(&guest.guest_id)) else {
                continue;
            };
            let dial = Dial {
                key: tasks::session_key(&ip, 22, "ubuntu"),
                creds: template
                    .root_passwd
                    .clone()
                    .map(Credentials::Password)
                    .unwrap_or_else(|| Credentials::KeyPath(crate::paths::operator_key_path(std::path::Path::new(&ctx.settings.cyber_range_dir)))),
            };
            let gctx = GuestContext {
                pool: ctx.ssh_pool.clone(),
                dial,
                guest_id: guest.guest_id.clone(),
                basevm_type: format!("{:?}", template.basevm_type),
                os_type: template.basevm_os_type.clone(),
                logs_dir: range_dir.join("logs"),
            };
            let tasks_for_guest: Vec<Task> = template.tasks.clone();
            guest_runs.push((gctx, tasks_for_guest));

            if host_clone
                .guests
                .iter()
                .any(|gc| gc.guest_id == base_id(&guest.guest_id) && gc.entry_point)
            {
                let instance_id = instance_of
                    .get(&guest.guest_id)
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| guest.guest_id.clone());
                match ctx
                    .gateway
                    .publish_entry_point(range_id, &instance_id, &guest.guest_id, &ip, 22, "ubuntu", &utc_timestamp())
                    .await
                {
                    Ok(entry) => {
                        resources.tunnel_ids.push(entry.tunnel_id.clone());
                        entry_points.push(entry);
                    }
                    Err(e) => return Err((e, resources)),
                }
            }
        }

        task_results.extend(tasks::execute_all(guest_runs, TASK_FANOUT).await);
    }

    Ok((resources, ip_assignments, task_results, entry_points))
}

/// Strips both the guest-replica (`~N`) and host-instance (`@N`) suffixes
/// `expand_replicas` appends, recovering the `guest_settings`/`GuestClone`
/// id an expanded guest was cloned from.
fn base_id(guest_id: &str) -> &str {
    let stripped = guest_id.split('~').next().unwrap_or(guest_id);
    stripped.split('@').next().unwrap_or(stripped)
}

async fn cleanup_resources(ctx: &CreateContext<'_>, range_id: &str, resources: &RangeResources) -> Result<(), RangeError> {
    if !resources.domain_names.is_empty() {
        ctx.provider.destroy_guests(&resources.domain_names).await?;
    }
    for network_name in &resources.network_names {
        let _ = kvm::destroy_network(&ctx.settings.libvirt_uri, network_name).await;
    }
    tracing::warn!(range_id, "cleaned up partially created range after failure");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BaseVmKind, GuestClone, NetworkDecl};

    fn host(id: &str) -> Host {
        Host {
            id: id.into(),
            mgmt_addr: "10.0.0.1".into(),
            virbr_addr: "192.168.122.1".into(),
            account: "root".into(),
        }
    }

    fn template(id: &str) -> GuestTemplate {
        GuestTemplate {
            id: id.into(),
            basevm_host: "h1".into(),
            basevm_config_file: None,
            basevm_type: BaseVmKind::Kvm,
            basevm_os_type: "linux".into(),
            ip_addr: None,
            root_passwd: None,
            tasks: vec![],
        }
    }

    #[test]
    fn pick_clone_settings_with_single_entry() {
        let description = Description {
            host_settings: vec![],
            guest_settings: vec![],
            clone_settings: vec![CloneSettings {
                range_id: "101".into(),
                hosts: vec![],
            }],
        };
        let picked = pick_clone_settings(&description, None).unwrap();
        assert_eq!(picked.range_id, "101");
    }

    #[test]
    fn pick_clone_settings_requires_override_when_ambiguous() {
        let description = Description {
            host_settings: vec![],
            guest_settings: vec![],
            clone_settings: vec![
                CloneSettings {
                    range_id: "101".into(),
                    hosts: vec![],
                },
                CloneSettings {
                    range_id: "102".into(),
                    hosts: vec![],
                },
            ],
        };
        assert!(pick_clone_settings(&description, None).is_err());
        assert_eq!(pick_clone_settings(&description, Some("102")).unwrap().range_id, "102");
    }

    #[test]
    fn expand_replicas_mirrors_members_into_network() {
        let guests: HashMap<&str, &GuestTemplate> = {
            let t = Box::leak(Box::new(template("desktop")));
            let mut m = HashMap::new();
            m.insert("desktop", &*t);
            m
        };
        let host_clone = HostClone {
            host_id: "h1".into(),
            instance_number: 1,
            guests: vec![GuestClone {
                guest_id: "desktop".into(),
                number: 3,
                entry_point: false,
            }],
            topology: Topology {
                networks: vec![NetworkDecl {
                    name: "office".into(),
                    members: vec!["desktop.eth0".into()],
                    gateway_member: None,
                    subnet: None,
                }],
                forwarding_rules: vec![],
            },
        };
        let (expanded_guests, instance_of, expanded_topology) = expand_replicas(&host_clone, &guests).unwrap();
        assert_eq!(expanded_guests.len(), 3);
        assert_eq!(expanded_topology.networks[0].members.len(), 3);
        assert!(expanded_topology.networks[0].members.contains(&"desktop~2.eth0".to_string()));
        assert!(instance_of.values().all(|&n| n == 1));
    }

    #[test]
    fn expand_replicas_multiplies_guests_across_host_instances() {
        let guests: HashMap<&str, &GuestTemplate> = {
            let t = Box::leak(Box::new(template("desktop")));
            let mut m = HashMap::new();
            m.insert("desktop", &*t);
            m
        };
        let host_clone = HostClone {
            host_id: "h1".into(),
            instance_number: 2,
            guests: vec![GuestClone {
                guest_id: "desktop".into(),
                number: 1,
                entry_point: true,
            }],
            topology: Topology {
                networks: vec![NetworkDecl {
                    name: "office".into(),
                    members: vec!["desktop.eth0".into()],
                    gateway_member: None,
                    subnet: None,
                }],
                forwarding_rules: vec![],
            },
        };
        let (expanded_guests, instance_of, expanded_topology) = expand_replicas(&host_clone, &guests).unwrap();
        assert_eq!(expanded_guests.len(), 2);
        let ids: Vec<&str> = expanded_guests.iter().map(|g| g.id.as_str()).collect();
        assert!(ids.contains(&"desktop"));
        assert!(ids.contains(&"desktop@2"));
        assert_eq!(instance_of.get("desktop"), Some(&1));
        assert_eq!(instance_of.get("desktop@2"), Some(&2));
        assert_eq!(expanded_topology.networks[0].members.len(), 2);
        assert!(expanded_topology.networks[0].members.contains(&"desktop@2.eth0".to_string()));
    }

    #[test]
    fn expand_replicas_combines_host_instance_and_guest_replica_suffixes() {
        let guests: HashMap<&str, &GuestTemplate> = {
            let t = Box::leak(Box::new(template("desktop")));
            let mut m = HashMap::new();
            m.insert("desktop", &*t);
            m
        };
        let host_clone = HostClone {
            host_id: "h1".into(),
            instance_number: 2,
            guests: vec![GuestClone {
                guest_id: "desktop".into(),
                number: 2,
                entry_point: false,
            }],
            topology: Topology {
                networks: vec![],
                forwarding_rules: vec![],
            },
        };
        let (expanded_guests, instance_of, _) = expand_replicas(&host_clone, &guests).unwrap();
        let ids: Vec<&str> = expanded_guests.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["desktop", "desktop~2", "desktop@2", "desktop@2~2"]);
        assert_eq!(instance_of.get("desktop@2~2"), Some(&2));
    }

    #[test]
    fn base_id_strips_replica_suffix() {
        assert_eq!(base_id("desktop~2"), "desktop");
        assert_eq!(base_id("desktop"), "desktop");
        assert_eq!(base_id("desktop@2"), "desktop");
        assert_eq!(base_id("desktop@2~2"), "desktop");
    }

    #[allow(dead_code)]
    fn silence_unused(_h: Host) {}

    #[tokio::test]
    async fn user_network_mode_ignores_any_template_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let template_path = dir.path().join("base.xml");
        std::fs::write(&template_path, "<interface type='bridge'><source bridge='br0'/></interface>").unwrap();

        let nics = build_interfaces(
            "52:54:00:00:00:00",
            NetworkModeArg::User,
            false,
            Some(template_path.to_str().unwrap()),
            "qemu:///session",
        )
        .await;
        assert!(matches!(nics[0].mode, crate::domain_xml::InterfaceMode::User));
    }

    #[tokio::test]
    async fn enable_ssh_always_wins_regardless_of_network_mode() {
        let nics = build_interfaces("52:54:00:00:00:00", NetworkModeArg::User, true, None, "qemu:///session").await;
        assert!(matches!(nics[0].mode, crate::domain_xml::InterfaceMode::Network(ref n) if n == "default"));
    }

    #[tokio::test]
    async fn bridge_mode_on_system_uri_uses_default_network_not_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let template_path = dir.path().join("base.xml");
        std::fs::write(&template_path, "<interface type='bridge'><source bridge='br0'/></interface>").unwrap();

        let nics = build_interfaces(
            "52:54:00:00:00:00",
            NetworkModeArg::Bridge,
            false,
            Some(template_path.to_str().unwrap()),
            "qemu:///system",
        )
        .await;
        assert!(matches!(nics[0].mode, crate::domain_xml::InterfaceMode::Network(ref n) if n == "default"));
    }

    #[tokio::test]
    async fn bridge_mode_without_a_declared_template_bridge_falls_back_to_user() {
        let nics = build_interfaces(
            "52:54:00:00:00:00",
            NetworkModeArg::Bridge,
            false,
            None,
            "qemu:///session",
        )
        .await;
        assert!(matches!(nics[0].mode, crate::domain_xml::InterfaceMode::User));
    }
}
