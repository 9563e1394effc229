//! KVM/libvirt provider: clones disks, renders domain definitions,
//! boots guests, discovers IPs, and reclaims resources through libvirt.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ssh_key::private::Ed25519Keypair;
use ssh_key::PrivateKey;
use virt::domain::Domain;
use virt::network::Network;

use crate::disk::{acl, image, overlay};
use crate::domain_xml::{self, DomainOverrides};
use crate::error::RangeError;
use crate::model::ProvisionedGuest;
use crate::paths;
use crate::provider::conn_cache::ConnectionCache;
use crate::provider::{CreateGuestSpec, Provider, ResourceInfo, ResourceStatus};
use crate::{cloudinit, qcow2};

/// Domain names minted by this provider always start with this prefix, so
/// `status()` can tell a domain this orchestrator owns from one libvirt
/// also happens to host.
pub const DOMAIN_PREFIX: &str = "cyris";

/// Base images smaller than this are treated as placeholders that must be
/// fetched/converted rather than cloned.
const TRIVIAL_IMAGE_BYTES: u64 = 1024 * 1024;

const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const BOOT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct KvmProvider {
    cache: Arc<ConnectionCache>,
    uri: String,
    cyber_range_dir: PathBuf,
    domain_type: String,
    machine: String,
    default_image_url: String,
    image_size_floor: String,
}

impl KvmProvider {
    pub fn new(uri: impl Into<String>, cyber_range_dir: PathBuf) -> Self {
        Self {
            cache: ConnectionCache::new(),
            uri: uri.into(),
            cyber_range_dir,
            domain_type: "kvm".into(),
            machine: "q35".into(),
            default_image_url:
                "https://cloud-images.ubuntu.com/releases/22.04/release/ubuntu-22.04-server-cloudimg-amd64.img"
                    .into(),
            image_size_floor: "10G".into(),
        }
    }

    /// Overrides the built-in default base image URL, e.g. from
    /// `EnvSettings::default_image_url` as set by `config-init`.
    pub fn set_default_image_url(&mut self, url: String) {
        self.default_image_url = url;
    }

    async fn ensure_overlay_source(&self, requested_base: Option<&Path>) -> Result<PathBuf, RangeError> {
        let cache_dir = paths::cache_dir();
        let candidate = match requested_base {
            Some(path) => path.to_path_buf(),
            None => image::ensure_base_image(&self.default_image_url, &cache_dir, &self.image_size_floor).await?,
        };

        let trivial = tokio::fs::metadata(&candidate)
            .await
            .map(|m| m.len() < TRIVIAL_IMAGE_BYTES)
            .unwrap_or(true);

        if trivial {
            image::ensure_base_image(&self.default_image_url, &cache_dir, &self.image_size_floor).await
        } else {
            Ok(candidate)
        }
    }

    async fn build_guest_disk(
        &self,
        range_id: &str,
        domain_name: &str,
        spec: &CreateGuestSpec,
    ) -> Result<(PathBuf, PathBuf), RangeError> {
        let disks_dir = paths::disks_dir(&self.cyber_range_dir, range_id);
        tokio::fs::create_dir_all(&disks_dir)
            .await
            .map_err(|e| RangeError::Io {
                context: format!("creating {}", disks_dir.display()),
                source: e,
            })?;

        let overlay_path = paths::overlay_path(&self.cyber_range_dir, range_id, domain_name);
        let requested_base = spec
            .basevm_config_file
            .as_ref()
            .map(|p| PathBuf::from(p).with_extension("qcow2"));

        match self.ensure_overlay_source(requested_base.as_deref()).await {
            Ok(base) => {
                overlay::create_overlay(&base, &overlay_path).await?;
                overlay::resize_overlay(&overlay_path, &spec.disk_size).await?;
            }
            Err(_) => qcow2::create_qcow2(&overlay_path, &spec.disk_size)?,
        }

        if acl::is_system_uri(&self.uri) {
            let range_dir = paths::range_dir(&self.cyber_range_dir, range_id);
            acl::grant_system_access(&range_dir, &overlay_path).await?;
        }

        let key_path = paths::operator_key_path(&self.cyber_range_dir);
        ensure_ssh_keypair(&key_path).await?;
        let authorized_keys = collect_ssh_keys(&key_path).await?;

        let mac = domain_xml::format_mac(mac_suffix(domain_name));
        let seed_path = paths::seed_path(&self.cyber_range_dir, range_id, domain_name);
        cloudinit::generate_seed_iso(&seed_path, domain_name, &mac, None, &authorized_keys).await?;

        Ok((overlay_path, seed_path))
    }

    async fn poll_until_running(&self, domain_name: &str) -> Result<(), RangeError> {
        let deadline = tokio::time::Instant::now() + BOOT_TIMEOUT;
        loop {
            let handle = self.cache.get(&self.uri)?;
            let running = Domain::lookup_by_name(&handle, domain_name)
                .ok()
                .map(|d| d.is_active().unwrap_or(false))
                .unwrap_or(false);
            drop(handle);
            if running {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RangeError::Timeout {
                    name: domain_name.to_string(),
                    reason: "domain did not reach RUNNING within 60s".into(),
                });
            }
            tokio::time::sleep(BOOT_POLL_INTERVAL).await;
        }
    }
}

fn mac_suffix(domain_name: &str) -> [u8; 3] {
    let mut hash: u32 = 5381;
    for b in domain_name.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    [(hash >> 16) as u8, (hash >> 8) as u8, hash as u8]
}

/// Generates an Ed25519 SSH keypair at `key_path` (+ `.pub`) if one doesn't
/// already exist, so every guest this orchestrator boots can be seeded with
/// the same operator public key and reached without a per-guest password.
async fn ensure_ssh_keypair(key_path: &Path) -> Result<(), RangeError> {
    if key_path.exists() {
        return Ok(());
    }

    if let Some(parent) = key_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| RangeError::Io {
                context: format!("creating directory {}", parent.display()),
                source: e,
            })?;
    }

    let keypair = Ed25519Keypair::random(&mut rand_core::OsRng);
    let private = PrivateKey::from(keypair);

    let openssh_private = private
        .to_openssh(ssh_key::LineEnding::LF)
        .map_err(|e| RangeError::Io {
            context: format!("encoding SSH private key: {e}"),
            source: std::io::Error::other(e.to_string()),
        })?;
    tokio::fs::write(key_path, openssh_private.as_bytes())
        .await
        .map_err(|e| RangeError::Io {
            context: format!("writing SSH key to {}", key_path.display()),
            source: e,
        })?;

    // OpenSSH refuses keys with open permissions.
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| RangeError::Io {
                context: format!("setting permissions on {}", key_path.display()),
                source: e,
            })?;
    }

    let pub_key = private.public_key().to_openssh().map_err(|e| RangeError::Io {
        context: format!("encoding SSH public key: {e}"),
        source: std::io::Error::other(e.to_string()),
    })?;
    let pub_path = key_path.with_extension("pub");
    tokio::fs::write(&pub_path, pub_key.as_bytes())
        .await
        .map_err(|e| RangeError::Io {
            context: format!("writing SSH public key to {}", pub_path.display()),
            source: e,
        })?;

    tracing::info!(path = %key_path.display(), "generated operator SSH keypair");
    Ok(())
}

/// Reads the auto-generated operator public key for injection into a
/// guest's cloud-init `ssh_authorized_keys`.
async fn collect_ssh_keys(key_path: &Path) -> Result<Vec<String>, RangeError> {
    let pub_path = key_path.with_extension("pub");
    let pub_key = tokio::fs::read_to_string(&pub_path)
        .await
        .map_err(|e| RangeError::Io {
            context: format!("reading SSH public key from {}", pub_path.display()),
            source: e,
        })?;
    Ok(vec![pub_key.trim().to_string()])
}

fn unique_domain_name(guest_id: &str, suffix_seed: &str) -> String {
    let mut hash: u64 = 14695981039346656037;
    for b in suffix_seed.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    format!("{DOMAIN_PREFIX}-{guest_id}-{:08x}", hash as u32)
}

fn is_running(dom: &Domain) -> bool {
    dom.is_active().unwrap_or(false)
}

impl Provider for KvmProvider {
    async fn create_hosts(&self, _hosts: &[crate::model::Host]) -> Result<(), RangeError> {
        // A single operator host is assumed; nothing to provision beyond
        // what's already reachable.
        Ok(())
    }

    async fn destroy_hosts(&self, _hosts: &[crate::model::Host]) -> Result<(), RangeError> {
        Ok(())
    }

    async fn create_guests(
        &self,
        range_id: &str,
        specs: &[CreateGuestSpec],
    ) -> Result<Vec<ProvisionedGuest>, RangeError> {
        let mut provisioned = Vec::with_capacity(specs.len());
        for spec in specs {
            let guest = self.clone_vm(range_id, spec).await?;
            provisioned.push(guest);
        }
        Ok(provisioned)
    }

    async fn clone_vm(
        &self,
        range_id: &str,
        spec: &CreateGuestSpec,
    ) -> Result<ProvisionedGuest, RangeError> {
        let domain_name = unique_domain_name(&spec.guest_id, &format!("{range_id}:{}", spec.guest_id));
        let (disk_path, seed_path) = self.build_guest_disk(range_id, &domain_name, spec).await?;

        let mac = domain_xml::format_mac(mac_suffix(&domain_name));
        // Each NIC gets its own unique MAC derived from the domain name and
        // its index; a caller-supplied mac on `spec.interfaces` is only a
        // mode carrier (network/bridge/user) since the real MAC can't be
        // known before the domain name is minted above.
        let interfaces = if spec.interfaces.is_empty() {
            vec![domain_xml::NicOverride {
                mac: mac.clone(),
                mode: domain_xml::InterfaceMode::User,
            }]
        } else {
            spec.interfaces
                .iter()
                .enumerate()
                .map(|(i, nic)| domain_xml::NicOverride {
                    mac: if i == 0 {
                        mac.clone()
                    } else {
                        domain_xml::format_mac(mac_suffix(&format!("{domain_name}#{i}")))
                    },
                    mode: nic.mode.clone(),
                })
                .collect()
        };

        let overrides = DomainOverrides {
            name: domain_name.clone(),
            uuid: uuid_from(&domain_name),
            domain_type: self.domain_type.clone(),
            machine: self.machine.clone(),
            memory_kib: spec.memory_kib,
            vcpus: spec.vcpus,
            disk_path: disk_path.clone(),
            seed_path: Some(seed_path),
            interfaces,
        };
        let xml = domain_xml::generate_domain_xml(&overrides, None);

        let handle = self.cache.get(&self.uri)?;
        let dom = Domain::define_xml(&handle, &xml).map_err(|e| RangeError::Virtualization {
            operation: "define_domain".into(),
            message: e.to_string(),
            hint: "check the generated domain XML for errors".into(),
        })?;
        dom.create().map_err(|e| RangeError::Virtualization {
            operation: "start_domain".into(),
            message: e.to_string(),
            hint: "check `virsh` logs for the domain's boot failure".into(),
        })?;
        drop(handle);

        self.poll_until_running(&domain_name).await?;

        Ok(ProvisionedGuest {
            guest_id: spec.guest_id.clone(),
            domain_name,
            disk_path,
            mac,
            ip: None,
        })
    }

    async fn destroy_guests(&self, domain_names: &[String]) -> Result<(), RangeError> {
        for name in domain_names {
            let handle = self.cache.get(&self.uri)?;
            let Ok(dom) = Domain::lookup_by_name(&handle, name) else {
                tracing::info!(domain = name, "domain already absent, treating as destroyed");
                continue;
            };
            if is_running(&dom) {
                dom.destroy().map_err(|e| RangeError::Virtualization {
                    operation: "stop_domain".into(),
                    message: e.to_string(),
                    hint: "check libvirt permissions".into(),
                })?;
            }
            let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
            while is_running(&dom) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            dom.undefine().map_err(|e| RangeError::Virtualization {
                operation: "undefine_domain".into(),
                message: e.to_string(),
                hint: "check libvirt permissions".into(),
            })?;
        }
        Ok(())
    }

    async fn status(&self, domain_names: &[String]) -> HashMap<String, ResourceStatus> {
        let mut result = HashMap::with_capacity(domain_names.len());
        let Ok(handle) = self.cache.get(&self.uri) else {
            for name in domain_names {
                result.insert(name.clone(), ResourceStatus::Error);
            }
            return result;
        };
        for name in domain_names {
            let status = match Domain::lookup_by_name(&handle, name) {
                Ok(dom) => match dom.get_state() {
                    Ok((state, _)) => match state {
                        virt::sys::VIR_DOMAIN_RUNNING => ResourceStatus::Active,
                        virt::sys::VIR_DOMAIN_SHUTOFF => ResourceStatus::Stopped,
                        virt::sys::VIR_DOMAIN_PAUSED => ResourceStatus::Paused,
                        _ => ResourceStatus::Unknown,
                    },
                    Err(_) => ResourceStatus::Unknown,
                },
                Err(_) => ResourceStatus::NotFound,
            };
            result.insert(name.clone(), status);
        }
        result
    }

    async fn resource_info(&self, domain_name: &str) -> Result<ResourceInfo, RangeError> {
        let handle = self.cache.get(&self.uri)?;
        let dom = Domain::lookup_by_name(&handle, domain_name).map_err(|_| RangeError::DomainNotFound {
            name: domain_name.to_string(),
        })?;
        let info = dom.get_info().map_err(|e| RangeError::Virtualization {
            operation: "get_info".into(),
            message: e.to_string(),
            hint: String::new(),
        })?;
        Ok(ResourceInfo {
            domain_name: domain_name.to_string(),
            memory_kib: info.max_mem,
            vcpus: info.nr_virt_cpu,
            ip: None,
        })
    }

    async fn get_vm_ip(&self, domain_name: &str, mac: &str) -> Result<String, RangeError> {
        let handle = self.cache.get(&self.uri)?;
        let dom = Domain::lookup_by_name(&handle, domain_name).map_err(|_| RangeError::DomainNotFound {
            name: domain_name.to_string(),
        })?;

        if let Ok(ifaces) =
            dom.interface_addresses(virt::sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE, 0)
        {
            for iface in &ifaces {
                if iface.hwaddr.eq_ignore_ascii_case(mac) {
                    for addr in &iface.addrs {
                        if addr.typed == 0 && is_usable(&addr.addr) {
                            return Ok(addr.addr.clone());
                        }
                    }
                }
            }
        }
        drop(handle);

        if let Some(ip) = virsh_domifaddr(domain_name, mac).await {
            return Ok(ip);
        }

        if let Some(ip) = arp_lookup(mac).await {
            return Ok(ip);
        }

        Err(RangeError::Timeout {
            name: domain_name.to_string(),
            reason: "no IP address found via DHCP leases, virsh, or ARP".into(),
        })
    }

    async fn get_ssh_info(
        &self,
        domain_name: &str,
        mac: &str,
        account: &str,
    ) -> Result<(String, u16, String), RangeError> {
        let ip = self.get_vm_ip(domain_name, mac).await?;
        Ok((ip, 22, account.to_string()))
    }
}

fn is_usable(addr: &str) -> bool {
    addr.parse::<std::net::Ipv4Addr>()
        .map(|ip| !ip.is_loopback() && !ip.is_link_local())
        .unwrap_or(false)
}

/// Fallback IP discovery via the `virsh` CLI's `domifaddr`, for libvirt
/// builds where the API call above is unavailable.
async fn virsh_domifaddr(domain_name: &str, mac: &str) -> Option<String> {
    let output = tokio::process::Command::new("virsh")
        .args(["domifaddr", domain_name])
        .output()
        .await
        .ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    for line in text.lines() {
        if line.to_ascii_lowercase().contains(&mac.to_ascii_lowercase()) {
            if let Some(cidr) = line.split_whitespace().last() {
                return cidr.split('/').next().map(String::from);
            }
        }
    }
    None
}

/// Last-resort fallback: a bounded ARP table scan filtered by MAC — a
/// heuristic, not a contract, kept within a small time budget.
async fn arp_lookup(mac: &str) -> Option<String> {
    let output = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::process::Command::new("arp").args(["-an"]).output(),
    )
    .await
    .ok()?
    .ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    for line in text.lines() {
        if line.to_ascii_lowercase().contains(&mac.to_ascii_lowercase()) {
            if let Some(start) = line.find('(') {
                if let Some(end) = line[start..].find(')') {
                    return Some(line[start + 1..start + end].to_string());
                }
            }
        }
    }
    None
}

/// Checks whether `bridge` exists as a host network interface, via `ip
/// link show` — the same check the network-mode policy needs before it
/// can safely attach a guest to an existing bridge instead of falling
/// back to the default libvirt network.
pub async fn bridge_exists_on_host(bridge: &str) -> bool {
    tokio::process::Command::new("ip")
        .args(["link", "show", bridge])
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn uuid_from(domain_name: &str) -> String {
    let mut hash: u64 = 14695981039346656037;
    for b in domain_name.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    let hi = hash;
    let lo = hash.rotate_left(17) ^ 0xA5A5_A5A5_A5A5_A5A5;
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        (hi >> 32) as u32,
        (hi >> 16) as u16,
        hi as u16,
        (lo >> 48) as u16,
        lo & 0xFFFF_FFFF_FFFF
    )
}

/// Ensures a libvirt network is defined (auto-declaring it if absent) and
/// active, then installs a DHCP host reservation for every statically
/// assigned guest in it. Used by the topology engine when wiring a range.
pub async fn ensure_network(uri: &str, plan: &crate::network_xml::NetworkPlan) -> Result<(), RangeError> {
    let cache = ConnectionCache::new();
    let handle = cache.get(uri)?;
    let net = match Network::lookup_by_name(&handle, &plan.name) {
        Ok(net) => net,
        Err(_) => {
            let xml = crate::network_xml::generate_network_xml(plan);
            Network::define_xml(&handle, &xml).map_err(|e| RangeError::Network {
                operation: "define_network".into(),
                message: e.to_string(),
            })?
        }
    };
    if !net.is_active().unwrap_or(false) {
        net.create().map_err(|e| RangeError::Network {
            operation: "start_network".into(),
            message: e.to_string(),
        })?;
    }
    Ok(())
}

pub async fn destroy_network(uri: &str, network_name: &str) -> Result<(), RangeError> {
    let cache = ConnectionCache::new();
    let handle = cache.get(uri)?;
    if let Ok(net) = Network::lookup_by_name(&handle, network_name) {
        if net.is_active().unwrap_or(false) {
            let _ = net.destroy();
        }
        let _ = net.undefine();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_domain_names_differ_by_guest() {
        let a = unique_domain_name("g1", "101:g1");
        let b = unique_domain_name("g2", "101:g2");
        assert_ne!(a, b);
        assert!(a.starts_with("cyris-g1-"));
    }

    #[test]
    fn unique_domain_names_stable_for_same_input() {
        let a = unique_domain_name("g1", "101:g1");
        let b = unique_domain_name("g1", "101:g1");
        assert_eq!(a, b);
    }

    #[test]
    fn mac_suffix_is_deterministic() {
        assert_eq!(mac_suffix("cyris-g1-abcd1234"), mac_suffix("cyris-g1-abcd1234"));
    }

    #[test]
    fn uuid_from_name_has_canonical_shape() {
        let u = uuid_from("cyris-g1-abcd1234");
        assert_eq!(u.len(), 36);
        assert_eq!(u.chars().filter(|c| *c == '-').count(), 4);
    }

    #[test]
    fn is_usable_rejects_loopback_and_link_local() {
        assert!(!is_usable("127.0.0.1"));
        assert!(!is_usable("169.254.1.1"));
        assert!(is_usable("192.168.1.50"));
    }
}
