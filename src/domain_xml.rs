//! Libvirt domain XML generation using facet-xml struct serialization.
//!
//! # Caveats (facet-xml v0.43)
//!
//! - **Compact output only.** Pretty-print (`to_string_pretty`) corrupts text
//!   nodes by inserting whitespace inside `<name>`, `<memory>`, etc.
//!   Tracked upstream: <https://github.com/facet-rs/facet/issues/1982>
//! - **No self-closing tags.** Attribute-only elements like `<boot dev="hd">`
//!   render as `<boot dev="hd"></boot>` instead of `<boot dev="hd"/>`.
//!   Libvirt accepts both forms, so this is cosmetic only.
//! - **`#[facet(flatten)]` is broken** for enum variants — double-wraps
//!   elements. Avoid for now; use separate optional struct fields instead.

use std::path::Path;

use facet::Facet;
use facet_xml as xml;

/// How a guest NIC attaches, per the network-mode policy. Exactly one
/// of the `Interface` struct's optional source fields is populated per
/// variant since facet-xml enum flattening is unusable here.
#[derive(Debug, Clone)]
pub enum InterfaceMode {
    /// `enable_ssh`, or `bridge` on a system URI: attach to the default
    /// libvirt network.
    Network(String),
    /// `bridge` on a session URI with an existing host bridge.
    Bridge(String),
    /// Isolated NAT, no source element.
    User,
}

#[derive(Debug, Clone)]
pub struct NicOverride {
    pub mac: String,
    pub mode: InterfaceMode,
}

/// Per-VM overrides always applied on top of a template, or used alone to
/// synthesise a minimal domain when no template is available.
#[derive(Debug, Clone)]
pub struct DomainOverrides {
    pub name: String,
    pub uuid: String,
    pub domain_type: String,
    pub machine: String,
    pub memory_kib: u64,
    pub vcpus: u32,
    pub disk_path: std::path::PathBuf,
    pub seed_path: Option<std::path::PathBuf>,
    pub interfaces: Vec<NicOverride>,
}

#[derive(Debug, Facet)]
#[facet(rename = "domain")]
struct Domain {
    #[facet(xml::attribute, rename = "type")]
    domain_type: String,
    name: String,
    uuid: String,
    memory: Memory,
    vcpu: u32,
    os: Os,
    features: Features,
    devices: Devices,
}

#[derive(Debug, Facet)]
struct Memory {
    #[facet(xml::attribute)]
    unit: String,
    #[facet(xml::text)]
    value: u64,
}

#[derive(Debug, Facet)]
struct Os {
    #[facet(rename = "type")]
    os_type: OsType,
    boot: Boot,
}

#[derive(Debug, Facet)]
#[facet(rename = "type")]
struct OsType {
    #[facet(xml::attribute)]
    arch: String,
    #[facet(xml::attribute)]
    machine: String,
    #[facet(xml::text)]
    value: String,
}

#[derive(Debug, Facet)]
struct Boot {
    #[facet(xml::attribute)]
    dev: String,
}

#[derive(Debug, Facet)]
struct Features {
    acpi: Empty,
    apic: Empty,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct Empty {}

#[derive(Debug, Facet)]
struct Devices {
    disk: Vec<Disk>,
    interface: Vec<Interface>,
    serial: Serial,
    console: Console,
    graphics: Graphics,
}

#[derive(Debug, Facet)]
struct Disk {
    #[facet(xml::attribute, rename = "type")]
    disk_type: String,
    #[facet(xml::attribute)]
    device: String,
    driver: DiskDriver,
    source: DiskSource,
    target: DiskTarget,
    #[facet(default)]
    readonly: Option<Empty>,
}

#[derive(Debug, Facet)]
struct DiskDriver {
    #[facet(xml::attribute)]
    name: String,
    #[facet(xml::attribute, rename = "type")]
    driver_type: String,
}

#[derive(Debug, Facet)]
struct DiskSource {
    #[facet(xml::attribute)]
    file: String,
}

#[derive(Debug, Facet)]
struct DiskTarget {
    #[facet(xml::attribute)]
    dev: String,
    #[facet(xml::attribute)]
    bus: String,
}

#[derive(Debug, Facet)]
struct Interface {
    #[facet(xml::attribute, rename = "type")]
    iface_type: String,
    mac: InterfaceMac,
    #[facet(default)]
    source: Option<InterfaceSource>,
    model: InterfaceModel,
}

#[derive(Debug, Facet)]
struct InterfaceMac {
    #[facet(xml::attribute)]
    address: String,
}

#[derive(Debug, Facet)]
struct InterfaceSource {
    #[facet(default, xml::attribute)]
    network: Option<String>,
    #[facet(default, xml::attribute)]
    bridge: Option<String>,
}

#[derive(Debug, Facet)]
struct InterfaceModel {
    #[facet(xml::attribute, rename = "type")]
    model_type: String,
}

#[derive(Debug, Facet)]
struct Serial {
    #[facet(xml::attribute, rename = "type")]
    serial_type: String,
    target: SerialTarget,
}

#[derive(Debug, Facet)]
#[facet(rename = "target")]
struct SerialTarget {
    #[facet(xml::attribute)]
    port: String,
}

#[derive(Debug, Facet)]
struct Console {
    #[facet(xml::attribute, rename = "type")]
    console_type: String,
    target: ConsoleTarget,
}

#[derive(Debug, Facet)]
#[facet(rename = "target")]
struct ConsoleTarget {
    #[facet(xml::attribute, rename = "type")]
    target_type: String,
    #[facet(xml::attribute)]
    port: String,
}

#[derive(Debug, Facet)]
struct Graphics {
    #[facet(xml::attribute, rename = "type")]
    graphics_type: String,
    #[facet(xml::attribute)]
    port: String,
    #[facet(xml::attribute)]
    listen: String,
}

fn interface_from(nic: &NicOverride) -> Interface {
    let (iface_type, source) = match &nic.mode {
        InterfaceMode::Network(name) => (
            "network",
            Some(InterfaceSource {
                network: Some(name.clone()),
                bridge: None,
            }),
        ),
        InterfaceMode::Bridge(bridge) => (
            "bridge",
            Some(InterfaceSource {
                network: None,
                bridge: Some(bridge.clone()),
            }),
        ),
        InterfaceMode::User => ("user", None),
    };
    Interface {
        iface_type: iface_type.into(),
        mac: InterfaceMac {
            address: nic.mac.clone(),
        },
        source,
        model: InterfaceModel {
            model_type: "virtio".into(),
        },
    }
}

/// Render a domain definition. `template_xml` is accepted for parity with
/// the "template plus overrides" model but this renderer always regenerates
/// devices from `overrides` rather than textually merging — every override
/// field is mandatory, so there is nothing left for a template to usefully
/// contribute beyond the machine type, which callers fold into `overrides`
/// before calling this.
pub fn generate_domain_xml(overrides: &DomainOverrides, _template_xml: Option<&str>) -> String {
    let disks = vec![
        Disk {
            disk_type: "file".into(),
            device: "disk".into(),
            driver: DiskDriver {
                name: "qemu".into(),
                driver_type: "qcow2".into(),
            },
            source: DiskSource {
                file: overrides.disk_path.display().to_string(),
            },
            target: DiskTarget {
                dev: "vda".into(),
                bus: "virtio".into(),
            },
            readonly: None,
        },
        Disk {
            disk_type: "file".into(),
            device: "cdrom".into(),
            driver: DiskDriver {
                name: "qemu".into(),
                driver_type: "raw".into(),
            },
            source: DiskSource {
                file: overrides
                    .seed_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            },
            target: DiskTarget {
                dev: "sda".into(),
                bus: "sata".into(),
            },
            readonly: Some(Empty {}),
        },
    ];

    let interfaces: Vec<Interface> = overrides.interfaces.iter().map(interface_from).collect();

    let domain = Domain {
        domain_type: overrides.domain_type.clone(),
        name: overrides.name.clone(),
        uuid: overrides.uuid.clone(),
        memory: Memory {
            unit: "KiB".into(),
            value: overrides.memory_kib,
        },
        vcpu: overrides.vcpus,
        os: Os {
            os_type: OsType {
                arch: "x86_64".into(),
                machine: overrides.machine.clone(),
                value: "hvm".into(),
            },
            boot: Boot { dev: "hd".into() },
        },
        features: Features {
            acpi: Empty {},
            apic: Empty {},
        },
        devices: Devices {
            disk: disks,
            interface: interfaces,
            serial: Serial {
                serial_type: "pty".into(),
                target: SerialTarget { port: "0".into() },
            },
            console: Console {
                console_type: "pty".into(),
                target: ConsoleTarget {
                    target_type: "serial".into(),
                    port: "0".into(),
                },
            },
            graphics: Graphics {
                graphics_type: "vnc".into(),
                port: "-1".into(),
                listen: "127.0.0.1".into(),
            },
        },
    };

    facet_xml::to_string(&domain).expect("domain XML serialization should not fail")
}

/// A fresh MAC in the QEMU/KVM OUI, derived from a caller-supplied random
/// suffix so callers control seeding/testability instead of this module
/// reaching for its own RNG.
pub fn format_mac(suffix: [u8; 3]) -> String {
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        suffix[0], suffix[1], suffix[2]
    )
}

/// Decide the NIC attachment mode for a guest NIC per the network-mode
/// policy table: `enable_ssh` wins outright, then bridge-vs-user-mode.
pub fn network_mode_for(
    enable_ssh: bool,
    requested_bridge: Option<&str>,
    is_system_uri: bool,
    bridge_exists_on_host: bool,
) -> InterfaceMode {
    if enable_ssh {
        return InterfaceMode::Network("default".into());
    }
    if let Some(bridge) = requested_bridge {
        if is_system_uri {
            return InterfaceMode::Network("default".into());
        }
        if bridge_exists_on_host {
            return InterfaceMode::Bridge(bridge.into());
        }
        return InterfaceMode::Network("default".into());
    }
    InterfaceMode::User
}

/// Pulls the bridge name out of a template domain XML's
/// `<interface type='bridge'>...<source bridge='NAME'/>` element, if the
/// template declares bridge networking at all. A small scan rather than a
/// full parse: templates come from arbitrary pre-existing libvirt configs
/// that won't necessarily round-trip through this module's own `Domain`
/// struct.
pub fn extract_template_bridge(template_xml: &str) -> Option<String> {
    let bridge_iface = template_xml
        .find("type='bridge'")
        .or_else(|| template_xml.find("type=\"bridge\""))?;
    let source_start = template_xml[bridge_iface..].find("<source")? + bridge_iface;
    let source_end = template_xml[source_start..].find('>')? + source_start;
    let source_tag = &template_xml[source_start..source_end];
    extract_attr(source_tag, "bridge")
}

fn extract_attr(tag: &str, name: &str) -> Option<String> {
    for quote in ['\'', '"'] {
        let needle = format!("{name}={quote}");
        if let Some(pos) = tag.find(&needle) {
            let after = &tag[pos + needle.len()..];
            if let Some(end) = after.find(quote) {
                return Some(after[..end].to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn overrides(interfaces: Vec<NicOverride>) -> DomainOverrides {
        DomainOverrides {
            name: "cyris-g1-abcd1234".into(),
            uuid: "11111111-2222-3333-4444-555555555555".into(),
            domain_type: "kvm".into(),
            machine: "q35".into(),
            memory_kib: 2048 * 1024,
            vcpus: 2,
            disk_path: PathBuf::from("/var/lib/cyris/ranges/101/disks/cyris-g1-abcd1234.qcow2"),
            seed_path: Some(PathBuf::from(
                "/var/lib/cyris/ranges/101/disks/cyris-g1-abcd1234-seed.iso",
            )),
            interfaces,
        }
    }

    #[test]
    fn renders_name_uuid_and_disk() {
        let xml = generate_domain_xml(&overrides(vec![]), None);
        assert!(xml.contains("cyris-g1-abcd1234"));
        assert!(xml.contains("11111111-2222-3333-4444-555555555555"));
        assert!(xml.contains(r#"type="kvm""#));
        assert!(xml.contains(r#"machine="q35""#));
    }

    #[test]
    fn user_mode_nic_has_no_source() {
        let nic = NicOverride {
            mac: format_mac([1, 2, 3]),
            mode: InterfaceMode::User,
        };
        let xml = generate_domain_xml(&overrides(vec![nic]), None);
        assert!(xml.contains(r#"type="user""#));
        assert!(!xml.contains("<source"));
    }

    #[test]
    fn network_mode_nic_has_network_source() {
        let nic = NicOverride {
            mac: format_mac([1, 2, 3]),
            mode: InterfaceMode::Network("default".into()),
        };
        let xml = generate_domain_xml(&overrides(vec![nic]), None);
        assert!(xml.contains(r#"network="default""#));
    }

    #[test]
    fn policy_enable_ssh_wins_over_bridge() {
        let mode = network_mode_for(true, Some("br0"), false, true);
        assert!(matches!(mode, InterfaceMode::Network(n) if n == "default"));
    }

    #[test]
    fn policy_bridge_on_session_uri_uses_existing_bridge() {
        let mode = network_mode_for(false, Some("br0"), false, true);
        assert!(matches!(mode, InterfaceMode::Bridge(b) if b == "br0"));
    }

    #[test]
    fn policy_bridge_missing_on_host_falls_back_to_default() {
        let mode = network_mode_for(false, Some("br0"), false, false);
        assert!(matches!(mode, InterfaceMode::Network(n) if n == "default"));
    }

    #[test]
    fn policy_default_is_user_mode() {
        let mode = network_mode_for(false, None, false, false);
        assert!(matches!(mode, InterfaceMode::User));
    }

    #[test]
    fn format_mac_uses_qemu_oui() {
        assert_eq!(format_mac([0xde, 0xad, 0x01]), "52:54:00:de:ad:01");
    }

    #[test]
    fn extracts_bridge_name_from_template() {
        let xml = r#"<interface type='bridge'><source bridge='br0'/></interface>"#;
        assert_eq!(extract_template_bridge(xml), Some("br0".into()));
    }

    #[test]
    fn no_bridge_interface_yields_none() {
        let xml = r#"<interface type='network'><source network='default'/></interface>"#;
        assert_eq!(extract_template_bridge(xml), None);
    }
}
