//! Topology engine: IP planning, network declaration, and forwarding-rule
//! translation.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::error::RangeError;
use crate::model::{ForwardingRule, GuestTemplate, Topology};
use crate::network_xml::{self, NetworkPlan};

/// Output of planning one range's topology: the guest-id → IP map (merged
/// across all networks) and the rendered per-network plans, ready for the
/// KVM provider to declare.
pub struct TopologyPlan {
    pub ip_assignments: HashMap<String, String>,
    pub networks: Vec<NetworkPlan>,
    pub forwarding_rules: Vec<ForwardingRule>,
}

fn member_guest_id(member: &str) -> &str {
    member.split('.').next().unwrap_or(member)
}

/// Deterministically carve a /24 for a network from its globally-unique
/// prefixed name, returning `(a, b, c)` of `a.b.c.0/24`. A djb2-style hash
/// of the name picks the second and third octets, so the derivation stays
/// reproducible across runs without a stored allocation table, and the
/// full three-octet space keeps sibling networks within one range from
/// colliding.
fn carve_subnet(prefixed_name: &str) -> (u8, u8, u8) {
    let mut hash: u32 = 5381;
    for b in prefixed_name.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    let b = 16 + ((hash >> 8) % 112) as u8; // 16..128, avoids well-known ranges
    let c = (hash % 254) as u8 + 1; // 1..254
    (172, b, c)
}

/// Plan IP assignments and network declarations for one range's topology.
/// Pre-set `ip_addr` values on guest templates are honoured exactly and
/// never overridden by planning; any collision between two members is a
/// fatal planning error raised before any libvirt call.
pub fn plan_topology(
    range_id: &str,
    topology: &Topology,
    guests: &[GuestTemplate],
) -> Result<TopologyPlan, RangeError> {
    let mut ip_assignments: HashMap<String, String> = HashMap::new();
    let mut networks = Vec::with_capacity(topology.networks.len());

    let preset: HashMap<&str, &str> = guests
        .iter()
        .filter_map(|g| g.ip_addr.as_deref().map(|ip| (g.id.as_str(), ip)))
        .collect();

    for network in &topology.networks {
        let prefixed = network_xml::prefixed_name(range_id, &network.name);
        let (a, b, c) = carve_subnet(&prefixed);
        let gateway_ip = Ipv4Addr::new(a, b, c, 1);
        let netmask = "255.255.255.0".to_string();

        let mut used: std::collections::HashSet<Ipv4Addr> = std::collections::HashSet::new();
        used.insert(gateway_ip);

        let mut next_free = 10u8;

        for member in &network.members {
            let guest_id = member_guest_id(member);
            let assigned = if let Some(ip_str) = preset.get(guest_id) {
                let ip: Ipv4Addr = ip_str.parse().map_err(|_| RangeError::Validation {
                    message: format!("guest '{guest_id}' has an invalid ip_addr '{ip_str}'"),
                })?;
                ip
            } else if let Some(existing) = ip_assignments.get(guest_id) {
                existing.parse().unwrap()
            } else {
                loop {
                    let candidate = Ipv4Addr::new(a, b, c, next_free);
                    next_free = next_free.checked_add(1).ok_or_else(|| RangeError::Resource {
                        message: format!(
                            "network '{}' exhausted its address space",
                            network.name
                        ),
                        source: None,
                    })?;
                    if !used.contains(&candidate) {
                        break candidate;
                    }
                }
            };

            if let Some(owner) = ip_assignments.get(guest_id) {
                if owner.parse::<Ipv4Addr>().unwrap() != assigned {
                    return Err(RangeError::IpCollision {
                        network: network.name.clone(),
                        addr: assigned.to_string(),
                        a: owner.clone(),
                        b: guest_id.to_string(),
                    });
                }
            }
            if used.contains(&assigned) && assigned != gateway_ip {
                return Err(RangeError::IpCollision {
                    network: network.name.clone(),
                    addr: assigned.to_string(),
                    a: "<gateway-or-prior-member>".into(),
                    b: guest_id.to_string(),
                });
            }
            used.insert(assigned);
            ip_assignments.insert(guest_id.to_string(), assigned.to_string());
        }

        // DHCP range brackets away the gateway and every static address.
        let dhcp_start = used.iter().map(|a| a.octets()[3]).max().unwrap_or(10) + 1;
        let dhcp_start = dhcp_start.max(100);
        let dhcp_end = 199u8;
        if dhcp_start >= dhcp_end {
            return Err(RangeError::Resource {
                message: format!(
                    "network '{}' has too many static addresses to leave room for DHCP",
                    network.name
                ),
                source: None,
            });
        }

        networks.push(NetworkPlan {
            name: prefixed,
            bridge_name: network_xml::derive_bridge_name(&network_xml::prefixed_name(
                range_id,
                &network.name,
            )),
            gateway_ip: gateway_ip.to_string(),
            netmask,
            dhcp_start: Ipv4Addr::new(a, b, c, dhcp_start).to_string(),
            dhcp_end: Ipv4Addr::new(a, b, c, dhcp_end).to_string(),
        });
    }

    Ok(TopologyPlan {
        ip_assignments,
        networks,
        forwarding_rules: topology.forwarding_rules.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BaseVmKind, NetworkDecl};

    fn guest(id: &str, ip: Option<&str>) -> GuestTemplate {
        GuestTemplate {
            id: id.into(),
            basevm_host: "h1".into(),
            basevm_config_file: None,
            basevm_type: BaseVmKind::Kvm,
            basevm_os_type: "linux".into(),
            ip_addr: ip.map(String::from),
            root_passwd: None,
            tasks: vec![],
        }
    }

    #[test]
    fn assigns_sequential_ips_within_a_network() {
        let topo = Topology {
            networks: vec![NetworkDecl {
                name: "office".into(),
                members: vec!["desktop.eth0".into(), "laptop.eth0".into()],
                gateway_member: None,
                subnet: None,
            }],
            forwarding_rules: vec![],
        };
        let guests = vec![guest("desktop", None), guest("laptop", None)];
        let plan = plan_topology("101", &topo, &guests).unwrap();
        assert_eq!(plan.networks.len(), 1);
        assert_ne!(
            plan.ip_assignments["desktop"],
            plan.ip_assignments["laptop"]
        );
    }

    #[test]
    fn honours_preset_ip_exactly() {
        let topo = Topology {
            networks: vec![NetworkDecl {
                name: "office".into(),
                members: vec!["desktop.eth0".into()],
                gateway_member: None,
                subnet: None,
            }],
            forwarding_rules: vec![],
        };
        let guests = vec![guest("desktop", Some("10.1.1.50"))];
        let plan = plan_topology("101", &topo, &guests).unwrap();
        assert_eq!(plan.ip_assignments["desktop"], "10.1.1.50");
    }

    #[test]
    fn rejects_preset_ip_collision() {
        let topo = Topology {
            networks: vec![NetworkDecl {
                name: "office".into(),
                members: vec!["desktop.eth0".into(), "laptop.eth0".into()],
                gateway_member: None,
                subnet: None,
            }],
            forwarding_rules: vec![],
        };
        let guests = vec![
            guest("desktop", Some("10.1.1.50")),
            guest("laptop", Some("10.1.1.50")),
        ];
        assert!(plan_topology("101", &topo, &guests).is_err());
    }

    #[test]
    fn network_names_carry_range_id() {
        let topo = Topology {
            networks: vec![NetworkDecl {
                name: "servers".into(),
                members: vec!["web.eth0".into()],
                gateway_member: None,
                subnet: None,
            }],
            forwarding_rules: vec![],
        };
        let guests = vec![guest("web", None)];
        let plan = plan_topology("202", &topo, &guests).unwrap();
        assert!(plan.networks[0].name.starts_with("cyris-202-"));
    }
}
