//! Libvirt network XML generation using facet-xml struct serialization.

use facet::Facet;
use facet_xml as xml;

#[derive(Debug, Facet)]
#[facet(rename = "network")]
struct NetworkDef {
    name: String,
    forward: Forward,
    bridge: Bridge,
    dns: Dns,
    ip: NetworkIp,
}

#[derive(Debug, Facet)]
struct Forward {
    #[facet(xml::attribute, rename = "mode")]
    mode: String,
}

#[derive(Debug, Facet)]
struct Bridge {
    #[facet(xml::attribute)]
    name: String,
    #[facet(xml::attribute)]
    stp: String,
    #[facet(xml::attribute)]
    delay: String,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct Dns {}

#[derive(Debug, Facet)]
struct NetworkIp {
    #[facet(xml::attribute)]
    address: String,
    #[facet(xml::attribute)]
    netmask: String,
    dhcp: NetworkDhcp,
}

#[derive(Debug, Facet)]
struct NetworkDhcp {
    range: DhcpRange,
}

#[derive(Debug, Facet)]
struct DhcpRange {
    #[facet(xml::attribute)]
    start: String,
    #[facet(xml::attribute)]
    end: String,
}

/// Libvirt network name, globally unique and carrying the range id,
/// e.g. `cyris-101-office`.
pub fn prefixed_name(range_id: &str, network_name: &str) -> String {
    format!("cyris-{range_id}-{network_name}")
}

/// Plan of a network's address space, computed by the topology engine and
/// rendered here. `dhcp_start`/`dhcp_end` must already exclude the gateway
/// address and every statically assigned address in the network.
pub struct NetworkPlan {
    pub name: String,
    pub bridge_name: String,
    pub gateway_ip: String,
    pub netmask: String,
    pub dhcp_start: String,
    pub dhcp_end: String,
}

/// Generate NAT-mode libvirt network XML with a DHCP range bracketed away
/// from reserved addresses and DNS enabled.
pub fn generate_network_xml(plan: &NetworkPlan) -> String {
    let net = NetworkDef {
        name: plan.name.clone(),
        forward: Forward { mode: "nat".into() },
        bridge: Bridge {
            name: plan.bridge_name.clone(),
            stp: "on".into(),
            delay: "0".into(),
        },
        dns: Dns {},
        ip: NetworkIp {
            address: plan.gateway_ip.clone(),
            netmask: plan.netmask.clone(),
            dhcp: NetworkDhcp {
                range: DhcpRange {
                    start: plan.dhcp_start.clone(),
                    end: plan.dhcp_end.clone(),
                },
            },
        },
    };

    facet_xml::to_string(&net).expect("network XML serialization should not fail")
}

/// Derive a deterministic bridge device name from the (already globally
/// unique) network name. Libvirt bridge names are capped at 15 bytes.
pub fn derive_bridge_name(prefixed_network_name: &str) -> String {
    let mut hash: u32 = 5381;
    for b in prefixed_network_name.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    format!("virbr-{:08x}", hash)[..15.min(format!("virbr-{:08x}", hash).len())].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> NetworkPlan {
        NetworkPlan {
            name: "cyris-101-office".into(),
            bridge_name: "virbr-00001".into(),
            gateway_ip: "192.168.50.1".into(),
            netmask: "255.255.255.0".into(),
            dhcp_start: "192.168.50.100".into(),
            dhcp_end: "192.168.50.199".into(),
        }
    }

    #[test]
    fn network_xml_has_nat_bridge_and_dhcp() {
        let xml = generate_network_xml(&plan());
        assert!(xml.contains("<name>cyris-101-office</name>"));
        assert!(xml.contains(r#"mode="nat""#));
        assert!(xml.contains(r#"name="virbr-00001""#));
        assert!(xml.contains(r#"address="192.168.50.1""#));
        assert!(xml.contains(r#"start="192.168.50.100""#));
        assert!(xml.contains(r#"end="192.168.50.199""#));
        assert!(xml.contains("<dns>"));
    }

    #[test]
    fn prefixed_name_carries_range_id() {
        assert_eq!(prefixed_name("101", "office"), "cyris-101-office");
    }

    #[test]
    fn bridge_name_is_deterministic_and_bounded() {
        let a = derive_bridge_name("cyris-101-office");
        let b = derive_bridge_name("cyris-101-office");
        assert_eq!(a, b);
        assert!(a.len() <= 15);
    }
}
