use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// One of `none | nat | route`, spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMode {
    None,
    Nat,
    Route,
}

impl fmt::Display for ForwardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ForwardMode::None => "none",
            ForwardMode::Nat => "nat",
            ForwardMode::Route => "route",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    /// Optional lease-count hint; the original grammar carries it alongside
    /// start/end but the lifecycle engine never needs to compute it itself.
    pub size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpHost {
    pub mac: Option<String>,
    pub hostname: Option<String>,
    pub ip: Ipv4Addr,
}

/// The CIDR computed as `(ip AND netmask)/netmask` — spec §3/§8 invariant 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedNetwork {
    pub network: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl DerivedNetwork {
    pub fn compute(ip: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        let ip_bits = u32::from(ip);
        let mask_bits = u32::from(netmask);
        Self {
            network: Ipv4Addr::from(ip_bits & mask_bits),
            netmask,
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        (u32::from(addr) & mask) == u32::from(self.network)
    }
}

impl fmt::Display for DerivedNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.netmask)
    }
}

/// The declarative, immutable-once-admitted network definition of spec §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDef {
    pub name: String,
    pub uuid: uuid::Uuid,
    pub bridge_name: Option<String>,
    #[serde(default = "default_true")]
    pub stp_enabled: bool,
    #[serde(default)]
    pub forward_delay: u32,
    pub ip_address: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub dns_domain: Option<String>,
    #[serde(default)]
    pub dhcp_ranges: Vec<DhcpRange>,
    #[serde(default)]
    pub dhcp_hosts: Vec<DhcpHost>,
    pub tftp_root: Option<PathBuf>,
    pub bootp_file: Option<String>,
    pub bootp_server: Option<String>,
    pub forward_mode: ForwardMode,
    pub forward_dev: Option<String>,
    #[serde(default = "default_true")]
    pub adjust_firewall: bool,
}

fn default_true() -> bool {
    true
}

/// A bridge name is a template for the allocator, rather than a literal, if
/// it contains a decimal conversion token — spec §4.4.
pub fn is_bridge_name_template(name: &str) -> bool {
    name.contains("%d")
}

impl NetworkDef {
    /// `derived_network`, computed from `ip_address`/`netmask` when both are
    /// present — spec §3/§8 invariant 4.
    pub fn derived_network(&self) -> Option<DerivedNetwork> {
        match (self.ip_address, self.netmask) {
            (Some(ip), Some(mask)) => Some(DerivedNetwork::compute(ip, mask)),
            _ => None,
        }
    }

    /// Validates every closed-form invariant in spec §3/§8 that can be
    /// checked from the definition alone (registry-wide invariants like
    /// name/uuid/bridge uniqueness are the registry's job, not this one's).
    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.name.is_empty() {
            return Err(NetworkError::MalformedDefinition {
                reason: "name must not be empty".to_string(),
            });
        }

        match (self.ip_address, self.netmask) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => {
                return Err(NetworkError::MalformedDefinition {
                    reason: format!(
                        "network '{}': ip_address and netmask must be both present or both absent",
                        self.name
                    ),
                });
            }
        }

        if self.forward_mode != ForwardMode::None
            && (self.ip_address.is_none() || self.netmask.is_none())
        {
            return Err(NetworkError::MalformedDefinition {
                reason: format!(
                    "network '{}': forward mode '{}' requires ip_address and netmask",
                    self.name, self.forward_mode
                ),
            });
        }

        if let Some(derived) = self.derived_network() {
            for range in &self.dhcp_ranges {
                if range.end < range.start {
                    return Err(NetworkError::MalformedDefinition {
                        reason: format!(
                            "network '{}': dhcp range {}-{} has end before start",
                            self.name, range.start, range.end
                        ),
                    });
                }
                if !derived.contains(range.start) || !derived.contains(range.end) {
                    return Err(NetworkError::MalformedDefinition {
                        reason: format!(
                            "network '{}': dhcp range {}-{} falls outside {derived}",
                            self.name, range.start, range.end
                        ),
                    });
                }
            }
        } else if !self.dhcp_ranges.is_empty() {
            return Err(NetworkError::MalformedDefinition {
                reason: format!(
                    "network '{}': dhcp ranges require ip_address/netmask",
                    self.name
                ),
            });
        }

        for host in &self.dhcp_hosts {
            if host.mac.is_none() && host.hostname.is_none() {
                return Err(NetworkError::MalformedDefinition {
                    reason: format!(
                        "network '{}': dhcp host {} needs a mac or a hostname",
                        self.name, host.ip
                    ),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_def() -> NetworkDef {
        NetworkDef {
            name: "net0".to_string(),
            uuid: uuid::Uuid::new_v4(),
            bridge_name: Some("virbr0".to_string()),
            stp_enabled: true,
            forward_delay: 0,
            ip_address: Some("192.168.100.1".parse().unwrap()),
            netmask: Some("255.255.255.0".parse().unwrap()),
            dns_domain: None,
            dhcp_ranges: vec![],
            dhcp_hosts: vec![],
            tftp_root: None,
            bootp_file: None,
            bootp_server: None,
            forward_mode: ForwardMode::Nat,
            forward_dev: None,
            adjust_firewall: true,
        }
    }

    #[test]
    fn derived_network_masks_correctly() {
        let def = base_def();
        let derived = def.derived_network().unwrap();
        assert_eq!(derived.network, "192.168.100.0".parse::<Ipv4Addr>().unwrap());
        assert_eq!(derived.to_string(), "192.168.100.0/255.255.255.0");
    }

    #[test]
    fn validate_accepts_well_formed_range() {
        let mut def = base_def();
        def.dhcp_ranges.push(DhcpRange {
            start: "192.168.100.2".parse().unwrap(),
            end: "192.168.100.254".parse().unwrap(),
            size: None,
        });
        def.validate().unwrap();
    }

    #[test]
    fn validate_rejects_range_outside_network() {
        let mut def = base_def();
        def.dhcp_ranges.push(DhcpRange {
            start: "10.0.0.2".parse().unwrap(),
            end: "10.0.0.254".parse().unwrap(),
            size: None,
        });
        assert!(def.validate().is_err());
    }

    #[test]
    fn validate_rejects_range_with_end_before_start() {
        let mut def = base_def();
        def.dhcp_ranges.push(DhcpRange {
            start: "192.168.100.254".parse().unwrap(),
            end: "192.168.100.2".parse().unwrap(),
            size: None,
        });
        assert!(def.validate().is_err());
    }

    #[test]
    fn validate_requires_mac_or_hostname_on_static_host() {
        let mut def = base_def();
        def.dhcp_hosts.push(DhcpHost {
            mac: None,
            hostname: None,
            ip: "192.168.100.5".parse().unwrap(),
        });
        assert!(def.validate().is_err());
    }

    #[test]
    fn validate_requires_ip_and_netmask_together() {
        let mut def = base_def();
        def.netmask = None;
        assert!(def.validate().is_err());
    }

    #[test]
    fn validate_requires_address_for_nat_mode() {
        let mut def = base_def();
        def.ip_address = None;
        def.netmask = None;
        def.forward_mode = ForwardMode::Nat;
        assert!(def.validate().is_err());
    }

    #[test]
    fn isolated_network_allows_no_address() {
        let mut def = base_def();
        def.ip_address = None;
        def.netmask = None;
        def.forward_mode = ForwardMode::None;
        def.validate().unwrap();
    }

    #[test]
    fn bridge_name_template_detection() {
        assert!(is_bridge_name_template("virbr%d"));
        assert!(!is_bridge_name_template("virbr0"));
    }

    #[test]
    fn definition_roundtrips_through_json() {
        let mut def = base_def();
        def.dhcp_ranges.push(DhcpRange {
            start: "192.168.100.2".parse().unwrap(),
            end: "192.168.100.254".parse().unwrap(),
            size: None,
        });
        let json = serde_json::to_string(&def).unwrap();
        let back: NetworkDef = serde_json::from_str(&json).unwrap();
        assert_eq!(def, back);
    }
}
