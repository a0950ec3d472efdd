//! NWFilter rule AST (spec §3/§4.8): a protocol-tagged rule record whose
//! entry values may be literals or named variable references, resolved
//! per-interface before compilation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
    InOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Accept,
    Drop,
    Return,
    Continue,
}

/// The closed protocol-tag set of spec §3. Variants ending in `Ipv6` are the
/// "explicit-IPv6 analogues" of their IPv4 counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolType {
    Mac,
    Arp,
    Ip,
    Ipv6,
    All,
    Tcp,
    Udp,
    Udplite,
    Esp,
    Ah,
    Sctp,
    Icmp,
    Igmp,
    TcpIpv6,
    UdpIpv6,
    UdpliteIpv6,
    EspIpv6,
    AhIpv6,
    SctpIpv6,
    Icmpv6,
    AllIpv6,
}

impl ProtocolType {
    /// True for the layer-2 (ebtables) protocol family: `mac, arp, ip, ipv6,
    /// all` addressed at the bridging layer rather than the packet layer.
    pub fn is_layer2(self) -> bool {
        matches!(
            self,
            ProtocolType::Mac | ProtocolType::Arp | ProtocolType::Ip | ProtocolType::Ipv6 | ProtocolType::All
        )
    }

    /// True when this protocol's layer-3 rules belong on the `ip6tables`
    /// backend rather than `iptables`.
    pub fn is_ipv6_family(self) -> bool {
        matches!(
            self,
            ProtocolType::Ipv6
                | ProtocolType::TcpIpv6
                | ProtocolType::UdpIpv6
                | ProtocolType::UdpliteIpv6
                | ProtocolType::EspIpv6
                | ProtocolType::AhIpv6
                | ProtocolType::SctpIpv6
                | ProtocolType::Icmpv6
                | ProtocolType::AllIpv6
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            ProtocolType::Mac => "mac",
            ProtocolType::Arp => "arp",
            ProtocolType::Ip => "ip",
            ProtocolType::Ipv6 => "ipv6",
            ProtocolType::All => "all",
            ProtocolType::Tcp => "tcp",
            ProtocolType::Udp => "udp",
            ProtocolType::Udplite => "udplite",
            ProtocolType::Esp => "esp",
            ProtocolType::Ah => "ah",
            ProtocolType::Sctp => "sctp",
            ProtocolType::Icmp => "icmp",
            ProtocolType::Igmp => "igmp",
            ProtocolType::TcpIpv6 => "tcp-ipv6",
            ProtocolType::UdpIpv6 => "udp-ipv6",
            ProtocolType::UdpliteIpv6 => "udplite-ipv6",
            ProtocolType::EspIpv6 => "esp-ipv6",
            ProtocolType::AhIpv6 => "ah-ipv6",
            ProtocolType::SctpIpv6 => "sctp-ipv6",
            ProtocolType::Icmpv6 => "icmpv6",
            ProtocolType::AllIpv6 => "all-ipv6",
        }
    }
}

/// Data-type tag of spec §3, each carrying the maximum textual width its
/// kernel-side buffer accepts — used by the resolver's overflow check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    IpAddr,
    Ipv6Addr,
    MacAddr,
    MacMask,
    IpMask,
    Ipv6Mask,
    U8,
    U16,
}

impl DataType {
    pub fn max_len(self) -> usize {
        match self {
            DataType::IpAddr | DataType::IpMask => 15,   // "255.255.255.255"
            DataType::Ipv6Addr | DataType::Ipv6Mask => 45,
            DataType::MacAddr | DataType::MacMask => 17, // "ff:ff:ff:ff:ff:ff"
            DataType::U8 => 3,                           // "255"
            DataType::U16 => 5,                          // "65535"
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::IpAddr => "ip_addr",
            DataType::Ipv6Addr => "ipv6_addr",
            DataType::MacAddr => "mac_addr",
            DataType::MacMask => "mac_mask",
            DataType::IpMask => "ip_mask",
            DataType::Ipv6Mask => "ipv6_mask",
            DataType::U8 => "u8",
            DataType::U16 => "u16",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryValue {
    Literal(String),
    Variable(String),
}

/// One field of a protocol payload: a value (literal or variable), its
/// declared type, and whether the match is negated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDescriptor {
    pub field: String,
    pub value: EntryValue,
    pub data_type: DataType,
    pub negate: bool,
}

impl EntryDescriptor {
    pub fn literal(field: &str, data_type: DataType, value: &str) -> Self {
        Self {
            field: field.to_string(),
            value: EntryValue::Literal(value.to_string()),
            data_type,
            negate: false,
        }
    }

    pub fn variable(field: &str, data_type: DataType, variable: &str) -> Self {
        Self {
            field: field.to_string(),
            value: EntryValue::Variable(variable.to_string()),
            data_type,
            negate: false,
        }
    }
}

/// A single nwfilter rule record (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDef {
    pub direction: Direction,
    pub action: Action,
    pub priority: i32,
    pub protocol: ProtocolType,
    pub entries: Vec<EntryDescriptor>,
}

/// The concrete packet-filter tool a resolved rule is lowered onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Backend {
    Ebtables,
    Iptables,
    Ip6tables,
}

impl Backend {
    pub fn program(self) -> &'static str {
        match self {
            Backend::Ebtables => "ebtables",
            Backend::Iptables => "iptables",
            Backend::Ip6tables => "ip6tables",
        }
    }

    pub fn save_program(self) -> &'static str {
        match self {
            Backend::Ebtables => "ebtables-save",
            Backend::Iptables => "iptables-save",
            Backend::Ip6tables => "ip6tables-save",
        }
    }
}

impl ProtocolType {
    /// The backend a resolved rule for this protocol is lowered onto —
    /// layer-2 protocols go to ebtables, everything else splits on address
    /// family.
    pub fn backend(self) -> Backend {
        if self.is_layer2() {
            Backend::Ebtables
        } else if self.is_ipv6_family() {
            Backend::Ip6tables
        } else {
            Backend::Iptables
        }
    }
}

/// Per-interface variable table resolved before compilation.
pub type VariableTable = HashMap<String, String>;

/// A rule whose variable references have all been substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntry {
    pub field: String,
    pub value: String,
    pub negate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRule {
    pub direction: Direction,
    pub action: Action,
    pub priority: i32,
    pub protocol: ProtocolType,
    pub entries: Vec<ResolvedEntry>,
}

/// Resolves every variable reference in `rule` against `vars`, failing with
/// `FilterVariableUnresolved` or `FilterBufferOverflow` per spec §4.8.
pub fn resolve_rule(rule: &RuleDef, ifname: &str, vars: &VariableTable) -> Result<ResolvedRule, NetworkError> {
    let mut entries = Vec::with_capacity(rule.entries.len());
    for entry in &rule.entries {
        let value = match &entry.value {
            EntryValue::Literal(v) => v.clone(),
            EntryValue::Variable(name) => vars.get(name).cloned().ok_or_else(|| {
                NetworkError::FilterVariableUnresolved {
                    ifname: ifname.to_string(),
                    variable: name.clone(),
                }
            })?,
        };
        if value.len() > entry.data_type.max_len() {
            return Err(NetworkError::FilterBufferOverflow {
                ifname: ifname.to_string(),
                variable: entry.field.clone(),
                data_type: entry.data_type.name().to_string(),
                value,
            });
        }
        entries.push(ResolvedEntry {
            field: entry.field.clone(),
            value,
            negate: entry.negate,
        });
    }
    Ok(ResolvedRule {
        direction: rule.direction,
        action: rule.action,
        priority: rule.priority,
        protocol: rule.protocol,
        entries,
    })
}
