//! The rule compiler of spec §4.9: lowers one resolved rule into one or
//! more backend-specific rule instances, each carrying a `command_template`
//! with `%c`/`%s` placeholders for the list operation and chain position a
//! later install/remove fills in.

use virtnet_model::{Action, Backend, Direction, NetworkError, ProtocolType, ResolvedEntry, ResolvedRule};

/// Whether the guest interface this filter is bound to is bridged (the
/// common case) or a `direct`-type device, which cannot carry layer-3
/// rules — spec §4.9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    Bridge,
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainFamily {
    Forward,
    HostInput,
}

impl ChainFamily {
    fn code(self) -> char {
        match self {
            ChainFamily::Forward => 'F',
            ChainFamily::HostInput => 'H',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainState {
    In,
    Out,
}

impl ChainState {
    fn letter(self, temp: bool) -> char {
        match (self, temp) {
            (ChainState::In, false) => 'I',
            (ChainState::Out, false) => 'O',
            (ChainState::In, true) => 'J',
            (ChainState::Out, true) => 'P',
        }
    }
}

fn action_target(action: Action) -> &'static str {
    match action {
        Action::Accept => "ACCEPT",
        Action::Drop => "DROP",
        Action::Return => "RETURN",
        Action::Continue => "CONTINUE",
    }
}

fn base_protocol_name(protocol: ProtocolType) -> &'static str {
    match protocol {
        ProtocolType::TcpIpv6 => "tcp",
        ProtocolType::UdpIpv6 => "udp",
        ProtocolType::UdpliteIpv6 => "udplite",
        ProtocolType::EspIpv6 => "esp",
        ProtocolType::AhIpv6 => "ah",
        ProtocolType::SctpIpv6 => "sctp",
        ProtocolType::Icmpv6 => "icmpv6",
        ProtocolType::AllIpv6 => "all",
        other => other.name(),
    }
}

fn entries_to_match_args(entries: &[ResolvedEntry]) -> Vec<String> {
    let mut out = Vec::with_capacity(entries.len() * 2);
    for entry in entries {
        if entry.negate {
            out.push("!".to_string());
        }
        out.push(format!("--{}", entry.field));
        out.push(entry.value.clone());
    }
    out
}

/// One fully-lowered, per-backend rule instance — a chain identity plus a
/// `(table, match_args, target)` template. `render` fills in the `%c`/`%s`
/// placeholders to produce the argv for one `-A`/`-D`/`-I` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleInstance {
    pub backend: Backend,
    family: ChainFamily,
    state: ChainState,
    pub ifname: String,
    pub protocol_suffix: Option<&'static str>,
    pub priority: i32,
    pub table: Option<&'static str>,
    pub match_args: Vec<String>,
    pub target: &'static str,
}

impl RuleInstance {
    fn chain_name(&self, temp: bool) -> String {
        let mut name = format!("{}{}-{}", self.family.code(), self.state.letter(temp), self.ifname);
        if let Some(suffix) = self.protocol_suffix {
            name.push('-');
            name.push_str(suffix);
        }
        name
    }

    /// The chain name while this instance is still in the temp tree.
    pub fn temp_chain(&self) -> String {
        self.chain_name(true)
    }

    /// The chain name once the temp tree has been swapped live.
    pub fn live_chain(&self) -> String {
        self.chain_name(false)
    }

    /// Renders the full argv for installing (`op='A'`) or removing
    /// (`op='D'`) this instance against `chain`, at `pos` when inserting.
    pub fn render(&self, chain: &str, op: char, pos: Option<u32>) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(table) = self.table {
            out.push("-t".to_string());
            out.push(table.to_string());
        }
        out.push(format!("-{op}"));
        out.push(chain.to_string());
        if op == 'I' {
            if let Some(p) = pos {
                out.push(p.to_string());
            }
        }
        out.extend(self.match_args.iter().cloned());
        out.push("-j".to_string());
        out.push(self.target.to_string());
        out
    }
}

fn layer2_suffix(protocol: ProtocolType) -> Option<&'static str> {
    match protocol {
        ProtocolType::Ip => Some("ipv4"),
        ProtocolType::Ipv6 => Some("ipv6"),
        ProtocolType::Arp => Some("arp"),
        _ => None,
    }
}

fn compile_layer2(rule: &ResolvedRule, ifname: &str) -> Vec<RuleInstance> {
    let target = action_target(rule.action);
    let suffix = layer2_suffix(rule.protocol);
    let mut match_args = vec!["-p".to_string(), base_protocol_name(rule.protocol).to_string()];
    match_args.extend(entries_to_match_args(&rule.entries));

    let states: &[ChainState] = match rule.direction {
        Direction::In => &[ChainState::In],
        Direction::Out => &[ChainState::Out],
        Direction::InOut => &[ChainState::In, ChainState::Out],
    };

    states
        .iter()
        .map(|&state| RuleInstance {
            backend: Backend::Ebtables,
            family: ChainFamily::Forward,
            state,
            ifname: ifname.to_string(),
            protocol_suffix: suffix,
            priority: rule.priority,
            table: None,
            match_args: match_args.clone(),
            target,
        })
        .collect()
}

fn compile_layer3(rule: &ResolvedRule, ifname: &str) -> Vec<RuleInstance> {
    let backend = rule.protocol.backend();
    let base_match: Vec<String> = {
        let mut m = vec!["-p".to_string(), base_protocol_name(rule.protocol).to_string()];
        m.extend(entries_to_match_args(&rule.entries));
        m
    };
    let outbound = rule.direction != Direction::In;

    let mut new_established = vec!["-m".to_string(), "state".to_string(), "--state".to_string(), "NEW,ESTABLISHED".to_string()];
    new_established.extend(base_match.clone());
    let mut established_only = vec!["-m".to_string(), "state".to_string(), "--state".to_string(), "ESTABLISHED".to_string()];
    established_only.extend(base_match.clone());

    let in_match = if outbound { new_established } else { base_match.clone() };
    let out_match = if outbound { established_only } else { base_match.clone() };

    vec![
        RuleInstance {
            backend,
            family: ChainFamily::Forward,
            state: ChainState::In,
            ifname: ifname.to_string(),
            protocol_suffix: None,
            priority: rule.priority,
            table: None,
            match_args: in_match,
            target: "RETURN",
        },
        RuleInstance {
            backend,
            family: ChainFamily::Forward,
            state: ChainState::Out,
            ifname: ifname.to_string(),
            protocol_suffix: None,
            priority: rule.priority,
            table: None,
            match_args: out_match,
            target: "ACCEPT",
        },
        RuleInstance {
            backend,
            family: ChainFamily::HostInput,
            state: ChainState::In,
            ifname: ifname.to_string(),
            protocol_suffix: None,
            priority: rule.priority,
            table: None,
            match_args: base_match,
            target: "ACCEPT",
        },
    ]
}

/// Lowers `rule` on `ifname` into its rule instances, per the layer-2 /
/// layer-3 policy of spec §4.9. Fails with `FilterProtocolUnsupported` if a
/// layer-3 protocol is requested on a `direct`-type interface.
pub fn compile(rule: &ResolvedRule, ifname: &str, iface_type: InterfaceType) -> Result<Vec<RuleInstance>, NetworkError> {
    if rule.protocol.is_layer2() {
        Ok(compile_layer2(rule, ifname))
    } else {
        if iface_type == InterfaceType::Direct {
            return Err(NetworkError::FilterProtocolUnsupported {
                protocol: rule.protocol.name().to_string(),
                net_type: "direct".to_string(),
            });
        }
        Ok(compile_layer3(rule, ifname))
    }
}
