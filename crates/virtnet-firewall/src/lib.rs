//! The L3 firewall rule writer of spec §4.7: a deterministic, ordered
//! install plan derived from a network definition, installed with LIFO
//! rollback on failure and removed best-effort in reverse order. Plan
//! construction mirrors the teacher's `iptables::build_plan` shape.

use virtnet_effectors::FirewallEffector;
use virtnet_model::{Backend, ForwardMode, NetworkDef, NetworkError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub table: &'static str,
    pub chain: &'static str,
    pub args: Vec<String>,
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Builds the ordered install plan of spec §4.7 for `def`. Empty when
/// `adjust_firewall` is false.
pub fn plan(def: &NetworkDef) -> Result<Vec<Step>, NetworkError> {
    if !def.adjust_firewall {
        return Ok(Vec::new());
    }
    let bridge = def.bridge_name.as_deref().ok_or_else(|| NetworkError::FirewallBuildFailed {
        name: def.name.clone(),
        reason: "network has no bridge name to install firewall rules for".to_string(),
    })?;

    let mut steps = vec![
        Step {
            table: "filter",
            chain: "INPUT",
            args: args(&["-i", bridge, "-p", "tcp", "--dport", "67", "-j", "ACCEPT"]),
        },
        Step {
            table: "filter",
            chain: "INPUT",
            args: args(&["-i", bridge, "-p", "udp", "--dport", "67", "-j", "ACCEPT"]),
        },
        Step {
            table: "filter",
            chain: "INPUT",
            args: args(&["-i", bridge, "-p", "tcp", "--dport", "53", "-j", "ACCEPT"]),
        },
        Step {
            table: "filter",
            chain: "INPUT",
            args: args(&["-i", bridge, "-p", "udp", "--dport", "53", "-j", "ACCEPT"]),
        },
        Step {
            table: "filter",
            chain: "FORWARD",
            args: args(&["-i", bridge, "-j", "REJECT"]),
        },
        Step {
            table: "filter",
            chain: "FORWARD",
            args: args(&["-o", bridge, "-j", "REJECT"]),
        },
        Step {
            table: "filter",
            chain: "FORWARD",
            args: args(&["-i", bridge, "-o", bridge, "-j", "ACCEPT"]),
        },
    ];

    if let Some(derived) = def.derived_network() {
        let cidr = derived.to_string();
        match def.forward_mode {
            ForwardMode::Nat => {
                let mut allow_out = vec!["-s".to_string(), cidr.clone(), "-i".to_string(), bridge.to_string()];
                if let Some(dev) = &def.forward_dev {
                    allow_out.push("-o".to_string());
                    allow_out.push(dev.clone());
                }
                allow_out.push("-j".to_string());
                allow_out.push("ACCEPT".to_string());
                steps.push(Step {
                    table: "filter",
                    chain: "FORWARD",
                    args: allow_out,
                });

                let mut allow_related_in = vec!["-d".to_string(), cidr.clone(), "-o".to_string(), bridge.to_string()];
                if let Some(dev) = &def.forward_dev {
                    allow_related_in.push("-i".to_string());
                    allow_related_in.push(dev.clone());
                }
                allow_related_in.extend(["-m".to_string(), "state".to_string(), "--state".to_string(), "RELATED,ESTABLISHED".to_string(), "-j".to_string(), "ACCEPT".to_string()]);
                steps.push(Step {
                    table: "filter",
                    chain: "FORWARD",
                    args: allow_related_in,
                });

                let mut masquerade = vec!["-s".to_string(), cidr, "!".to_string(), "-d".to_string(), derived.to_string()];
                if let Some(dev) = &def.forward_dev {
                    masquerade.push("-o".to_string());
                    masquerade.push(dev.clone());
                }
                masquerade.push("-j".to_string());
                masquerade.push("MASQUERADE".to_string());
                steps.push(Step {
                    table: "nat",
                    chain: "POSTROUTING",
                    args: masquerade,
                });
            }
            ForwardMode::Route => {
                let mut allow_out = vec!["-s".to_string(), cidr.clone(), "-i".to_string(), bridge.to_string()];
                if let Some(dev) = &def.forward_dev {
                    allow_out.push("-o".to_string());
                    allow_out.push(dev.clone());
                }
                allow_out.push("-j".to_string());
                allow_out.push("ACCEPT".to_string());
                steps.push(Step {
                    table: "filter",
                    chain: "FORWARD",
                    args: allow_out,
                });

                let mut allow_in = vec!["-d".to_string(), cidr, "-o".to_string(), bridge.to_string()];
                if let Some(dev) = &def.forward_dev {
                    allow_in.push("-i".to_string());
                    allow_in.push(dev.clone());
                }
                allow_in.push("-j".to_string());
                allow_in.push("ACCEPT".to_string());
                steps.push(Step {
                    table: "filter",
                    chain: "FORWARD",
                    args: allow_in,
                });
            }
            ForwardMode::None => {}
        }
    }

    Ok(steps)
}

/// Installs every step of `plan`, unwinding 1..N-1 in reverse if step N
/// fails, then persists the ruleset.
pub fn apply(effector: &dyn FirewallEffector, def: &NetworkDef) -> Result<(), NetworkError> {
    let steps = plan(def)?;
    let mut installed = Vec::with_capacity(steps.len());
    for step in &steps {
        match effector.install_rule(Backend::Iptables, step.table, step.chain, &step.args) {
            Ok(()) => installed.push(step),
            Err(source) => {
                for undo in installed.into_iter().rev() {
                    if let Err(e) = effector.remove_rule(Backend::Iptables, undo.table, undo.chain, &undo.args) {
                        tracing::warn!(network = %def.name, error = %e, "rollback step failed");
                    }
                }
                return Err(NetworkError::HostEffectorFailed {
                    step: format!("firewall:{}:{}", step.table, step.chain),
                    name: def.name.clone(),
                    source,
                });
            }
        }
    }
    if let Err(e) = effector.save(Backend::Iptables) {
        tracing::warn!(network = %def.name, error = %e, "failed to persist firewall ruleset");
    }
    Ok(())
}

/// Removes every step of `def`'s plan in reverse order, best-effort.
pub fn remove(effector: &dyn FirewallEffector, def: &NetworkDef) {
    let steps = match plan(def) {
        Ok(steps) => steps,
        Err(e) => {
            tracing::warn!(network = %def.name, error = %e, "could not recompute firewall plan for removal");
            return;
        }
    };
    for step in steps.into_iter().rev() {
        if let Err(e) = effector.remove_rule(Backend::Iptables, step.table, step.chain, &step.args) {
            tracing::warn!(network = %def.name, table = step.table, chain = step.chain, error = %e, "failed to remove firewall rule");
        }
    }
}
