//! The shadow-swap chain manager of spec §4.10: builds a complete temp
//! chain tree for an interface's rule set, installs every rule instance
//! into it, then atomically swaps it over the live tree. Any failure
//! before the swap step unwinds every temp chain created so far and
//! leaves the live tree untouched.

pub mod effector;

use std::collections::BTreeMap;

pub use effector::{ChainEffector, CliChainEffector};
use virtnet_model::{Backend, NetworkError};
use virtnet_nwfilter::RuleInstance;

fn wrap(source: anyhow::Error, ifname: &str, step: &str) -> NetworkError {
    NetworkError::HostEffectorFailed {
        step: step.to_string(),
        name: ifname.to_string(),
        source,
    }
}

/// The distinct chains a rule set touches, keyed by temp-chain name so the
/// same chain is only created/renamed once even if several instances
/// append into it.
fn distinct_chains(instances: &[RuleInstance]) -> Vec<(Backend, String, String)> {
    let mut seen = BTreeMap::new();
    for inst in instances {
        seen.entry(inst.temp_chain()).or_insert_with(|| (inst.backend, inst.temp_chain(), inst.live_chain()));
    }
    seen.into_values().collect()
}

fn uses_backend(chains: &[(Backend, String, String)], backend: Backend) -> bool {
    chains.iter().any(|(b, _, _)| *b == backend)
}

type Undo<'a> = Box<dyn FnOnce() + 'a>;

fn run_undo(mut undo: Vec<Undo<'_>>) {
    while let Some(step) = undo.pop() {
        step();
    }
}

/// The process-wide base chains, each pinned into a builtin chain at a
/// fixed position — spec §4.10's "Base chains" paragraph.
const BASE_CHAINS: [(&str, &str, u32); 4] = [
    ("FORWARD", "libvirt-in", 1),
    ("FORWARD", "libvirt-out", 2),
    ("FORWARD", "libvirt-in-post", 3),
    ("INPUT", "libvirt-host-in", 1),
];

/// The three root-chain links a bridged interface needs into the base
/// chains: outbound traffic through `libvirt-out`, inbound through
/// `libvirt-in`, and host-destined traffic through `libvirt-host-in`.
const ROOT_LINKS: [(&str, char, bool); 3] = [("libvirt-out", 'F', false), ("libvirt-in", 'F', true), ("libvirt-host-in", 'H', true)];

fn root_chain_name(family: char, incoming: bool, temp: bool, ifname: &str) -> String {
    let state = match (incoming, temp) {
        (true, true) => 'J',
        (true, false) => 'I',
        (false, true) => 'P',
        (false, false) => 'O',
    };
    format!("{family}{state}-{ifname}")
}

fn physdev_flag(incoming: bool) -> &'static str {
    if incoming { "--physdev-in" } else { "--physdev-out" }
}

/// Creates the process-wide base chains and pins each at its declared
/// position in `FORWARD`/`INPUT`, using the linker routine: grep the
/// current position, insert if absent, and if present at the wrong
/// position, insert at the declared one and delete the stale entry.
/// Idempotent; safe to call before every apply.
fn ensure_base_chains(effector: &dyn ChainEffector, backend: Backend) -> Result<(), NetworkError> {
    for (_, chain, _) in BASE_CHAINS {
        effector.ensure_builtin_chain(backend, None, chain).map_err(|e| wrap(e, chain, "ensure-base-chain"))?;
    }
    for (builtin, chain, pos) in BASE_CHAINS {
        pin_base_chain(effector, backend, builtin, chain, pos)?;
    }
    Ok(())
}

fn pin_base_chain(effector: &dyn ChainEffector, backend: Backend, builtin: &str, target: &str, pos: u32) -> Result<(), NetworkError> {
    let needle = format!(" {target} ");
    let found = effector
        .chain_rule_position(backend, None, builtin, &needle)
        .map_err(|e| wrap(e, target, "pin-base-chain"))?;
    match found {
        Some(r) if r == pos => Ok(()),
        Some(r) => {
            effector
                .insert_at(backend, None, builtin, pos, &["-j".to_string(), target.to_string()])
                .map_err(|e| wrap(e, target, "pin-base-chain"))?;
            effector.delete_at(backend, None, builtin, r + 1).map_err(|e| wrap(e, target, "unpin-stale-base-chain"))
        }
        None => effector
            .insert_at(backend, None, builtin, pos, &["-j".to_string(), target.to_string()])
            .map_err(|e| wrap(e, target, "pin-base-chain")),
    }
}

fn link_temp_root_chains(effector: &dyn ChainEffector, backend: Backend, ifname: &str) -> Result<(), NetworkError> {
    for (base, family, incoming) in ROOT_LINKS {
        let chain = root_chain_name(family, incoming, true, ifname);
        let args = vec![
            "-A".to_string(),
            base.to_string(),
            "-m".to_string(),
            "physdev".to_string(),
            physdev_flag(incoming).to_string(),
            ifname.to_string(),
            "-g".to_string(),
            chain,
        ];
        effector.run(backend, &args).map_err(|e| wrap(e, ifname, "link-temp-root-chain"))?;
    }
    Ok(())
}

fn unlink_temp_root_chains(effector: &dyn ChainEffector, backend: Backend, ifname: &str) {
    for (base, family, incoming) in ROOT_LINKS {
        let chain = root_chain_name(family, incoming, true, ifname);
        let args = vec![
            "-D".to_string(),
            base.to_string(),
            "-m".to_string(),
            "physdev".to_string(),
            physdev_flag(incoming).to_string(),
            ifname.to_string(),
            "-g".to_string(),
            chain,
        ];
        let _ = effector.run(backend, &args);
    }
}

fn unlink_live_root_chains(effector: &dyn ChainEffector, backend: Backend, ifname: &str) {
    for (base, family, incoming) in ROOT_LINKS {
        let chain = root_chain_name(family, incoming, false, ifname);
        let args = vec![
            "-D".to_string(),
            base.to_string(),
            "-m".to_string(),
            "physdev".to_string(),
            physdev_flag(incoming).to_string(),
            ifname.to_string(),
            "-g".to_string(),
            chain,
        ];
        let _ = effector.run(backend, &args);
    }
}

/// Installs the one-time "accept established return traffic" pin into
/// `libvirt-in-post` for `ifname`, if not already present.
fn pin_virt_in_post(effector: &dyn ChainEffector, backend: Backend, ifname: &str) -> Result<(), NetworkError> {
    let needle = format!("--physdev-in {ifname} ");
    let exists = effector
        .chain_rule_position(backend, None, "libvirt-in-post", &needle)
        .map_err(|e| wrap(e, ifname, "pin-virt-in-post"))?
        .is_some();
    if exists {
        return Ok(());
    }
    let args = vec![
        "-A".to_string(),
        "libvirt-in-post".to_string(),
        "-m".to_string(),
        "physdev".to_string(),
        "--physdev-in".to_string(),
        ifname.to_string(),
        "-j".to_string(),
        "ACCEPT".to_string(),
    ];
    effector.run(backend, &args).map_err(|e| wrap(e, ifname, "pin-virt-in-post"))
}

fn link_layer2_temp_root(effector: &dyn ChainEffector, ifname: &str, incoming: bool) -> Result<(), NetworkError> {
    let (builtin, flag) = if incoming { ("PREROUTING", "-i") } else { ("POSTROUTING", "-o") };
    let chain = root_chain_name('F', incoming, true, ifname);
    let args = vec!["-A".to_string(), builtin.to_string(), flag.to_string(), ifname.to_string(), "-j".to_string(), chain];
    effector.run(Backend::Ebtables, &args).map_err(|e| wrap(e, ifname, "link-layer2-root-chain"))
}

fn unlink_layer2_temp_root(effector: &dyn ChainEffector, ifname: &str, incoming: bool) {
    let (builtin, flag) = if incoming { ("PREROUTING", "-i") } else { ("POSTROUTING", "-o") };
    let chain = root_chain_name('F', incoming, true, ifname);
    let args = vec!["-D".to_string(), builtin.to_string(), flag.to_string(), ifname.to_string(), "-j".to_string(), chain];
    let _ = effector.run(Backend::Ebtables, &args);
}

fn unlink_layer2_live_root(effector: &dyn ChainEffector, ifname: &str, incoming: bool) {
    let (builtin, flag) = if incoming { ("PREROUTING", "-i") } else { ("POSTROUTING", "-o") };
    let chain = root_chain_name('F', incoming, false, ifname);
    let args = vec!["-D".to_string(), builtin.to_string(), flag.to_string(), ifname.to_string(), "-j".to_string(), chain];
    let _ = effector.run(Backend::Ebtables, &args);
}

/// Applies `instances` (already compiled for `ifname`) via the
/// build-temp-tree / install / commit / swap protocol of spec §4.10.
/// Priority order is the sort key within each chain.
pub fn apply(effector: &dyn ChainEffector, ifname: &str, mut instances: Vec<RuleInstance>) -> Result<(), NetworkError> {
    instances.sort_by_key(|i| i.priority);
    let chains = distinct_chains(&instances);
    let mut undo: Vec<Undo<'_>> = Vec::new();

    // 1. Prepare temp tree.
    for (backend, temp, _live) in &chains {
        let _ = effector.delete_chain(*backend, None, temp);
    }
    for (backend, temp, _live) in &chains {
        if let Err(e) = effector.create_chain(*backend, None, temp) {
            run_undo(undo);
            return Err(wrap(e, ifname, "prepare-temp-chain"));
        }
        let (backend, temp) = (*backend, temp.clone());
        undo.push(Box::new(move || {
            let _ = effector.delete_chain(backend, None, &temp);
        }));
    }

    // 2. Install rules; for each layer-3 backend in use, ensure the base
    // chains exist and route this interface's temp chains into them.
    for backend in [Backend::Iptables, Backend::Ip6tables] {
        if !uses_backend(&chains, backend) {
            continue;
        }
        if let Err(e) = ensure_base_chains(effector, backend) {
            run_undo(undo);
            return Err(e);
        }
        if let Err(e) = link_temp_root_chains(effector, backend, ifname) {
            run_undo(undo);
            return Err(e);
        }
        undo.push(Box::new(move || unlink_temp_root_chains(effector, backend, ifname)));
        if let Err(e) = pin_virt_in_post(effector, backend, ifname) {
            run_undo(undo);
            return Err(e);
        }
    }

    for inst in &instances {
        let chain = inst.temp_chain();
        let args = inst.render(&chain, 'A', None);
        if let Err(e) = effector.run(inst.backend, &args) {
            run_undo(undo);
            return Err(wrap(e, ifname, "install-temp-rule"));
        }
    }

    // 3. Commit: link the layer-2 temp root chain from PREROUTING/POSTROUTING.
    if uses_backend(&chains, Backend::Ebtables) {
        for incoming in [true, false] {
            if let Err(e) = link_layer2_temp_root(effector, ifname, incoming) {
                run_undo(undo);
                return Err(e);
            }
            undo.push(Box::new(move || unlink_layer2_temp_root(effector, ifname, incoming)));
        }
    }

    // 4. Swap: unlink the old live root chains, remove them, rename temp to
    // live (renaming carries forward the links installed in step 2/3, which
    // point at the temp names and become live once the rename lands).
    if uses_backend(&chains, Backend::Ebtables) {
        unlink_layer2_live_root(effector, ifname, true);
        unlink_layer2_live_root(effector, ifname, false);
    }
    for backend in [Backend::Iptables, Backend::Ip6tables] {
        if uses_backend(&chains, backend) {
            unlink_live_root_chains(effector, backend, ifname);
        }
    }
    for (backend, temp, live) in &chains {
        let _ = effector.delete_chain(*backend, None, live);
        if let Err(e) = effector.rename_chain(*backend, None, temp, live) {
            run_undo(undo);
            return Err(wrap(e, ifname, "swap-rename"));
        }
    }

    Ok(())
}

const CHAIN_FAMILIES: [char; 2] = ['F', 'H'];
const CHAIN_STATES: [char; 4] = ['I', 'O', 'J', 'P'];
const LAYER2_SUFFIXES: [&str; 3] = ["ipv4", "ipv6", "arp"];

/// Unconditionally removes every root and sub-chain `ifname` could own
/// across all three backends, plus the base-chain links and the
/// `libvirt-in-post` accept pin for the interface. Used when a guest
/// interface is torn down; must never fail even when nothing exists.
pub fn all_teardown(effector: &dyn ChainEffector, ifname: &str) {
    unlink_layer2_live_root(effector, ifname, true);
    unlink_layer2_live_root(effector, ifname, false);
    unlink_layer2_temp_root(effector, ifname, true);
    unlink_layer2_temp_root(effector, ifname, false);
    for backend in [Backend::Iptables, Backend::Ip6tables] {
        unlink_live_root_chains(effector, backend, ifname);
        unlink_temp_root_chains(effector, backend, ifname);
        let args = vec![
            "-D".to_string(),
            "libvirt-in-post".to_string(),
            "-m".to_string(),
            "physdev".to_string(),
            "--physdev-in".to_string(),
            ifname.to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ];
        let _ = effector.run(backend, &args);
    }

    for backend in [Backend::Ebtables, Backend::Iptables, Backend::Ip6tables] {
        for family in CHAIN_FAMILIES {
            for state in CHAIN_STATES {
                let base = format!("{family}{state}-{ifname}");
                let _ = effector.delete_chain(backend, None, &base);
                if backend == Backend::Ebtables {
                    for suffix in LAYER2_SUFFIXES {
                        let name = format!("{base}-{suffix}");
                        let _ = effector.delete_chain(backend, None, &name);
                    }
                }
            }
        }
    }
}
