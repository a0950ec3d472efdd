//! The network lifecycle engine of spec §4.5: the `define`/`start`/`stop`/
//! `reload`/`autostart`/`reattach` state machine composing the registry,
//! bridge allocator, DHCP supervisor, firewall writer and persistence
//! layer into one transactional start (LIFO unwind on any step's failure)
//! and one best-effort, idempotent stop.

use std::path::Path;

use nix::sys::signal::Signal;
use uuid::Uuid;
use virtnet_effectors::{BridgeEffector, FirewallEffector, FsEffector, ProcEffector};
use virtnet_model::{ForwardMode, NetworkDef, NetworkError};
use virtnet_persist::PersistPaths;
use virtnet_registry::{NetworkObject, Registry};

/// The effector handles and filesystem paths every lifecycle operation is
/// threaded through — a dependency-injected context rather than a
/// process-wide singleton, per the design's global-daemon-state note.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub bridge: &'a dyn BridgeEffector,
    pub fs: &'a dyn FsEffector,
    pub proc: &'a dyn ProcEffector,
    pub firewall: &'a dyn FirewallEffector,
    pub dhcp_helper: &'a Path,
    pub paths: &'a PersistPaths,
}

fn state_path(paths: &PersistPaths, name: &str) -> std::path::PathBuf {
    paths.state_dir.join(format!("{name}.xml"))
}

/// Resolves a bridge name via the allocator and admits `def` as a new,
/// inactive registry object.
pub fn define(registry: &Registry, mut def: NetworkDef) -> Result<Uuid, NetworkError> {
    let resolved = virtnet_bridge::allocate(registry, def.bridge_name.as_deref(), true, None)?;
    def.bridge_name = Some(resolved);
    def.validate()?;
    registry.assign(def)
}

type Undo<'a> = Box<dyn FnOnce() + 'a>;

fn run_undo(mut undo: Vec<Undo<'_>>) {
    while let Some(step) = undo.pop() {
        step();
    }
}

fn unwind_and_fail(undo: Vec<Undo<'_>>, name: &str, step: &str, source: anyhow::Error) -> NetworkError {
    run_undo(undo);
    NetworkError::HostEffectorFailed {
        step: step.to_string(),
        name: name.to_string(),
        source,
    }
}

/// Brings `obj` up, in the order of spec §4.5's `start` table. Any step's
/// failure unwinds every prior step (LIFO) before the error is surfaced;
/// `obj.active` is only set once every step has succeeded.
pub fn start<'a>(ctx: Context<'a>, obj: &mut NetworkObject) -> Result<(), NetworkError> {
    if obj.active {
        return Err(NetworkError::AlreadyActive { name: obj.live_def.name.clone() });
    }
    let def = obj.live_def.clone();
    let bridge_name = def.bridge_name.clone().ok_or_else(|| NetworkError::MalformedDefinition {
        reason: format!("network '{}' has no bridge name to start", def.name),
    })?;

    let mut undo: Vec<Undo<'a>> = Vec::new();

    if let Err(e) = ctx.bridge.add(&bridge_name) {
        return Err(unwind_and_fail(undo, &def.name, "bridge-add", e));
    }
    {
        let bridge = ctx.bridge;
        let bridge_name = bridge_name.clone();
        undo.push(Box::new(move || {
            if let Err(e) = bridge.del(&bridge_name) {
                tracing::warn!(bridge = %bridge_name, error = %e, "rollback: bridge delete failed");
            }
        }));
    }

    if let Err(e) = ctx.bridge.set_forward_delay(&bridge_name, def.forward_delay) {
        return Err(unwind_and_fail(undo, &def.name, "bridge-forward-delay", e));
    }
    if let Err(e) = ctx.bridge.set_stp(&bridge_name, def.stp_enabled) {
        return Err(unwind_and_fail(undo, &def.name, "bridge-stp", e));
    }

    if let (Some(ip), Some(mask)) = (def.ip_address, def.netmask) {
        if let Err(e) = ctx.bridge.set_inet_addr(&bridge_name, ip) {
            return Err(unwind_and_fail(undo, &def.name, "bridge-inet-addr", e));
        }
        if let Err(e) = ctx.bridge.set_netmask(&bridge_name, mask) {
            return Err(unwind_and_fail(undo, &def.name, "bridge-netmask", e));
        }
        if let Err(e) = ctx.bridge.set_up(&bridge_name, true) {
            return Err(unwind_and_fail(undo, &def.name, "bridge-up", e));
        }
        let bridge = ctx.bridge;
        let bridge_name = bridge_name.clone();
        undo.push(Box::new(move || {
            if let Err(e) = bridge.set_up(&bridge_name, false) {
                tracing::warn!(bridge = %bridge_name, error = %e, "rollback: bridge down failed");
            }
        }));
    }

    if def.adjust_firewall {
        if let Err(err) = virtnet_firewall::apply(ctx.firewall, &def) {
            run_undo(undo);
            return Err(err);
        }
        let firewall = ctx.firewall;
        let def_for_undo = def.clone();
        undo.push(Box::new(move || virtnet_firewall::remove(firewall, &def_for_undo)));
    }

    if def.forward_mode != ForwardMode::None {
        if let Err(e) = ctx.fs.write_string(Path::new("/proc/sys/net/ipv4/ip_forward"), "1\n") {
            tracing::warn!(network = %def.name, error = %e, "failed to enable ip_forward");
        }
    }

    if !def.dhcp_ranges.is_empty() {
        match virtnet_dhcp::start(ctx.proc, ctx.fs, ctx.dhcp_helper, &def, &ctx.paths.run_dir) {
            Ok(pid) => {
                obj.dhcp_pid = Some(pid);
                let proc = ctx.proc;
                undo.push(Box::new(move || {
                    if let Err(e) = virtnet_dhcp::stop(proc, pid) {
                        tracing::warn!(pid, error = %e, "rollback: dhcp sidecar termination failed");
                    }
                }));
            }
            Err(e) => {
                run_undo(undo);
                return Err(NetworkError::HostEffectorFailed {
                    step: "dhcp-start".to_string(),
                    name: def.name.clone(),
                    source: e,
                });
            }
        }
    }

    let path = state_path(ctx.paths, &def.name);
    let xml = virtnet_persist::codec::encode(&def);
    if let Err(e) = ctx.fs.write_string(&path, &xml) {
        run_undo(undo);
        return Err(NetworkError::HostEffectorFailed {
            step: "persist-state".to_string(),
            name: def.name.clone(),
            source: e,
        });
    }

    obj.live_def = def;
    obj.active = true;
    Ok(())
}

/// Idempotent on an inactive object. Tears down every resource `start`
/// could have created, best-effort, and publishes `pending_def` if one was
/// queued while the network was active.
pub fn stop(ctx: Context<'_>, obj: &mut NetworkObject) {
    if !obj.active {
        return;
    }
    let def = obj.live_def.clone();

    let path = state_path(ctx.paths, &def.name);
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(network = %def.name, error = %e, "failed to remove state file");
        }
    }

    let dhcp_pid = obj.dhcp_pid;
    if let Some(pid) = dhcp_pid {
        if let Err(e) = virtnet_dhcp::stop(ctx.proc, pid) {
            tracing::warn!(pid, error = %e, "failed to send termination signal to dhcp sidecar");
        }
    }

    if def.adjust_firewall {
        virtnet_firewall::remove(ctx.firewall, &def);
    }

    if let Some(bridge_name) = &def.bridge_name {
        if let Err(e) = ctx.bridge.set_up(bridge_name, false) {
            tracing::warn!(bridge = %bridge_name, error = %e, "failed to bring bridge down");
        }
        if let Err(e) = ctx.bridge.del(bridge_name) {
            tracing::warn!(bridge = %bridge_name, error = %e, "failed to delete bridge");
        }
    }

    if let Some(pid) = dhcp_pid {
        if virtnet_util::pid::is_alive(pid) {
            if let Err(e) = ctx.proc.signal(pid, Signal::SIGKILL) {
                tracing::warn!(pid, error = %e, "failed to kill unresponsive dhcp sidecar");
            }
        }
    }

    obj.dhcp_pid = None;
    obj.active = false;
    if let Some(pending) = obj.pending_def.take() {
        obj.live_def = pending;
    }
}

/// Called once per loaded object at daemon start: replaces `live_def` with
/// the state-dir snapshot if one parses, detects an already-running
/// bridge, and re-probes the DHCP sidecar's pidfile.
pub fn reattach_one(ctx: Context<'_>, obj: &mut NetworkObject) {
    let name = obj.live_def.name.clone();
    let path = state_path(ctx.paths, &name);
    if let Ok(xml) = std::fs::read_to_string(&path) {
        if let Ok(state_def) = virtnet_persist::codec::decode(&xml) {
            let old = std::mem::replace(&mut obj.live_def, state_def);
            obj.pending_def = Some(old);
        }
    }

    if let Some(bridge_name) = &obj.live_def.bridge_name {
        obj.active = ctx.bridge.has(bridge_name).unwrap_or(false);
    }

    if !obj.live_def.dhcp_ranges.is_empty() {
        match virtnet_dhcp::reattach(ctx.fs, &ctx.paths.run_dir, &name) {
            Ok(pid) => obj.dhcp_pid = pid,
            Err(e) => {
                tracing::warn!(network = %name, error = %e, "failed to probe dhcp sidecar pidfile");
                obj.dhcp_pid = None;
            }
        }
    }
}

/// For every loaded object marked `autostart` that isn't already active,
/// runs `start`; per-entry failures are logged, not propagated (spec §4.5).
pub fn autostart_scan(ctx: Context<'_>, registry: &Registry) {
    for uuid in registry.list_uuids() {
        let Some(mut locked) = registry.lock_by_uuid(uuid) else {
            continue;
        };
        if locked.autostart && !locked.active {
            if let Err(e) = start(ctx, &mut locked) {
                tracing::warn!(network = %locked.live_def.name, error = %e, "autostart failed");
            }
        }
    }
}

/// Re-scans the config directory, admits any not-yet-registered
/// definition, re-persists the firewall ruleset, and runs an autostart
/// pass over anything newly eligible.
pub fn reload(ctx: Context<'_>, registry: &Registry) -> anyhow::Result<()> {
    let defs = virtnet_persist::load_all_definitions(ctx.paths)?;
    for def in defs {
        let name = def.name.clone();
        let is_new = registry.uuid_for_name(&name).is_none();
        if let Err(e) = registry.assign(def) {
            tracing::warn!(network = %name, error = %e, "reload: failed to admit network definition");
            continue;
        }
        if is_new && virtnet_persist::is_autostart(ctx.paths, &name) {
            if let Some(mut locked) = registry.lock_by_name(&name) {
                locked.autostart = true;
            }
        }
    }
    if let Err(e) = ctx.firewall.save(virtnet_model::Backend::Iptables) {
        tracing::warn!(error = %e, "reload: failed to persist firewall ruleset");
    }
    autostart_scan(ctx, registry);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::process::ExitStatus;
    use std::sync::Mutex;
    use virtnet_model::{DhcpRange, ForwardMode};

    #[derive(Default)]
    struct Mock {
        calls: Mutex<Vec<String>>,
        fail_step: Mutex<Option<&'static str>>,
        bridge_exists: Mutex<bool>,
    }

    impl Mock {
        fn record(&self, call: &str) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(call.to_string());
            if self.fail_step.lock().unwrap().as_deref() == Some(call) {
                return Err(anyhow::anyhow!("simulated failure at {call}"));
            }
            Ok(())
        }
    }

    impl BridgeEffector for Mock {
        fn add(&self, _name: &str) -> anyhow::Result<()> {
            self.record("bridge-add")?;
            *self.bridge_exists.lock().unwrap() = true;
            Ok(())
        }
        fn del(&self, _name: &str) -> anyhow::Result<()> {
            self.record("bridge-del")?;
            *self.bridge_exists.lock().unwrap() = false;
            Ok(())
        }
        fn set_stp(&self, _name: &str, _on: bool) -> anyhow::Result<()> {
            self.record("bridge-stp")
        }
        fn set_forward_delay(&self, _name: &str, _seconds: u32) -> anyhow::Result<()> {
            self.record("bridge-forward-delay")
        }
        fn set_inet_addr(&self, _name: &str, _ip: Ipv4Addr) -> anyhow::Result<()> {
            self.record("bridge-inet-addr")
        }
        fn set_netmask(&self, _name: &str, _netmask: Ipv4Addr) -> anyhow::Result<()> {
            self.record("bridge-netmask")
        }
        fn set_up(&self, _name: &str, up: bool) -> anyhow::Result<()> {
            self.record(if up { "bridge-up" } else { "bridge-down" })
        }
        fn has(&self, _name: &str) -> anyhow::Result<bool> {
            Ok(*self.bridge_exists.lock().unwrap())
        }
    }

    impl FsEffector for Mock {
        fn write_string(&self, _path: &Path, _text: &str) -> anyhow::Result<()> {
            self.record("fs-write")
        }
        fn read_pid(&self, _dir: &Path, _name: &str) -> anyhow::Result<Option<i32>> {
            Ok(Some(4242))
        }
        fn make_path(&self, _path: &Path) -> anyhow::Result<()> {
            Ok(())
        }
        fn link_points_to(&self, _link: &Path, _target: &Path) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    impl ProcEffector for Mock {
        fn spawn(&self, _argv: &[String]) -> anyhow::Result<ExitStatus> {
            Ok(std::process::Command::new("true").status().unwrap())
        }
        fn signal(&self, _pid: i32, _which: Signal) -> anyhow::Result<()> {
            self.record("proc-signal")
        }
    }

    impl FirewallEffector for Mock {
        fn ensure_chain(&self, _backend: virtnet_model::Backend, _table: &str, _chain: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn install_rule(&self, _backend: virtnet_model::Backend, _table: &str, _chain: &str, _args: &[String]) -> anyhow::Result<()> {
            self.record("firewall-install")
        }
        fn remove_rule(&self, _backend: virtnet_model::Backend, _table: &str, _chain: &str, _args: &[String]) -> anyhow::Result<()> {
            self.record("firewall-remove")
        }
        fn save(&self, _backend: virtnet_model::Backend) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    fn sample_def() -> NetworkDef {
        NetworkDef {
            name: "net0".to_string(),
            uuid: Uuid::new_v4(),
            bridge_name: Some("virbr0".to_string()),
            stp_enabled: true,
            forward_delay: 0,
            ip_address: Some("192.168.100.1".parse().unwrap()),
            netmask: Some("255.255.255.0".parse().unwrap()),
            dns_domain: None,
            dhcp_ranges: vec![DhcpRange {
                start: "192.168.100.2".parse().unwrap(),
                end: "192.168.100.254".parse().unwrap(),
                size: None,
            }],
            dhcp_hosts: vec![],
            tftp_root: None,
            bootp_file: None,
            bootp_server: None,
            forward_mode: ForwardMode::Nat,
            forward_dev: None,
            adjust_firewall: true,
        }
    }

    fn new_object(def: NetworkDef) -> NetworkObject {
        NetworkObject {
            live_def: def,
            pending_def: None,
            active: false,
            autostart: false,
            dhcp_pid: None,
        }
    }

    fn harness() -> (tempfile::TempDir, PersistPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = PersistPaths {
            def_dir: dir.path().join("defs"),
            autostart_dir: dir.path().join("defs/autostart"),
            state_dir: dir.path().join("state"),
            run_dir: dir.path().join("run"),
        };
        paths.ensure_all().unwrap();
        (dir, paths)
    }

    #[test]
    fn start_brings_up_bridge_firewall_dhcp_and_marks_active() {
        let (_dir, paths) = harness();
        let mock = Mock::default();
        let ctx = Context {
            bridge: &mock,
            fs: &mock,
            proc: &mock,
            firewall: &mock,
            dhcp_helper: Path::new("/usr/sbin/dnsmasq"),
            paths: &paths,
        };
        let mut obj = new_object(sample_def());
        start(ctx, &mut obj).unwrap();
        assert!(obj.active);
        assert_eq!(obj.dhcp_pid, Some(4242));
        let calls = mock.calls.lock().unwrap();
        assert!(calls.contains(&"bridge-add".to_string()));
        assert!(calls.contains(&"firewall-install".to_string()));
    }

    #[test]
    fn start_rolls_back_bridge_on_netmask_failure() {
        let (_dir, paths) = harness();
        let mock = Mock::default();
        *mock.fail_step.lock().unwrap() = Some("bridge-netmask");
        let ctx = Context {
            bridge: &mock,
            fs: &mock,
            proc: &mock,
            firewall: &mock,
            dhcp_helper: Path::new("/usr/sbin/dnsmasq"),
            paths: &paths,
        };
        let mut obj = new_object(sample_def());
        let err = start(ctx, &mut obj).unwrap_err();
        assert!(matches!(err, NetworkError::HostEffectorFailed { .. }));
        assert!(!obj.active);
        assert!(mock.calls.lock().unwrap().contains(&"bridge-del".to_string()));
        assert!(!*mock.bridge_exists.lock().unwrap());
    }

    #[test]
    fn start_rolls_back_firewall_and_bridge_on_later_failure() {
        let (_dir, paths) = harness();
        let mock = Mock::default();
        *mock.fail_step.lock().unwrap() = Some("fs-write");
        let ctx = Context {
            bridge: &mock,
            fs: &mock,
            proc: &mock,
            firewall: &mock,
            dhcp_helper: Path::new("/usr/sbin/dnsmasq"),
            paths: &paths,
        };
        let mut obj = new_object(sample_def());
        let mut def = sample_def();
        def.dhcp_ranges.clear();
        obj.live_def = def;
        let err = start(ctx, &mut obj).unwrap_err();
        assert!(matches!(err, NetworkError::HostEffectorFailed { .. }));
        assert!(mock.calls.lock().unwrap().contains(&"firewall-remove".to_string()));
        assert!(!*mock.bridge_exists.lock().unwrap());
    }

    #[test]
    fn stop_on_inactive_object_is_a_noop() {
        let (_dir, paths) = harness();
        let mock = Mock::default();
        let ctx = Context {
            bridge: &mock,
            fs: &mock,
            proc: &mock,
            firewall: &mock,
            dhcp_helper: Path::new("/usr/sbin/dnsmasq"),
            paths: &paths,
        };
        let mut obj = new_object(sample_def());
        stop(ctx, &mut obj);
        assert!(mock.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn stop_tears_down_an_active_network_and_publishes_pending() {
        let (_dir, paths) = harness();
        let mock = Mock::default();
        let ctx = Context {
            bridge: &mock,
            fs: &mock,
            proc: &mock,
            firewall: &mock,
            dhcp_helper: Path::new("/usr/sbin/dnsmasq"),
            paths: &paths,
        };
        let mut def = sample_def();
        def.dhcp_ranges.clear();
        let mut obj = new_object(def);
        start(ctx, &mut obj).unwrap();
        let mut pending = sample_def();
        pending.name = "net0-pending".to_string();
        obj.pending_def = Some(pending.clone());
        stop(ctx, &mut obj);
        assert!(!obj.active);
        assert_eq!(obj.live_def.name, "net0-pending");
        assert!(obj.pending_def.is_none());
        assert!(mock.calls.lock().unwrap().contains(&"bridge-del".to_string()));
    }

    #[test]
    fn reattach_detects_a_bridge_already_on_the_host() {
        let (_dir, paths) = harness();
        let mock = Mock::default();
        *mock.bridge_exists.lock().unwrap() = true;
        let ctx = Context {
            bridge: &mock,
            fs: &mock,
            proc: &mock,
            firewall: &mock,
            dhcp_helper: Path::new("/usr/sbin/dnsmasq"),
            paths: &paths,
        };
        let mut def = sample_def();
        def.dhcp_ranges.clear();
        let mut obj = new_object(def);
        reattach_one(ctx, &mut obj);
        assert!(obj.active);
    }
}
