//! The DHCP sidecar supervisor of spec §4.6: builds the dnsmasq argument
//! vector, spawns it, and reattaches to an already-running instance by its
//! pidfile across daemon restarts. Argument order is load-bearing — it is
//! taken straight from the original driver's `APPEND_ARG` sequence.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use nix::sys::signal::Signal;
use virtnet_effectors::{FsEffector, ProcEffector};
use virtnet_model::{DhcpHost, NetworkDef};

const DNSMASQ_BASENAME: &str = "dnsmasq";

fn dhcp_host_entry(host: &DhcpHost) -> Option<String> {
    match (&host.mac, &host.hostname) {
        (Some(mac), Some(name)) => Some(format!("{mac},{name},{}", host.ip)),
        (Some(mac), None) => Some(format!("{mac},{}", host.ip)),
        (None, Some(name)) => Some(format!("{name},{}", host.ip)),
        (None, None) => None,
    }
}

/// Builds the dnsmasq argv for `def`, in the exact order spec §4.6
/// specifies. `helper` is the dnsmasq binary path, `pid_dir` the directory
/// its pidfile is written to.
pub fn build_argv(helper: &Path, def: &NetworkDef, pid_dir: &Path) -> Vec<String> {
    let mut argv = vec![helper.to_string_lossy().into_owned()];
    argv.push("--strict-order".to_string());
    argv.push("--bind-interfaces".to_string());

    if let Some(domain) = &def.dns_domain {
        argv.push("--domain".to_string());
        argv.push(domain.clone());
    }

    argv.push(format!("--pid-file={}/{}.pid", pid_dir.display(), def.name));
    argv.push("--conf-file=".to_string());
    argv.push(String::new());

    if let Some(ip) = def.ip_address {
        argv.push("--listen-address".to_string());
        argv.push(ip.to_string());
    }
    argv.push("--except-interface".to_string());
    argv.push("lo".to_string());

    for range in &def.dhcp_ranges {
        argv.push("--dhcp-range".to_string());
        argv.push(format!("{},{}", range.start, range.end));
    }

    for host in &def.dhcp_hosts {
        if let Some(entry) = dhcp_host_entry(host) {
            argv.push("--dhcp-host".to_string());
            argv.push(entry);
        }
    }

    argv
}

/// Spawns dnsmasq for `def` and reads back the pid it wrote to its pidfile.
/// The helper is expected to daemonize before the spawn call returns, so the
/// pidfile read happens synchronously afterward, matching the original
/// driver's "no race" comment on this path.
pub fn start(
    proc_effector: &dyn ProcEffector,
    fs_effector: &dyn FsEffector,
    helper: &Path,
    def: &NetworkDef,
    pid_dir: &Path,
) -> Result<i32> {
    let argv = build_argv(helper, def, pid_dir);
    let status = proc_effector.spawn(&argv).context("spawning dnsmasq")?;
    if !status.success() {
        return Err(anyhow!("dnsmasq exited with {:?} before daemonizing", status.code()));
    }
    fs_effector
        .read_pid(pid_dir, &def.name)?
        .ok_or_else(|| anyhow!("dnsmasq did not write a pidfile at {}/{}.pid", pid_dir.display(), def.name))
}

pub fn stop(proc_effector: &dyn ProcEffector, pid: i32) -> Result<()> {
    proc_effector.signal(pid, Signal::SIGTERM)
}

/// Reattaches to a dnsmasq instance recorded in a prior run's pidfile.
/// Returns `None` if the pid is dead or has been recycled by an unrelated
/// process, so the caller knows to start a fresh instance instead.
pub fn reattach(fs_effector: &dyn FsEffector, pid_dir: &Path, name: &str) -> Result<Option<i32>> {
    let Some(pid) = fs_effector.read_pid(pid_dir, name)? else {
        return Ok(None);
    };
    if !virtnet_util::pid::is_alive(pid) || !virtnet_util::pid::exe_matches(pid, DNSMASQ_BASENAME) {
        return Ok(None);
    }
    Ok(Some(pid))
}
