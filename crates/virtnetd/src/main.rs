//! virtnetd: the composition root for the virtual-network lifecycle
//! subsystem. Loads persisted definitions, reattaches to anything already
//! running from a prior instance, runs autostart, then blocks on SIGHUP
//! (reload) and SIGTERM/SIGINT (graceful shutdown) the same way the
//! original daemon's signal thread does.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use nix::unistd::Uid;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use virtnet_effectors::{CliFirewallEffector, IpRouteBridgeEffector, StdFsEffector, StdProcEffector};
use virtnet_lifecycle::Context as LifecycleContext;
use virtnet_persist::{DaemonLock, PersistPaths};
use virtnet_registry::Registry;
use virtnet_util::{CommandRunner, find_in_path};

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let verbose = std::env::var_os("VIRTNETD_VERBOSE").is_some();
    let paths = resolve_paths();
    paths.ensure_all().context("preparing persistence directories")?;

    let lock = DaemonLock::new(&paths.run_dir);
    let _lock_file = lock.acquire().context("acquiring daemon lock")?;

    ensure_deps()?;

    let dhcp_helper = find_in_path("dnsmasq").unwrap_or_else(|| PathBuf::from("/usr/sbin/dnsmasq"));
    let runner = CommandRunner::new(verbose, false);
    let bridge = IpRouteBridgeEffector::new(runner.clone());
    let fs = StdFsEffector;
    let proc = StdProcEffector;
    let firewall = CliFirewallEffector::new(runner.clone());

    let ctx = LifecycleContext {
        bridge: &bridge,
        fs: &fs,
        proc: &proc,
        firewall: &firewall,
        dhcp_helper: &dhcp_helper,
        paths: &paths,
    };

    let registry = Registry::new();
    load_and_reattach(&registry, &paths, ctx)?;
    virtnet_lifecycle::autostart_scan(ctx, &registry);

    let mut signals = Signals::new([SIGHUP, SIGINT, SIGTERM]).context("installing signal handlers")?;
    for signal in signals.forever() {
        match signal {
            SIGHUP => {
                tracing::info!("received SIGHUP, reloading network definitions");
                if let Err(e) = virtnet_lifecycle::reload(ctx, &registry) {
                    tracing::warn!(error = %e, "reload failed");
                }
            }
            SIGINT | SIGTERM => {
                tracing::info!("received shutdown signal, stopping active networks");
                shutdown(&registry, ctx);
                break;
            }
            _ => {}
        }
    }

    lock.release().context("releasing daemon lock")
}

/// Admits every on-disk definition into the registry and reattaches to
/// anything already active on the host, mirroring a daemon restart.
fn load_and_reattach(registry: &Registry, paths: &PersistPaths, ctx: LifecycleContext<'_>) -> Result<()> {
    let defs = virtnet_persist::load_all_definitions(paths)?;
    for def in defs {
        let name = def.name.clone();
        let autostart = virtnet_persist::is_autostart(paths, &name);
        let uuid = match registry.assign(def) {
            Ok(uuid) => uuid,
            Err(e) => {
                tracing::warn!(network = %name, error = %e, "skipping network definition at startup");
                continue;
            }
        };
        if let Some(mut locked) = registry.lock_by_uuid(uuid) {
            locked.autostart = autostart;
            virtnet_lifecycle::reattach_one(ctx, &mut locked);
        }
    }
    Ok(())
}

fn shutdown(registry: &Registry, ctx: LifecycleContext<'_>) {
    for uuid in registry.list_uuids() {
        if let Some(mut locked) = registry.lock_by_uuid(uuid) {
            virtnet_lifecycle::stop(ctx, &mut locked);
        }
    }
}

fn resolve_paths() -> PersistPaths {
    if Uid::effective().is_root() {
        PersistPaths::system(Path::new("/etc"), Path::new("/var"))
    } else {
        let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
        PersistPaths::session(&home)
    }
}

fn ensure_deps() -> Result<()> {
    if find_in_path("ip").is_none() {
        return Err(anyhow!("missing dependency: ip (iproute2)"));
    }
    if find_in_path("iptables").is_none() {
        return Err(anyhow!("missing dependency: iptables"));
    }
    Ok(())
}
