//! The `bridge.*` effector of spec §6, shelled out via `ip`/`brctl`-style
//! invocations the same way the teacher's mark/firewall backends shell out
//! to `nft`/`iptables` through `CommandRunner`.

use std::net::Ipv4Addr;

use anyhow::{Context, Result, anyhow};
use virtnet_util::CommandRunner;

pub trait BridgeEffector: Send + Sync {
    fn add(&self, name: &str) -> Result<()>;
    fn del(&self, name: &str) -> Result<()>;
    fn set_stp(&self, name: &str, on: bool) -> Result<()>;
    fn set_forward_delay(&self, name: &str, seconds: u32) -> Result<()>;
    fn set_inet_addr(&self, name: &str, ip: Ipv4Addr) -> Result<()>;
    fn set_netmask(&self, name: &str, netmask: Ipv4Addr) -> Result<()>;
    fn set_up(&self, name: &str, up: bool) -> Result<()>;
    fn has(&self, name: &str) -> Result<bool>;
}

/// `ip link`/`ip addr` based effector. The reference host implementation;
/// spec §6 leaves the production implementation out of scope, so this one
/// exists to make the daemon runnable and to anchor the trait's contract.
pub struct IpRouteBridgeEffector {
    runner: CommandRunner,
}

impl IpRouteBridgeEffector {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }
}

fn prefix_len(netmask: Ipv4Addr) -> u32 {
    u32::from(netmask).count_ones()
}

impl BridgeEffector for IpRouteBridgeEffector {
    fn add(&self, name: &str) -> Result<()> {
        if self.has(name)? {
            return Err(anyhow!("bridge '{name}' already exists"));
        }
        self.runner.run("ip", &["link", "add", "name", name, "type", "bridge"])
    }

    fn del(&self, name: &str) -> Result<()> {
        // Tolerate absent: link del on a missing device is a no-op failure.
        let _ = self.runner.run_allow_fail("ip", &["link", "del", name]);
        Ok(())
    }

    fn set_stp(&self, name: &str, on: bool) -> Result<()> {
        let state = if on { "1" } else { "0" };
        self.runner
            .run("ip", &["link", "set", name, "type", "bridge", "stp_state", state])
    }

    fn set_forward_delay(&self, name: &str, seconds: u32) -> Result<()> {
        let centiseconds = (seconds * 100).to_string();
        self.runner.run(
            "ip",
            &["link", "set", name, "type", "bridge", "forward_delay", &centiseconds],
        )
    }

    fn set_inet_addr(&self, name: &str, ip: Ipv4Addr) -> Result<()> {
        // The netmask is applied separately via set_netmask, mirroring the
        // two-step contract of spec §6; here we default to a /32 until the
        // real prefix length lands.
        let cidr = format!("{ip}/32");
        self.runner.run("ip", &["addr", "add", &cidr, "dev", name])
    }

    fn set_netmask(&self, name: &str, netmask: Ipv4Addr) -> Result<()> {
        let plen = prefix_len(netmask);
        let addrs = self
            .runner
            .run_capture_allow_fail("ip", &["-4", "-o", "addr", "show", "dev", name])
            .context("listing addresses")?;
        let Some(current) = addrs.split_whitespace().find(|tok| tok.contains('/')) else {
            return Err(anyhow!("bridge '{name}' has no address to rewrite netmask for"));
        };
        let ip = current.split('/').next().unwrap_or(current);
        let cidr = format!("{ip}/{plen}");
        self.runner.run_allow_fail("ip", &["addr", "del", current, "dev", name])?;
        self.runner.run("ip", &["addr", "add", &cidr, "dev", name])
    }

    fn set_up(&self, name: &str, up: bool) -> Result<()> {
        let state = if up { "up" } else { "down" };
        self.runner.run("ip", &["link", "set", name, state])
    }

    fn has(&self, name: &str) -> Result<bool> {
        let out = self.runner.run_capture_allow_fail("ip", &["link", "show", name])?;
        Ok(!out.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_len_slash_24() {
        assert_eq!(prefix_len("255.255.255.0".parse().unwrap()), 24);
    }

    #[test]
    fn prefix_len_slash_16() {
        assert_eq!(prefix_len("255.255.0.0".parse().unwrap()), 16);
    }

    #[test]
    fn dry_run_add_succeeds_without_a_real_bridge() {
        let runner = CommandRunner::new(false, true);
        let effector = IpRouteBridgeEffector::new(runner);
        effector.add("virbr-test0").unwrap();
    }
}
