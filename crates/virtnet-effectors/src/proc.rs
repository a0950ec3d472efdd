//! The `proc.*` effector of spec §6: synchronous spawn-and-wait and
//! signal delivery, used by the DHCP sidecar supervisor and the daemon's
//! own reload/shutdown handling.

use std::process::ExitStatus;

use anyhow::{Context, Result};
use nix::sys::signal::Signal;

pub trait ProcEffector: Send + Sync {
    fn spawn(&self, argv: &[String]) -> Result<ExitStatus>;
    fn signal(&self, pid: i32, which: Signal) -> Result<()>;
}

pub struct StdProcEffector;

impl ProcEffector for StdProcEffector {
    fn spawn(&self, argv: &[String]) -> Result<ExitStatus> {
        let (program, args) = argv.split_first().context("empty argv")?;
        std::process::Command::new(program)
            .args(args)
            .status()
            .with_context(|| format!("failed to spawn {program}"))
    }

    fn signal(&self, pid: i32, which: Signal) -> Result<()> {
        virtnet_util::pid::send_signal(pid, which)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_rejects_empty_argv() {
        let effector = StdProcEffector;
        assert!(effector.spawn(&[]).is_err());
    }

    #[test]
    fn spawn_runs_true() {
        let effector = StdProcEffector;
        let status = effector.spawn(&["true".to_string()]).unwrap();
        assert!(status.success());
    }

    #[test]
    fn signal_to_dead_pid_is_ok() {
        let effector = StdProcEffector;
        effector.signal(i32::MAX - 1, Signal::SIGTERM).unwrap();
    }
}
