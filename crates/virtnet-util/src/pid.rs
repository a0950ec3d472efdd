//! Pidfile helpers shared by the DHCP sidecar supervisor and the registry's
//! own lock file. Grounded on the `/proc/<pid>` probing idiom in
//! `state::StateStore::is_lock_stale` and the dnsmasq pid reattach logic in
//! the original network driver.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// `fs.read_pid(dir, name) -> pid?`
pub fn read_pid(dir: &Path, name: &str) -> Result<Option<i32>> {
    let path = pid_path(dir, name);
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    match contents.trim().parse::<i32>() {
        Ok(pid) => Ok(Some(pid)),
        Err(_) => Ok(None),
    }
}

pub fn pid_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.pid"))
}

/// `signal 0` probe: true iff the process exists and is visible to us.
pub fn is_alive(pid: i32) -> bool {
    signal::kill(Pid::from_raw(pid), None).is_ok()
}

/// Sends a signal, treating "no such process" as success (already gone).
pub fn send_signal(pid: i32, sig: Signal) -> Result<()> {
    match signal::kill(Pid::from_raw(pid), sig) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("signalling pid {pid}")),
    }
}

/// True if `/proc/<pid>/exe` resolves to a path whose filename matches
/// `expected_basename`. Used to reject a reattached pid that has been
/// recycled by an unrelated process since the daemon last ran.
pub fn exe_matches(pid: i32, expected_basename: &str) -> bool {
    let link = format!("/proc/{pid}/exe");
    match std::fs::read_link(&link) {
        Ok(target) => target
            .file_name()
            .map(|f| f == expected_basename)
            .unwrap_or(false),
        // Can't verify (permissions, exe unlinked, no /proc) — do not fail
        // closed, since this check is best-effort hardening, not a gate.
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn read_pid_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_pid(dir.path(), "net0").unwrap().is_none());
    }

    #[test]
    fn read_pid_parses_contents() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("net0.pid"), "12345\n").unwrap();
        assert_eq!(read_pid(dir.path(), "net0").unwrap(), Some(12345));
    }

    #[test]
    fn read_pid_garbage_is_none() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("net0.pid"), "not-a-pid\n").unwrap();
        assert_eq!(read_pid(dir.path(), "net0").unwrap(), None);
    }

    #[test]
    fn self_pid_is_alive() {
        let pid = std::process::id() as i32;
        assert!(is_alive(pid));
    }

    #[test]
    fn send_signal_to_dead_pid_is_ok() {
        // A pid vanishingly unlikely to be alive on any test host.
        send_signal(i32::MAX - 1, Signal::SIGTERM).unwrap();
    }
}
