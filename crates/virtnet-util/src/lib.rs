use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use anyhow::{Context, Result, anyhow};

pub mod pid;

/// Runs external host tools (`ip`, `iptables`, `ebtables`, dnsmasq helpers, …)
/// and records the command line when verbose logging is enabled.
///
/// This is the concrete, process-spawning half of the `proc.spawn`/`proc.signal`
/// host-effector contract; the trait side lives in `virtnet-effectors`.
#[derive(Clone)]
pub struct CommandRunner {
    pub verbose: bool,
    pub dry_run: bool,
}

impl CommandRunner {
    pub fn new(verbose: bool, dry_run: bool) -> Self {
        Self { verbose, dry_run }
    }

    /// Runs to completion; a non-zero exit status is an error.
    pub fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        self.trace(program, args);
        if self.dry_run {
            return Ok(());
        }
        let status = Command::new(program)
            .args(args)
            .status()
            .with_context(|| format!("failed to spawn {program}"))?;
        if !status.success() {
            return Err(anyhow!(
                "command failed ({}): {} {}",
                describe_status(status),
                program,
                args.join(" ")
            ));
        }
        Ok(())
    }

    /// Runs to completion but swallows a non-zero exit (used for idempotent
    /// cleanup steps where "already absent" and "removed" are both fine).
    pub fn run_allow_fail(&self, program: &str, args: &[&str]) -> Result<()> {
        self.trace(program, args);
        if self.dry_run {
            return Ok(());
        }
        let _ = Command::new(program)
            .args(args)
            .status()
            .with_context(|| format!("failed to spawn {program}"))?;
        Ok(())
    }

    /// Runs and returns captured stdout, trimmed. Non-zero exit is not an
    /// error (used for probing commands like `grep`/`iptables -L -n`).
    pub fn run_capture_allow_fail(&self, program: &str, args: &[&str]) -> Result<String> {
        self.trace(program, args);
        if self.dry_run {
            return Ok(String::new());
        }
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("failed to spawn {program}"))?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn trace(&self, program: &str, args: &[&str]) {
        if self.verbose {
            tracing::debug!(program, args = %args.join(" "), "exec");
        }
    }
}

fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit {code}"),
        None => "killed by signal".to_string(),
    }
}

pub fn find_in_path<S: AsRef<OsStr>>(binary: S) -> Option<PathBuf> {
    let binary = binary.as_ref();
    if Path::new(binary).is_file() {
        return Some(PathBuf::from(binary));
    }
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let full = dir.join(binary);
        if full.is_file() {
            return Some(full);
        }
    }
    None
}

pub fn set_permissions_0600(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

pub fn set_permissions_0700(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}

pub fn is_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_in_path_locates_sh() {
        assert!(find_in_path("sh").is_some());
    }

    #[test]
    fn find_in_path_rejects_unknown_binary() {
        assert!(find_in_path("definitely-not-a-real-binary-xyz").is_none());
    }

    #[test]
    fn dry_run_skips_execution_but_succeeds() {
        let runner = CommandRunner::new(false, true);
        runner.run("definitely-not-a-real-binary-xyz", &["--help"]).unwrap();
    }

    #[test]
    fn run_allow_fail_tolerates_nonzero_exit() {
        let runner = CommandRunner::new(false, false);
        runner.run_allow_fail("false", &[]).unwrap();
    }
}
