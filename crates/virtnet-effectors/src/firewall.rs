//! The `iptables_ctx.*`/`iptables.save()` effector of spec §6: idempotent
//! install/remove of a single rule on one of the three packet-filter
//! backends, plus ruleset persistence. Idempotency follows the teacher's
//! `iptables::apply`/`remove` shape — a best-effort delete before every
//! create, rather than a check-then-act race.

use anyhow::Result;
use virtnet_model::Backend;
use virtnet_util::CommandRunner;

pub trait FirewallEffector: Send + Sync {
    /// Creates `chain` in `table` if it does not already exist.
    fn ensure_chain(&self, backend: Backend, table: &str, chain: &str) -> Result<()>;

    /// Installs one rule, identified by its full argument list. Idempotent:
    /// an identical delete is attempted first so re-running never duplicates
    /// the rule.
    fn install_rule(&self, backend: Backend, table: &str, chain: &str, args: &[String]) -> Result<()>;

    /// Removes one rule if present; absent is success.
    fn remove_rule(&self, backend: Backend, table: &str, chain: &str, args: &[String]) -> Result<()>;

    /// Persists the backend's current ruleset (`iptables-save` etc).
    fn save(&self, backend: Backend) -> Result<String>;
}

pub struct CliFirewallEffector {
    runner: CommandRunner,
}

impl CliFirewallEffector {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }

    fn table_args(table: &str) -> Vec<String> {
        vec!["-t".to_string(), table.to_string()]
    }
}

impl FirewallEffector for CliFirewallEffector {
    fn ensure_chain(&self, backend: Backend, table: &str, chain: &str) -> Result<()> {
        let program = backend.program();
        let mut new_chain = Self::table_args(table);
        new_chain.extend(["-N".to_string(), chain.to_string()]);
        let args: Vec<&str> = new_chain.iter().map(String::as_str).collect();
        // Fails when the chain already exists; that is success here.
        self.runner.run_allow_fail(program, &args)
    }

    fn install_rule(&self, backend: Backend, table: &str, chain: &str, args: &[String]) -> Result<()> {
        self.remove_rule(backend, table, chain, args)?;
        let program = backend.program();
        let mut append = Self::table_args(table);
        append.push("-A".to_string());
        append.push(chain.to_string());
        append.extend(args.iter().cloned());
        let append_ref: Vec<&str> = append.iter().map(String::as_str).collect();
        self.runner.run(program, &append_ref)
    }

    fn remove_rule(&self, backend: Backend, table: &str, chain: &str, args: &[String]) -> Result<()> {
        let program = backend.program();
        let mut delete = Self::table_args(table);
        delete.push("-D".to_string());
        delete.push(chain.to_string());
        delete.extend(args.iter().cloned());
        let delete_ref: Vec<&str> = delete.iter().map(String::as_str).collect();
        self.runner.run_allow_fail(program, &delete_ref)
    }

    fn save(&self, backend: Backend) -> Result<String> {
        self.runner.run_capture_allow_fail(backend.save_program(), &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_install_is_a_noop_success() {
        let runner = CommandRunner::new(false, true);
        let effector = CliFirewallEffector::new(runner);
        effector
            .install_rule(Backend::Iptables, "filter", "FORWARD", &["-j".to_string(), "ACCEPT".to_string()])
            .unwrap();
    }

    #[test]
    fn dry_run_ensure_chain_is_a_noop_success() {
        let runner = CommandRunner::new(false, true);
        let effector = CliFirewallEffector::new(runner);
        effector.ensure_chain(Backend::Iptables, "filter", "LIBVIRT_FWI").unwrap();
    }

    #[test]
    fn dry_run_save_returns_empty_string() {
        let runner = CommandRunner::new(false, true);
        let effector = CliFirewallEffector::new(runner);
        assert_eq!(effector.save(Backend::Iptables).unwrap(), "");
    }
}
