//! The chain-manipulation half of the host effector contract: creating,
//! deleting, renaming chains and running already-rendered rule argv —
//! narrower than `virtnet_effectors::FirewallEffector`, which only ever
//! appends/removes single rules on a fixed chain.

use anyhow::Result;
use virtnet_model::Backend;
use virtnet_util::CommandRunner;

pub trait ChainEffector: Send + Sync {
    /// Creates `chain`; idempotent in the sense that the manager always
    /// deletes any stale chain of the same name first.
    fn create_chain(&self, backend: Backend, table: Option<&str>, chain: &str) -> Result<()>;

    /// Deletes `chain`; tolerates absence.
    fn delete_chain(&self, backend: Backend, table: Option<&str>, chain: &str) -> Result<()>;

    /// Atomically renames `from` to `to`.
    fn rename_chain(&self, backend: Backend, table: Option<&str>, from: &str, to: &str) -> Result<()>;

    /// Runs a fully-rendered command (one `RuleInstance::render` output).
    fn run(&self, backend: Backend, args: &[String]) -> Result<()>;

    /// Creates a process-wide base chain (`libvirt-in` and friends);
    /// tolerates the chain already existing, unlike `create_chain`, since
    /// base chains are never torn down between applies.
    fn ensure_builtin_chain(&self, backend: Backend, table: Option<&str>, chain: &str) -> Result<()>;

    /// Returns the 1-based line number of the first rule in `chain` whose
    /// text contains `needle`, or `None` if no such rule exists. Backs the
    /// base-chain linker's grep-the-position step.
    fn chain_rule_position(&self, backend: Backend, table: Option<&str>, chain: &str, needle: &str) -> Result<Option<u32>>;

    /// Inserts a rule built from `args` at line `pos` of `chain`.
    fn insert_at(&self, backend: Backend, table: Option<&str>, chain: &str, pos: u32, args: &[String]) -> Result<()>;

    /// Deletes the rule at line `pos` of `chain`; tolerates absence.
    fn delete_at(&self, backend: Backend, table: Option<&str>, chain: &str, pos: u32) -> Result<()>;
}

pub struct CliChainEffector {
    runner: CommandRunner,
}

impl CliChainEffector {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }

    fn table_args(table: Option<&str>) -> Vec<String> {
        match table {
            Some(t) => vec!["-t".to_string(), t.to_string()],
            None => Vec::new(),
        }
    }
}

impl ChainEffector for CliChainEffector {
    fn create_chain(&self, backend: Backend, table: Option<&str>, chain: &str) -> Result<()> {
        let program = backend.program();
        let mut args = Self::table_args(table);
        args.extend(["-N".to_string(), chain.to_string()]);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner.run(program, &refs)
    }

    fn delete_chain(&self, backend: Backend, table: Option<&str>, chain: &str) -> Result<()> {
        let program = backend.program();
        let mut flush = Self::table_args(table);
        flush.extend(["-F".to_string(), chain.to_string()]);
        let flush_refs: Vec<&str> = flush.iter().map(String::as_str).collect();
        let _ = self.runner.run_allow_fail(program, &flush_refs);

        let mut delete = Self::table_args(table);
        delete.extend(["-X".to_string(), chain.to_string()]);
        let delete_refs: Vec<&str> = delete.iter().map(String::as_str).collect();
        self.runner.run_allow_fail(program, &delete_refs)
    }

    fn rename_chain(&self, backend: Backend, table: Option<&str>, from: &str, to: &str) -> Result<()> {
        let program = backend.program();
        let mut args = Self::table_args(table);
        args.extend(["-E".to_string(), from.to_string(), to.to_string()]);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner.run(program, &refs)
    }

    fn run(&self, backend: Backend, args: &[String]) -> Result<()> {
        let program = backend.program();
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner.run(program, &refs)
    }

    fn ensure_builtin_chain(&self, backend: Backend, table: Option<&str>, chain: &str) -> Result<()> {
        let program = backend.program();
        let mut args = Self::table_args(table);
        args.extend(["-N".to_string(), chain.to_string()]);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner.run_allow_fail(program, &refs)
    }

    fn chain_rule_position(&self, backend: Backend, table: Option<&str>, chain: &str, needle: &str) -> Result<Option<u32>> {
        let program = backend.program();
        let mut args = Self::table_args(table);
        args.extend(["-L".to_string(), chain.to_string(), "-n".to_string(), "--line-numbers".to_string()]);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.runner.run_capture_allow_fail(program, &refs)?;
        for line in out.lines() {
            if line.contains(needle) {
                if let Some(pos) = line.split_whitespace().next().and_then(|tok| tok.parse::<u32>().ok()) {
                    return Ok(Some(pos));
                }
            }
        }
        Ok(None)
    }

    fn insert_at(&self, backend: Backend, table: Option<&str>, chain: &str, pos: u32, args: &[String]) -> Result<()> {
        let program = backend.program();
        let mut full = Self::table_args(table);
        full.extend(["-I".to_string(), chain.to_string(), pos.to_string()]);
        full.extend(args.iter().cloned());
        let refs: Vec<&str> = full.iter().map(String::as_str).collect();
        self.runner.run(program, &refs)
    }

    fn delete_at(&self, backend: Backend, table: Option<&str>, chain: &str, pos: u32) -> Result<()> {
        let program = backend.program();
        let mut full = Self::table_args(table);
        full.extend(["-D".to_string(), chain.to_string(), pos.to_string()]);
        let refs: Vec<&str> = full.iter().map(String::as_str).collect();
        self.runner.run_allow_fail(program, &refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_create_chain_is_a_noop_success() {
        let runner = CommandRunner::new(false, true);
        let effector = CliChainEffector::new(runner);
        effector.create_chain(Backend::Iptables, None, "FI-vnet1").unwrap();
    }

    #[test]
    fn dry_run_delete_chain_tolerates_absence() {
        let runner = CommandRunner::new(false, false);
        let effector = CliChainEffector::new(runner);
        effector.delete_chain(Backend::Iptables, None, "definitely-not-a-real-chain").unwrap();
    }

    #[test]
    fn dry_run_rename_chain_is_a_noop_success() {
        let runner = CommandRunner::new(false, true);
        let effector = CliChainEffector::new(runner);
        effector.rename_chain(Backend::Ebtables, None, "FJ-vnet1", "FI-vnet1").unwrap();
    }

    #[test]
    fn dry_run_ensure_builtin_chain_tolerates_already_existing() {
        let runner = CommandRunner::new(false, false);
        let effector = CliChainEffector::new(runner);
        effector.ensure_builtin_chain(Backend::Iptables, None, "libvirt-in").unwrap();
        effector.ensure_builtin_chain(Backend::Iptables, None, "libvirt-in").unwrap();
    }

    #[test]
    fn dry_run_chain_rule_position_on_empty_chain_is_none() {
        let runner = CommandRunner::new(false, true);
        let effector = CliChainEffector::new(runner);
        let pos = effector.chain_rule_position(Backend::Iptables, None, "libvirt-in", " libvirt-in ").unwrap();
        assert!(pos.is_none());
    }

    #[test]
    fn dry_run_insert_and_delete_at_are_noop_success() {
        let runner = CommandRunner::new(false, true);
        let effector = CliChainEffector::new(runner);
        effector
            .insert_at(Backend::Iptables, None, "FORWARD", 1, &["-j".to_string(), "libvirt-in".to_string()])
            .unwrap();
        effector.delete_at(Backend::Iptables, None, "FORWARD", 2).unwrap();
    }
}
