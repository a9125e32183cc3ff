//! The kernel-visible named set interface.
//!
//! Five operations, each atomic at the kernel boundary, implemented over
//! the `ipset` command line. Non-privileged runs get the disabled
//! adapter: file publication still happens, kernel publication becomes a
//! no-op.

use anyhow::Result;

use crate::cmd_abstraction::{args_to_strings, CommandExecutor, RealCommandExecutor};

/// Default hash size limit of a kernel set.
pub const DEFAULT_MAXELEM: usize = 65_536;

pub trait KernelSets: Send + Sync {
    /// Names of all sets currently loaded.
    fn list_names(&self) -> Result<Vec<String>>;

    /// Create an empty set of the given kind and capacity.
    fn create(&self, name: &str, kind: &str, maxelem: usize) -> Result<()>;

    /// Load a batch-terminated stream of `add` directives.
    fn restore(&self, batch: &str) -> Result<()>;

    /// Atomically exchange the contents of two sets.
    fn swap(&self, a: &str, b: &str) -> Result<()>;

    fn destroy(&self, name: &str) -> Result<()>;
}

/// `ipset` CLI adapter.
pub struct IpsetCli<E: CommandExecutor> {
    exec: E,
}

impl IpsetCli<RealCommandExecutor> {
    pub fn new() -> Self {
        Self {
            exec: RealCommandExecutor,
        }
    }
}

impl Default for IpsetCli<RealCommandExecutor> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: CommandExecutor> IpsetCli<E> {
    pub fn with_executor(exec: E) -> Self {
        Self { exec }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let out = self.exec.execute("ipset", &args_to_strings(args))?;
        if out.success {
            Ok(out.stdout)
        } else {
            anyhow::bail!("ipset {} failed: {}", args.join(" "), out.stderr.trim())
        }
    }
}

impl<E: CommandExecutor> KernelSets for IpsetCli<E> {
    fn list_names(&self) -> Result<Vec<String>> {
        let out = self.run(&["list", "-n"])?;
        Ok(out.lines().map(|l| l.trim().to_string()).collect())
    }

    fn create(&self, name: &str, kind: &str, maxelem: usize) -> Result<()> {
        self.run(&[
            "create",
            name,
            kind,
            "family",
            "inet",
            "maxelem",
            &maxelem.to_string(),
        ])
        .map(|_| ())
    }

    fn restore(&self, batch: &str) -> Result<()> {
        let out = self
            .exec
            .execute_with_stdin("ipset", &args_to_strings(&["restore"]), batch)?;
        if out.success {
            Ok(())
        } else {
            anyhow::bail!("ipset restore failed: {}", out.stderr.trim())
        }
    }

    fn swap(&self, a: &str, b: &str) -> Result<()> {
        self.run(&["swap", a, b]).map(|_| ())
    }

    fn destroy(&self, name: &str) -> Result<()> {
        self.run(&["destroy", name]).map(|_| ())
    }
}

/// Adapter for non-privileged runs: reports no sets, so every kernel
/// publication short-circuits.
pub struct DisabledKernel;

impl KernelSets for DisabledKernel {
    fn list_names(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn create(&self, _name: &str, _kind: &str, _maxelem: usize) -> Result<()> {
        Ok(())
    }

    fn restore(&self, _batch: &str) -> Result<()> {
        Ok(())
    }

    fn swap(&self, _a: &str, _b: &str) -> Result<()> {
        Ok(())
    }

    fn destroy(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

/// Effective UID zero check. Kernel publication needs CAP_NET_ADMIN;
/// root covers the common deployment.
pub fn is_privileged() -> bool {
    // SAFETY: geteuid reads the effective uid, has no preconditions and
    // cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Pick the kernel adapter for this run.
pub fn create_kernel(enabled: bool) -> Box<dyn KernelSets> {
    if enabled && is_privileged() {
        Box::new(IpsetCli::new())
    } else {
        Box::new(DisabledKernel)
    }
}
