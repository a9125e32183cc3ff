//! Atomic publication of canonical snapshots.
//!
//! The on-disk artifact is written next to its target and renamed over
//! it, mtime already stamped to the source's. The kernel-visible set is
//! replaced by loading a temporary set and swapping it in; the live set
//! is untouched unless every step succeeded.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::config::{Representation, Settings};
use crate::kernel::{KernelSets, DEFAULT_MAXELEM};
use crate::range::RangeSet;
use crate::utils::set_mtime;

pub struct Publisher<'a> {
    settings: &'a Settings,
    kernel: &'a dyn KernelSets,
}

impl<'a> Publisher<'a> {
    pub fn new(settings: &'a Settings, kernel: &'a dyn KernelSets) -> Self {
        Self { settings, kernel }
    }

    /// Write `text` to a temporary sibling, stamp it with the source
    /// mtime, and rename it over `target`. A failed attempt leaves the
    /// previous snapshot intact and, when enabled, parks the temporary
    /// under the errors directory.
    pub fn publish_file(&self, target: &Path, text: &str, mtime: i64) -> Result<()> {
        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .context("target has no file name")?
            .to_string();
        let tmp = target.with_file_name(format!(".{}.tmp", file_name));

        let attempt = (|| -> Result<()> {
            fs::write(&tmp, text).with_context(|| format!("failed to write {:?}", tmp))?;
            set_mtime(&tmp, mtime)?;
            fs::rename(&tmp, target)
                .with_context(|| format!("failed to replace {:?}", target))?;
            Ok(())
        })();

        if attempt.is_err() {
            if self.settings.keep_errors && tmp.exists() {
                let parked = self.settings.errors_dir.join(&file_name);
                let _ = fs::create_dir_all(&self.settings.errors_dir);
                if fs::rename(&tmp, &parked).is_ok() {
                    warn!("kept failed artifact at {:?}", parked);
                }
            } else {
                let _ = fs::remove_file(&tmp);
            }
        }
        attempt
    }

    /// Park a failed intermediate (for example a rejected parse result)
    /// under the errors directory for diagnosis.
    pub fn preserve_error(&self, file_name: &str, content: &[u8]) {
        if !self.settings.keep_errors {
            return;
        }
        let parked = self.settings.errors_dir.join(file_name);
        if fs::create_dir_all(&self.settings.errors_dir)
            .and_then(|_| fs::write(&parked, content))
            .is_ok()
        {
            warn!("kept failed artifact at {:?}", parked);
        }
    }

    /// Touch the existing snapshot so its mtime tracks the source even
    /// when the content did not change.
    pub fn refresh_mtime(&self, target: &Path, mtime: i64) -> Result<()> {
        set_mtime(target, mtime)
    }

    /// Replace the kernel-visible set named `name`, if it exists, with
    /// the given content. Net-kind sets are prefix-reduced first to fit
    /// the hash; if the entry count still exceeds the default limit the
    /// temporary set is created larger.
    pub fn publish_kernel(
        &self,
        name: &str,
        repr: Representation,
        set: &RangeSet,
    ) -> Result<()> {
        let existing = self.kernel.list_names()?;
        if !existing.iter().any(|n| n == name) {
            debug!("kernel set {} not loaded, skipping swap", name);
            return Ok(());
        }

        let kind = repr.hash_kind();
        let lines: Vec<String> = if kind == "hash:ip" {
            set.hosts().map(|h| h.to_string()).collect()
        } else {
            let reduced =
                set.prefix_reduce(self.settings.reduce_factor, self.settings.reduce_entries);
            reduced.to_cidrs().iter().map(|n| n.to_string()).collect()
        };

        let mut maxelem = DEFAULT_MAXELEM;
        if lines.len() > maxelem {
            maxelem = lines.len().next_power_of_two();
        }

        let tmp = format!("{}.t", name);
        // A leftover temporary from a crashed run would fail create.
        if existing.iter().any(|n| *n == tmp) {
            let _ = self.kernel.destroy(&tmp);
        }

        let load = (|| -> Result<()> {
            self.kernel.create(&tmp, kind, maxelem)?;
            let mut batch = String::with_capacity(lines.len() * 24 + 8);
            for line in &lines {
                batch.push_str("add ");
                batch.push_str(&tmp);
                batch.push(' ');
                batch.push_str(line);
                batch.push('\n');
            }
            batch.push_str("COMMIT\n");
            self.kernel.restore(&batch)?;
            self.kernel.swap(name, &tmp)?;
            Ok(())
        })();

        match load {
            Ok(()) => self.kernel.destroy(&tmp),
            Err(e) => {
                let _ = self.kernel.destroy(&tmp);
                Err(e.context(format!("kernel publication of {} failed", name)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mock::MockKernel;
    use crate::utils::read_mtime;
    use tempfile::TempDir;

    // Built literally so ambient environment overrides cannot leak in.
    fn settings(dir: &TempDir) -> Settings {
        Settings {
            base_dir: dir.path().to_path_buf(),
            cache_file: dir.path().join(".cache"),
            lib_dir: dir.path().join("lib"),
            tmp_dir: dir.path().join("tmp"),
            history_dir: dir.path().join("history"),
            errors_dir: dir.path().join("errors"),
            keep_errors: true,
            kernel_publish: false,
            stale_after: 7 * 1440,
            parallel_dns_queries: 4,
            max_download_time: 30,
            max_connect_time: 5,
            user_agent: "feedset-test".to_string(),
            failure_threshold: 10,
            reduce_factor: 20,
            reduce_entries: 65_536,
        }
    }

    fn set(tokens: &[&str]) -> RangeSet {
        RangeSet::from_tokens(tokens.iter().copied())
    }

    #[test]
    fn test_publish_file_atomic_with_mtime() {
        let dir = TempDir::new().unwrap();
        let s = settings(&dir);
        let kernel = MockKernel::default();
        let publisher = Publisher::new(&s, &kernel);

        let target = dir.path().join("demo.netset");
        publisher
            .publish_file(&target, "# demo\n1.2.3.0/24\n", 1234)
            .unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "# demo\n1.2.3.0/24\n");
        assert_eq!(read_mtime(&target), 1234);
        // No temporary left behind.
        assert!(!dir.path().join(".demo.netset.tmp").exists());
    }

    #[test]
    fn test_publish_file_failure_keeps_previous() {
        let dir = TempDir::new().unwrap();
        let s = settings(&dir);
        let kernel = MockKernel::default();
        let publisher = Publisher::new(&s, &kernel);

        let target = dir.path().join("gone").join("demo.netset");
        assert!(publisher.publish_file(&target, "x\n", 1).is_err());
    }

    #[test]
    fn test_preserve_error() {
        let dir = TempDir::new().unwrap();
        let s = settings(&dir);
        let kernel = MockKernel::default();
        let publisher = Publisher::new(&s, &kernel);
        publisher.preserve_error("demo.netset", b"broken\n");
        assert_eq!(
            fs::read_to_string(dir.path().join("errors/demo.netset")).unwrap(),
            "broken\n"
        );
    }

    #[test]
    fn test_kernel_swap_sequence() {
        let dir = TempDir::new().unwrap();
        let s = settings(&dir);
        let kernel = MockKernel::with_sets(&["demo"]);
        let publisher = Publisher::new(&s, &kernel);

        publisher
            .publish_kernel("demo", Representation::Both, &set(&["1.2.3.0/24", "5.6.7.8"]))
            .unwrap();

        let calls = kernel.call_log();
        assert_eq!(
            calls,
            vec![
                format!("create demo.t hash:net {}", DEFAULT_MAXELEM),
                // two adds plus COMMIT
                "restore 3 lines".to_string(),
                "swap demo demo.t".to_string(),
                "destroy demo.t".to_string(),
            ]
        );
    }

    #[test]
    fn test_kernel_skips_unloaded_sets() {
        let dir = TempDir::new().unwrap();
        let s = settings(&dir);
        let kernel = MockKernel::default();
        let publisher = Publisher::new(&s, &kernel);
        publisher
            .publish_kernel("demo", Representation::Both, &set(&["1.2.3.4"]))
            .unwrap();
        assert!(kernel.call_log().is_empty());
    }

    #[test]
    fn test_kernel_failure_destroys_temp_and_leaves_production() {
        let dir = TempDir::new().unwrap();
        let s = settings(&dir);
        let mut kernel = MockKernel::with_sets(&["demo"]);
        kernel.fail_on = Some("restore");
        let publisher = Publisher::new(&s, &kernel);

        let err = publisher
            .publish_kernel("demo", Representation::Both, &set(&["1.2.3.4"]))
            .unwrap_err();
        assert!(err.to_string().contains("demo"));

        let calls = kernel.call_log();
        assert!(calls.iter().any(|c| c == "destroy demo.t"));
        assert!(!calls.iter().any(|c| c.starts_with("swap")));
    }

    #[test]
    fn test_kernel_ip_kind_expands_hosts() {
        let dir = TempDir::new().unwrap();
        let s = settings(&dir);
        let kernel = MockKernel::with_sets(&["demo_ip"]);
        let publisher = Publisher::new(&s, &kernel);
        publisher
            .publish_kernel("demo_ip", Representation::Ip, &set(&["1.0.0.0/30"]))
            .unwrap();
        let calls = kernel.call_log();
        assert_eq!(calls[0], format!("create demo_ip.t hash:ip {}", DEFAULT_MAXELEM));
        // four hosts plus COMMIT
        assert_eq!(calls[1], "restore 5 lines");
    }

    #[test]
    fn test_kernel_grows_maxelem_for_large_sets() {
        let dir = TempDir::new().unwrap();
        let mut s = settings(&dir);
        // Disable reduction so the entry count stays above the default.
        s.reduce_entries = usize::MAX;
        let kernel = MockKernel::with_sets(&["big"]);
        let publisher = Publisher::new(&s, &kernel);

        // 2^17 /32 entries spread so they cannot merge.
        let ranges: Vec<(u32, u32)> = (0..131_072u32).map(|i| (i * 2, i * 2)).collect();
        let big = RangeSet::from_ranges(ranges);
        publisher
            .publish_kernel("big", Representation::Both, &big)
            .unwrap();
        let calls = kernel.call_log();
        assert_eq!(calls[0], "create big.t hash:net 131072");
    }

    #[test]
    fn test_kernel_leftover_temp_is_destroyed_first() {
        let dir = TempDir::new().unwrap();
        let s = settings(&dir);
        let kernel = MockKernel::with_sets(&["demo", "demo.t"]);
        let publisher = Publisher::new(&s, &kernel);
        publisher
            .publish_kernel("demo", Representation::Both, &set(&["1.2.3.4"]))
            .unwrap();
        assert_eq!(kernel.call_log()[0], "destroy demo.t");
    }
}
