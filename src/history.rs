//! Per-feed archive of past canonical sets.
//!
//! Each accepted snapshot is kept in binary form under
//! `history/<feed>/<ts>.set`, named and stamped by its source timestamp.
//! The archive feeds the windowed unions and is trimmed to the longest
//! configured window.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::range::RangeSet;
use crate::utils::set_mtime;

pub struct HistoryStore {
    root: PathBuf,
}

impl HistoryStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn feed_dir(&self, feed: &str) -> PathBuf {
        self.root.join(feed)
    }

    /// List `(timestamp, path)` entries of a feed's archive, oldest first.
    fn entries(&self, feed: &str) -> Result<Vec<(i64, PathBuf)>> {
        let dir = self.feed_dir(feed);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("failed to list {:?}", dir))? {
            let entry = entry?;
            let path = entry.path();
            let Some(ts) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".set"))
                .and_then(|n| n.parse::<i64>().ok())
            else {
                continue;
            };
            out.push((ts, path));
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Archive a snapshot under its source timestamp. Existing entries
    /// are never rewritten.
    pub fn keep(&self, feed: &str, set: &RangeSet, source_ts: i64) -> Result<()> {
        let dir = self.feed_dir(feed);
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {:?}", dir))?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))
            .with_context(|| format!("failed to restrict {:?}", dir))?;
        let path = dir.join(format!("{}.set", source_ts));
        if path.exists() {
            return Ok(());
        }
        set.write_binary(&path)?;
        set_mtime(&path, source_ts)?;
        Ok(())
    }

    /// Union of every archive entry newer than `now - since_minutes`.
    pub fn union_since(&self, feed: &str, since_minutes: u64, now: i64) -> Result<RangeSet> {
        let cutoff = now - since_minutes as i64 * 60;
        let paths: Vec<PathBuf> = self
            .entries(feed)?
            .into_iter()
            .filter(|(ts, _)| *ts > cutoff)
            .map(|(_, p)| p)
            .collect();
        RangeSet::union_binaries(paths.iter().map(|p| p.as_path()))
    }

    /// Delete entries older than the longest configured window. Returns
    /// the number removed.
    pub fn cleanup(&self, feed: &str, max_window_minutes: u64, now: i64) -> Result<usize> {
        let cutoff = now - max_window_minutes as i64 * 60;
        let mut removed = 0;
        for (ts, path) in self.entries(feed)? {
            if ts <= cutoff {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {:?}", path))?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("history {}: dropped {} expired snapshots", feed, removed);
        }
        Ok(removed)
    }

    /// Remove a retired feed's whole archive.
    pub fn remove_feed(&self, feed: &str) -> Result<()> {
        let dir = self.feed_dir(feed);
        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| format!("failed to remove {:?}", dir))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn set(tokens: &[&str]) -> RangeSet {
        RangeSet::from_tokens(tokens.iter().copied())
    }

    #[test]
    fn test_keep_and_union() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::new(dir.path());
        let now = 100_000;

        store.keep("demo", &set(&["10.0.0.0/24"]), now - 3600).unwrap();
        store.keep("demo", &set(&["10.0.1.0/24"]), now - 1800).unwrap();
        store.keep("demo", &set(&["10.0.2.0/24"]), now - 60).unwrap();

        // 24h window sees everything.
        let day = store.union_since("demo", 1440, now).unwrap();
        assert_eq!(day.count().0, 2); // 10.0.0.0/23 + 10.0.2.0/24

        // 20 minute window sees only the newest.
        let recent = store.union_since("demo", 20, now).unwrap();
        assert_eq!(
            recent.to_cidrs()[0].to_string(),
            "10.0.2.0/24"
        );
    }

    #[test]
    fn test_keep_is_idempotent_per_timestamp() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::new(dir.path());
        store.keep("demo", &set(&["1.2.3.4"]), 500).unwrap();
        // A different set under the same timestamp must not overwrite.
        store.keep("demo", &set(&["5.6.7.8"]), 500).unwrap();
        let all = store.union_since("demo", 1_000_000, 1000).unwrap();
        assert_eq!(all, set(&["1.2.3.4"]));
    }

    #[test]
    fn test_mtime_matches_source_timestamp() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::new(dir.path());
        store.keep("demo", &set(&["1.2.3.4"]), 12_345).unwrap();
        let path = dir.path().join("demo").join("12345.set");
        assert_eq!(crate::utils::read_mtime(&path), 12_345);
    }

    #[test]
    fn test_cleanup_drops_expired() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::new(dir.path());
        let now = 1_000_000;
        store.keep("demo", &set(&["1.2.3.4"]), now - 10 * 86_400).unwrap();
        store.keep("demo", &set(&["5.6.7.8"]), now - 3600).unwrap();

        let removed = store.cleanup("demo", 10_080, now).unwrap();
        assert_eq!(removed, 1);
        let left = store.union_since("demo", 1_000_000, now).unwrap();
        assert_eq!(left, set(&["5.6.7.8"]));
    }

    #[test]
    fn test_unknown_feed_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::new(dir.path());
        assert!(store.union_since("ghost", 1440, 1000).unwrap().is_empty());
        assert_eq!(store.cleanup("ghost", 1440, 1000).unwrap(), 0);
    }

    #[test]
    fn test_remove_feed() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::new(dir.path());
        store.keep("demo", &set(&["1.2.3.4"]), 500).unwrap();
        store.remove_feed("demo").unwrap();
        assert!(!dir.path().join("demo").exists());
        store.remove_feed("demo").unwrap();
    }

    #[test]
    fn test_directory_permissions() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::new(dir.path());
        store.keep("demo", &set(&["1.2.3.4"]), 500).unwrap();
        let mode = fs::metadata(dir.path().join("demo"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
