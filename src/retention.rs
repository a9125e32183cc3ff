//! Per-IP lifetime tracking.
//!
//! For every feed the tracker keeps, under `lib/<feed>/`, the latest
//! binary snapshot, one `new/<ts>` diff per batch of IPs that first
//! appeared at `ts` and has not fully rotated out, hour-bucketed
//! histograms of past and current lifetimes, and the changeset and
//! retention CSV rows the analytics surface consumes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::range::RangeSet;
use crate::utils::{read_mtime, set_mtime};

/// Derived retention state of one feed.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct RetentionModel {
    /// First time this feed was observed.
    pub started: i64,
    /// True until every IP of the inception snapshot has rotated out at
    /// least once.
    pub incomplete: bool,
    /// hour bucket -> IPs removed after living that many hours.
    pub past: BTreeMap<u64, u64>,
    /// hour bucket -> currently listed IPs of that age.
    pub current: BTreeMap<u64, u64>,
}

pub struct RetentionTracker {
    root: PathBuf,
}

/// Nearest-hour bucket of a lifetime in seconds.
fn hour_bucket(seconds: i64) -> u64 {
    ((seconds.max(0) + 1800) / 3600) as u64
}

impl RetentionTracker {
    pub fn new(lib_dir: &Path) -> Self {
        Self {
            root: lib_dir.to_path_buf(),
        }
    }

    fn feed_dir(&self, feed: &str) -> PathBuf {
        self.root.join(feed)
    }

    /// Load the persisted model, default when none exists yet.
    pub fn load_model(&self, feed: &str) -> Result<RetentionModel> {
        let path = self.feed_dir(feed).join("histogram");
        if !path.exists() {
            return Ok(RetentionModel::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("corrupt histogram {:?}", path))
    }

    fn save_model(&self, feed: &str, model: &RetentionModel) -> Result<()> {
        let path = self.feed_dir(feed).join("histogram");
        let content = serde_json::to_string_pretty(model)?;
        fs::write(&path, content).with_context(|| format!("failed to write {:?}", path))
    }

    fn append_csv(&self, feed: &str, file: &str, row: &str) -> Result<()> {
        let path = self.feed_dir(feed).join(file);
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {:?}", path))?;
        writeln!(f, "{}", row).with_context(|| format!("failed to append to {:?}", path))
    }

    /// List surviving `new/<ts>` diffs, oldest first.
    fn new_entries(&self, feed: &str) -> Result<Vec<(i64, PathBuf)>> {
        let dir = self.feed_dir(feed).join("new");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("failed to list {:?}", dir))? {
            let path = entry?.path();
            let Some(ts) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<i64>().ok())
            else {
                continue;
            };
            out.push((ts, path));
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Fold a fresh snapshot into the model. Snapshots not newer than
    /// the latest one are ignored.
    pub fn update(&self, feed: &str, snapshot: &RangeSet, ts: i64) -> Result<RetentionModel> {
        let dir = self.feed_dir(feed);
        let new_dir = dir.join("new");
        fs::create_dir_all(&new_dir)
            .with_context(|| format!("failed to create {:?}", new_dir))?;
        let latest_path = dir.join("latest");

        let mut model = self.load_model(feed)?;

        let latest = if latest_path.exists() {
            if ts <= read_mtime(&latest_path) {
                return Ok(model);
            }
            RangeSet::read_binary(&latest_path)?
        } else {
            model.started = ts;
            model.incomplete = true;
            RangeSet::new()
        };

        // Record what this snapshot added and dropped.
        let added = snapshot.difference(&latest);
        let removed_total = latest.difference(snapshot).ip_count();
        if !added.is_empty() {
            let path = new_dir.join(ts.to_string());
            added.write_binary(&path)?;
            set_mtime(&path, ts)?;
        }
        self.append_csv(
            feed,
            "changesets.csv",
            &format!("{},{},{}", ts, added.ip_count(), removed_total),
        )?;

        // Age out each pending batch against the new snapshot.
        for (batch_ts, path) in self.new_entries(feed)? {
            if batch_ts == ts {
                continue;
            }
            let batch = RangeSet::read_binary(&path)?;
            let still = batch.intersection(snapshot);
            let removed = batch.difference(&still);
            if !removed.is_empty() {
                let hours = hour_bucket(ts - batch_ts);
                if batch_ts > model.started {
                    *model.past.entry(hours).or_default() += removed.ip_count();
                }
                self.append_csv(
                    feed,
                    "retention.csv",
                    &format!("{},{},{},{}", ts, batch_ts, hours, removed.ip_count()),
                )?;
            }
            if still.is_empty() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {:?}", path))?;
            } else if !removed.is_empty() {
                still.write_binary(&path)?;
                set_mtime(&path, batch_ts)?;
            }
        }

        snapshot.write_binary(&latest_path)?;
        set_mtime(&latest_path, ts)?;

        // Rebuild the current histogram from the surviving batches.
        model.current.clear();
        model.incomplete = false;
        for (batch_ts, path) in self.new_entries(feed)? {
            let batch = RangeSet::read_binary(&path)?;
            *model.current.entry(hour_bucket(ts - batch_ts)).or_default() += batch.ip_count();
            if batch_ts <= model.started {
                model.incomplete = true;
            }
        }

        self.save_model(feed, &model)?;
        Ok(model)
    }

    /// Append one `t,entries,ips` size row for the analytics surface.
    pub fn append_history_row(
        &self,
        feed: &str,
        ts: i64,
        entries: usize,
        ips: u64,
    ) -> Result<()> {
        fs::create_dir_all(self.feed_dir(feed))?;
        self.append_csv(feed, "history.csv", &format!("{},{},{}", ts, entries, ips))
    }

    /// Remove a retired feed's retention state.
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
    fn test_hour_bucket_rounds() {
        assert_eq!(hour_bucket(0), 0);
        assert_eq!(hour_bucket(1799), 0);
        assert_eq!(hour_bucket(1800), 1);
        assert_eq!(hour_bucket(3600), 1);
        assert_eq!(hour_bucket(5400), 2);
    }

    #[test]
    fn test_first_snapshot_starts_model() {
        let dir = TempDir::new().unwrap();
        let tracker = RetentionTracker::new(dir.path());
        let model = tracker.update("demo", &set(&["1.2.3.4", "5.6.7.8"]), 1000).unwrap();
        assert_eq!(model.started, 1000);
        assert!(model.incomplete);
        assert_eq!(model.current.get(&0), Some(&2));
        assert!(model.past.is_empty());
    }

    #[test]
    fn test_rotation_after_one_hour() {
        let dir = TempDir::new().unwrap();
        let tracker = RetentionTracker::new(dir.path());

        // S1 = {a, b} at t=0, S2 = {b, c} at t=3600.
        tracker.update("demo", &set(&["10.0.0.1", "10.0.0.2"]), 0).unwrap();
        let model = tracker
            .update("demo", &set(&["10.0.0.2", "10.0.0.3"]), 3600)
            .unwrap();

        // `a` rotated out of the inception batch: still incomplete (b
        // survives) and, being inception, not counted as past.
        assert!(model.incomplete);
        assert!(model.past.is_empty());
        // Current: b is one hour old, c is new.
        assert_eq!(model.current.get(&1), Some(&1));
        assert_eq!(model.current.get(&0), Some(&1));
        let total: u64 = model.current.values().sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn test_post_inception_removals_count_as_past() {
        let dir = TempDir::new().unwrap();
        let tracker = RetentionTracker::new(dir.path());

        tracker.update("demo", &set(&["10.0.0.1"]), 0).unwrap();
        // d arrives at t=3600.
        tracker
            .update("demo", &set(&["10.0.0.1", "10.0.0.4"]), 3600)
            .unwrap();
        // d leaves at t=10800 after living 2 hours.
        let model = tracker.update("demo", &set(&["10.0.0.1"]), 10_800).unwrap();
        assert_eq!(model.past.get(&2), Some(&1));
        // Inception IP still listed.
        assert!(model.incomplete);
        assert_eq!(model.current.values().sum::<u64>(), 1);
    }

    #[test]
    fn test_incomplete_clears_when_inception_rotates() {
        let dir = TempDir::new().unwrap();
        let tracker = RetentionTracker::new(dir.path());

        tracker.update("demo", &set(&["10.0.0.1"]), 0).unwrap();
        let model = tracker.update("demo", &set(&["10.0.0.9"]), 3600).unwrap();
        assert!(!model.incomplete);
        assert_eq!(model.current.get(&0), Some(&1));
    }

    #[test]
    fn test_stale_snapshot_is_ignored() {
        let dir = TempDir::new().unwrap();
        let tracker = RetentionTracker::new(dir.path());
        let first = tracker.update("demo", &set(&["10.0.0.1"]), 5000).unwrap();
        let replay = tracker.update("demo", &set(&["10.0.0.2"]), 5000).unwrap();
        assert_eq!(first, replay);
        let older = tracker.update("demo", &set(&["10.0.0.3"]), 100).unwrap();
        assert_eq!(first, older);
    }

    #[test]
    fn test_current_sum_matches_latest_snapshot() {
        let dir = TempDir::new().unwrap();
        let tracker = RetentionTracker::new(dir.path());
        tracker.update("demo", &set(&["10.0.0.0/30"]), 0).unwrap();
        tracker.update("demo", &set(&["10.0.0.0/29"]), 3600).unwrap();
        let model = tracker
            .update("demo", &set(&["10.0.0.0/28"]), 7200)
            .unwrap();
        assert_eq!(model.current.values().sum::<u64>(), 16);
    }

    #[test]
    fn test_csv_rows_appended() {
        let dir = TempDir::new().unwrap();
        let tracker = RetentionTracker::new(dir.path());
        tracker.update("demo", &set(&["10.0.0.1"]), 0).unwrap();
        tracker.update("demo", &set(&["10.0.0.2"]), 3600).unwrap();

        let changes = fs::read_to_string(dir.path().join("demo/changesets.csv")).unwrap();
        let lines: Vec<&str> = changes.lines().collect();
        assert_eq!(lines, vec!["0,1,0", "3600,1,1"]);

        let retention = fs::read_to_string(dir.path().join("demo/retention.csv")).unwrap();
        assert_eq!(retention.lines().next(), Some("3600,0,1,1"));
    }

    #[test]
    fn test_history_row() {
        let dir = TempDir::new().unwrap();
        let tracker = RetentionTracker::new(dir.path());
        tracker.append_history_row("demo", 42, 3, 300).unwrap();
        let content = fs::read_to_string(dir.path().join("demo/history.csv")).unwrap();
        assert_eq!(content, "42,3,300\n");
    }

    #[test]
    fn test_model_round_trips_via_disk() {
        let dir = TempDir::new().unwrap();
        let tracker = RetentionTracker::new(dir.path());
        let written = tracker.update("demo", &set(&["10.0.0.1"]), 0).unwrap();
        assert_eq!(tracker.load_model("demo").unwrap(), written);
    }

    #[test]
    fn test_remove_feed() {
        let dir = TempDir::new().unwrap();
        let tracker = RetentionTracker::new(dir.path());
        tracker.update("demo", &set(&["10.0.0.1"]), 0).unwrap();
        tracker.remove_feed("demo").unwrap();
        assert!(!dir.path().join("demo").exists());
    }
}
