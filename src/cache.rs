//! Per-feed state persisted between runs.
//!
//! The cache is one JSON document mapping feed name to [`SetState`].
//! Every run loads it at start and rewrites it atomically (tmp plus
//! rename, previous version kept as a `.old` sibling) whenever state
//! changed.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Mutable per-feed state. All timestamps are epoch seconds.
///
/// Invariants kept by the mutators: `checked >= processed >= source`,
/// `min <= avg <= max` for both size and interval trackers.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct SetState {
    /// Mtime of the current raw source snapshot.
    pub source: i64,
    /// Last time the feed was checked, successfully or not.
    pub checked: i64,
    /// Last time a canonical snapshot was produced.
    pub processed: i64,
    /// Consecutive download failures.
    pub failures: u32,
    /// Publication counter, monotonically non-decreasing.
    pub version: u64,

    pub entries: usize,
    pub entries_min: usize,
    pub entries_max: usize,
    pub ips: u64,
    pub ips_min: u64,
    pub ips_max: u64,

    /// Observed update interval of the upstream, in seconds.
    pub interval_avg: i64,
    pub interval_min: i64,
    pub interval_max: i64,
    intervals_seen: u64,

    /// How far the source timestamp sits in the future of local time.
    pub clock_skew: i64,
}

impl SetState {
    /// The feed was looked at, whatever the outcome.
    pub fn note_checked(&mut self, now: i64) {
        self.checked = self.checked.max(now);
    }

    /// The download failed.
    pub fn note_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    /// A fresh source snapshot arrived. Tracks the observed update
    /// interval and clock skew, and clears the failure streak.
    pub fn note_fetched(&mut self, source_ts: i64, now: i64) {
        self.failures = 0;
        self.clock_skew = (source_ts - now).max(0);
        if self.source > 0 && source_ts > self.source {
            let interval = source_ts - self.source;
            if self.intervals_seen == 0 {
                self.interval_min = interval;
                self.interval_max = interval;
                self.interval_avg = interval;
            } else {
                self.interval_min = self.interval_min.min(interval);
                self.interval_max = self.interval_max.max(interval);
                let seen = self.intervals_seen as i64;
                self.interval_avg = (self.interval_avg * seen + interval) / (seen + 1);
            }
            self.intervals_seen += 1;
        }
        self.source = source_ts;
        self.note_checked(now);
    }

    /// A canonical snapshot was published.
    pub fn note_published(&mut self, entries: usize, ips: u64, now: i64) {
        self.version += 1;
        self.processed = now;
        self.note_checked(now);
        self.entries = entries;
        self.ips = ips;
        if self.version == 1 {
            self.entries_min = entries;
            self.entries_max = entries;
            self.ips_min = ips;
            self.ips_max = ips;
        } else {
            self.entries_min = self.entries_min.min(entries);
            self.entries_max = self.entries_max.max(entries);
            self.ips_min = self.ips_min.min(ips);
            self.ips_max = self.ips_max.max(ips);
        }
    }
}

/// The on-disk cache document.
#[derive(Debug, Default)]
pub struct MetadataCache {
    states: BTreeMap<String, SetState>,
    dirty: bool,
}

impl MetadataCache {
    /// Load the cache, starting empty when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read metadata cache {:?}", path))?;
        let states = serde_json::from_str(&content)
            .with_context(|| format!("corrupt metadata cache {:?}", path))?;
        Ok(Self {
            states,
            dirty: false,
        })
    }

    pub fn get(&self, name: &str) -> SetState {
        self.states.get(name).cloned().unwrap_or_default()
    }

    /// Store a feed's state back. Marks the cache dirty.
    pub fn put(&mut self, name: &str, state: SetState) {
        self.states.insert(name.to_string(), state);
        self.dirty = true;
    }

    /// Drop state of a retired feed.
    pub fn remove(&mut self, name: &str) {
        if self.states.remove(name).is_some() {
            self.dirty = true;
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(|s| s.as_str())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Atomically rewrite the cache file, keeping the previous version
    /// as `<path>.old`.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {:?}", parent))?;
        }
        let content =
            serde_json::to_string_pretty(&self.states).context("failed to serialize cache")?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, content)
            .with_context(|| format!("failed to write {:?}", tmp))?;
        if path.exists() {
            let old = path.with_extension("old");
            fs::rename(path, &old)
                .with_context(|| format!("failed to rotate {:?}", old))?;
        }
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace {:?}", path))?;
        self.dirty = false;
        Ok(())
    }
}
