//! Shared formatting and time helpers.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Format a count with K/M suffix for compact log output.
pub fn format_count(count: usize) -> String {
    if count >= 1_000_000 {
        format!("{:.1}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.1}K", count as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}

/// Humanize a history window given in minutes into the suffix used for
/// derived set names: `1h`, `6h`, `1d`, `7d`, `30d`, with composites such
/// as `1d12h` for non-round values.
pub fn humanize_minutes(minutes: u64) -> String {
    let mut out = String::new();
    let days = minutes / 1440;
    let hours = (minutes % 1440) / 60;
    let mins = minutes % 60;
    if days > 0 {
        out.push_str(&format!("{}d", days));
    }
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if mins > 0 || out.is_empty() {
        out.push_str(&format!("{}min", mins));
    }
    out
}

/// Current time as whole seconds since the epoch.
pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Convert epoch seconds to a UTC timestamp, clamping bad values to epoch.
pub fn epoch_to_utc(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap())
}

/// Seconds since the given epoch timestamp, never negative.
pub fn age_seconds(since_epoch: i64) -> i64 {
    (now_epoch() - since_epoch).max(0)
}

/// Stamp a file's mtime to the given epoch seconds.
pub fn set_mtime(path: &Path, epoch: i64) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open {:?}", path))?;
    let when = UNIX_EPOCH + Duration::from_secs(epoch.max(0) as u64);
    file.set_modified(when)
        .with_context(|| format!("failed to set mtime on {:?}", path))
}

/// Read a file's mtime as epoch seconds, zero when unreadable.
pub fn read_mtime(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_count() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1500), "1.5K");
        assert_eq!(format_count(1_500_000), "1.5M");
    }

    #[test]
    fn test_humanize_round_windows() {
        assert_eq!(humanize_minutes(60), "1h");
        assert_eq!(humanize_minutes(360), "6h");
        assert_eq!(humanize_minutes(1440), "1d");
        assert_eq!(humanize_minutes(10080), "7d");
        assert_eq!(humanize_minutes(43200), "30d");
    }

    #[test]
    fn test_humanize_composite_windows() {
        assert_eq!(humanize_minutes(2160), "1d12h");
        assert_eq!(humanize_minutes(90), "1h30min");
        assert_eq!(humanize_minutes(30), "30min");
        assert_eq!(humanize_minutes(0), "0min");
    }

    #[test]
    fn test_epoch_to_utc_clamps() {
        assert_eq!(epoch_to_utc(0).timestamp(), 0);
        assert_eq!(epoch_to_utc(1_700_000_000).timestamp(), 1_700_000_000);
    }
}
