//! From parsed tokens to publishable canonical snapshots.
//!
//! The processor owns the representation policy, the textual canonical
//! form with its descriptive header, and the content comparison that
//! keeps republication idempotent when only the header would change.

use chrono::{DateTime, Utc};

use crate::config::{FeedDefinition, Representation};
use crate::range::RangeSet;
use crate::utils::{epoch_to_utc, humanize_minutes};

/// A snapshot rendered under a feed's representation.
pub struct Rendered {
    /// One token per line, already sorted ascending.
    pub lines: Vec<String>,
    /// Entry count as published (lines).
    pub entries: usize,
    /// Unique addresses covered by the published lines.
    pub ips: u64,
}

/// Apply a feed's representation to a canonical set.
///
/// `ip` expands everything to single addresses; `net` keeps only CIDRs
/// shorter than /32; `both` emits the full canonical CIDR list. `split`
/// feeds are rendered through their `_ip`/`_net` children and never
/// reach this directly.
pub fn render_representation(repr: Representation, set: &RangeSet) -> Rendered {
    match repr {
        Representation::Ip => {
            let lines: Vec<String> = set.hosts().map(|h| h.to_string()).collect();
            let entries = lines.len();
            Rendered {
                entries,
                ips: entries as u64,
                lines,
            }
        }
        Representation::Net => {
            let nets: Vec<_> = set
                .to_cidrs()
                .into_iter()
                .filter(|n| n.prefix_len() < 32)
                .collect();
            let ips = nets
                .iter()
                .map(|n| 1u64 << (32 - n.prefix_len()))
                .sum();
            Rendered {
                entries: nets.len(),
                ips,
                lines: nets.iter().map(|n| n.to_string()).collect(),
            }
        }
        Representation::Both | Representation::Split => {
            let (entries, ips) = set.count();
            Rendered {
                entries,
                ips,
                lines: set.to_cidrs().iter().map(|n| n.to_string()).collect(),
            }
        }
    }
}

/// Partition a canonical set into its /32 part and its wider part, for
/// split feeds. Both halves share the same source snapshot.
pub fn split_set(set: &RangeSet) -> (RangeSet, RangeSet) {
    let mut singles = Vec::new();
    let mut nets = Vec::new();
    for net in set.to_cidrs() {
        let start = u32::from(net.network());
        let end = u32::from(net.broadcast());
        if net.prefix_len() == 32 {
            singles.push((start, end));
        } else {
            nets.push((start, end));
        }
    }
    (RangeSet::from_ranges(singles), RangeSet::from_ranges(nets))
}

/// Everything volatile the header mentions.
pub struct HeaderInfo {
    pub source_mtime: i64,
    pub version: u64,
    pub generated: i64,
    /// Set for windowed aggregates.
    pub window: Option<u64>,
}

fn rfc_date(epoch: i64) -> String {
    let dt: DateTime<Utc> = epoch_to_utc(epoch);
    dt.format("%a, %d %b %Y %H:%M:%S UTC").to_string()
}

/// Render the full canonical text form: descriptive `#` header followed
/// by one token per line.
pub fn render_snapshot(
    feed: &FeedDefinition,
    info: &HeaderInfo,
    rendered: &Rendered,
) -> String {
    let mut out = String::new();
    let mut push = |line: &str| {
        out.push_str(line);
        out.push('\n');
    };
    push(&format!("# {}", feed.name));
    push("#");
    push(&format!(
        "# {} {}",
        feed.family,
        feed.representation.hash_kind()
    ));
    push("#");
    if !feed.description.is_empty() {
        push(&format!("# {}", feed.description));
        push("#");
    }
    if !feed.maintainer.is_empty() {
        push(&format!("# Maintainer      : {}", feed.maintainer));
    }
    if !feed.maintainer_url.is_empty() {
        push(&format!("# Maintainer URL  : {}", feed.maintainer_url));
    }
    if !feed.url.is_empty() {
        push(&format!("# Source URL      : {}", feed.url));
    }
    push(&format!("# Source mtime    : {}", rfc_date(info.source_mtime)));
    push(&format!("# Category        : {}", feed.category));
    push(&format!("# Version         : {}", info.version));
    push(&format!("# Generated       : {}", rfc_date(info.generated)));
    push(&format!("# Period          : {} minutes", feed.period));
    if let Some(window) = info.window {
        push(&format!("# Window          : {}", humanize_minutes(window)));
    }
    push(&format!("# Entries         : {}", rendered.entries));
    push(&format!("# Unique IPs      : {}", rendered.ips));
    push("#");
    for line in &rendered.lines {
        push(line);
    }
    out
}

/// True when the existing snapshot text carries exactly the same
/// non-comment lines. The header always differs (version, generation
/// time), so identity is decided on content alone.
pub fn same_content(existing: &str, lines: &[String]) -> bool {
    let old: Vec<&str> = existing
        .lines()
        .filter(|l| !l.starts_with('#') && !l.trim().is_empty())
        .collect();
    old.len() == lines.len() && old.iter().zip(lines).all(|(a, b)| a == b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeedDefinition;

    fn set(tokens: &[&str]) -> RangeSet {
        RangeSet::from_tokens(tokens.iter().copied())
    }

    fn feed() -> FeedDefinition {
        FeedDefinition {
            name: "demo".to_string(),
            url: "https://example.org/demo.txt".to_string(),
            description: "demo list".to_string(),
            maintainer: "example".to_string(),
            category: "attacks".to_string(),
            ..Default::default()
        }
    }

    fn info() -> HeaderInfo {
        HeaderInfo {
            source_mtime: 1_700_000_000,
            version: 3,
            generated: 1_700_000_100,
            window: None,
        }
    }

    #[test]
    fn test_both_keeps_canonical_cidrs() {
        let r = render_representation(Representation::Both, &set(&["5.6.7.8", "1.2.3.0/24"]));
        assert_eq!(r.lines, vec!["1.2.3.0/24", "5.6.7.8/32"]);
        assert_eq!(r.entries, 2);
        assert_eq!(r.ips, 257);
    }

    #[test]
    fn test_ip_expands_hosts() {
        let r = render_representation(Representation::Ip, &set(&["1.0.0.0/30"]));
        assert_eq!(r.lines, vec!["1.0.0.0", "1.0.0.1", "1.0.0.2", "1.0.0.3"]);
        assert_eq!(r.entries, 4);
        assert_eq!(r.ips, 4);
    }

    #[test]
    fn test_net_drops_single_addresses() {
        let r = render_representation(Representation::Net, &set(&["1.2.3.4", "10.0.0.0/24"]));
        assert_eq!(r.lines, vec!["10.0.0.0/24"]);
        assert_eq!(r.ips, 256);
    }

    #[test]
    fn test_split_partitions_by_prefix() {
        let (singles, nets) = split_set(&set(&["1.2.3.4", "10.0.0.0/24"]));
        assert_eq!(singles, set(&["1.2.3.4"]));
        assert_eq!(nets, set(&["10.0.0.0/24"]));
    }

    #[test]
    fn test_header_fields() {
        let rendered = render_representation(Representation::Both, &set(&["1.2.3.0/24"]));
        let text = render_snapshot(&feed(), &info(), &rendered);
        assert!(text.starts_with("# demo\n"));
        assert!(text.contains("# inet hash:net\n"));
        assert!(text.contains("# Version         : 3\n"));
        assert!(text.contains("# Entries         : 1\n"));
        assert!(text.contains("# Unique IPs      : 256\n"));
        assert!(text.contains("# Period          : 1440 minutes\n"));
        assert!(text.ends_with("#\n1.2.3.0/24\n"));
    }

    #[test]
    fn test_window_suffix_in_header() {
        let mut i = info();
        i.window = Some(1440);
        let rendered = render_representation(Representation::Both, &set(&["1.2.3.0/24"]));
        let text = render_snapshot(&feed(), &i, &rendered);
        assert!(text.contains("# Window          : 1d\n"));
    }

    #[test]
    fn test_content_lines_sorted_ascending() {
        let rendered =
            render_representation(Representation::Both, &set(&["5.6.7.8", "1.2.3.0/24"]));
        let text = render_snapshot(&feed(), &info(), &rendered);
        let data: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(data, vec!["1.2.3.0/24", "5.6.7.8/32"]);
    }

    #[test]
    fn test_same_content_ignores_header() {
        let rendered = render_representation(Representation::Both, &set(&["1.2.3.0/24"]));
        let old_text = render_snapshot(&feed(), &info(), &rendered);
        // A later header (version, generation time) does not matter.
        let mut newer = info();
        newer.version = 9;
        newer.generated += 999;
        let new_text = render_snapshot(&feed(), &newer, &rendered);
        assert_ne!(old_text, new_text);
        assert!(same_content(&old_text, &rendered.lines));
        let other = render_representation(Representation::Both, &set(&["9.9.9.9"]));
        assert!(!same_content(&old_text, &other.lines));
    }

    #[test]
    fn test_empty_set_renders_header_only() {
        let rendered = render_representation(Representation::Both, &RangeSet::new());
        let text = render_snapshot(&feed(), &info(), &rendered);
        assert!(text.contains("# Entries         : 0\n"));
        assert!(text.ends_with("#\n"));
        assert!(same_content(&text, &rendered.lines));
    }

    #[test]
    fn test_canonical_text_reparses_to_same_set() {
        let s = set(&["1.2.3.0/26", "1.2.3.64/26", "8.8.8.8"]);
        let rendered = render_representation(Representation::Both, &s);
        let text = render_snapshot(&feed(), &info(), &rendered);
        let reparsed = RangeSet::from_tokens(
            text.lines().filter(|l| !l.starts_with('#')).map(|l| l.to_string()),
        );
        assert_eq!(reparsed, s);
    }
}
