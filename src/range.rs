//! IPv4 range algebra: the canonical representation behind every set.
//!
//! A [`RangeSet`] is a sorted list of non-overlapping, non-adjacent closed
//! integer ranges over the IPv4 space. All set operations downstream of the
//! parser pipeline (union, intersection, difference, counting, prefix
//! reduction, CIDR emission) go through this module.

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

/// Magic prefix of the binary snapshot form.
const BINARY_MAGIC: &[u8; 8] = b"FEEDSET1";

/// Default prefix-reduction coverage growth allowance, in percent.
pub const DEFAULT_REDUCE_FACTOR: u32 = 20;

/// Default prefix-reduction entry target.
pub const DEFAULT_REDUCE_ENTRIES: usize = 65_536;

/// A canonical set of IPv4 addresses.
///
/// Invariant: `ranges` is sorted by start, and no two ranges overlap or
/// touch (`next.start > cur.end + 1`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RangeSet {
    ranges: Vec<(u32, u32)>,
}

/// Parse one dotted-quad octet, rejecting zero-prefixed forms like `01`.
fn parse_octet(s: &str) -> Option<u8> {
    if s.is_empty() || s.len() > 3 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    s.parse().ok()
}

/// Parse a dotted-quad address into its integer value.
fn parse_addr(s: &str) -> Option<u32> {
    let mut octets = [0u8; 4];
    let mut parts = s.split('.');
    for slot in &mut octets {
        *slot = parse_octet(parts.next()?)?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(u32::from_be_bytes(octets))
}

/// Convert a dotted netmask such as `255.255.255.0` to a prefix length.
/// Non-contiguous masks are invalid.
fn mask_to_prefix(mask: u32) -> Option<u8> {
    let ones = mask.count_ones();
    if ones == 0 {
        return None;
    }
    let expected = if ones == 32 { u32::MAX } else { !(u32::MAX >> ones) };
    (mask == expected).then_some(ones as u8)
}

/// Parse a single token into a closed range.
///
/// Accepted forms: a bare address, `addr/prefix` with `1 <= prefix <= 32`,
/// a dash range `start-end`, and `addr/dotted-mask`. The base address of a
/// CIDR is masked down to its network. Returns `None` for anything else;
/// the caller decides whether dropped tokens matter.
pub fn parse_token(token: &str) -> Option<(u32, u32)> {
    let token = token.trim();
    if let Some((start, end)) = token.split_once('-') {
        let a = parse_addr(start.trim())?;
        let b = parse_addr(end.trim())?;
        return (a <= b).then_some((a, b));
    }
    if let Some((addr, suffix)) = token.split_once('/') {
        let base = parse_addr(addr)?;
        let prefix = if suffix.contains('.') {
            mask_to_prefix(parse_addr(suffix)?)?
        } else {
            if suffix.is_empty() || suffix.len() > 2 || !suffix.bytes().all(|b| b.is_ascii_digit())
            {
                return None;
            }
            let p: u8 = suffix.parse().ok()?;
            if p == 0 || p > 32 {
                return None;
            }
            p
        };
        let hostmask = if prefix == 32 { 0 } else { u32::MAX >> prefix };
        let net = base & !hostmask;
        return Some((net, net | hostmask));
    }
    let a = parse_addr(token)?;
    Some((a, a))
}

impl RangeSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from raw ranges, canonicalizing as needed.
    pub fn from_ranges(mut ranges: Vec<(u32, u32)>) -> Self {
        ranges.retain(|(a, b)| a <= b);
        ranges.sort_unstable();
        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(ranges.len());
        for (a, b) in ranges {
            match merged.last_mut() {
                Some((_, end)) if *end == u32::MAX || a <= *end + 1 => {
                    if b > *end {
                        *end = b;
                    }
                }
                _ => merged.push((a, b)),
            }
        }
        Self { ranges: merged }
    }

    /// Parse an iterator of tokens, silently dropping invalid ones.
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::from_ranges(
            tokens
                .into_iter()
                .filter_map(|t| parse_token(t.as_ref()))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[(u32, u32)] {
        &self.ranges
    }

    /// Total number of addresses covered.
    pub fn ip_count(&self) -> u64 {
        self.ranges
            .iter()
            .map(|(a, b)| u64::from(*b) - u64::from(*a) + 1)
            .sum()
    }

    /// Number of CIDRs in the canonical emission plus the population count.
    pub fn count(&self) -> (usize, u64) {
        (self.to_cidrs().len(), self.ip_count())
    }

    /// Membership test for a single address.
    pub fn contains(&self, addr: u32) -> bool {
        self.ranges
            .binary_search_by(|(a, b)| {
                if addr < *a {
                    std::cmp::Ordering::Greater
                } else if addr > *b {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    /// Minimal CIDR decomposition, sorted ascending by network address.
    pub fn to_cidrs(&self) -> Vec<Ipv4Net> {
        let mut out = Vec::new();
        for &(start, end) in &self.ranges {
            let mut cur = u64::from(start);
            let end = u64::from(end);
            while cur <= end {
                // Largest block that is both aligned at `cur` and fits.
                let align = if cur == 0 { 32 } else { cur.trailing_zeros().min(32) };
                let span = end - cur + 1;
                let fit = 63 - span.leading_zeros(); // floor(log2(span))
                let bits = align.min(fit);
                let prefix = (32 - bits) as u8;
                let addr = Ipv4Addr::from(cur as u32);
                // Prefix is derived from alignment, always valid.
                out.push(Ipv4Net::new(addr, prefix).expect("aligned prefix"));
                cur += 1u64 << bits;
            }
        }
        out
    }

    /// Iterate every individual address in the set.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.ranges
            .iter()
            .flat_map(|&(a, b)| (u64::from(a)..=u64::from(b)).map(|v| Ipv4Addr::from(v as u32)))
    }

    /// Union of any number of sets.
    pub fn union_all<'a, I>(sets: I) -> Self
    where
        I: IntoIterator<Item = &'a RangeSet>,
    {
        let mut all: Vec<(u32, u32)> = Vec::new();
        for set in sets {
            all.extend_from_slice(&set.ranges);
        }
        Self::from_ranges(all)
    }

    pub fn union(&self, other: &Self) -> Self {
        Self::union_all([self, other])
    }

    /// Pairwise intersection via two-pointer sweep.
    pub fn intersection(&self, other: &Self) -> Self {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let (a1, b1) = self.ranges[i];
            let (a2, b2) = other.ranges[j];
            let lo = a1.max(a2);
            let hi = b1.min(b2);
            if lo <= hi {
                out.push((lo, hi));
            }
            if b1 < b2 {
                i += 1;
            } else {
                j += 1;
            }
        }
        // Pieces come out ordered and disjoint already.
        Self { ranges: out }
    }

    /// Intersection of any number of sets. The intersection of no sets is
    /// empty.
    pub fn intersection_all<'a, I>(sets: I) -> Self
    where
        I: IntoIterator<Item = &'a RangeSet>,
    {
        let mut iter = sets.into_iter();
        let Some(first) = iter.next() else {
            return Self::new();
        };
        iter.fold(first.clone(), |acc, s| acc.intersection(s))
    }

    /// Addresses in `self` but not in `other`.
    pub fn difference(&self, other: &Self) -> Self {
        let mut out = Vec::new();
        let mut j = 0;
        for &(a, b) in &self.ranges {
            let mut cur = a;
            while j < other.ranges.len() && other.ranges[j].1 < cur {
                j += 1;
            }
            let mut k = j;
            let mut done = false;
            while k < other.ranges.len() && other.ranges[k].0 <= b {
                let (oa, ob) = other.ranges[k];
                if oa > cur {
                    out.push((cur, oa - 1));
                }
                if ob >= b {
                    done = true;
                    break;
                }
                cur = ob + 1;
                k += 1;
            }
            if !done && cur <= b {
                out.push((cur, b));
            }
        }
        Self::from_ranges(out)
    }

    /// Addresses of `self` not covered by any of `others`.
    pub fn difference_all<'a, I>(&self, others: I) -> Self
    where
        I: IntoIterator<Item = &'a RangeSet>,
    {
        self.difference(&Self::union_all(others))
    }

    pub fn symmetric_difference(&self, other: &Self) -> Self {
        self.union(other).difference(&self.intersection(other))
    }

    /// Fold of pairwise symmetric difference over any number of sets:
    /// addresses covered by an odd number of them.
    pub fn symmetric_difference_all<'a, I>(sets: I) -> Self
    where
        I: IntoIterator<Item = &'a RangeSet>,
    {
        sets.into_iter()
            .fold(Self::new(), |acc, s| acc.symmetric_difference(s))
    }

    /// Lossy coverage expansion: promote CIDRs to shorter prefixes until
    /// the entry count drops to `min_entries`, never growing the covered
    /// population by more than `factor` percent. Used to fit very large
    /// sets into a fixed-size kernel hash.
    pub fn prefix_reduce(&self, factor: u32, min_entries: usize) -> Self {
        let orig_ips = self.ip_count();
        if orig_ips == 0 {
            return self.clone();
        }
        let budget = orig_ips.saturating_mul(u64::from(factor)) / 100;
        let mut set = self.clone();
        let mut added: u64 = 0;
        loop {
            let cidrs = set.to_cidrs();
            if cidrs.len() <= min_entries {
                break;
            }
            // Cheapest promotion: widen one CIDR to its parent prefix.
            let mut best: Option<((u32, u32), u64)> = None;
            for net in &cidrs {
                let prefix = net.prefix_len();
                if prefix == 0 {
                    continue;
                }
                let parent_hostmask = u32::MAX >> (prefix - 1);
                let base = u32::from(net.network()) & !parent_hostmask;
                let parent = (base, base | parent_hostmask);
                let covered = set
                    .intersection(&RangeSet::from_ranges(vec![parent]))
                    .ip_count();
                let cost = (u64::from(parent.1) - u64::from(parent.0) + 1) - covered;
                if best.map_or(true, |(_, c)| cost < c) {
                    best = Some((parent, cost));
                }
            }
            let Some((parent, cost)) = best else { break };
            if added + cost > budget {
                break;
            }
            added += cost;
            set = set.union(&RangeSet::from_ranges(vec![parent]));
        }
        set
    }

    /// Write the compact binary snapshot form.
    pub fn write_binary(&self, path: &Path) -> Result<()> {
        let mut buf = Vec::with_capacity(12 + self.ranges.len() * 8);
        buf.extend_from_slice(BINARY_MAGIC);
        buf.extend_from_slice(&(self.ranges.len() as u32).to_le_bytes());
        for &(a, b) in &self.ranges {
            buf.extend_from_slice(&a.to_le_bytes());
            buf.extend_from_slice(&b.to_le_bytes());
        }
        fs::write(path, buf).with_context(|| format!("failed to write snapshot {:?}", path))
    }

    /// Read a binary snapshot written by [`RangeSet::write_binary`].
    pub fn read_binary(path: &Path) -> Result<Self> {
        let data =
            fs::read(path).with_context(|| format!("failed to read snapshot {:?}", path))?;
        Self::from_binary(&data).with_context(|| format!("corrupt snapshot {:?}", path))
    }

    fn from_binary(data: &[u8]) -> Result<Self> {
        if data.len() < 12 || &data[..8] != BINARY_MAGIC {
            anyhow::bail!("bad snapshot magic");
        }
        let count = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;
        if data.len() != 12 + count * 8 {
            anyhow::bail!("snapshot length mismatch");
        }
        let mut ranges = Vec::with_capacity(count);
        for chunk in data[12..].chunks_exact(8) {
            let a = u32::from_le_bytes(chunk[..4].try_into().unwrap());
            let b = u32::from_le_bytes(chunk[4..].try_into().unwrap());
            if a > b {
                anyhow::bail!("inverted range in snapshot");
            }
            ranges.push((a, b));
        }
        Ok(Self::from_ranges(ranges))
    }

    /// Union every binary snapshot in `paths` in one pass.
    pub fn union_binaries<'a, I>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a Path>,
    {
        let mut all: Vec<(u32, u32)> = Vec::new();
        for path in paths {
            all.extend_from_slice(&Self::read_binary(path)?.ranges);
        }
        Ok(Self::from_ranges(all))
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for net in self.to_cidrs() {
            writeln!(f, "{}", net)?;
        }
        Ok(())
    }
}
