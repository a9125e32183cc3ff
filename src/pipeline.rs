//! Parser pipeline: byte stream in, IPv4 tokens out.
//!
//! A feed's parser chain is an ordered list of named steps. Byte-level
//! decoders (gzip, zip) must come first; the rest are line transformers
//! composed in order. A strict validity filter always runs last, so the
//! set processor only ever sees tokens the range engine accepts. Chains
//! are resolved from their names at configuration load; unknown names
//! never reach a run.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use regex::Regex;
use std::io::Read;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::range;

/// Fully anchored IPv4 address with optional /1../32 prefix. Leading-zero
/// octets do not match.
static STRICT_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:25[0-5]|2[0-4]\d|1\d{2}|[1-9]?\d)(?:\.(?:25[0-5]|2[0-4]\d|1\d{2}|[1-9]?\d)){3}(?:/(?:3[0-2]|[12]?\d))?$",
    )
    .expect("static regex")
});

/// A line transformer: a pure mapping over the stream of lines.
pub trait Transform: Send + Sync {
    fn apply(&self, lines: Vec<String>) -> Vec<String>;
}

/// One resolved step of a parser chain.
pub enum Step {
    Gunzip,
    Unzip,
    Line(Box<dyn Transform>),
}

/// Truncate each line at the comment character and drop what remains
/// empty.
struct StripComments(char);

impl Transform for StripComments {
    fn apply(&self, lines: Vec<String>) -> Vec<String> {
        lines
            .into_iter()
            .filter_map(|line| {
                let cut = match line.find(self.0) {
                    Some(pos) => line[..pos].trim_end().to_string(),
                    None => line,
                };
                (!cut.trim().is_empty()).then_some(cut)
            })
            .collect()
    }
}

/// Trim surrounding whitespace and drop empty lines.
struct TrimLines;

impl Transform for TrimLines {
    fn apply(&self, lines: Vec<String>) -> Vec<String> {
        lines
            .into_iter()
            .filter_map(|line| {
                let t = line.trim();
                (!t.is_empty()).then(|| t.to_string())
            })
            .collect()
    }
}

/// Append `/32` to bare addresses.
struct AppendSlash32;

impl Transform for AppendSlash32 {
    fn apply(&self, lines: Vec<String>) -> Vec<String> {
        lines
            .into_iter()
            .map(|line| {
                if line.contains('/') {
                    line
                } else {
                    format!("{}/32", line)
                }
            })
            .collect()
    }
}

/// Strip a trailing `/32`.
struct StripSlash32;

impl Transform for StripSlash32 {
    fn apply(&self, lines: Vec<String>) -> Vec<String> {
        lines
            .into_iter()
            .map(|line| match line.strip_suffix("/32") {
                Some(bare) => bare.to_string(),
                None => line,
            })
            .collect()
    }
}

/// Rewrite `addr/255.255.255.0` into `addr/24`. Lines with an invalid or
/// non-contiguous mask are dropped.
struct NetmaskToPrefix;

impl Transform for NetmaskToPrefix {
    fn apply(&self, lines: Vec<String>) -> Vec<String> {
        lines
            .into_iter()
            .filter_map(|line| {
                let Some((addr, mask)) = line.split_once('/') else {
                    return Some(line);
                };
                if !mask.contains('.') {
                    return Some(line);
                }
                let mask = Ipv4Addr::from_str(mask).ok()?;
                let bits = u32::from(mask);
                let ones = bits.count_ones();
                let contiguous =
                    ones > 0 && bits == if ones == 32 { u32::MAX } else { !(u32::MAX >> ones) };
                contiguous.then(|| format!("{}/{}", addr, ones))
            })
            .collect()
    }
}

/// Pick one column of a separated line, 1-based like cut(1).
struct PickColumn {
    sep: char,
    index: usize,
}

impl Transform for PickColumn {
    fn apply(&self, lines: Vec<String>) -> Vec<String> {
        lines
            .into_iter()
            .filter_map(|line| {
                line.split(self.sep)
                    .nth(self.index.saturating_sub(1))
                    .map(|c| c.trim().trim_matches('"').to_string())
            })
            .filter(|c| !c.is_empty())
            .collect()
    }
}

/// Keep only lines matching a pattern, for row filters such as an
/// "online" status column.
struct KeepMatching(Regex);

impl Transform for KeepMatching {
    fn apply(&self, lines: Vec<String>) -> Vec<String> {
        lines
            .into_iter()
            .filter(|line| self.0.is_match(line))
            .collect()
    }
}

/// Extract every strict IPv4/CIDR token from free-form text. Maximal runs
/// of dotted digits are tested whole, so substrings of longer dotted
/// numbers never leak through.
struct Ipv4Grep;

impl Transform for Ipv4Grep {
    fn apply(&self, lines: Vec<String>) -> Vec<String> {
        lines
            .into_iter()
            .flat_map(|line| {
                line.split(|c: char| !(c.is_ascii_digit() || c == '.' || c == '/'))
                    .filter(|tok| STRICT_TOKEN.is_match(tok))
                    .map(|tok| tok.to_string())
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

/// Pull source addresses out of snort `alert` rules, flattening bracketed
/// lists to one address per line.
struct SnortAlertSources;

impl Transform for SnortAlertSources {
    fn apply(&self, lines: Vec<String>) -> Vec<String> {
        lines
            .into_iter()
            .filter(|line| line.trim_start().starts_with("alert"))
            .filter_map(|line| {
                // alert <proto> <sources> <ports> -> ...
                line.split_whitespace().nth(2).map(|s| s.to_string())
            })
            .flat_map(|field| {
                field
                    .trim_matches(|c| c == '[' || c == ']')
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect::<Vec<_>>()
            })
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Convert Cisco `access-list ... deny ip <host|net> any` lines to
/// address or CIDR tokens. Wildcard masks become prefix lengths.
struct CiscoDeny;

impl Transform for CiscoDeny {
    fn apply(&self, lines: Vec<String>) -> Vec<String> {
        lines
            .into_iter()
            .filter_map(|line| {
                let tokens: Vec<&str> = line.split_whitespace().collect();
                let deny = tokens.windows(2).position(|w| w == ["deny", "ip"])?;
                let rest = &tokens[deny + 2..];
                match rest {
                    ["host", addr, "any", ..] => Some((*addr).to_string()),
                    [addr, wildcard, "any", ..] => {
                        let base = Ipv4Addr::from_str(addr).ok()?;
                        let wild = u32::from(Ipv4Addr::from_str(wildcard).ok()?);
                        let mask = !wild;
                        let ones = mask.count_ones();
                        let contiguous = ones > 0
                            && mask == if ones == 32 { u32::MAX } else { !(u32::MAX >> ones) };
                        contiguous.then(|| format!("{}/{}", base, ones))
                    }
                    _ => None,
                }
            })
            .collect()
    }
}

/// Minimal XML/RSS reader: split on `<`, emit the text content of every
/// element with the given tag name.
struct XmlTag(String);

impl Transform for XmlTag {
    fn apply(&self, lines: Vec<String>) -> Vec<String> {
        let text = lines.join("\n");
        let mut out = Vec::new();
        for segment in text.split('<') {
            let Some((tag, content)) = segment.split_once('>') else {
                continue;
            };
            if tag.trim() == self.0 {
                let content = content.trim();
                if !content.is_empty() {
                    out.push(content.to_string());
                }
            }
        }
        out
    }
}

/// Resolve one step name. Parameterized steps use `name:param` form.
fn build_step(name: &str) -> Result<Step> {
    let (kind, param) = match name.split_once(':') {
        Some((k, p)) => (k, Some(p)),
        None => (name, None),
    };
    let step = match (kind, param) {
        ("gunzip", None) => Step::Gunzip,
        ("unzip", None) => Step::Unzip,
        ("remove_comments", None) => Step::Line(Box::new(StripComments('#'))),
        ("remove_semicolon_comments", None) => Step::Line(Box::new(StripComments(';'))),
        ("trim", None) => Step::Line(Box::new(TrimLines)),
        ("append_slash32", None) => Step::Line(Box::new(AppendSlash32)),
        ("strip_slash32", None) => Step::Line(Box::new(StripSlash32)),
        ("netmask_to_prefix", None) => Step::Line(Box::new(NetmaskToPrefix)),
        ("ipv4_grep", None) => Step::Line(Box::new(Ipv4Grep)),
        ("snort_alert_sources", None) => Step::Line(Box::new(SnortAlertSources)),
        ("cisco_deny", None) => Step::Line(Box::new(CiscoDeny)),
        ("csv_column", Some(p)) => Step::Line(Box::new(PickColumn {
            sep: ',',
            index: parse_index(name, p)?,
        })),
        ("tab_column", Some(p)) => Step::Line(Box::new(PickColumn {
            sep: '\t',
            index: parse_index(name, p)?,
        })),
        ("semicolon_column", Some(p)) => Step::Line(Box::new(PickColumn {
            sep: ';',
            index: parse_index(name, p)?,
        })),
        ("keep_matching", Some(p)) => Step::Line(Box::new(KeepMatching(
            Regex::new(p).with_context(|| format!("bad pattern in {:?}", name))?,
        ))),
        ("xml_tag", Some(p)) if !p.is_empty() => Step::Line(Box::new(XmlTag(p.to_string()))),
        _ => bail!("unknown parser step {:?}", name),
    };
    Ok(step)
}

fn parse_index(name: &str, param: &str) -> Result<usize> {
    let index: usize = param
        .parse()
        .with_context(|| format!("bad column number in {:?}", name))?;
    if index == 0 {
        bail!("column numbers are 1-based in {:?}", name);
    }
    Ok(index)
}

/// Resolve a whole chain, enforcing that byte decoders precede line
/// steps.
pub fn build_chain(names: &[String]) -> Result<Vec<Step>> {
    let mut steps = Vec::with_capacity(names.len());
    let mut saw_line_step = false;
    for name in names {
        let step = build_step(name)?;
        match step {
            Step::Gunzip | Step::Unzip if saw_line_step => {
                bail!("decoder {:?} must come before line steps", name)
            }
            Step::Line(_) => saw_line_step = true,
            _ => {}
        }
        steps.push(step);
    }
    Ok(steps)
}

/// Load-time check used by the configuration validator.
pub fn validate_chain(names: &[String]) -> Result<()> {
    build_chain(names).map(|_| ())
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .context("gzip decode failed")?;
    Ok(out)
}

fn unzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor).context("zip open failed")?;
    if archive.len() == 0 {
        bail!("zip archive is empty");
    }
    let mut file = archive.by_index(0).context("zip entry read failed")?;
    let mut out = Vec::new();
    file.read_to_end(&mut out).context("zip decode failed")?;
    Ok(out)
}

/// Hostname shape for feeds that list names instead of addresses.
static HOSTNAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[A-Za-z0-9]([A-Za-z0-9-]{0,62}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,62}[A-Za-z0-9])?)+$",
    )
    .expect("static regex")
});

/// What survives a chain: valid IPv4 tokens, plus the lines that look
/// like hostnames when the feed asked for resolution.
pub struct ParsedStream {
    pub tokens: Vec<String>,
    pub hostnames: Vec<String>,
}

/// Run a resolved chain over raw feed bytes. The validity filter always
/// runs last: every token must parse under the range grammar, and
/// `0.0.0.0` is dropped. With `collect_hostnames`, lines failing the
/// grammar but shaped like hostnames are returned for resolution
/// instead of being discarded.
pub fn run_chain_collecting(
    bytes: &[u8],
    chain: &[Step],
    collect_hostnames: bool,
) -> Result<ParsedStream> {
    let mut data: Option<Vec<u8>> = None;
    let mut lines: Option<Vec<String>> = None;
    for step in chain {
        match step {
            Step::Gunzip => data = Some(gunzip(data.as_deref().unwrap_or(bytes))?),
            Step::Unzip => data = Some(unzip(data.as_deref().unwrap_or(bytes))?),
            Step::Line(t) => {
                let current = lines.take().unwrap_or_else(|| {
                    split_lines(data.as_deref().unwrap_or(bytes))
                });
                lines = Some(t.apply(current));
            }
        }
    }
    let lines = lines.unwrap_or_else(|| split_lines(data.as_deref().unwrap_or(bytes)));
    let mut out = ParsedStream {
        tokens: Vec::new(),
        hostnames: Vec::new(),
    };
    for line in lines {
        match range::parse_token(&line) {
            Some((0, 0)) | None => {
                let candidate = line.trim();
                // All-numeric lines are malformed addresses, not names.
                if collect_hostnames
                    && candidate.bytes().any(|b| b.is_ascii_alphabetic())
                    && HOSTNAME.is_match(candidate)
                {
                    out.hostnames.push(candidate.to_string());
                }
            }
            Some(_) => out.tokens.push(line),
        }
    }
    Ok(out)
}

/// [`run_chain_collecting`] without hostname collection.
pub fn run_chain(bytes: &[u8], chain: &[Step]) -> Result<Vec<String>> {
    run_chain_collecting(bytes, chain, false).map(|p| p.tokens)
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(|l| l.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn run(names: &[&str], input: &str) -> Vec<String> {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let chain = build_chain(&names).unwrap();
        run_chain(input.as_bytes(), &chain).unwrap()
    }

    #[test]
    fn test_comments_and_trim() {
        let out = run(
            &["remove_comments", "trim"],
            "# header\n 1.2.3.4 \n5.6.7.8 # tail\n\n",
        );
        assert_eq!(out, vec!["1.2.3.4", "5.6.7.8"]);
    }

    #[test]
    fn test_semicolon_comments() {
        let out = run(
            &["remove_semicolon_comments", "trim"],
            "; header\n1.2.3.4 ; SBL123\n",
        );
        assert_eq!(out, vec!["1.2.3.4"]);
    }

    #[test]
    fn test_append_and_strip_slash32() {
        assert_eq!(
            run(&["trim", "append_slash32"], "1.2.3.4\n10.0.0.0/8\n"),
            vec!["1.2.3.4/32", "10.0.0.0/8"]
        );
        assert_eq!(
            run(&["trim", "strip_slash32"], "1.2.3.4/32\n10.0.0.0/8\n"),
            vec!["1.2.3.4", "10.0.0.0/8"]
        );
    }

    #[test]
    fn test_netmask_to_prefix() {
        assert_eq!(
            run(
                &["trim", "netmask_to_prefix"],
                "10.0.0.0/255.255.255.0\n10.1.0.0/255.0.255.0\n1.2.3.4\n"
            ),
            vec!["10.0.0.0/24", "1.2.3.4"]
        );
    }

    #[test]
    fn test_ipv4_grep_excludes_embedded_substrings() {
        let out = run(
            &["ipv4_grep"],
            "seen 1.2.3.4 and 1.2.3.4.5 and ip=10.0.0.0/8 version 1.2\n",
        );
        assert_eq!(out, vec!["1.2.3.4", "10.0.0.0/8"]);
    }

    #[test]
    fn test_ipv4_grep_rejects_leading_zero_octets() {
        assert!(run(&["ipv4_grep"], "01.2.3.4\n").is_empty());
    }

    #[test]
    fn test_csv_column() {
        let out = run(
            &["csv_column:2", "trim"],
            "id,ip,status\n7,\"1.2.3.4\",online\n",
        );
        assert_eq!(out, vec!["1.2.3.4"]);
    }

    #[test]
    fn test_row_filter_with_column() {
        let input = "7,1.2.3.4,online\n8,5.6.7.8,offline\n";
        let out = run(&["keep_matching:online", "csv_column:2"], input);
        assert_eq!(out, vec!["1.2.3.4"]);
    }

    #[test]
    fn test_snort_alert_sources() {
        let input = "alert ip [1.2.3.4,5.6.7.0/24] any -> $HOME_NET any (msg:\"x\";)\n\
                     # comment\n\
                     pass ip 9.9.9.9 any -> any any\n";
        let out = run(&["snort_alert_sources"], input);
        assert_eq!(out, vec!["1.2.3.4", "5.6.7.0/24"]);
    }

    #[test]
    fn test_cisco_deny() {
        let input = "access-list 100 deny ip host 1.2.3.4 any\n\
                     access-list 100 deny ip 10.0.0.0 0.0.0.255 any\n\
                     access-list 100 permit ip any any\n";
        let out = run(&["cisco_deny"], input);
        assert_eq!(out, vec!["1.2.3.4", "10.0.0.0/24"]);
    }

    #[test]
    fn test_xml_tag() {
        let input = "<rss><item><title>x</title><ip>1.2.3.4</ip></item>\n<item><ip>5.6.7.8</ip></item></rss>";
        let out = run(&["xml_tag:ip"], input);
        assert_eq!(out, vec!["1.2.3.4", "5.6.7.8"]);
    }

    #[test]
    fn test_gunzip() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"# list\n1.2.3.4\n").unwrap();
        let gz = enc.finish().unwrap();
        let chain = build_chain(&[
            "gunzip".to_string(),
            "remove_comments".to_string(),
            "trim".to_string(),
        ])
        .unwrap();
        assert_eq!(run_chain(&gz, &chain).unwrap(), vec!["1.2.3.4"]);
    }

    #[test]
    fn test_decoder_after_line_step_rejected() {
        let names = vec!["trim".to_string(), "gunzip".to_string()];
        assert!(build_chain(&names).is_err());
    }

    #[test]
    fn test_unknown_step_rejected() {
        assert!(build_chain(&["frobnicate".to_string()]).is_err());
        assert!(build_chain(&["csv_column:0".to_string()]).is_err());
        assert!(build_chain(&["csv_column:x".to_string()]).is_err());
    }

    #[test]
    fn test_validity_filter_drops_zero_and_slash_zero() {
        let out = run(&["trim"], "0.0.0.0\n0.0.0.0/0\n1.2.3.4/0\n1.2.3.4\n");
        assert_eq!(out, vec!["1.2.3.4"]);
    }

    #[test]
    fn test_validity_filter_accepts_engine_grammar() {
        let out = run(&["trim"], "1.0.0.0-1.0.0.9\n10.0.0.0/255.255.0.0\njunk\n");
        assert_eq!(out, vec!["1.0.0.0-1.0.0.9", "10.0.0.0/255.255.0.0"]);
    }

    #[test]
    fn test_empty_chain_is_validity_only() {
        let chain = build_chain(&[]).unwrap();
        let out = run_chain(b"1.2.3.4\nnot an ip\n", &chain).unwrap();
        assert_eq!(out, vec!["1.2.3.4"]);
    }

    #[test]
    fn test_hostname_collection() {
        let chain = build_chain(&["trim".to_string()]).unwrap();
        let parsed = run_chain_collecting(
            b"1.2.3.4\nbad.example.com\n0.0.0.0\n1.2.3.4.5\nnot a host\n",
            &chain,
            true,
        )
        .unwrap();
        assert_eq!(parsed.tokens, vec!["1.2.3.4"]);
        assert_eq!(parsed.hostnames, vec!["bad.example.com"]);
    }

    #[test]
    fn test_hostnames_dropped_without_collection() {
        let chain = build_chain(&["trim".to_string()]).unwrap();
        let parsed =
            run_chain_collecting(b"1.2.3.4\nbad.example.com\n", &chain, false).unwrap();
        assert_eq!(parsed.tokens, vec!["1.2.3.4"]);
        assert!(parsed.hostnames.is_empty());
    }
}
