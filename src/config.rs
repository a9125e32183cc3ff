//! Configuration: the feed registry and run-wide settings.
//!
//! Feeds are declared in a YAML document. Everything that can fail from a
//! bad declaration (unknown parser names, dangling composite sources,
//! duplicate feed names) fails here at load time, not mid-run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use crate::error::FeedsetError;
use crate::pipeline;
use crate::range::{DEFAULT_REDUCE_ENTRIES, DEFAULT_REDUCE_FACTOR};

/// How a feed's bytes are obtained.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FetcherKind {
    /// Conditional HTTP GET honoring the server's last-modified.
    Http,
    /// Copy of a local file.
    File,
    /// Reuse the raw snapshot of another feed fetched earlier in the run.
    Composite,
}

impl Default for FetcherKind {
    fn default() -> Self {
        Self::Http
    }
}

/// Shape of the published snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Representation {
    /// Single addresses only, CIDRs expanded.
    Ip,
    /// CIDRs with mask shorter than 32 only.
    Net,
    /// CIDRs including /32.
    Both,
    /// Two peer sets, `<name>_ip` and `<name>_net`, from one source.
    Split,
}

impl Default for Representation {
    fn default() -> Self {
        Self::Both
    }
}

impl Representation {
    /// File extension of the published artifact.
    pub fn extension(self) -> &'static str {
        match self {
            Representation::Ip => "ipset",
            Representation::Net | Representation::Both | Representation::Split => "netset",
        }
    }

    /// Kernel hash kind for the published set.
    pub fn hash_kind(self) -> &'static str {
        match self {
            Representation::Ip => "hash:ip",
            _ => "hash:net",
        }
    }
}

/// One configured feed. Immutable within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedDefinition {
    /// Unique, stable identifier; also the published set name.
    pub name: String,

    /// Source URL (http fetcher) or local path (file fetcher).
    pub url: String,

    pub fetcher: FetcherKind,

    /// Name of the feed whose raw snapshot a composite fetcher reuses.
    pub source_feed: Option<String>,

    /// Update period in minutes.
    pub period: u64,

    /// History windows in minutes; each publishes `<name>_<suffix>`.
    pub windows: Vec<u64>,

    /// Address family; only `inet` is currently processed.
    pub family: String,

    pub representation: Representation,

    /// Ordered parser chain applied to the fetched bytes.
    pub parsers: Vec<String>,

    pub category: String,
    pub description: String,
    pub maintainer: String,
    pub maintainer_url: String,

    /// Accept an empty parse result instead of failing the feed.
    pub accept_empty: bool,

    /// Resolve hostname tokens left over by the parser chain into their
    /// A records.
    pub resolve_hostnames: bool,

    /// Environment variable holding this feed's API key, and the query
    /// parameter it is sent as. A missing variable disables the feed.
    pub api_key_env: Option<String>,
    pub api_key_param: Option<String>,
}

impl Default for FeedDefinition {
    fn default() -> Self {
        Self {
            name: String::new(),
            url: String::new(),
            fetcher: FetcherKind::Http,
            source_feed: None,
            period: 1440,
            windows: Vec::new(),
            family: "inet".to_string(),
            representation: Representation::Both,
            parsers: vec!["remove_comments".to_string(), "trim".to_string()],
            category: "unknown".to_string(),
            description: String::new(),
            maintainer: String::new(),
            maintainer_url: String::new(),
            accept_empty: false,
            resolve_hostnames: false,
            api_key_env: None,
            api_key_param: None,
        }
    }
}

impl FeedDefinition {
    /// Path of this feed's enablement marker and raw snapshot.
    pub fn source_path(&self, base: &Path) -> PathBuf {
        base.join(format!("{}.source", self.name))
    }

    /// Path of the published canonical snapshot.
    pub fn published_path(&self, base: &Path) -> PathBuf {
        base.join(format!("{}.{}", self.name, self.representation.extension()))
    }

    /// Derive the `<name>_ip` / `<name>_net` peers of a split feed.
    pub fn split_children(&self) -> Option<(FeedDefinition, FeedDefinition)> {
        if self.representation != Representation::Split {
            return None;
        }
        let mut ip = self.clone();
        ip.name = format!("{}_ip", self.name);
        ip.representation = Representation::Ip;
        let mut net = self.clone();
        net.name = format!("{}_net", self.name);
        net.representation = Representation::Net;
        Some((ip, net))
    }
}

/// The whole configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for published sets and state.
    pub base_dir: PathBuf,

    /// Keep failed intermediates under `errors/` for diagnosis.
    pub keep_errors: bool,

    /// Publish to the kernel-visible sets when privileged.
    pub kernel_publish: bool,

    /// Warn when the newest publication is older than this many minutes.
    pub stale_after: u64,

    pub feeds: Vec<FeedDefinition>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/var/lib/feedset"),
            keep_errors: true,
            kernel_publish: true,
            stale_after: 7 * 1440,
            feeds: Vec::new(),
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {:?}", path.as_ref()))?;
        let config: Config =
            serde_yaml::from_str(&content).context("failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject declarations that would only fail mid-run.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for feed in &self.feeds {
            if feed.name.is_empty()
                || !feed
                    .name
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
            {
                return Err(FeedsetError::Config(format!(
                    "invalid feed name {:?}",
                    feed.name
                ))
                .into());
            }
            if !names.insert(feed.name.as_str()) {
                return Err(
                    FeedsetError::Config(format!("duplicate feed name {}", feed.name)).into(),
                );
            }
            if feed.period == 0 {
                return Err(
                    FeedsetError::Config(format!("feed {} has a zero period", feed.name)).into(),
                );
            }
            pipeline::validate_chain(&feed.parsers).map_err(|e| {
                FeedsetError::Config(format!("feed {}: {}", feed.name, e))
            })?;
            match feed.fetcher {
                FetcherKind::Composite => {
                    let source = feed.source_feed.as_deref().unwrap_or("");
                    if !self.feeds.iter().any(|f| f.name == source) {
                        return Err(FeedsetError::Config(format!(
                            "feed {} references unknown source feed {:?}",
                            feed.name, source
                        ))
                        .into());
                    }
                }
                FetcherKind::Http | FetcherKind::File => {
                    if feed.url.is_empty() {
                        return Err(FeedsetError::Config(format!(
                            "feed {} has no source url",
                            feed.name
                        ))
                        .into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Look a feed up by name.
    pub fn feed(&self, name: &str) -> Option<&FeedDefinition> {
        self.feeds.iter().find(|f| f.name == name)
    }
}

/// Run-wide tunables, after environment overrides.
#[derive(Debug, Clone)]
pub struct Settings {
    pub base_dir: PathBuf,
    pub cache_file: PathBuf,
    pub lib_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub history_dir: PathBuf,
    pub errors_dir: PathBuf,
    pub keep_errors: bool,
    pub kernel_publish: bool,
    pub stale_after: u64,
    pub parallel_dns_queries: usize,
    pub max_download_time: u64,
    pub max_connect_time: u64,
    pub user_agent: String,
    pub failure_threshold: u32,
    pub reduce_factor: u32,
    pub reduce_entries: usize,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    /// Resolve settings from a loaded config plus environment overrides.
    pub fn resolve(config: &Config) -> Self {
        let base_dir = env::var("BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config.base_dir.clone());
        let cache_file = env::var("CACHE_DIR")
            .map(|d| PathBuf::from(d).join(".cache"))
            .unwrap_or_else(|_| base_dir.join(".cache"));
        let lib_dir = env::var("LIB_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| base_dir.join("lib"));
        let tmp_dir = env::var("TMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::temp_dir());
        let history_dir = env::var("HISTORY_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| base_dir.join("history"));
        let errors_dir = env::var("ERRORS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| base_dir.join("errors"));
        Self {
            cache_file,
            lib_dir,
            tmp_dir,
            history_dir,
            errors_dir,
            keep_errors: config.keep_errors,
            kernel_publish: config.kernel_publish,
            stale_after: config.stale_after,
            parallel_dns_queries: env_parse("PARALLEL_DNS_QUERIES", 10),
            max_download_time: env_parse("MAX_DOWNLOAD_TIME", 300),
            max_connect_time: env_parse("MAX_CONNECT_TIME", 10),
            user_agent: env::var("USER_AGENT")
                .unwrap_or_else(|_| format!("feedset/{}", env!("CARGO_PKG_VERSION"))),
            failure_threshold: env_parse("IGNORE_REPEATING_DOWNLOAD_ERRORS", 10),
            reduce_factor: env_parse("IPSET_REDUCE_FACTOR", DEFAULT_REDUCE_FACTOR),
            reduce_entries: env_parse("IPSET_REDUCE_ENTRIES", DEFAULT_REDUCE_ENTRIES),
            base_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(name: &str) -> FeedDefinition {
        FeedDefinition {
            name: name.to_string(),
            url: format!("https://example.org/{}.txt", name),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let config = Config {
            feeds: vec![feed("a"), feed("a")],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_parser_rejected_at_load() {
        let mut f = feed("a");
        f.parsers = vec!["no_such_transform".to_string()];
        let config = Config {
            feeds: vec![f],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_composite_requires_existing_source() {
        let mut c = feed("child");
        c.fetcher = FetcherKind::Composite;
        c.source_feed = Some("parent".to_string());
        let missing = Config {
            feeds: vec![c.clone()],
            ..Default::default()
        };
        assert!(missing.validate().is_err());
        let ok = Config {
            feeds: vec![feed("parent"), c],
            ..Default::default()
        };
        ok.validate().unwrap();
    }

    #[test]
    fn test_split_children() {
        let mut f = feed("demo");
        f.representation = Representation::Split;
        let (ip, net) = f.split_children().unwrap();
        assert_eq!(ip.name, "demo_ip");
        assert_eq!(ip.representation, Representation::Ip);
        assert_eq!(net.name, "demo_net");
        assert_eq!(net.representation, Representation::Net);
        assert!(feed("plain").split_children().is_none());
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = Config {
            feeds: vec![feed("demo")],
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.feeds[0].name, "demo");
        assert_eq!(parsed.feeds[0].period, 1440);
    }

    #[test]
    fn test_zero_period_rejected() {
        let mut f = feed("a");
        f.period = 0;
        let config = Config {
            feeds: vec![f],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_representation_artifacts() {
        assert_eq!(Representation::Ip.extension(), "ipset");
        assert_eq!(Representation::Both.extension(), "netset");
        assert_eq!(Representation::Ip.hash_kind(), "hash:ip");
        assert_eq!(Representation::Net.hash_kind(), "hash:net");
    }
}
