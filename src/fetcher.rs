//! Feed downloaders: conditional HTTP, local copy, and shared-source.
//!
//! A fetcher never retries within a run; repeated failures feed the
//! scheduler's back-off instead. Outcomes are three-valued so the caller
//! can tell "fresh bytes" from "nothing changed" from "broken", and every
//! failure carries a stable code for the logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderValue, IF_MODIFIED_SINCE, LAST_MODIFIED};
use reqwest::{Client, StatusCode};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::utils::{epoch_to_utc, now_epoch};

/// Why a fetch failed. `code` is stable across releases for log scraping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    BadUrl,
    Connect,
    Timeout,
    Request,
    HttpStatus(u16),
    Body,
    EmptyBody,
    MissingSource,
    Io,
}

impl FetchFailure {
    pub fn code(&self) -> &'static str {
        match self {
            FetchFailure::BadUrl => "bad-url",
            FetchFailure::Connect => "connect",
            FetchFailure::Timeout => "timeout",
            FetchFailure::Request => "request",
            FetchFailure::HttpStatus(_) => "http-status",
            FetchFailure::Body => "body",
            FetchFailure::EmptyBody => "empty-body",
            FetchFailure::MissingSource => "missing-source",
            FetchFailure::Io => "io",
        }
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchFailure::HttpStatus(status) => write!(f, "http-status {}", status),
            other => f.write_str(other.code()),
        }
    }
}

/// Result of one fetch attempt.
#[derive(Debug)]
pub enum FetchOutcome {
    /// New bytes. `modified` is the upstream timestamp (epoch seconds)
    /// the stored snapshot's mtime must be set to.
    Fetched { body: Vec<u8>, modified: i64 },
    /// Upstream reports no change, or the body equals the current
    /// snapshot byte for byte.
    NotModified,
    Failed(FetchFailure),
}

/// What a fetcher may consult about the feed being fetched.
pub struct FetchContext {
    /// Source URL (http) or local path (file). API keys are already
    /// appended by the orchestrator.
    pub url: String,
    /// The current raw snapshot, if one exists.
    pub previous: Option<PreviousSnapshot>,
    /// Raw snapshot path of the primary feed, for shared-source fetches.
    pub shared_source: Option<PathBuf>,
    pub accept_empty: bool,
}

/// The raw snapshot a conditional fetch compares against.
pub struct PreviousSnapshot {
    pub path: PathBuf,
    pub mtime: i64,
}

impl PreviousSnapshot {
    /// Build from an existing file, if it exists.
    pub fn probe(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).ok()?;
        let mtime = meta
            .modified()
            .ok()?
            .duration_since(std::time::UNIX_EPOCH)
            .ok()?
            .as_secs() as i64;
        Some(Self {
            path: path.to_path_buf(),
            mtime,
        })
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, ctx: &FetchContext) -> FetchOutcome;
}

/// True when `body` equals the bytes of the current snapshot.
fn equals_previous(body: &[u8], previous: Option<&PreviousSnapshot>) -> bool {
    previous
        .and_then(|p| fs::read(&p.path).ok())
        .map(|current| current == body)
        .unwrap_or(false)
}

/// Classify a non-empty-vs-empty body into the final outcome.
fn accept_body(body: Vec<u8>, modified: i64, ctx: &FetchContext) -> FetchOutcome {
    if body.is_empty() && !ctx.accept_empty {
        return FetchOutcome::Failed(FetchFailure::EmptyBody);
    }
    if equals_previous(&body, ctx.previous.as_ref()) {
        return FetchOutcome::NotModified;
    }
    FetchOutcome::Fetched { body, modified }
}

/// Conditional HTTP GET honoring the server's last-modified.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(settings.max_connect_time))
            .timeout(Duration::from_secs(settings.max_download_time))
            .user_agent(settings.user_agent.clone())
            .gzip(true)
            .build()?;
        Ok(Self { client })
    }

    fn classify(e: &reqwest::Error) -> FetchFailure {
        if e.is_timeout() {
            FetchFailure::Timeout
        } else if e.is_connect() {
            FetchFailure::Connect
        } else if e.is_builder() || e.is_request() {
            FetchFailure::BadUrl
        } else {
            FetchFailure::Request
        }
    }
}

/// Format epoch seconds as an HTTP date.
fn http_date(epoch: i64) -> String {
    epoch_to_utc(epoch)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, ctx: &FetchContext) -> FetchOutcome {
        let mut request = self.client.get(&ctx.url);
        if let Some(prev) = &ctx.previous {
            if let Ok(value) = HeaderValue::from_str(&http_date(prev.mtime)) {
                request = request.header(IF_MODIFIED_SINCE, value);
            }
        }
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                debug!("GET {} failed: {}", ctx.url, e);
                return FetchOutcome::Failed(Self::classify(&e));
            }
        };
        if response.status() == StatusCode::NOT_MODIFIED {
            return FetchOutcome::NotModified;
        }
        if !response.status().is_success() {
            return FetchOutcome::Failed(FetchFailure::HttpStatus(response.status().as_u16()));
        }
        let modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| DateTime::parse_from_rfc2822(s).ok())
            .map(|dt| dt.with_timezone(&Utc).timestamp())
            .unwrap_or_else(now_epoch);
        let body = match response.bytes().await {
            Ok(b) => b.to_vec(),
            Err(e) => {
                warn!("reading body of {} failed: {}", ctx.url, e);
                return FetchOutcome::Failed(FetchFailure::Body);
            }
        };
        accept_body(body, modified, ctx)
    }
}

/// Treat a local path as the server.
pub struct FileFetcher;

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(&self, ctx: &FetchContext) -> FetchOutcome {
        fetch_local(Path::new(&ctx.url), ctx)
    }
}

/// Reuse the raw snapshot another feed fetched earlier in this run.
pub struct CompositeFetcher;

#[async_trait]
impl Fetcher for CompositeFetcher {
    async fn fetch(&self, ctx: &FetchContext) -> FetchOutcome {
        match &ctx.shared_source {
            Some(path) => fetch_local(path, ctx),
            None => FetchOutcome::Failed(FetchFailure::MissingSource),
        }
    }
}

fn fetch_local(path: &Path, ctx: &FetchContext) -> FetchOutcome {
    let Some(snapshot) = PreviousSnapshot::probe(path) else {
        return FetchOutcome::Failed(FetchFailure::MissingSource);
    };
    match fs::read(path) {
        Ok(body) => accept_body(body, snapshot.mtime, ctx),
        Err(_) => FetchOutcome::Failed(FetchFailure::Io),
    }
}

/// The fetcher registry: one instance per kind, resolved at run start.
pub struct FetcherSet {
    http: HttpFetcher,
    file: FileFetcher,
    composite: CompositeFetcher,
}

impl FetcherSet {
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(settings)?,
            file: FileFetcher,
            composite: CompositeFetcher,
        })
    }

    pub fn for_kind(&self, kind: crate::config::FetcherKind) -> &dyn Fetcher {
        match kind {
            crate::config::FetcherKind::Http => &self.http,
            crate::config::FetcherKind::File => &self.file,
            crate::config::FetcherKind::Composite => &self.composite,
        }
    }
}
