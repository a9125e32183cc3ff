//! The run-once engine.
//!
//! Acquires the run lock, builds a workspace, walks the feed registry
//! through fetch, parse, canonicalize, archive, retention, and
//! publication, isolating per-feed failures, then dispatches the
//! collaborators with the names of every set that changed.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::cache::MetadataCache;
use crate::cmd_abstraction::{args_to_strings, CommandExecutor, RealCommandExecutor};
use crate::config::{Config, FeedDefinition, Settings};
use crate::dns;
use crate::error::FeedsetError;
use crate::fetcher::{FetchContext, FetchOutcome, FetcherSet, PreviousSnapshot};
use crate::history::HistoryStore;
use crate::kernel::{create_kernel, KernelSets};
use crate::lock::LockGuard;
use crate::pipeline;
use crate::processor::{self, HeaderInfo};
use crate::publisher::Publisher;
use crate::range::RangeSet;
use crate::retention::RetentionTracker;
use crate::scheduler::{self, Decision};
use crate::signal::is_shutdown_requested;
use crate::utils::{age_seconds, humanize_minutes, now_epoch, read_mtime, set_mtime};

/// Flags of one run, straight from the CLI.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Bypass the scheduler's timing entirely.
    pub recheck: bool,
    /// Re-run parser and canonicalizer even when the download reports
    /// the source unchanged.
    pub reprocess: bool,
    /// Hand every published set to the collaborators, not only the
    /// changed ones.
    pub rebuild: bool,
    /// Enable feeds whose marker is missing instead of skipping them.
    pub enable_all: bool,
    /// Delete artifacts of feeds no longer in the registry.
    pub cleanup: bool,
    /// Ask the VCS collaborator to push after committing.
    pub push_git: bool,
    /// When non-empty, process only these feeds.
    pub only: Vec<String>,
}

/// Terminal state of one feed in one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    Disabled,
    SkippedNotDue,
    SkippedNotRequested,
    NotModified,
    FetchFailed(&'static str),
    ParseFailed,
    EmptyRejected,
    /// Parsed fine, content identical to the published snapshot.
    Same,
    Done,
    PublishFailed,
}

/// What a run did, feed by feed.
#[derive(Debug, Default)]
pub struct RunReport {
    pub statuses: BTreeMap<String, FeedStatus>,
    /// Published set names, including split children and windowed
    /// aggregates.
    pub updated: Vec<String>,
}

impl RunReport {
    pub fn failed_feeds(&self) -> usize {
        self.statuses
            .values()
            .filter(|s| {
                matches!(
                    s,
                    FeedStatus::FetchFailed(_)
                        | FeedStatus::ParseFailed
                        | FeedStatus::EmptyRejected
                        | FeedStatus::PublishFailed
                )
            })
            .count()
    }
}

/// Invoked once at the end of a run with every updated set name.
pub trait Collaborator: Send + Sync {
    fn after_run(&self, updated: &[String]) -> Result<()>;
}

/// Commits the base directory when it is a git checkout.
pub struct GitCollaborator {
    base: PathBuf,
    push: bool,
    exec: Box<dyn CommandExecutor>,
}

impl GitCollaborator {
    pub fn new(base: PathBuf, push: bool) -> Self {
        Self {
            base,
            push,
            exec: Box::new(RealCommandExecutor),
        }
    }

    fn git(&self, args: &[&str]) -> Result<()> {
        let mut full = vec!["-C", self.base.to_str().unwrap_or(".")];
        full.extend_from_slice(args);
        let out = self.exec.execute("git", &args_to_strings(&full))?;
        if !out.success {
            anyhow::bail!("git {} failed: {}", args.join(" "), out.stderr.trim());
        }
        Ok(())
    }
}

impl Collaborator for GitCollaborator {
    fn after_run(&self, updated: &[String]) -> Result<()> {
        if updated.is_empty() || !self.base.join(".git").exists() {
            return Ok(());
        }
        self.git(&["add", "-A"])?;
        self.git(&[
            "commit",
            "-m",
            &format!("updated {} ipsets", updated.len()),
        ])?;
        if self.push {
            self.git(&["push"])?;
        }
        Ok(())
    }
}

/// Create a feed's enablement marker: an empty snapshot stamped to the
/// epoch, so the first conditional fetch always misses.
pub fn enable_feed(path: &std::path::Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    fs::write(path, b"").with_context(|| format!("failed to create {:?}", path))?;
    set_mtime(path, 0)
}

pub struct Orchestrator {
    config: Config,
    settings: Settings,
    fetchers: FetcherSet,
    kernel: Box<dyn KernelSets>,
    collaborators: Vec<Box<dyn Collaborator>>,
}

enum PublishResult {
    Published(String),
    Unchanged,
}

impl Orchestrator {
    pub fn new(config: Config, settings: Settings) -> Result<Self> {
        let kernel = create_kernel(settings.kernel_publish);
        Self::with_kernel(config, settings, kernel)
    }

    /// Injection point for tests and non-privileged embedding.
    pub fn with_kernel(
        config: Config,
        settings: Settings,
        kernel: Box<dyn KernelSets>,
    ) -> Result<Self> {
        let fetchers = FetcherSet::new(&settings)?;
        Ok(Self {
            config,
            settings,
            fetchers,
            kernel,
            collaborators: Vec::new(),
        })
    }

    pub fn add_collaborator(&mut self, collaborator: Box<dyn Collaborator>) {
        self.collaborators.push(collaborator);
    }

    /// Execute one full pass over the registry.
    pub async fn run(&self, options: &RunOptions) -> Result<RunReport> {
        if !self.settings.base_dir.exists() {
            return Err(FeedsetError::MissingBaseDir(
                self.settings.base_dir.display().to_string(),
            )
            .into());
        }
        let _lock = LockGuard::acquire(&self.settings.base_dir.join(".lock"))?;

        let mut cache = MetadataCache::load(&self.settings.cache_file)?;
        fs::create_dir_all(&self.settings.tmp_dir)
            .with_context(|| format!("failed to create {:?}", self.settings.tmp_dir))?;
        let workspace = tempfile::Builder::new()
            .prefix("feedset.")
            .tempdir_in(&self.settings.tmp_dir)
            .context("failed to create workspace")?;

        let history = HistoryStore::new(&self.settings.history_dir);
        let retention = RetentionTracker::new(&self.settings.lib_dir);
        let publisher = Publisher::new(&self.settings, self.kernel.as_ref());

        let mut report = RunReport::default();
        for feed in &self.config.feeds {
            if is_shutdown_requested() {
                warn!("shutdown requested, stopping before {}", feed.name);
                break;
            }
            let status = self
                .process_feed(
                    feed,
                    options,
                    &mut cache,
                    &workspace,
                    &history,
                    &retention,
                    &publisher,
                    &mut report.updated,
                )
                .await;
            debug!("{}: {:?}", feed.name, status);
            report.statuses.insert(feed.name.clone(), status);
        }

        if options.cleanup {
            self.cleanup_retired(&mut cache, &history, &retention);
        }

        if cache.is_dirty() {
            cache.save(&self.settings.cache_file)?;
        }

        let mut for_collaborators = report.updated.clone();
        if options.rebuild {
            for name in self.expected_set_names() {
                if !for_collaborators.contains(&name) {
                    for_collaborators.push(name);
                }
            }
        }
        for collaborator in &self.collaborators {
            if let Err(e) = collaborator.after_run(&for_collaborators) {
                warn!("collaborator failed: {:#}", e);
            }
        }

        info!(
            "run complete: {} updated, {} failed",
            report.updated.len(),
            report.failed_feeds()
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_feed(
        &self,
        feed: &FeedDefinition,
        options: &RunOptions,
        cache: &mut MetadataCache,
        workspace: &TempDir,
        history: &HistoryStore,
        retention: &RetentionTracker,
        publisher: &Publisher<'_>,
        updated: &mut Vec<String>,
    ) -> FeedStatus {
        let name = &feed.name;
        if !options.only.is_empty() && !options.only.iter().any(|n| n == name) {
            return FeedStatus::SkippedNotRequested;
        }

        let source_path = feed.source_path(&self.settings.base_dir);
        if !source_path.exists() {
            if !options.enable_all {
                return FeedStatus::Disabled;
            }
            if let Err(e) = enable_feed(&source_path) {
                warn!("{}: cannot enable: {:#}", name, e);
                return FeedStatus::FetchFailed("io");
            }
            info!("{}: enabled", name);
        }

        let mut state = cache.get(name);
        let now = now_epoch();

        if state.processed > 0
            && age_seconds(state.processed) > self.settings.stale_after as i64 * 60
        {
            warn!("{}: DATA ARE TOO OLD, last publication {}s ago", name, age_seconds(state.processed));
        }

        match scheduler::decide(
            feed.period,
            state.failures,
            self.settings.failure_threshold,
            state.checked,
            now,
            options.recheck,
        ) {
            Decision::Later(secs) => {
                debug!("{}: not due for another {}s", name, secs);
                return FeedStatus::SkippedNotDue;
            }
            Decision::Run => {}
        }

        let mut url = feed.url.clone();
        if let Some(var) = &feed.api_key_env {
            match env::var(var) {
                Ok(key) => {
                    let param = feed.api_key_param.as_deref().unwrap_or("key");
                    let sep = if url.contains('?') { '&' } else { '?' };
                    url = format!("{}{}{}={}", url, sep, param, key);
                }
                Err(_) => {
                    warn!("{}: {} is not set, feed disabled for this run", name, var);
                    return FeedStatus::Disabled;
                }
            }
        }

        let ctx = FetchContext {
            url,
            previous: PreviousSnapshot::probe(&source_path),
            shared_source: feed.source_feed.as_ref().map(|primary| {
                self.settings.base_dir.join(format!("{}.source", primary))
            }),
            accept_empty: feed.accept_empty,
        };
        let outcome = self.fetchers.for_kind(feed.fetcher).fetch(&ctx).await;

        let (body, source_mtime, refetched) = match outcome {
            FetchOutcome::Failed(failure) => {
                state.note_checked(now);
                state.note_failure();
                warn!(
                    "{}: download failed ({}), {} consecutive",
                    name, failure, state.failures
                );
                cache.put(name, state);
                return FeedStatus::FetchFailed(failure.code());
            }
            FetchOutcome::NotModified => {
                state.note_checked(now);
                if !options.reprocess {
                    debug!("{}: source not modified", name);
                    cache.put(name, state);
                    return FeedStatus::NotModified;
                }
                match fs::read(&source_path) {
                    Ok(bytes) => {
                        let mtime = read_mtime(&source_path).max(state.source);
                        (bytes, mtime, false)
                    }
                    Err(e) => {
                        warn!("{}: cannot reprocess source: {}", name, e);
                        cache.put(name, state);
                        return FeedStatus::FetchFailed("io");
                    }
                }
            }
            FetchOutcome::Fetched { body, modified } => (body, modified, true),
        };

        if source_mtime > now {
            warn!(
                "{}: source timestamp is {}s in the future",
                name,
                source_mtime - now
            );
        }

        // The raw bytes stay in the workspace while the feed is parsed;
        // the published .source is only replaced on a successful parse.
        let raw_path = workspace.path().join(format!("{}.raw", name));
        if let Err(e) = fs::write(&raw_path, &body) {
            warn!("{}: workspace write failed: {}", name, e);
            state.note_checked(now);
            cache.put(name, state);
            return FeedStatus::FetchFailed("io");
        }

        let chain = match pipeline::build_chain(&feed.parsers) {
            Ok(chain) => chain,
            Err(e) => {
                warn!("{}: parser chain rejected: {:#}", name, e);
                state.note_checked(now);
                cache.put(name, state);
                return FeedStatus::ParseFailed;
            }
        };
        let artifact_name = format!("{}.{}", name, feed.representation.extension());
        let parsed = match pipeline::run_chain_collecting(&body, &chain, feed.resolve_hostnames) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("{}: parse failed: {:#}", name, e);
                publisher.preserve_error(&artifact_name, &body);
                state.note_checked(now);
                cache.put(name, state);
                return FeedStatus::ParseFailed;
            }
        };

        let mut tokens = parsed.tokens;
        if feed.resolve_hostnames && !parsed.hostnames.is_empty() {
            let resolved = dns::resolve_a_records(
                parsed.hostnames,
                self.settings.parallel_dns_queries,
            )
            .await;
            tokens.extend(resolved.iter().map(|a| a.to_string()));
        }

        if tokens.is_empty() && !feed.accept_empty {
            warn!("{}: parsed stream is empty", name);
            publisher.preserve_error(&artifact_name, &body);
            state.note_checked(now);
            cache.put(name, state);
            return FeedStatus::EmptyRejected;
        }

        let set = RangeSet::from_tokens(&tokens);

        if refetched {
            state.note_fetched(source_mtime, now);
            if let Err(e) = fs::write(&source_path, &body)
                .map_err(anyhow::Error::from)
                .and_then(|_| set_mtime(&source_path, source_mtime))
            {
                warn!("{}: raw snapshot update failed: {:#}", name, e);
            }
        } else {
            state.note_checked(now);
        }
        cache.put(name, state);

        if let Err(e) = history.keep(name, &set, source_mtime) {
            warn!("{}: history archive failed: {:#}", name, e);
        }
        if let Err(e) = retention.update(name, &set, source_mtime) {
            warn!("{}: retention update failed: {:#}", name, e);
        }

        let mut any_published = false;
        let mut any_failed = false;

        let base_targets: Vec<(FeedDefinition, RangeSet)> = match feed.split_children() {
            Some((ip_child, net_child)) => {
                let (singles, nets) = processor::split_set(&set);
                vec![(ip_child, singles), (net_child, nets)]
            }
            None => vec![(feed.clone(), set.clone())],
        };

        for (target, target_set) in &base_targets {
            match self.publish_one(target, target_set, source_mtime, None, cache, publisher, retention) {
                Ok(PublishResult::Published(published)) => {
                    any_published = true;
                    updated.push(published);
                }
                Ok(PublishResult::Unchanged) => {}
                Err(e) => {
                    warn!("{}: publication failed: {:#}", target.name, e);
                    any_failed = true;
                }
            }
        }

        let now = now_epoch();
        for window in &feed.windows {
            let combined = match history.union_since(name, *window, now) {
                Ok(combined) => combined,
                Err(e) => {
                    warn!("{}: window union failed: {:#}", name, e);
                    any_failed = true;
                    continue;
                }
            };
            let suffix = humanize_minutes(*window);
            let windowed: Vec<(FeedDefinition, RangeSet)> = match feed.split_children() {
                Some((ip_child, net_child)) => {
                    let (singles, nets) = processor::split_set(&combined);
                    vec![(ip_child, singles), (net_child, nets)]
                }
                None => vec![(feed.clone(), combined)],
            };
            for (mut target, target_set) in windowed {
                target.name = format!("{}_{}", target.name, suffix);
                match self.publish_one(
                    &target,
                    &target_set,
                    source_mtime,
                    Some(*window),
                    cache,
                    publisher,
                    retention,
                ) {
                    Ok(PublishResult::Published(published)) => {
                        any_published = true;
                        updated.push(published);
                    }
                    Ok(PublishResult::Unchanged) => {}
                    Err(e) => {
                        warn!("{}: publication failed: {:#}", target.name, e);
                        any_failed = true;
                    }
                }
            }
        }

        if let Some(max_window) = feed.windows.iter().max() {
            if let Err(e) = history.cleanup(name, *max_window, now) {
                warn!("{}: history cleanup failed: {:#}", name, e);
            }
        }

        if any_failed {
            FeedStatus::PublishFailed
        } else if any_published {
            FeedStatus::Done
        } else {
            FeedStatus::Same
        }
    }

    /// Render and publish one set (a feed, a split child, or a windowed
    /// aggregate). Content identity only refreshes the snapshot mtime;
    /// the version counter moves on real publications alone.
    #[allow(clippy::too_many_arguments)]
    fn publish_one(
        &self,
        feed: &FeedDefinition,
        set: &RangeSet,
        source_mtime: i64,
        window: Option<u64>,
        cache: &mut MetadataCache,
        publisher: &Publisher<'_>,
        retention: &RetentionTracker,
    ) -> Result<PublishResult> {
        let rendered = processor::render_representation(feed.representation, set);
        let target = feed.published_path(&self.settings.base_dir);

        if let Ok(existing) = fs::read_to_string(&target) {
            if processor::same_content(&existing, &rendered.lines) {
                publisher.refresh_mtime(&target, source_mtime)?;
                debug!("{}: content unchanged", feed.name);
                return Ok(PublishResult::Unchanged);
            }
        }

        let mut state = cache.get(&feed.name);
        let now = now_epoch();
        let info = HeaderInfo {
            source_mtime,
            version: state.version + 1,
            generated: now,
            window,
        };
        let text = processor::render_snapshot(feed, &info, &rendered);
        publisher.publish_file(&target, &text, source_mtime)?;
        publisher.publish_kernel(&feed.name, feed.representation, set)?;

        state.note_published(rendered.entries, rendered.ips, now);
        cache.put(&feed.name, state.clone());

        if window.is_none() {
            if let Err(e) =
                retention.append_history_row(&feed.name, source_mtime, rendered.entries, rendered.ips)
            {
                warn!("{}: history row failed: {:#}", feed.name, e);
            }
            self.write_feed_metadata(feed, &state, &rendered);
        }

        info!(
            "{}: published version {} ({} entries, {} unique IPs)",
            feed.name, state.version, rendered.entries, rendered.ips
        );
        Ok(PublishResult::Published(feed.name.clone()))
    }

    /// Descriptive per-set document for the analytics surface.
    fn write_feed_metadata(
        &self,
        feed: &FeedDefinition,
        state: &crate::cache::SetState,
        rendered: &processor::Rendered,
    ) {
        let dir = self.settings.lib_dir.join(&feed.name);
        let doc = serde_json::json!({
            "name": feed.name,
            "family": feed.family,
            "hash": feed.representation.hash_kind(),
            "category": feed.category,
            "description": feed.description,
            "maintainer": feed.maintainer,
            "maintainer_url": feed.maintainer_url,
            "source_url": feed.url,
            "period_minutes": feed.period,
            "version": state.version,
            "entries": rendered.entries,
            "unique_ips": rendered.ips,
            "updated": state.source,
        });
        if let Err(e) = fs::create_dir_all(&dir).map_err(anyhow::Error::from).and_then(|_| {
            let text = serde_json::to_string_pretty(&doc)?;
            fs::write(dir.join("metadata"), text).map_err(anyhow::Error::from)
        }) {
            warn!("{}: metadata write failed: {:#}", feed.name, e);
        }
    }

    /// Every set name the current registry can publish.
    fn expected_set_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for feed in &self.config.feeds {
            let bases: Vec<String> = match feed.split_children() {
                Some((ip_child, net_child)) => vec![feed.name.clone(), ip_child.name, net_child.name],
                None => vec![feed.name.clone()],
            };
            for window in &feed.windows {
                let suffix = humanize_minutes(*window);
                for base in &bases {
                    if *base != feed.name || feed.split_children().is_none() {
                        names.push(format!("{}_{}", base, suffix));
                    }
                }
            }
            names.extend(bases);
        }
        names
    }

    /// Delete artifacts of feeds that left the registry.
    fn cleanup_retired(
        &self,
        cache: &mut MetadataCache,
        history: &HistoryStore,
        retention: &RetentionTracker,
    ) {
        let expected: HashSet<String> = self.expected_set_names().into_iter().collect();
        let retired: Vec<String> = cache
            .names()
            .filter(|n| !expected.contains(*n))
            .map(|n| n.to_string())
            .collect();
        for name in retired {
            info!("{}: retired, removing artifacts", name);
            for suffix in ["source", "ipset", "netset"] {
                let _ = fs::remove_file(
                    self.settings.base_dir.join(format!("{}.{}", name, suffix)),
                );
            }
            if let Err(e) = history.remove_feed(&name) {
                warn!("{}: history removal failed: {:#}", name, e);
            }
            if let Err(e) = retention.remove_feed(&name) {
                warn!("{}: retention removal failed: {:#}", name, e);
            }
            cache.remove(&name);
        }
    }
}
