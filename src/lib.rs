//! # feedset - Feed Ingestion and Ipset Maintenance Engine
//!
//! Maintains a curated collection of IP blocklists sourced from
//! third-party feeds: polls each feed on its own schedule, normalizes
//! whatever textual format it ships into canonical CIDR sets, archives
//! snapshots over time, tracks per-IP retention, and publishes the
//! results to the on-disk archive and the kernel-visible ipsets.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        feedset                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CLI (clap)                                                 │
//! │    └── Commands: run, enable                                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Config (serde_yaml)                                        │
//! │    └── Feed registry, parser chains, env overrides          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Orchestrator                                               │
//! │    ├── Scheduler (periods, slack, failure back-off)         │
//! │    ├── Fetcher (reqwest conditional GET, file, composite)   │
//! │    ├── Pipeline (decoders + line transformers)              │
//! │    ├── Processor (representations, canonical text form)     │
//! │    ├── History (binary snapshot archive, windowed unions)   │
//! │    ├── Retention (per-IP lifetime histograms)               │
//! │    └── Publisher (atomic file + kernel set swap)            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Range engine (sorted disjoint IPv4 ranges)                 │
//! │    └── union, intersect, diff, CIDR emission, reduction     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Kernel adapter (KernelSets trait over the ipset CLI)       │
//! │    └── create, restore, swap, destroy                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use feedset::config::{Config, Settings};
//! use feedset::orchestrator::{Orchestrator, RunOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("/etc/feedset/feeds.yaml")?;
//!     let settings = Settings::resolve(&config);
//!     let orchestrator = Orchestrator::new(config, settings)?;
//!     let report = orchestrator.run(&RunOptions::default()).await?;
//!     println!("updated {} sets", report.updated.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`range`] - IPv4 range algebra and binary snapshot form
//! - [`pipeline`] - parser chains turning feed bytes into tokens
//! - [`fetcher`] - conditional HTTP, local copy, shared-source fetchers
//! - [`scheduler`] - per-feed polling decisions with failure back-off
//! - [`processor`] - representations and the canonical text form
//! - [`history`] - per-feed snapshot archive and windowed unions
//! - [`retention`] - per-IP lifetime histograms
//! - [`cache`] - per-feed state persisted between runs
//! - [`publisher`] - atomic file and kernel publication
//! - [`kernel`] - the kernel-visible named set interface
//! - [`orchestrator`] - the run-once engine tying it together
//! - [`lock`] - whole-run exclusive lock
//! - [`signal`] - graceful shutdown handling
//! - [`dns`] - bounded parallel hostname resolution

pub mod cache;
pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod dns;
pub mod error;
pub mod fetcher;
pub mod history;
pub mod kernel;
pub mod lock;
pub mod orchestrator;
pub mod pipeline;
pub mod processor;
pub mod publisher;
pub mod range;
pub mod retention;
pub mod scheduler;
pub mod signal;
pub mod utils;

pub use config::Config;
pub use orchestrator::{Orchestrator, RunOptions};
pub use range::RangeSet;
