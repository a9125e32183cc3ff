//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "feedset")]
#[command(author, version, about = "Feed ingestion and ipset maintenance engine")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path (falls back to CONFIG_FILE, then the default)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Errors only (for cron)
    #[arg(long, global = true)]
    pub silent: bool,

    /// Debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute one full pass over the feed registry
    Run {
        /// Bypass the per-feed timing (unsafe for automated runs)
        #[arg(long)]
        recheck: bool,

        /// Re-parse even when the download reports the source unchanged
        #[arg(long)]
        reprocess: bool,

        /// Hand every published set to the collaborators
        #[arg(long)]
        rebuild: bool,

        /// Enable every configured feed that has no marker yet
        #[arg(long = "enable-all")]
        enable_all: bool,

        /// Delete artifacts of feeds no longer configured
        #[arg(long)]
        cleanup: bool,

        /// Push after the VCS commit
        #[arg(long = "push-git")]
        push_git: bool,

        /// Process only the named feeds
        #[arg(long)]
        only: Vec<String>,
    },

    /// Enable feeds by creating their source markers
    Enable {
        /// Feed names to enable
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Show version
    Version,
}

/// Default config location when neither --config nor CONFIG_FILE is set.
pub const DEFAULT_CONFIG: &str = "/etc/feedset/feeds.yaml";

impl Cli {
    /// --config beats CONFIG_FILE beats the default.
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(|| {
            std::env::var("CONFIG_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG))
        })
    }
}
