//! Enable command: create epoch-stamped source markers.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::config::{Config, Settings};
use crate::error::FeedsetError;
use crate::orchestrator::enable_feed;

pub async fn run(names: Vec<String>, config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("failed to load config from {:?}", config_path))?;
    let settings = Settings::resolve(&config);
    fs::create_dir_all(&settings.base_dir)
        .with_context(|| format!("failed to create {:?}", settings.base_dir))?;

    for name in &names {
        let feed = config
            .feed(name)
            .ok_or_else(|| FeedsetError::UnknownFeed(name.clone()))?;
        enable_feed(&feed.source_path(&settings.base_dir))?;
        println!("[OK] enabled {}", name);
    }
    Ok(())
}
