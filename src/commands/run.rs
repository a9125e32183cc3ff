//! Run command: one full pass over the registry.

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::{Config, Settings};
use crate::orchestrator::{GitCollaborator, Orchestrator, RunOptions};
use crate::signal::{is_shutdown_requested, ShutdownGuard};
use crate::utils::format_count;

pub async fn run(options: RunOptions, config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("failed to load config from {:?}", config_path))?;
    let settings = Settings::resolve(&config);

    let _signals = ShutdownGuard::new();

    let mut orchestrator = Orchestrator::new(config, settings.clone())?;
    orchestrator.add_collaborator(Box::new(GitCollaborator::new(
        settings.base_dir.clone(),
        options.push_git,
    )));

    let report = orchestrator.run(&options).await?;

    if is_shutdown_requested() {
        anyhow::bail!("run interrupted by signal");
    }

    println!(
        "[OK] {} sets updated, {} feeds failed",
        format_count(report.updated.len()),
        report.failed_feeds()
    );
    Ok(())
}
