//! feedset - feed ingestion and ipset maintenance engine.

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use feedset::cli::{Cli, Commands};
use feedset::orchestrator::RunOptions;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else if cli.silent {
        Level::ERROR
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config_path();
    match cli.command {
        Commands::Run {
            recheck,
            reprocess,
            rebuild,
            enable_all,
            cleanup,
            push_git,
            only,
        } => {
            let options = RunOptions {
                recheck,
                reprocess,
                rebuild,
                enable_all,
                cleanup,
                push_git,
                only,
            };
            feedset::commands::run::run(options, &config_path).await
        }
        Commands::Enable { names } => feedset::commands::enable::run(names, &config_path).await,
        Commands::Version => {
            println!("feedset {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
