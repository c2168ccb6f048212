//! BlueChat CLI entry point

use anyhow::Context;
use clap::Parser;
use tracing::info;

use bluechat_cli::{cli::Cli, commands::CommandDispatcher, config::AppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Initialize logging
    setup_logging(cli.verbose);

    // Load configuration
    let config = load_configuration(&cli)?;

    CommandDispatcher::execute(cli, config)
        .await
        .context("command failed")?;

    info!("BlueChat CLI exited successfully");
    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Load configuration from file or the platform default location
fn load_configuration(cli: &Cli) -> anyhow::Result<AppConfig> {
    match &cli.config {
        Some(path) => AppConfig::load_from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path)),
        None => AppConfig::load().context("failed to load configuration"),
    }
}
