mod aggregator;
mod candles;
mod cli;
mod config;
mod error;
mod exchange;
mod filter_utils;
mod indicators;
mod models;
mod movers;
mod options;
mod pairs;
mod resolver;
mod storage_utils;
mod tables;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = cli::run(cli).await {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}
