//! Convoy CLI entry point.

use anyhow::Context;
use clap::Parser;

use convoy::cli::{Cli, Commands};
use convoy::infrastructure::logging::LoggerImpl;
use convoy::ConfigLoader;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
    .context("Failed to load configuration");
    let config = match config {
        Ok(config) => config,
        Err(err) => convoy::cli::handle_error(&err, cli.json),
    };

    // Keep the guard alive so buffered file logs are flushed on exit
    let _logger = match LoggerImpl::init(&config.logging) {
        Ok(logger) => logger,
        Err(err) => convoy::cli::handle_error(&err, cli.json),
    };

    let result = match cli.command {
        Commands::Simulate(args) => convoy::cli::commands::simulate::execute(args, &config, cli.json).await,
        Commands::Config(args) => convoy::cli::commands::config::execute(&args, &config, cli.json),
    };

    if let Err(err) = result {
        convoy::cli::handle_error(&err, cli.json);
    }
}
