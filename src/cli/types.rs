//! CLI type definitions

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use super::commands::config::ConfigArgs;
use super::commands::simulate::SimulateArgs;

#[derive(Parser)]
#[command(name = "convoy")]
#[command(about = "Convoy - job reconciliation core for a container orchestrator", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Configuration file; defaults to convoy.yaml and convoy.local.yaml in
    /// the current directory
    #[arg(short, long, global = true, env = "CONVOY_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the job manager against simulated agents and print its events
    Simulate(SimulateArgs),

    /// Inspect the effective configuration
    Config(ConfigArgs),
}
