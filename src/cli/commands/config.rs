//! `convoy config` commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration after every layer was merged
    Show,
    /// Check that the configuration loads and passes validation
    Validate,
}

#[derive(Debug, Serialize)]
pub struct ConfigShowOutput {
    pub config: Config,
}

impl CommandOutput for ConfigShowOutput {
    fn to_human(&self) -> String {
        serde_yaml::to_string(&self.config).unwrap_or_else(|e| format!("<unprintable config: {e}>"))
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigValidateOutput {
    pub valid: bool,
    pub cycle_interval_ms: u64,
    pub bucket_size: u64,
}

impl CommandOutput for ConfigValidateOutput {
    fn to_human(&self) -> String {
        format!(
            "Configuration is valid (cycle every {}ms, {} new tasks per bucket)",
            self.cycle_interval_ms, self.bucket_size
        )
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": self.valid,
            "cycle_interval_ms": self.cycle_interval_ms,
            "bucket_size": self.bucket_size,
        })
    }
}

/// The configuration was already loaded and validated by the caller; these
/// commands only report on it.
pub fn execute(args: &ConfigArgs, config: &Config, json_mode: bool) -> Result<()> {
    match args.command {
        ConfigCommands::Show => output(&ConfigShowOutput { config: config.clone() }, json_mode),
        ConfigCommands::Validate => output(
            &ConfigValidateOutput {
                valid: true,
                cycle_interval_ms: config.reconciler.cycle_interval_ms,
                bucket_size: config.rate_limit.bucket_size,
            },
            json_mode,
        ),
    }
    Ok(())
}
