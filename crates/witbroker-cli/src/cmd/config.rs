//! `wb config`: print the effective configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use witbroker_core::config::{BrokerConfig, resolve_config};

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Config file to read instead of the default locations.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

pub fn run_config(args: &ConfigArgs, project_root: &Path) -> Result<()> {
    let config = resolve_config(args.config.as_deref(), project_root)?;
    print!("{}", render(&config)?);
    Ok(())
}

fn render(config: &BrokerConfig) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to render config as TOML")
}
