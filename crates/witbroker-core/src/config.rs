use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::coordinator::DEFAULT_MAX_PREVIEW_ITEMS;
use crate::error::ErrorCode;
use crate::sweeper::DEFAULT_SWEEP_INTERVAL;

/// Project-relative config location.
pub const PROJECT_CONFIG_PATH: &str = ".witbroker/config.toml";

/// Environment override for the sweep interval.
pub const SWEEP_INTERVAL_ENV: &str = "WB_SWEEP_INTERVAL_SECS";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub bulk: BulkConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl BrokerConfig {
    /// Reject values that parse but cannot run.
    ///
    /// # Errors
    ///
    /// Returns an error if the sweep interval is zero.
    pub fn validate(&self) -> Result<()> {
        if self.sweep.interval_secs == 0 {
            bail!("sweep.interval_secs must be greater than zero");
        }
        Ok(())
    }
}

impl SweepConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkConfig {
    #[serde(default = "default_max_preview_items")]
    pub max_preview_items: usize,
    #[serde(default)]
    pub stop_on_error: bool,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            max_preview_items: default_max_preview_items(),
            stop_on_error: false,
        }
    }
}

/// Load a config file. A missing file yields defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read, parsed or
/// validated. Parse and validation errors carry [`ErrorCode::ConfigParseError`].
pub fn load_config(path: &Path) -> Result<BrokerConfig> {
    if !path.exists() {
        return Ok(BrokerConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let code = ErrorCode::ConfigParseError.code();
    let config = toml::from_str::<BrokerConfig>(&content)
        .with_context(|| format!("{code}: failed to parse {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("{code}: invalid config {}", path.display()))?;
    Ok(config)
}

/// User-level config location, if the platform has a config dir.
#[must_use]
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("witbroker/config.toml"))
}

/// Resolve the effective config.
///
/// Precedence for the file: `explicit` path, then
/// `<project_root>/.witbroker/config.toml`, then the user config dir, then
/// built-in defaults. [`SWEEP_INTERVAL_ENV`] overrides the sweep interval.
///
/// # Errors
///
/// Returns an error if an explicit path does not exist, a file fails to
/// parse, or the environment override is not a positive integer.
pub fn resolve_config(explicit: Option<&Path>, project_root: &Path) -> Result<BrokerConfig> {
    let mut config = if let Some(path) = explicit {
        if !path.exists() {
            bail!("Config file {} does not exist", path.display());
        }
        load_config(path)?
    } else {
        let project = project_root.join(PROJECT_CONFIG_PATH);
        if project.exists() {
            load_config(&project)?
        } else if let Some(user) = user_config_path() {
            load_config(&user)?
        } else {
            BrokerConfig::default()
        }
    };

    apply_env_overrides(&mut config, env::var(SWEEP_INTERVAL_ENV).ok())?;
    Ok(config)
}

fn apply_env_overrides(config: &mut BrokerConfig, sweep_env: Option<String>) -> Result<()> {
    let Some(raw) = sweep_env else {
        return Ok(());
    };
    let secs: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{SWEEP_INTERVAL_ENV} must be a whole number of seconds"))?;
    if secs == 0 {
        bail!("{SWEEP_INTERVAL_ENV} must be greater than zero");
    }
    config.sweep.interval_secs = secs;
    Ok(())
}

const fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL.as_secs()
}

const fn default_max_preview_items() -> usize {
    DEFAULT_MAX_PREVIEW_ITEMS
}
