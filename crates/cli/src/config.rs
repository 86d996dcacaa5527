//! Configuration loading for depotctl.

use anyhow::{Context, Result};
use depot_core::config::AppConfig;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::path::Path;

/// Environment variable prefix; `__` separates nested keys.
pub const ENV_PREFIX: &str = "DEPOT_";

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "DEPOT_CONFIG";

/// Load configuration from `path` (optional) and `DEPOT_*` variables.
///
/// Environment variables override the file. At least one of the two must be
/// present.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let mut figment = Figment::new();
    let has_config_file = path.exists();

    if has_config_file {
        tracing::debug!(config_path = %path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    }

    let has_env_config =
        std::env::vars().any(|(key, _)| key.starts_with(ENV_PREFIX) && key != CONFIG_ENV);

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: depotctl --config /path/to/depot.toml\n  \
             2. Environment variables: DEPOT_STORAGE__TYPE=filesystem \
             DEPOT_STORAGE__PATH=/var/lib/depot depotctl\n\n\
             Set {CONFIG_ENV} to specify a default config file path."
        );
    }

    let config: AppConfig = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .context("failed to load configuration")?;

    config.validate().context("invalid configuration")?;
    Ok(config)
}
