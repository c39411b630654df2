//! Engine configuration loading for the CLI.

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::path::Path;
use updraft_core::config::EngineConfig;

/// Prefix for configuration environment variables. Nested keys use `__`,
/// e.g. `UPDRAFT_LOADER__MAX_ATTEMPTS=5`.
pub const ENV_PREFIX: &str = "UPDRAFT_";

/// Variables under [`ENV_PREFIX`] that are CLI options, not engine settings.
const IGNORED_ENV_KEYS: &[&str] = &["config", "signing_key"];

/// Load the engine configuration from an optional TOML file merged with
/// `UPDRAFT_*` environment variables. Environment values win.
pub fn load_engine_config(path: Option<&Path>) -> Result<EngineConfig> {
    let mut figment = Figment::new();

    if let Some(path) = path {
        if !path.exists() {
            anyhow::bail!("config file not found: {}", path.display());
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(
        Env::prefixed(ENV_PREFIX)
            .ignore(IGNORED_ENV_KEYS)
            .split("__"),
    );

    let config: EngineConfig = figment
        .extract()
        .context("failed to load engine configuration")?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid engine configuration")?;
    Ok(config)
}
