//! Configuration management for the proxy.
//!
//! Handles parsing, interpolation, and validation of the proxy configuration
//! file. The file is JSON; upstream servers may be given as an array of
//! named entries or as a map whose keys become names — the rest of the
//! system only ever sees the normalized list form.

mod interpolation;
mod model;
mod validation;

pub use interpolation::{InterpolationError, interpolate_config, interpolate_string};
pub use model::{
    AuthScheme, AuthSettings, AutoReconnectSettings, CommandSettings, ConfigError,
    NetworkTransportConfig, ProxyConfig, RegistrySettings, TransportKind, UpstreamConfig,
};
pub use validation::{ValidationError, validate_config, validate_server_name};

use dirs_next::{config_dir, home_dir};
use std::env;
use std::path::PathBuf;

/// Get the default path for the proxy configuration file.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var("MANIFOLD_CONFIG_PATH")
        && !path.trim().is_empty()
    {
        return expand_tilde(&path);
    }

    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("manifold")
        .join("config.json")
}

/// Load and parse the configuration from the default location.
pub async fn load_config() -> Result<ProxyConfig, ConfigError> {
    let path = default_config_path();
    load_config_from_path(&path).await
}

/// Load and parse the configuration from a specific path.
pub async fn load_config_from_path(path: &std::path::Path) -> Result<ProxyConfig, ConfigError> {
    if !path.exists() {
        return Ok(ProxyConfig::default());
    }

    let content = tokio::fs::read_to_string(path).await?;
    let mut config: ProxyConfig = serde_json::from_str(&content)?;

    interpolate_config(&mut config)?;
    validate_config(&config)?;

    Ok(config)
}

/// Save the configuration to a specific path.
pub async fn save_config_to_path(
    config: &ProxyConfig,
    path: &std::path::Path,
) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let content = serde_json::to_string_pretty(config)?;
    tokio::fs::write(path, content).await?;

    Ok(())
}

fn expand_tilde(path: &str) -> PathBuf {
    let p = path.trim();
    if p == "~" {
        return home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = p.strip_prefix("~/") {
        return home_dir().unwrap_or_else(|| PathBuf::from("~")).join(rest);
    }
    PathBuf::from(p)
}
