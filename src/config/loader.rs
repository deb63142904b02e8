//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}")))?;

    config.validate()?;

    info!(
        "Configuration loaded: {} list sources, dns listen {}, proxy listen {}",
        config.rules.list_urls.len() + config.rules.list_files.len(),
        config.dns.listen,
        config.proxy.listen
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `DIVERT_LOG_LEVEL`: Override log level
/// - `DIVERT_DNS_LISTEN`: Override DNS listener address
/// - `DIVERT_PROXY_LISTEN`: Override proxy listener address
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;

    if let Ok(level) = std::env::var("DIVERT_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Ok(addr) = std::env::var("DIVERT_DNS_LISTEN") {
        config.dns.listen = addr
            .parse()
            .map_err(|_| ConfigError::invalid_address(&addr, "invalid socket address"))?;
        debug!("DNS listener overridden to {}", config.dns.listen);
    }

    if let Ok(addr) = std::env::var("DIVERT_PROXY_LISTEN") {
        config.proxy.listen = addr
            .parse()
            .map_err(|_| ConfigError::invalid_address(&addr, "invalid socket address"))?;
        debug!("Proxy listener overridden to {}", config.proxy.listen);
    }

    config.validate()?;

    Ok(config)
}
