use std::path::{Path, PathBuf};

use conveyor_common::config::SystemConfig;

use super::validation;

/// Complete engine configuration loaded from the config directory.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Parsed system.toml.
    pub system: SystemConfig,
    /// Base config directory path.
    #[allow(dead_code)]
    pub config_dir: PathBuf,
}

/// Load configuration from `<config_dir>/system.toml`.
///
/// A missing file yields the documented defaults (every knob has one);
/// a file that exists but does not parse or validate refuses startup
/// with a clear message.
pub fn load_config(config_dir: &Path) -> Result<EngineConfig, ConfigError> {
    tracing::info!(config_dir = %config_dir.display(), "Loading configuration");

    let system_path = config_dir.join("system.toml");
    let system = if system_path.exists() {
        load_system_config(&system_path)?
    } else {
        tracing::warn!(
            path = %system_path.display(),
            "No system.toml found, using defaults"
        );
        SystemConfig::default()
    };

    let config = EngineConfig {
        system,
        config_dir: config_dir.to_path_buf(),
    };

    validation::validate(&config)?;

    tracing::info!("Configuration loaded successfully");
    Ok(config)
}

fn load_system_config(path: &Path) -> Result<SystemConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {detail}")]
    Parse { path: PathBuf, detail: String },

    #[error("Validation failed: {0}")]
    Validation(String),
}
