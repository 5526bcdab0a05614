//! Configuration management for recollect.
//!
//! Configuration is loaded from multiple sources with precedence:
//! 1. Command-line flags and their RECOLLECT_* environment variables
//! 2. Config file (RECOLLECT_CONFIG, the platform config dir, or
//!    ~/.recollect/config.toml)
//! 3. Default values
//!
//! The file is shared with recollect-server: engine sections are read by
//! recollect-core, the `[cli]` section only by this binary.

use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use recollect_core::EngineConfig;
use serde::{Deserialize, Serialize};

/// CLI-only defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// User applied when --user is not given
    pub user: Option<String>,
    /// Agent applied when --agent is not given
    pub agent: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CliFile {
    cli: CliConfig,
}

/// Main configuration structure
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Where the configuration was read from, if anywhere
    pub source: Option<PathBuf>,
    pub engine: EngineConfig,
    pub cli: CliConfig,
}

impl Config {
    /// Load configuration from the first config file found.
    pub fn load() -> Result<Self> {
        match config_path() {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let mut config = Self::parse(&raw)
                    .with_context(|| format!("Invalid config file {}", path.display()))?;
                config.source = Some(path);
                Ok(config)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Parse a config file body.
    pub fn parse(raw: &str) -> Result<Self> {
        let engine = EngineConfig::from_toml_str(raw)?;
        let file: CliFile = toml::from_str(raw)?;
        Ok(Self {
            source: None,
            engine,
            cli: file.cli,
        })
    }
}

/// Resolve the config file location.
fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("RECOLLECT_CONFIG") {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    if let Some(proj_dirs) = ProjectDirs::from("dev", "recollect", "recollect") {
        let path = proj_dirs.config_dir().join("config.toml");
        if path.exists() {
            return Some(path);
        }
    }

    dirs::home_dir().map(|home| home.join(".recollect").join("config.toml"))
}
