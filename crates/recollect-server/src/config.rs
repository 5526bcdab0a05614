//! Server configuration.

use std::path::{Path, PathBuf};

use recollect_core::EngineConfig;
use serde::Deserialize;

/// Settings that only apply to the long-running server.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Seconds between background maintenance cycles (0 = disabled).
    pub maintenance_interval_secs: u64,
    /// Run background maintenance as a dry run.
    pub maintenance_dry_run: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServerFile {
    server: ServerSettings,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to configuration file
    pub config_path: PathBuf,
    /// Default store used when `initialize` names none
    pub database_path: PathBuf,
    /// Engine tuning, shared with the CLI
    pub engine: EngineConfig,
    pub server: ServerSettings,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::for_dir(&home.join(".recollect"))
    }
}

impl Config {
    fn for_dir(recollect_dir: &Path) -> Self {
        Self {
            config_path: recollect_dir.join("config.toml"),
            database_path: recollect_dir.join("memory.db"),
            engine: EngineConfig::default(),
            server: ServerSettings::default(),
        }
    }

    /// Load configuration from file or defaults
    ///
    /// Standard directory structure:
    /// ```text
    /// ~/.recollect/
    /// ├── config.toml           # Engine and [server] settings
    /// ├── memory.db             # Default store
    /// └── memory.db.lock        # Store lock file
    /// ```
    pub fn load() -> anyhow::Result<Self> {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));

        // Use RECOLLECT_DIR env var if set, otherwise ~/.recollect
        let recollect_dir = std::env::var("RECOLLECT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".recollect"));

        std::fs::create_dir_all(&recollect_dir)?;

        let mut config = Self::for_dir(&recollect_dir);
        if config.config_path.exists() {
            let raw = std::fs::read_to_string(&config.config_path)?;
            config.engine = EngineConfig::from_toml_str(&raw)?;
            config.server = toml_server_section(&raw)?;
        }
        Ok(config)
    }
}

fn toml_server_section(raw: &str) -> anyhow::Result<ServerSettings> {
    let file: ServerFile = toml::from_str(raw)?;
    Ok(file.server)
}
