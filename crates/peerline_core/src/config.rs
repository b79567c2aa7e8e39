use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable that overrides the base directory.
pub const HOME_ENV: &str = "PEERLINE_HOME";

/// Default tracing filter when neither `RUST_LOG` nor the config sets one.
pub const DEFAULT_LOG_FILTER: &str =
    "info,peerline_network=debug,peerline_core=debug,peerline_app=debug";

/// Application settings stored at `~/.peerline/config.json`.
///
/// Network settings live in their own file (`network.json`) and are owned
/// by `peerline_network::NetworkConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Name shown to peers in the `sender` block.
    pub display_name: String,
    /// `tracing` filter directive.
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            display_name: "Anonymous".into(),
            log_filter: DEFAULT_LOG_FILTER.into(),
        }
    }
}

impl AppConfig {
    /// Returns the base directory: `$PEERLINE_HOME`, or `~/.peerline/`.
    pub fn base_dir() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os(HOME_ENV) {
            return Ok(PathBuf::from(dir));
        }
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".peerline"))
    }

    /// `<base>/config.json`
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.json"))
    }

    /// `<base>/logs/`
    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("logs"))
    }

    /// `<base>/peerline.db`
    pub fn db_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("peerline.db"))
    }

    /// `<base>/profile.json`: the node's persisted peer id and name.
    pub fn profile_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("profile.json"))
    }

    /// `<base>/network.json`
    pub fn network_config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("network.json"))
    }

    /// `<base>/peers.json`: the peer directory saved between runs.
    pub fn peers_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("peers.json"))
    }

    /// Ensures all required directories exist.
    pub fn ensure_dirs() -> Result<()> {
        for dir in [Self::base_dir()?, Self::logs_dir()?] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
            }
        }
        Ok(())
    }

    /// Loads config from disk, or creates the default if missing.
    pub fn load() -> Result<Self> {
        Self::ensure_dirs()?;
        Self::load_from_path(&Self::config_path()?)
    }

    /// Load config from a specific file path, writing defaults if absent.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let config: Self =
                serde_json::from_str(&content).with_context(|| "Failed to parse config.json")?;
            info!("Loaded config from {}", path.display());
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to_path(path)?;
            info!("Created default config at {}", path.display());
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_path()?)
    }

    /// Save config to a specific file path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }
}
