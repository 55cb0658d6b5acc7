//! Configuration management for stagehouse

pub mod schema;

pub use schema::Config;

use crate::error::{StagehouseError, StagehouseResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Name of the project-local config file
pub const LOCAL_CONFIG_FILE: &str = ".stagehouse.toml";

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stagehouse")
            .join("config.toml")
    }

    /// Get the state directory path
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stagehouse")
    }

    /// Get the default lock directory path
    pub fn locks_dir() -> PathBuf {
        Self::state_dir().join("locks")
    }

    /// Get the default stages storage cache directory path
    pub fn stages_cache_dir() -> PathBuf {
        Self::state_dir().join("stages_storage_cache")
    }

    /// Load configuration, using defaults if the file does not exist
    pub async fn load(&self) -> StagehouseResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> StagehouseResult<Config> {
        let content = read_config(path).await?;

        toml::from_str(&content).map_err(|e| StagehouseError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Load the global configuration with a project-local file layered on top
    ///
    /// Keys present in the local file override the global ones; tables are
    /// merged recursively.
    pub async fn load_merged(&self, local_path: Option<&Path>) -> StagehouseResult<Config> {
        let Some(local_path) = local_path else {
            return self.load().await;
        };

        let mut base = if self.config_path.exists() {
            parse_value(&self.config_path, &read_config(&self.config_path).await?)?
        } else {
            toml::Value::Table(toml::map::Map::new())
        };
        let overlay = parse_value(local_path, &read_config(local_path).await?)?;
        merge_values(&mut base, overlay);

        base.try_into().map_err(|e: toml::de::Error| StagehouseError::ConfigInvalid {
            path: local_path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Walk up from `start` looking for a project-local config file
    pub fn find_local_config(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .map(|dir| dir.join(LOCAL_CONFIG_FILE))
            .find(|candidate| candidate.is_file())
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> StagehouseResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            StagehouseError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> StagehouseResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StagehouseError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Ensure all state directories exist
    pub async fn ensure_state_dirs() -> StagehouseResult<()> {
        let dirs = [Self::state_dir(), Self::locks_dir(), Self::stages_cache_dir()];

        for dir in &dirs {
            fs::create_dir_all(dir).await.map_err(|e| {
                StagehouseError::io(format!("creating directory {}", dir.display()), e)
            })?;
        }

        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_config(path: &Path) -> StagehouseResult<String> {
    fs::read_to_string(path)
        .await
        .map_err(|e| StagehouseError::io(format!("reading config from {}", path.display()), e))
}

fn parse_value(path: &Path, content: &str) -> StagehouseResult<toml::Value> {
    toml::from_str(content).map_err(|e| StagehouseError::ConfigInvalid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Recursively merge `overlay` into `base`
fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
