//! Configuration schema for stagehouse
//!
//! Configuration is stored at `~/.config/stagehouse/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Container engine settings
    pub backend: BackendConfig,

    /// Stages storage settings
    pub storage: StorageConfig,

    /// Registry API settings
    pub registry: RegistryConfig,

    /// Lock settings
    pub lock: LockConfig,

    /// Stages storage cache settings
    pub cache: CacheConfig,

    /// Sync defaults
    pub sync: SyncConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Container engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Engine CLI: "podman" or "docker"
    pub engine: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            engine: "podman".to_string(),
        }
    }
}

/// Stages storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Default stages storage address (":local", "archive:<path>" or a repository)
    pub default: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default: ":local".to_string(),
        }
    }
}

/// Registry HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry hosts reached over plain HTTP
    pub insecure: Vec<String>,

    /// Environment variable holding a pre-issued bearer token
    pub token_env: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            insecure: vec![],
            token_env: "STAGEHOUSE_REGISTRY_TOKEN".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lock backend: "file" or "memory"
    pub backend: String,

    /// Lock directory for the file backend (default: state dir)
    pub dir: Option<PathBuf>,

    /// Acquire/release attempts before giving up
    pub max_attempts: u32,

    /// Delay between attempts in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            dir: None,
            max_attempts: 60,
            retry_delay_ms: 1000,
        }
    }
}

/// Stages storage cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache backend: "file" or "memory"
    pub backend: String,

    /// Cache directory for the file backend (default: state dir)
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            dir: None,
        }
    }
}

/// Sync defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Concurrent stage copies
    pub workers: usize,

    /// Hold the project lock while syncing
    pub lock: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            lock: true,
        }
    }
}
