//! Stages storage cache
//!
//! Memoizes "which stage images exist in the stages storage for this
//! signature" so that lookups do not need a full storage listing.
//!
//! # Entry States
//!
//! | Lookup result | Meaning |
//! |---------------|---------|
//! | `None` | Never cached, ask the stages storage |
//! | `Some([])` | Cached, no images for this signature |
//! | `Some([..])` | Cached candidates |
//!
//! Writes happen only while the caller holds the signature's stage cache
//! lock. Reads take no lock and may be stale.

mod file;
mod memory;

pub use file::FileStagesStorageCache;
pub use memory::MemoryStagesStorageCache;

use crate::config::{Config, ConfigManager};
use crate::error::{StagehouseError, StagehouseResult};
use crate::stage::StageDescription;
use async_trait::async_trait;
use std::sync::Arc;

/// Per-project, per-signature memo of stages storage listings
#[async_trait]
pub trait StagesStorageCache: Send + Sync {
    /// Cached candidates for `signature`, `None` if never cached
    async fn get_stages_by_signature(
        &self,
        project: &str,
        signature: &str,
    ) -> StagehouseResult<Option<Vec<StageDescription>>>;

    /// Overwrite the entry for `signature`
    async fn store_stages_by_signature(
        &self,
        project: &str,
        signature: &str,
        stages: &[StageDescription],
    ) -> StagehouseResult<()>;

    /// Forget the entry for `signature`
    async fn delete_stages_by_signature(&self, project: &str, signature: &str)
        -> StagehouseResult<()>;

    /// Forget every entry of `project`
    async fn delete_all_stages(&self, project: &str) -> StagehouseResult<()>;

    /// Human-readable location for display
    fn location(&self) -> String;
}

/// Create the stages storage cache described by `[cache]`
pub fn create_stages_storage_cache(config: &Config) -> StagehouseResult<Arc<dyn StagesStorageCache>> {
    match config.cache.backend.as_str() {
        "file" => {
            let dir = config
                .cache
                .dir
                .clone()
                .unwrap_or_else(ConfigManager::stages_cache_dir);
            Ok(Arc::new(FileStagesStorageCache::new(dir)))
        }
        "memory" => Ok(Arc::new(MemoryStagesStorageCache::new())),
        other => Err(StagehouseError::User(format!(
            "Unknown cache backend '{}': expected \"file\" or \"memory\"",
            other
        ))),
    }
}
