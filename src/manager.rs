//! Stages manager
//!
//! Facade over one project's stages storage, its cache and its locks.
//! Lookups go through the cache. Refreshes and writes hold the project's
//! stages lock (shared) and then the signature's stage cache lock for their
//! whole duration, so a cache reset (exclusive project lock) never overlaps
//! a write.

use crate::backend::ContainerBackend;
use crate::cache::StagesStorageCache;
use crate::error::{StagehouseError, StagehouseResult};
use crate::lock::{LockHandle, LockStagesAndImagesOptions, StorageLockManager};
use crate::selection::select_suitable_stage;
use crate::stage::{sort_candidates, BuildStage, StageDescription};
use crate::storage::{unavailable, StagesStorage};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A stage made available to the local container engine
#[derive(Debug, Clone)]
pub struct FetchedStage {
    pub description: StageDescription,
    /// Reference of the image in the local engine
    pub local_reference: String,
}

/// Locks held while one signature's cache entry is written
struct SignatureLock {
    project: LockHandle,
    stage_cache: LockHandle,
}

/// Stage lookup and cache maintenance for one project
pub struct StagesManager {
    project: String,
    storage: Arc<dyn StagesStorage>,
    cache: Arc<dyn StagesStorageCache>,
    lock_manager: Arc<StorageLockManager>,
    backend: Arc<dyn ContainerBackend>,
}

impl StagesManager {
    pub fn new(
        project: impl Into<String>,
        storage: Arc<dyn StagesStorage>,
        cache: Arc<dyn StagesStorageCache>,
        lock_manager: Arc<StorageLockManager>,
        backend: Arc<dyn ContainerBackend>,
    ) -> Self {
        Self {
            project: project.into(),
            storage,
            cache,
            lock_manager,
            backend,
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn storage(&self) -> &Arc<dyn StagesStorage> {
        &self.storage
    }

    pub fn cache(&self) -> &Arc<dyn StagesStorageCache> {
        &self.cache
    }

    /// Every stage of the project, read from the stages storage directly
    pub async fn get_all_stages(&self) -> StagehouseResult<Vec<StageDescription>> {
        let address = self.storage.address();
        let ids = self
            .storage
            .get_all_stages(&self.project)
            .await
            .map_err(|e| unavailable(&address, e))?;

        let mut stages = Vec::with_capacity(ids.len());
        for id in ids {
            match self
                .storage
                .get_stage_description(&self.project, &id)
                .await
                .map_err(|e| unavailable(&address, e))?
            {
                Some(description) => stages.push(description),
                None => debug!(stage = %id, storage = %address, "Stage vanished while listing"),
            }
        }

        sort_candidates(&mut stages);
        Ok(stages)
    }

    /// Make the stage's selected image available locally
    ///
    /// Fails with `StaleCache` when the image is gone from the stages
    /// storage. The image is pulled only if it is not already present.
    pub async fn fetch_stage(&self, stage: &dyn BuildStage) -> StagehouseResult<FetchedStage> {
        let stage_id = stage.stage_id().ok_or_else(|| {
            StagehouseError::Internal(format!(
                "stage {} ({}) has no selected stage image",
                stage.name(),
                stage.signature()
            ))
        })?;

        let description = self
            .storage
            .get_stage_description(&self.project, stage_id)
            .await?
            .ok_or_else(|| StagehouseError::StaleCache {
                project: self.project.clone(),
                stage_name: stage.name().to_string(),
                stage_id: stage_id.clone(),
                storage: self.storage.address(),
            })?;

        let local_reference = if self.backend.is_present(description.image_name()).await? {
            debug!(stage = %stage_id, "Stage image already present locally");
            description.image_name().to_string()
        } else {
            info!(project = %self.project, stage = %stage_id, "Fetching stage {}", stage.name());
            self.storage.fetch_image(&self.project, &description).await?
        };

        Ok(FetchedStage {
            description,
            local_reference,
        })
    }

    /// First candidate the stage accepts, `None` means rebuild
    pub fn select_suitable_stages_storage_image<'a>(
        &self,
        stage: &dyn BuildStage,
        candidates: &'a [StageDescription],
    ) -> Option<&'a StageDescription> {
        let predicate = |candidate: &StageDescription| stage.is_compatible(candidate);
        let selected = select_suitable_stage(candidates, &predicate);
        debug!(
            stage = stage.name(),
            signature = stage.signature(),
            candidates = candidates.len(),
            selected = ?selected.map(|s| &s.stage_id),
            "Selected stages storage image"
        );
        selected
    }

    /// Re-read a signature's stages from storage and overwrite its cache entry
    pub async fn atomic_get_images_by_signature_from_stages_storage_with_cache_reset(
        &self,
        stage_name: &str,
        signature: &str,
    ) -> StagehouseResult<Vec<StageDescription>> {
        let lock = self.lock_signature(signature).await?;
        let result = self.refresh_cache_entry(stage_name, signature).await;
        self.unlock_signature(lock, result).await
    }

    async fn lock_signature(&self, signature: &str) -> StagehouseResult<SignatureLock> {
        let project = self
            .lock_manager
            .lock_stages_and_images(
                &self.project,
                LockStagesAndImagesOptions {
                    get_or_create_only: true,
                },
            )
            .await?;
        match self
            .lock_manager
            .lock_stage_cache(&self.project, signature)
            .await
        {
            Ok(stage_cache) => Ok(SignatureLock {
                project,
                stage_cache,
            }),
            Err(e) => self.lock_manager.unlock_with_result(project, Err(e)).await,
        }
    }

    /// Release in reverse acquisition order
    async fn unlock_signature<T>(
        &self,
        lock: SignatureLock,
        result: StagehouseResult<T>,
    ) -> StagehouseResult<T> {
        let result = self
            .lock_manager
            .unlock_with_result(lock.stage_cache, result)
            .await;
        self.lock_manager
            .unlock_with_result(lock.project, result)
            .await
    }

    async fn refresh_cache_entry(
        &self,
        stage_name: &str,
        signature: &str,
    ) -> StagehouseResult<Vec<StageDescription>> {
        let stages = self.read_stages_by_signature(signature).await?;

        if let Err(e) = self
            .cache
            .store_stages_by_signature(&self.project, signature, &stages)
            .await
        {
            warn!(
                project = %self.project,
                signature,
                stage = stage_name,
                "Unable to update stages storage cache: {}",
                e
            );
        }

        debug!(
            project = %self.project,
            signature,
            stage = stage_name,
            stages = stages.len(),
            "Refreshed stages storage cache"
        );
        Ok(stages)
    }

    async fn read_stages_by_signature(
        &self,
        signature: &str,
    ) -> StagehouseResult<Vec<StageDescription>> {
        let address = self.storage.address();
        let ids = self
            .storage
            .get_stages_by_signature(&self.project, signature)
            .await
            .map_err(|e| unavailable(&address, e))?;

        let mut stages = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(description) = self
                .storage
                .get_stage_description(&self.project, &id)
                .await
                .map_err(|e| unavailable(&address, e))?
            {
                stages.push(description);
            }
        }
        sort_candidates(&mut stages);
        Ok(stages)
    }

    /// Record the stages of a signature after a build published one
    pub async fn atomic_store_stage_cache(
        &self,
        stage_name: &str,
        signature: &str,
        stages: &[StageDescription],
    ) -> StagehouseResult<()> {
        let mut stages = stages.to_vec();
        sort_candidates(&mut stages);

        let lock = self.lock_signature(signature).await?;
        let result = self
            .cache
            .store_stages_by_signature(&self.project, signature, &stages)
            .await;
        if result.is_ok() {
            debug!(project = %self.project, signature, stage = stage_name, "Stored stage cache");
        }
        self.unlock_signature(lock, result).await
    }

    /// Cached stages of a signature without locking, `None` if never cached
    ///
    /// An unreadable entry is reported as never cached so the caller
    /// refreshes it.
    pub async fn get_images_by_signature_from_cache(
        &self,
        stage_name: &str,
        signature: &str,
    ) -> StagehouseResult<Option<Vec<StageDescription>>> {
        match self
            .cache
            .get_stages_by_signature(&self.project, signature)
            .await
        {
            Err(e @ StagehouseError::CacheCorrupted { .. }) => {
                warn!(stage = stage_name, "{}", e);
                Ok(None)
            }
            other => other,
        }
    }

    /// Cached stages of a signature, refreshing the entry on a miss
    pub async fn get_stages_by_signature(
        &self,
        stage_name: &str,
        signature: &str,
    ) -> StagehouseResult<Vec<StageDescription>> {
        if let Some(stages) = self
            .get_images_by_signature_from_cache(stage_name, signature)
            .await?
        {
            return Ok(stages);
        }
        self.atomic_get_images_by_signature_from_stages_storage_with_cache_reset(
            stage_name, signature,
        )
        .await
    }

    /// Delete stages from the storage and invalidate their cache entries
    pub async fn delete_stages(&self, stages: &[StageDescription]) -> StagehouseResult<()> {
        if stages.is_empty() {
            return Ok(());
        }
        self.storage.delete_stages(&self.project, stages).await?;

        let mut by_signature: BTreeMap<&str, usize> = BTreeMap::new();
        for stage in stages {
            *by_signature.entry(stage.stage_id.signature.as_str()).or_default() += 1;
        }

        for (signature, count) in by_signature {
            let lock = self.lock_signature(signature).await?;
            let result = self
                .cache
                .delete_stages_by_signature(&self.project, signature)
                .await;
            self.unlock_signature(lock, result).await?;
            info!(project = %self.project, signature, count, "Deleted stages");
        }
        Ok(())
    }

    /// Forget every cached listing of the project
    ///
    /// Idle stage cache lock files of the project are removed as well.
    pub async fn reset_stages_storage_cache(&self) -> StagehouseResult<()> {
        let handle = self
            .lock_manager
            .lock_stages_and_images(&self.project, LockStagesAndImagesOptions::default())
            .await?;
        let result = self.cache.delete_all_stages(&self.project).await;
        if result.is_ok() {
            match self.lock_manager.prune_stage_cache_locks(&self.project).await {
                Ok(removed) => debug!(project = %self.project, removed, "Pruned stage cache locks"),
                Err(e) => warn!(project = %self.project, "Unable to prune stage cache locks: {}", e),
            }
        }
        self.lock_manager.unlock_with_result(handle, result).await?;
        info!(project = %self.project, cache = %self.cache.location(), "Reset stages storage cache");
        Ok(())
    }
}
