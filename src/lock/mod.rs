//! Storage locks
//!
//! Mutual exclusion for processes acting on the same project's stages or
//! stages storage cache. Three lock namespaces share one primitive:
//!
//! | Lock | Name | Mode |
//! |------|------|------|
//! | Stage cache | `stage_cache.<project>.<signature>` | exclusive |
//! | Stages and images | `stages_and_images.<project>` | shared (get-or-create-only) or exclusive |
//! | Release | `release.<release>` | exclusive |
//!
//! Acquisition is bounded: busy or failing backends are retried a fixed
//! number of times, then the call fails with `LockAcquisitionExhausted`.

mod file;
mod memory;

pub use file::FileLocker;
pub(crate) use file::file_stem;
pub use memory::MemoryLocker;

use crate::config::{Config, ConfigManager};
use crate::error::{StagehouseError, StagehouseResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Any number of shared holders, no exclusive holder
    Shared,
    /// Single holder
    Exclusive,
}

/// A lock held in a backend
///
/// `release` must be idempotent: the manager may call it again after a
/// transient failure.
pub trait HeldLock: Send + Sync + fmt::Debug {
    fn release(&mut self) -> StagehouseResult<()>;
}

/// Pluggable lock backend
#[async_trait]
pub trait Locker: Send + Sync {
    /// Try once to take `name` in `mode`
    ///
    /// Returns `Ok(None)` when the lock is held elsewhere, `Err` on a backend
    /// failure. Neither blocks.
    async fn try_acquire(
        &self,
        name: &str,
        mode: LockMode,
    ) -> StagehouseResult<Option<Box<dyn HeldLock>>>;

    /// Remove idle locks whose names start with `prefix`, returning how many
    ///
    /// Backends that keep nothing once a lock is released have nothing to do.
    async fn prune(&self, _prefix: &str) -> StagehouseResult<usize> {
        Ok(0)
    }

    /// Backend name for display
    fn locker_name(&self) -> &'static str;
}

/// Proof of a held lock
///
/// Pass it back to [`StorageLockManager::unlock`]. Dropping a handle without
/// unlocking releases the lock as well and logs a warning if that fails.
#[derive(Debug)]
pub struct LockHandle {
    id: Uuid,
    name: String,
    mode: LockMode,
    acquired_at: DateTime<Utc>,
    held: Option<Box<dyn HeldLock>>,
}

impl LockHandle {
    fn new(name: String, mode: LockMode, held: Box<dyn HeldLock>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            mode,
            acquired_at: Utc::now(),
            held: Some(held),
        }
    }

    /// Unique id of this acquisition
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Lock name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock mode
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// When the lock was acquired
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Whether the lock is still held
    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(mut held) = self.held.take() {
            if let Err(e) = held.release() {
                warn!("Failed to release lock {} on drop: {}", self.name, e);
            }
        }
    }
}

/// Options for [`StorageLockManager::lock_stages_and_images`]
#[derive(Debug, Clone, Copy, Default)]
pub struct LockStagesAndImagesOptions {
    /// Caller only reads or adds stages; allows concurrent holders
    pub get_or_create_only: bool,
}

/// Lock name for a signature's stages storage cache entry
pub fn stage_cache_lock_name(project: &str, signature: &str) -> String {
    format!("stage_cache.{}.{}", project, signature)
}

/// Lock name for a project's stages and images
pub fn stages_and_images_lock_name(project: &str) -> String {
    format!("stages_and_images.{}", project)
}

/// Lock name for a deploy release
pub fn release_lock_name(release: &str) -> String {
    format!("release.{}", release)
}

/// Bounded-retry lock manager over a [`Locker`]
pub struct StorageLockManager {
    locker: Arc<dyn Locker>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl StorageLockManager {
    /// Create a lock manager
    pub fn new(locker: Arc<dyn Locker>, max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            locker,
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    /// Lock a signature's stages storage cache entry
    pub async fn lock_stage_cache(
        &self,
        project: &str,
        signature: &str,
    ) -> StagehouseResult<LockHandle> {
        self.acquire(stage_cache_lock_name(project, signature), LockMode::Exclusive)
            .await
    }

    /// Release a stage cache lock
    pub async fn unlock_stage_cache(&self, handle: LockHandle) -> StagehouseResult<()> {
        self.unlock(handle).await
    }

    /// Lock the whole project's stages and images
    pub async fn lock_stages_and_images(
        &self,
        project: &str,
        opts: LockStagesAndImagesOptions,
    ) -> StagehouseResult<LockHandle> {
        let mode = if opts.get_or_create_only {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        };
        self.acquire(stages_and_images_lock_name(project), mode).await
    }

    /// Remove idle stage cache locks of `project` from the backend
    ///
    /// Call only while holding the project's exclusive stages and images
    /// lock, which keeps every stage cache writer of the project out.
    pub async fn prune_stage_cache_locks(&self, project: &str) -> StagehouseResult<usize> {
        self.locker.prune(&stage_cache_lock_name(project, "")).await
    }

    /// Lock a deploy release
    pub async fn lock_release(&self, release: &str) -> StagehouseResult<LockHandle> {
        self.acquire(release_lock_name(release), LockMode::Exclusive)
            .await
    }

    /// Acquire `name`, retrying busy and failing attempts
    async fn acquire(&self, name: String, mode: LockMode) -> StagehouseResult<LockHandle> {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            match self.locker.try_acquire(&name, mode).await {
                Ok(Some(held)) => {
                    debug!(lock = %name, ?mode, attempt, "Lock acquired");
                    return Ok(LockHandle::new(name, mode, held));
                }
                Ok(None) => {
                    debug!(lock = %name, attempt, "Lock busy, waiting");
                }
                Err(e) => {
                    warn!(lock = %name, attempt, "Lock acquire failed: {}", e);
                    last_error = Some(e.to_string());
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(StagehouseError::LockAcquisitionExhausted {
            lock: name,
            attempts: self.max_attempts,
            last_error,
        })
    }

    /// Release a lock, retrying transient backend failures
    pub async fn unlock(&self, mut handle: LockHandle) -> StagehouseResult<()> {
        let Some(held) = handle.held.as_mut() else {
            return Ok(());
        };

        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match held.release() {
                Ok(()) => {
                    handle.held = None;
                    let held_ms = (Utc::now() - handle.acquired_at).num_milliseconds();
                    debug!(lock = %handle.name, held_ms, "Lock released");
                    return Ok(());
                }
                Err(e) => {
                    warn!(lock = %handle.name, attempt, "Lock release failed: {}", e);
                    last_error = e.to_string();
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(StagehouseError::LockRelease {
            lock: handle.name.clone(),
            reason: last_error,
        })
    }

    /// Release `handle` and merge the outcome with the guarded work's result
    ///
    /// A failed release is reported only when the work itself succeeded;
    /// otherwise the work's error wins and the release failure is logged.
    pub async fn unlock_with_result<T>(
        &self,
        handle: LockHandle,
        result: StagehouseResult<T>,
    ) -> StagehouseResult<T> {
        let lock = handle.name.clone();
        match (result, self.unlock(handle).await) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(unlock_err)) => Err(unlock_err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(unlock_err)) => {
                warn!(lock = %lock, "Lock release failed after error: {}", unlock_err);
                Err(err)
            }
        }
    }

    /// Backend name for display
    pub fn locker_name(&self) -> &'static str {
        self.locker.locker_name()
    }
}

/// Create the lock manager described by `[lock]`
pub fn create_lock_manager(config: &Config) -> StagehouseResult<Arc<StorageLockManager>> {
    let locker: Arc<dyn Locker> = match config.lock.backend.as_str() {
        "file" => {
            let dir = config
                .lock
                .dir
                .clone()
                .unwrap_or_else(ConfigManager::locks_dir);
            Arc::new(FileLocker::new(dir))
        }
        "memory" => Arc::new(MemoryLocker::new()),
        other => {
            return Err(StagehouseError::User(format!(
                "Unknown lock backend '{}': expected \"file\" or \"memory\"",
                other
            )))
        }
    };

    Ok(Arc::new(StorageLockManager::new(
        locker,
        config.lock.max_attempts,
        Duration::from_millis(config.lock.retry_delay_ms),
    )))
}
