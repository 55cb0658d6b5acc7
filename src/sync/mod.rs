//! Stages synchronization
//!
//! Copies (or moves) every stage of a project from one stages storage to
//! another. Both storages are listed directly, the difference is fanned out
//! over a bounded worker pool, and per-stage failures are collected rather
//! than aborting the run. Re-running a sync is safe: stages already present
//! at the destination are not copied again.
//!
//! Per stage, in order:
//!
//! 1. read the source description (gone = skipped)
//! 2. fetch from source, store to destination, verify at destination
//! 3. with `remove_source`, confirm the stage at the destination, then
//!    delete it from the source
//! 4. with `cleanup_local_cache`, remove local intermediates (best effort)

mod pool;

pub use pool::JobResult;

use crate::backend::ContainerBackend;
use crate::error::{StagehouseError, StagehouseResult};
use crate::lock::{LockStagesAndImagesOptions, StorageLockManager};
use crate::stage::StageId;
use crate::storage::{unavailable, StagesStorage};
use futures_util::future::try_join;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default number of sync workers
pub const DEFAULT_SYNC_WORKERS: usize = 10;

/// Sync behaviour switches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Delete each stage from the source once it is at the destination
    pub remove_source: bool,
    /// Remove images pulled or tagged locally along the way
    pub cleanup_local_cache: bool,
    /// Worker pool size
    pub workers: usize,
    /// Hold the project's stages lock (shared) for the whole run
    pub lock: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            remove_source: false,
            cleanup_local_cache: false,
            workers: DEFAULT_SYNC_WORKERS,
            lock: true,
        }
    }
}

/// What happened to one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Copied to the destination
    Copied,
    /// Copied to the destination and removed from the source
    Moved,
    /// Already at the destination, removed from the source
    SourceRemoved,
    /// Already at the destination, nothing to do
    AlreadyPresent,
    /// Gone from the source before it could be read
    Skipped,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Copied => "copied",
            Self::Moved => "moved",
            Self::SourceRemoved => "removed from source",
            Self::AlreadyPresent => "already present",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Result of one stage job
pub type StageSyncResult = JobResult<SyncAction>;

/// Progress notifications of a sync run
#[derive(Debug)]
pub enum SyncEvent<'a> {
    /// Both storages were listed; `total` stages will be processed
    Planned { total: usize },
    /// One stage finished
    Finished(&'a StageSyncResult),
}

/// Tally of a sync run
#[derive(Debug, Default)]
pub struct SyncReport {
    pub project: String,
    pub from: String,
    pub to: String,
    /// Jobs enqueued
    pub total: usize,
    /// Stages that reached the destination (or left the source on a move)
    pub synced: Vec<(StageId, SyncAction)>,
    /// Stages that vanished from the source mid-run
    pub skipped: Vec<StageId>,
    /// Per-stage failures
    pub failed: Vec<(StageId, StagehouseError)>,
}

impl SyncReport {
    fn record(&mut self, result: StageSyncResult) {
        match result.outcome {
            Ok(SyncAction::Skipped) => self.skipped.push(result.stage),
            Ok(action) => self.synced.push((result.stage, action)),
            Err(e) => self.failed.push((result.stage, e)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Turn a report with failures into `PartialSyncFailure`
    pub fn into_result(self) -> StagehouseResult<SyncReport> {
        if self.failed.is_empty() {
            return Ok(self);
        }
        let mut failures: Vec<String> = self
            .failed
            .iter()
            .map(|(stage, e)| match e {
                StagehouseError::StageSync { .. } => e.to_string(),
                other => format!("{}: {}", stage, other),
            })
            .collect();
        failures.sort();

        Err(StagehouseError::PartialSyncFailure {
            project: self.project,
            succeeded: self.synced.len(),
            failures,
        })
    }
}

/// Replicates one project's stages between two stages storages
pub struct StagesSynchronizer {
    project: String,
    from: Arc<dyn StagesStorage>,
    to: Arc<dyn StagesStorage>,
    backend: Arc<dyn ContainerBackend>,
    lock_manager: Arc<StorageLockManager>,
    options: SyncOptions,
}

impl StagesSynchronizer {
    pub fn new(
        project: impl Into<String>,
        from: Arc<dyn StagesStorage>,
        to: Arc<dyn StagesStorage>,
        backend: Arc<dyn ContainerBackend>,
        lock_manager: Arc<StorageLockManager>,
        options: SyncOptions,
    ) -> Self {
        Self {
            project: project.into(),
            from,
            to,
            backend,
            lock_manager,
            options,
        }
    }

    /// Reject option combinations before any I/O
    pub fn validate(&self) -> StagehouseResult<()> {
        if self.options.workers == 0 {
            return Err(StagehouseError::InvalidSyncOptions(
                "at least one worker is required".to_string(),
            ));
        }
        if self.options.remove_source && (self.from.is_local() || self.to.is_local()) {
            return Err(StagehouseError::InvalidSyncOptions(format!(
                "removing source stages is not supported when syncing {} -> {}: \
                 the local stages storage cannot take part in a move",
                self.from.address(),
                self.to.address()
            )));
        }
        if self.from.address() == self.to.address() {
            return Err(StagehouseError::InvalidSyncOptions(format!(
                "source and destination are the same stages storage: {}",
                self.from.address()
            )));
        }
        Ok(())
    }

    /// Run the sync, reporting each stage result as it completes
    ///
    /// Per-stage failures end up in the report; use
    /// [`SyncReport::into_result`] to turn them into an error.
    pub async fn run<F>(&self, cancel: &CancellationToken, on_event: F) -> StagehouseResult<SyncReport>
    where
        F: FnMut(SyncEvent<'_>),
    {
        self.validate()?;

        if !self.options.lock {
            return self.run_unlocked(cancel, on_event).await;
        }

        let handle = self
            .lock_manager
            .lock_stages_and_images(
                &self.project,
                LockStagesAndImagesOptions {
                    get_or_create_only: true,
                },
            )
            .await?;
        let result = self.run_unlocked(cancel, on_event).await;
        self.lock_manager.unlock_with_result(handle, result).await
    }

    async fn run_unlocked<F>(
        &self,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> StagehouseResult<SyncReport>
    where
        F: FnMut(SyncEvent<'_>),
    {
        let from_address = self.from.address();
        let to_address = self.to.address();

        let (source, destination) = try_join(
            async {
                self.from
                    .get_all_stages(&self.project)
                    .await
                    .map_err(|e| unavailable(&from_address, e))
            },
            async {
                self.to
                    .get_all_stages(&self.project)
                    .await
                    .map_err(|e| unavailable(&to_address, e))
            },
        )
        .await?;

        let destination: HashSet<StageId> = destination.into_iter().collect();
        let work: Vec<StageId> = source
            .into_iter()
            .filter(|id| self.options.remove_source || !destination.contains(id))
            .collect();

        info!(
            project = %self.project,
            from = %from_address,
            to = %to_address,
            stages = work.len(),
            workers = self.options.workers,
            "Syncing stages"
        );
        on_event(SyncEvent::Planned { total: work.len() });

        let mut report = SyncReport {
            project: self.project.clone(),
            from: from_address.clone(),
            to: to_address.clone(),
            total: work.len(),
            ..SyncReport::default()
        };

        let ctx = Arc::new(StageSync {
            project: self.project.clone(),
            from: Arc::clone(&self.from),
            to: Arc::clone(&self.to),
            backend: Arc::clone(&self.backend),
            options: self.options,
            destination,
        });
        let job = pool::stage_job(move |stage| {
            let ctx = Arc::clone(&ctx);
            async move { ctx.sync_stage(stage).await }
        });

        let results = pool::run(work, self.options.workers, cancel, job, |result| {
            match &result.outcome {
                Ok(action) => debug!(stage = %result.stage, "Stage {}", action),
                Err(e) => warn!(stage = %result.stage, "Stage sync failed: {}", e),
            }
            on_event(SyncEvent::Finished(result));
        })
        .await;

        for result in results {
            report.record(result);
        }

        info!(
            project = %self.project,
            synced = report.synced.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Stages sync finished"
        );
        Ok(report)
    }
}

/// Shared state of one run's stage jobs
struct StageSync {
    project: String,
    from: Arc<dyn StagesStorage>,
    to: Arc<dyn StagesStorage>,
    backend: Arc<dyn ContainerBackend>,
    options: SyncOptions,
    destination: HashSet<StageId>,
}

impl StageSync {
    async fn sync_stage(&self, stage: StageId) -> StagehouseResult<SyncAction> {
        self.sync_stage_inner(&stage)
            .await
            .map_err(|e| StagehouseError::StageSync {
                stage,
                from: self.from.address(),
                to: self.to.address(),
                source: Box::new(e),
            })
    }

    async fn sync_stage_inner(&self, stage: &StageId) -> StagehouseResult<SyncAction> {
        let Some(description) = self
            .from
            .get_stage_description(&self.project, stage)
            .await?
        else {
            debug!(stage = %stage, "Stage gone from source, skipping");
            return Ok(SyncAction::Skipped);
        };

        let mut action = SyncAction::AlreadyPresent;
        let mut local_images = Vec::new();

        // A move deletes the source, so the listing alone is not enough
        let present = self.destination.contains(stage)
            && (!self.options.remove_source
                || self
                    .to
                    .get_stage_description(&self.project, stage)
                    .await?
                    .is_some());
        if self.destination.contains(stage) && !present {
            debug!(stage = %stage, "Stage listed at destination but gone, copying");
        }

        if !present {
            let local = self.from.fetch_image(&self.project, &description).await?;
            self.to.store_image(&self.project, stage, &local).await?;

            if self
                .to
                .get_stage_description(&self.project, stage)
                .await?
                .is_none()
            {
                return Err(StagehouseError::SyncVerification {
                    stage: stage.clone(),
                    storage: self.to.address(),
                });
            }

            local_images.push(local);
            local_images.push(self.to.construct_stage_image_name(&self.project, stage));
            action = SyncAction::Copied;
        }

        if self.options.remove_source {
            self.from
                .delete_stages(&self.project, std::slice::from_ref(&description))
                .await?;
            action = match action {
                SyncAction::Copied => SyncAction::Moved,
                _ => SyncAction::SourceRemoved,
            };
        }

        if self.options.cleanup_local_cache && !self.from.is_local() && !self.to.is_local() {
            local_images.dedup();
            for image in &local_images {
                if let Err(e) = self.backend.remove(image).await {
                    warn!(stage = %stage, "Unable to remove local image {}: {}", image, e);
                }
            }
        }

        Ok(action)
    }
}

/// Sync `project` from `from` to `to`, failing if any stage failed
pub async fn sync_stages(
    project: &str,
    from: Arc<dyn StagesStorage>,
    to: Arc<dyn StagesStorage>,
    backend: Arc<dyn ContainerBackend>,
    lock_manager: Arc<StorageLockManager>,
    options: SyncOptions,
) -> StagehouseResult<SyncReport> {
    StagesSynchronizer::new(project, from, to, backend, lock_manager, options)
        .run(&CancellationToken::new(), |_| {})
        .await?
        .into_result()
}
