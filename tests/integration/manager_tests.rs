//! Stages manager over in-memory storage, cache and locks

use crate::common::{lock_manager, memory_manager, stage, FakeBackend, MemoryStagesStorage};
use async_trait::async_trait;
use stagehouse::cache::{MemoryStagesStorageCache, StagesStorageCache};
use stagehouse::error::{StagehouseError, StagehouseResult};
use stagehouse::lock::{FileLocker, LockStagesAndImagesOptions, MemoryLocker, StorageLockManager};
use stagehouse::manager::StagesManager;
use stagehouse::selection::SelectionPolicy;
use stagehouse::stage::{StageDescription, StageRef};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PROJECT: &str = "webapp";

#[tokio::test]
async fn fetch_of_vanished_stage_is_stale_cache() {
    let storage = MemoryStagesStorage::new("registry.example/stages")
        .with_stages(PROJECT, &[stage("sigA", 1)]);
    let (manager, _) = memory_manager(PROJECT, storage, FakeBackend::new());

    let selected = StageRef::new("install", "sigA").with_stage_id(stage("sigA", 2));
    let err = manager.fetch_stage(&selected).await.unwrap_err();

    match err {
        StagehouseError::StaleCache {
            project,
            stage_name,
            stage_id,
            ..
        } => {
            assert_eq!(project, PROJECT);
            assert_eq!(stage_name, "install");
            assert_eq!(stage_id, stage("sigA", 2));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn fetch_skips_storage_when_image_is_local() {
    let storage = MemoryStagesStorage::new("registry.example/stages")
        .with_stages(PROJECT, &[stage("sigA", 1), stage("sigB", 1)]);
    let backend = FakeBackend::new();
    backend.add_image("registry.example/stages/webapp:sigA-1");
    let (manager, _) = memory_manager(PROJECT, storage.clone(), backend);

    let present = manager
        .fetch_stage(&StageRef::new("from", "sigA").with_stage_id(stage("sigA", 1)))
        .await
        .unwrap();
    assert_eq!(present.local_reference, "registry.example/stages/webapp:sigA-1");
    assert_eq!(storage.fetch_calls.load(Ordering::SeqCst), 0);

    let fetched = manager
        .fetch_stage(&StageRef::new("setup", "sigB").with_stage_id(stage("sigB", 1)))
        .await
        .unwrap();
    assert_eq!(fetched.description.stage_id, stage("sigB", 1));
    assert_eq!(storage.fetch_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fetch_without_selected_stage_fails() {
    let storage = MemoryStagesStorage::new("registry.example/stages");
    let (manager, _) = memory_manager(PROJECT, storage, FakeBackend::new());

    let err = manager
        .fetch_stage(&StageRef::new("install", "sigA"))
        .await
        .unwrap_err();
    assert!(matches!(err, StagehouseError::Internal(_)));
}

#[tokio::test]
async fn cached_empty_listing_needs_no_storage_call() {
    let storage = MemoryStagesStorage::new("registry.example/stages")
        .with_stages(PROJECT, &[stage("sigA", 1)]);
    let (manager, _) = memory_manager(PROJECT, storage.clone(), FakeBackend::new());

    manager
        .atomic_store_stage_cache("install", "sigA", &[])
        .await
        .unwrap();

    let stages = manager.get_stages_by_signature("install", "sigA").await.unwrap();
    assert!(stages.is_empty());
    assert_eq!(storage.list_calls.load(Ordering::SeqCst), 0);
    assert_eq!(storage.describe_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cache_miss_refreshes_once() {
    let storage = MemoryStagesStorage::new("registry.example/stages").with_stages(
        PROJECT,
        &[stage("sigA", 3), stage("sigA", 1), stage("sigB", 2)],
    );
    let (manager, cache) = memory_manager(PROJECT, storage.clone(), FakeBackend::new());

    assert!(manager
        .get_images_by_signature_from_cache("install", "sigA")
        .await
        .unwrap()
        .is_none());

    let first = manager.get_stages_by_signature("install", "sigA").await.unwrap();
    let ids: Vec<_> = first.iter().map(|s| s.stage_id.clone()).collect();
    assert_eq!(ids, vec![stage("sigA", 1), stage("sigA", 3)]);
    assert_eq!(storage.list_calls.load(Ordering::SeqCst), 1);

    let second = manager.get_stages_by_signature("install", "sigA").await.unwrap();
    assert_eq!(second, first);
    assert_eq!(storage.list_calls.load(Ordering::SeqCst), 1);

    let cached = cache
        .get_stages_by_signature(PROJECT, "sigA")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached, first);
}

#[tokio::test]
async fn refresh_overwrites_stale_entry() {
    let storage = MemoryStagesStorage::new("registry.example/stages")
        .with_stages(PROJECT, &[stage("sigA", 1)]);
    let (manager, _) = memory_manager(PROJECT, storage.clone(), FakeBackend::new());

    manager.get_stages_by_signature("install", "sigA").await.unwrap();
    storage.insert(PROJECT, &stage("sigA", 2));

    // cache still answers with the old listing
    let cached = manager.get_stages_by_signature("install", "sigA").await.unwrap();
    assert_eq!(cached.len(), 1);

    let refreshed = manager
        .atomic_get_images_by_signature_from_stages_storage_with_cache_reset("install", "sigA")
        .await
        .unwrap();
    assert_eq!(refreshed.len(), 2);
    let cached = manager.get_stages_by_signature("install", "sigA").await.unwrap();
    assert_eq!(cached, refreshed);
}

#[tokio::test]
async fn unreachable_storage_leaves_cache_untouched() {
    let storage = MemoryStagesStorage::new("registry.example/stages")
        .with_stages(PROJECT, &[stage("sigA", 1)]);
    storage.set_fail_listing(true);
    let (manager, cache) = memory_manager(PROJECT, storage, FakeBackend::new());

    let err = manager
        .get_stages_by_signature("install", "sigA")
        .await
        .unwrap_err();
    assert!(matches!(err, StagehouseError::StorageUnavailable { .. }));
    assert!(cache
        .get_stages_by_signature(PROJECT, "sigA")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn held_stage_cache_lock_blocks_writers() {
    let storage = MemoryStagesStorage::new("registry.example/stages");
    let cache = Arc::new(MemoryStagesStorageCache::new());
    let locks = lock_manager();
    let manager = StagesManager::new(
        PROJECT,
        storage,
        cache.clone(),
        Arc::clone(&locks),
        FakeBackend::new(),
    );

    let held = locks.lock_stage_cache(PROJECT, "sigA").await.unwrap();
    let err = manager
        .atomic_store_stage_cache("install", "sigA", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, StagehouseError::LockAcquisitionExhausted { .. }));
    assert!(cache
        .get_stages_by_signature(PROJECT, "sigA")
        .await
        .unwrap()
        .is_none());

    // other signatures are independent
    manager
        .atomic_store_stage_cache("setup", "sigB", &[])
        .await
        .unwrap();

    locks.unlock_stage_cache(held).await.unwrap();
    manager
        .atomic_store_stage_cache("install", "sigA", &[])
        .await
        .unwrap();
}

#[tokio::test]
async fn concurrent_refreshes_each_complete() {
    let storage = MemoryStagesStorage::new("registry.example/stages")
        .with_stages(PROJECT, &[stage("sigA", 1), stage("sigA", 2)]);
    let locks = Arc::new(StorageLockManager::new(
        Arc::new(MemoryLocker::new()),
        200,
        Duration::from_millis(5),
    ));
    let manager = Arc::new(StagesManager::new(
        PROJECT,
        storage.clone(),
        Arc::new(MemoryStagesStorageCache::new()),
        locks,
        FakeBackend::new(),
    ));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .atomic_get_images_by_signature_from_stages_storage_with_cache_reset(
                        "install", "sigA",
                    )
                    .await
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap().len(), 2);
    }
    assert_eq!(storage.list_calls.load(Ordering::SeqCst), 8);
}

/// Memory cache that tracks how many writers are inside it at once
#[derive(Default)]
struct WriterCountingCache {
    inner: MemoryStagesStorageCache,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl WriterCountingCache {
    async fn write<T>(&self, work: impl std::future::Future<Output = T>) -> T {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let result = work.await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl StagesStorageCache for WriterCountingCache {
    async fn get_stages_by_signature(
        &self,
        project: &str,
        signature: &str,
    ) -> StagehouseResult<Option<Vec<StageDescription>>> {
        self.inner.get_stages_by_signature(project, signature).await
    }

    async fn store_stages_by_signature(
        &self,
        project: &str,
        signature: &str,
        stages: &[StageDescription],
    ) -> StagehouseResult<()> {
        self.write(self.inner.store_stages_by_signature(project, signature, stages))
            .await
    }

    async fn delete_stages_by_signature(
        &self,
        project: &str,
        signature: &str,
    ) -> StagehouseResult<()> {
        self.write(self.inner.delete_stages_by_signature(project, signature))
            .await
    }

    async fn delete_all_stages(&self, project: &str) -> StagehouseResult<()> {
        self.write(self.inner.delete_all_stages(project)).await
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cache_has_at_most_one_writer_per_signature() {
    let storage = MemoryStagesStorage::new("registry.example/stages")
        .with_stages(PROJECT, &[stage("sigA", 1), stage("sigA", 2)]);
    let cache = Arc::new(WriterCountingCache::default());
    let locks = Arc::new(StorageLockManager::new(
        Arc::new(MemoryLocker::new()),
        2000,
        Duration::from_millis(1),
    ));
    let manager = Arc::new(StagesManager::new(
        PROJECT,
        storage,
        cache.clone(),
        locks,
        FakeBackend::new(),
    ));

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                match i % 4 {
                    0 => manager.atomic_store_stage_cache("install", "sigA", &[]).await,
                    3 => manager.reset_stages_storage_cache().await,
                    _ => manager
                        .atomic_get_images_by_signature_from_stages_storage_with_cache_reset(
                            "install", "sigA",
                        )
                        .await
                        .map(|_| ()),
                }
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(cache.active.load(Ordering::SeqCst), 0);
    assert_eq!(cache.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn held_reset_lock_blocks_cache_writes() {
    let storage = MemoryStagesStorage::new("registry.example/stages");
    let cache = Arc::new(MemoryStagesStorageCache::new());
    let locks = lock_manager();
    let manager = StagesManager::new(
        PROJECT,
        storage,
        cache.clone(),
        Arc::clone(&locks),
        FakeBackend::new(),
    );

    let reset = locks
        .lock_stages_and_images(PROJECT, LockStagesAndImagesOptions::default())
        .await
        .unwrap();
    let err = manager
        .atomic_store_stage_cache("install", "sigA", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, StagehouseError::LockAcquisitionExhausted { .. }));
    assert!(cache
        .get_stages_by_signature(PROJECT, "sigA")
        .await
        .unwrap()
        .is_none());

    // the failed attempt released everything it took
    locks.unlock(reset).await.unwrap();
    manager
        .atomic_store_stage_cache("install", "sigA", &[])
        .await
        .unwrap();
    manager.reset_stages_storage_cache().await.unwrap();
}

#[tokio::test]
async fn reset_removes_idle_stage_cache_lock_files() {
    let dir = tempfile::TempDir::new().unwrap();
    let locker = FileLocker::new(dir.path().to_path_buf());
    let locks = Arc::new(StorageLockManager::new(
        Arc::new(locker.clone()),
        5,
        Duration::from_millis(1),
    ));
    let storage = MemoryStagesStorage::new("registry.example/stages")
        .with_stages(PROJECT, &[stage("sigA", 1), stage("sigB", 1)]);
    let manager = StagesManager::new(
        PROJECT,
        storage,
        Arc::new(MemoryStagesStorageCache::new()),
        Arc::clone(&locks),
        FakeBackend::new(),
    );

    manager.get_stages_by_signature("install", "sigA").await.unwrap();
    manager.get_stages_by_signature("setup", "sigB").await.unwrap();
    let other = locks.lock_stage_cache("api", "sigA").await.unwrap();
    locks.unlock(other).await.unwrap();
    assert!(locker.lock_path("stage_cache.webapp.sigA").exists());
    assert!(locker.lock_path("stage_cache.webapp.sigB").exists());

    manager.reset_stages_storage_cache().await.unwrap();

    assert!(!locker.lock_path("stage_cache.webapp.sigA").exists());
    assert!(!locker.lock_path("stage_cache.webapp.sigB").exists());
    assert!(locker.lock_path("stage_cache.api.sigA").exists());
    assert!(locker.lock_path("stages_and_images.webapp").exists());

    // locks come back on demand
    manager.get_stages_by_signature("install", "sigA").await.unwrap();
    assert!(locker.lock_path("stage_cache.webapp.sigA").exists());
}

#[tokio::test]
async fn delete_stages_invalidates_their_signatures() {
    let storage = MemoryStagesStorage::new("registry.example/stages")
        .with_stages(PROJECT, &[stage("sigA", 1), stage("sigB", 1)]);
    let (manager, cache) = memory_manager(PROJECT, storage.clone(), FakeBackend::new());

    let a = manager.get_stages_by_signature("install", "sigA").await.unwrap();
    manager.get_stages_by_signature("setup", "sigB").await.unwrap();

    manager.delete_stages(&a).await.unwrap();

    assert_eq!(storage.ids(PROJECT), vec![stage("sigB", 1)]);
    assert!(cache
        .get_stages_by_signature(PROJECT, "sigA")
        .await
        .unwrap()
        .is_none());
    assert!(cache
        .get_stages_by_signature(PROJECT, "sigB")
        .await
        .unwrap()
        .is_some());

    manager.delete_stages(&[]).await.unwrap();
    assert_eq!(storage.delete_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reset_forgets_every_signature() {
    let storage = MemoryStagesStorage::new("registry.example/stages")
        .with_stages(PROJECT, &[stage("sigA", 1), stage("sigB", 1)]);
    let (manager, cache) = memory_manager(PROJECT, storage.clone(), FakeBackend::new());

    manager.get_stages_by_signature("install", "sigA").await.unwrap();
    manager.get_stages_by_signature("setup", "sigB").await.unwrap();

    manager.reset_stages_storage_cache().await.unwrap();

    for signature in ["sigA", "sigB"] {
        assert!(cache
            .get_stages_by_signature(PROJECT, signature)
            .await
            .unwrap()
            .is_none());
    }
    assert_eq!(storage.ids(PROJECT).len(), 2);
}

#[tokio::test]
async fn selection_takes_first_compatible_candidate() {
    let storage = MemoryStagesStorage::new("registry.example/stages")
        .with_stages(PROJECT, &[stage("sigA", 1), stage("sigA", 2), stage("sigA", 3)]);
    let (manager, _) = memory_manager(PROJECT, storage, FakeBackend::new());

    let mut candidates = manager.get_stages_by_signature("install", "sigA").await.unwrap();
    candidates[1]
        .info
        .labels
        .insert("arch".to_string(), "arm64".to_string());
    candidates[2]
        .info
        .labels
        .insert("arch".to_string(), "arm64".to_string());

    let any = StageRef::new("install", "sigA");
    let picked = manager
        .select_suitable_stages_storage_image(&any, &candidates)
        .unwrap();
    assert_eq!(picked.stage_id, stage("sigA", 1));

    let arm = StageRef::new("install", "sigA").with_policy(SelectionPolicy::MatchLabels(
        BTreeMap::from([("arch".to_string(), "arm64".to_string())]),
    ));
    let picked = manager
        .select_suitable_stages_storage_image(&arm, &candidates)
        .unwrap();
    assert_eq!(picked.stage_id, stage("sigA", 2));

    let other_signature = StageRef::new("install", "sigZ");
    assert!(manager
        .select_suitable_stages_storage_image(&other_signature, &candidates)
        .is_none());
}
