//! Local and archive stages storages over a fake container engine

use crate::common::{lock_manager, stage, FakeBackend};
use async_trait::async_trait;
use stagehouse::backend::ContainerBackend;
use stagehouse::config::Config;
use stagehouse::error::{StagehouseError, StagehouseResult};
use stagehouse::stage::ImageInfo;
use stagehouse::storage::{
    create_storage, ArchiveStagesStorage, LocalStagesStorage, RegistryApi, RepoStagesStorage,
    StagesStorage,
};
use stagehouse::sync::{sync_stages, SyncAction, SyncOptions};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const PROJECT: &str = "webapp";

#[tokio::test]
async fn local_storage_lists_only_stage_tags() {
    let backend = FakeBackend::new();
    backend.add_image("stagehouse-stages/webapp:sigA-1");
    backend.add_image("stagehouse-stages/webapp:sigB-7");
    backend.add_image("stagehouse-stages/webapp:latest");
    backend.add_image("stagehouse-stages/other:sigA-1");
    let storage = LocalStagesStorage::new(backend.clone());

    let ids = storage.get_all_stages(PROJECT).await.unwrap();
    assert_eq!(ids, vec![stage("sigA", 1), stage("sigB", 7)]);

    let by_signature = storage.get_stages_by_signature(PROJECT, "sigB").await.unwrap();
    assert_eq!(by_signature, vec![stage("sigB", 7)]);

    let description = storage
        .get_stage_description(PROJECT, &stage("sigA", 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(description.image_name(), "stagehouse-stages/webapp:sigA-1");
    assert_eq!(description.info.tag, "sigA-1");

    assert!(storage
        .get_stage_description(PROJECT, &stage("sigA", 2))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn local_store_tags_and_delete_removes() {
    let backend = FakeBackend::new();
    backend.add_image("registry.example/stages:sigA-1");
    let storage = LocalStagesStorage::new(backend.clone());

    storage
        .store_image(PROJECT, &stage("sigA", 1), "registry.example/stages:sigA-1")
        .await
        .unwrap();
    assert!(backend.has_image("stagehouse-stages/webapp:sigA-1"));

    let description = storage
        .get_stage_description(PROJECT, &stage("sigA", 1))
        .await
        .unwrap()
        .unwrap();
    let local = storage.fetch_image(PROJECT, &description).await.unwrap();
    assert_eq!(local, "stagehouse-stages/webapp:sigA-1");

    storage.delete_stages(PROJECT, &[description.clone()]).await.unwrap();
    assert!(!backend.has_image("stagehouse-stages/webapp:sigA-1"));

    let err = storage.fetch_image(PROJECT, &description).await.unwrap_err();
    assert!(matches!(err, StagehouseError::ImageNotFound(_)));
}

#[tokio::test]
async fn archive_store_then_fetch_after_local_removal() {
    let temp = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    backend.add_image("registry.example/stages:sigA-1");
    let storage = ArchiveStagesStorage::new(temp.path().to_path_buf(), backend.clone());

    assert!(storage.get_all_stages(PROJECT).await.unwrap().is_empty());

    storage
        .store_image(PROJECT, &stage("sigA", 1), "registry.example/stages:sigA-1")
        .await
        .unwrap();

    let dir = temp.path().join(PROJECT);
    assert!(dir.join("sigA-1.tar").is_file());
    assert!(dir.join("sigA-1.json").is_file());
    assert!(!dir.join("sigA-1.tar.partial").exists());
    assert!(!dir.join("sigA-1.json.partial").exists());

    assert_eq!(storage.get_all_stages(PROJECT).await.unwrap(), vec![stage("sigA", 1)]);
    let description = storage
        .get_stage_description(PROJECT, &stage("sigA", 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(description.image_name(), "stagehouse-archive/webapp:sigA-1");

    backend.remove("stagehouse-archive/webapp:sigA-1").await.unwrap();
    let local = storage.fetch_image(PROJECT, &description).await.unwrap();
    assert_eq!(local, "stagehouse-archive/webapp:sigA-1");
    assert!(backend.has_image(&local));
    assert!(backend.calls().iter().any(|call| call.starts_with("load ")));
}

#[tokio::test]
async fn archive_ignores_incomplete_stages() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join(PROJECT);
    std::fs::create_dir_all(&dir).unwrap();
    // archive written but sidecar never committed
    std::fs::write(dir.join("sigA-1.tar"), b"partial").unwrap();
    std::fs::write(dir.join("sigB-1.json.partial"), b"{}").unwrap();
    std::fs::write(dir.join("notes.json"), b"{}").unwrap();

    let storage = ArchiveStagesStorage::new(temp.path().to_path_buf(), FakeBackend::new());
    assert!(storage.get_all_stages(PROJECT).await.unwrap().is_empty());
}

#[tokio::test]
async fn archive_delete_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    backend.add_image("registry.example/stages:sigA-1");
    let storage = ArchiveStagesStorage::new(temp.path().to_path_buf(), backend);

    storage
        .store_image(PROJECT, &stage("sigA", 1), "registry.example/stages:sigA-1")
        .await
        .unwrap();
    let description = storage
        .get_stage_description(PROJECT, &stage("sigA", 1))
        .await
        .unwrap()
        .unwrap();

    storage.delete_stages(PROJECT, &[description.clone()]).await.unwrap();
    storage.delete_stages(PROJECT, &[description]).await.unwrap();
    assert!(storage.get_all_stages(PROJECT).await.unwrap().is_empty());
}

#[tokio::test]
async fn sync_local_to_archive() {
    let temp = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    backend.add_image("stagehouse-stages/webapp:sigA-1");
    backend.add_image("stagehouse-stages/webapp:sigB-2");

    let local: Arc<dyn StagesStorage> = Arc::new(LocalStagesStorage::new(backend.clone()));
    let archive: Arc<dyn StagesStorage> = Arc::new(ArchiveStagesStorage::new(
        temp.path().to_path_buf(),
        backend.clone(),
    ));

    let report = sync_stages(
        PROJECT,
        Arc::clone(&local),
        Arc::clone(&archive),
        backend.clone(),
        lock_manager(),
        SyncOptions {
            workers: 2,
            ..SyncOptions::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(report.synced.len(), 2);
    assert!(report
        .synced
        .iter()
        .all(|(_, action)| *action == SyncAction::Copied));
    assert_eq!(
        archive.get_all_stages(PROJECT).await.unwrap(),
        vec![stage("sigA", 1), stage("sigB", 2)]
    );
    assert_eq!(local.get_all_stages(PROJECT).await.unwrap().len(), 2);
}

/// Registry holding tags of one repository in memory
#[derive(Default)]
struct FakeRegistry {
    tags: Mutex<BTreeMap<String, ImageInfo>>,
    unreachable: bool,
}

impl FakeRegistry {
    fn with_tags(tags: &[&str]) -> Arc<Self> {
        let registry = Self::default();
        for tag in tags {
            let mut info = ImageInfo::new("registry.example/stages", *tag);
            info.id = format!("sha256:{}", tag);
            registry.tags.lock().unwrap().insert(tag.to_string(), info);
        }
        Arc::new(registry)
    }
}

#[async_trait]
impl RegistryApi for FakeRegistry {
    async fn list_tags(&self, repository: &str) -> StagehouseResult<Vec<String>> {
        if self.unreachable {
            return Err(StagehouseError::Registry {
                url: repository.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(self.tags.lock().unwrap().keys().cloned().collect())
    }

    async fn image_info(&self, _repository: &str, tag: &str) -> StagehouseResult<Option<ImageInfo>> {
        Ok(self.tags.lock().unwrap().get(tag).cloned())
    }

    async fn delete_tag(&self, _repository: &str, tag: &str) -> StagehouseResult<()> {
        self.tags.lock().unwrap().remove(tag);
        Ok(())
    }
}

#[tokio::test]
async fn repo_storage_lists_stage_tags_only() {
    let registry = FakeRegistry::with_tags(&["sigB-2", "latest", "sigA-1", "v1.0"]);
    let storage = RepoStagesStorage::new(
        "registry.example/stages".to_string(),
        registry,
        FakeBackend::new(),
    );

    assert_eq!(
        storage.get_all_stages(PROJECT).await.unwrap(),
        vec![stage("sigA", 1), stage("sigB", 2)]
    );

    let description = storage
        .get_stage_description(PROJECT, &stage("sigB", 2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(description.image_name(), "registry.example/stages:sigB-2");
    assert_eq!(description.info.id, "sha256:sigB-2");
}

#[tokio::test]
async fn repo_storage_pushes_pulls_and_deletes() {
    let registry = FakeRegistry::with_tags(&["sigA-1"]);
    let backend = FakeBackend::new();
    backend.add_image("stagehouse-stages/webapp:sigB-1");
    let storage = RepoStagesStorage::new(
        "registry.example/stages".to_string(),
        registry.clone(),
        backend.clone(),
    );

    storage
        .store_image(PROJECT, &stage("sigB", 1), "stagehouse-stages/webapp:sigB-1")
        .await
        .unwrap();
    let calls = backend.calls();
    assert!(calls.contains(&"tag stagehouse-stages/webapp:sigB-1 registry.example/stages:sigB-1".to_string()));
    assert!(calls.contains(&"push registry.example/stages:sigB-1".to_string()));

    let description = storage
        .get_stage_description(PROJECT, &stage("sigA", 1))
        .await
        .unwrap()
        .unwrap();
    let local = storage.fetch_image(PROJECT, &description).await.unwrap();
    assert_eq!(local, "registry.example/stages:sigA-1");
    assert!(backend.calls().contains(&"pull registry.example/stages:sigA-1".to_string()));

    // already present, no second pull
    storage.fetch_image(PROJECT, &description).await.unwrap();
    let pulls = backend
        .calls()
        .iter()
        .filter(|call| call.starts_with("pull "))
        .count();
    assert_eq!(pulls, 1);

    storage.delete_stages(PROJECT, &[description]).await.unwrap();
    assert!(storage.get_all_stages(PROJECT).await.unwrap().is_empty());
}

#[tokio::test]
async fn repo_storage_unreachable_registry() {
    let registry = Arc::new(FakeRegistry {
        unreachable: true,
        ..FakeRegistry::default()
    });
    let storage = RepoStagesStorage::new(
        "registry.example/stages".to_string(),
        registry,
        FakeBackend::new(),
    );

    let err = storage.get_all_stages(PROJECT).await.unwrap_err();
    assert!(matches!(err, StagehouseError::StorageUnavailable { .. }));
}

#[test]
fn create_storage_dispatches_on_address() {
    let config = Config::default();
    let backend = FakeBackend::new();

    let local = create_storage(":local", &config, backend.clone()).unwrap();
    assert!(local.is_local());
    assert_eq!(local.address(), ":local");

    let archive = create_storage("archive:/var/lib/stages", &config, backend.clone()).unwrap();
    assert!(!archive.is_local());
    assert_eq!(archive.address(), "archive:/var/lib/stages");

    let repo = create_storage("localhost:5000/webapp/stages", &config, backend.clone()).unwrap();
    assert_eq!(
        repo.construct_stage_image_name(PROJECT, &stage("sigA", 1)),
        "localhost:5000/webapp/stages:sigA-1"
    );

    assert!(matches!(
        create_storage(":remote", &config, backend),
        Err(StagehouseError::InvalidStorageAddress { .. })
    ));
}
