//! Stages sync end to end over in-memory storages

use crate::common::{lock_manager, stage, FakeBackend, MemoryStagesStorage};
use stagehouse::error::StagehouseError;
use stagehouse::sync::{sync_stages, StagesSynchronizer, SyncAction, SyncEvent, SyncOptions};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PROJECT: &str = "webapp";

fn options() -> SyncOptions {
    SyncOptions {
        workers: 4,
        ..SyncOptions::default()
    }
}

#[tokio::test]
async fn copies_only_missing_stages() {
    let source = MemoryStagesStorage::new("registry.example/src")
        .with_stages(PROJECT, &[stage("sigA", 1), stage("sigB", 1)]);
    let destination =
        MemoryStagesStorage::new("registry.example/dst").with_stages(PROJECT, &[stage("sigA", 1)]);

    let report = sync_stages(
        PROJECT,
        source.clone(),
        destination.clone(),
        FakeBackend::new(),
        lock_manager(),
        options(),
    )
    .await
    .unwrap();

    assert_eq!(report.total, 1);
    assert_eq!(report.synced, vec![(stage("sigB", 1), SyncAction::Copied)]);
    assert!(report.failed.is_empty());
    assert_eq!(destination.ids(PROJECT), vec![stage("sigA", 1), stage("sigB", 1)]);
    assert_eq!(source.ids(PROJECT), vec![stage("sigA", 1), stage("sigB", 1)]);
    assert_eq!(source.fetch_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn second_run_copies_nothing() {
    let source = MemoryStagesStorage::new("registry.example/src")
        .with_stages(PROJECT, &[stage("sigA", 1), stage("sigB", 2), stage("sigC", 3)]);
    let destination = MemoryStagesStorage::new("registry.example/dst");
    let backend = FakeBackend::new();

    let first = sync_stages(
        PROJECT,
        source.clone(),
        destination.clone(),
        backend.clone(),
        lock_manager(),
        options(),
    )
    .await
    .unwrap();
    assert_eq!(first.synced.len(), 3);

    let second = sync_stages(
        PROJECT,
        source.clone(),
        destination.clone(),
        backend,
        lock_manager(),
        options(),
    )
    .await
    .unwrap();
    assert_eq!(second.total, 0);
    assert!(second.synced.is_empty());
    assert_eq!(destination.store_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn move_removes_source_after_copy() {
    let source = MemoryStagesStorage::new("registry.example/src")
        .with_stages(PROJECT, &[stage("sigA", 1), stage("sigB", 1)]);
    let destination =
        MemoryStagesStorage::new("archive:/backup").with_stages(PROJECT, &[stage("sigA", 1)]);

    let report = sync_stages(
        PROJECT,
        source.clone(),
        destination.clone(),
        FakeBackend::new(),
        lock_manager(),
        SyncOptions {
            remove_source: true,
            ..options()
        },
    )
    .await
    .unwrap();

    let mut synced = report.synced.clone();
    synced.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        synced,
        vec![
            (stage("sigA", 1), SyncAction::SourceRemoved),
            (stage("sigB", 1), SyncAction::Moved),
        ]
    );
    assert!(source.ids(PROJECT).is_empty());
    assert_eq!(destination.ids(PROJECT), vec![stage("sigA", 1), stage("sigB", 1)]);
}

#[tokio::test]
async fn move_recopies_stage_gone_from_destination_after_listing() {
    let source =
        MemoryStagesStorage::new("registry.example/src").with_stages(PROJECT, &[stage("sigA", 1)]);
    let destination = MemoryStagesStorage::new("registry.example/dst");
    destination.list_without_stage(PROJECT, &stage("sigA", 1));

    let report = sync_stages(
        PROJECT,
        source.clone(),
        destination.clone(),
        FakeBackend::new(),
        lock_manager(),
        SyncOptions {
            remove_source: true,
            ..options()
        },
    )
    .await
    .unwrap();

    assert_eq!(report.synced, vec![(stage("sigA", 1), SyncAction::Moved)]);
    assert_eq!(destination.store_calls.load(Ordering::SeqCst), 1);
    assert_eq!(destination.ids(PROJECT), vec![stage("sigA", 1)]);
    assert!(source.ids(PROJECT).is_empty());
}

#[tokio::test]
async fn partial_failure_names_every_failed_stage() {
    let ids: Vec<_> = (1..=6).map(|i| stage(&format!("sig{}", i), i)).collect();
    let source = MemoryStagesStorage::new("registry.example/src").with_stages(PROJECT, &ids);
    source.fail_fetch_of(&ids[1]);
    source.fail_fetch_of(&ids[4]);
    let destination = MemoryStagesStorage::new("registry.example/dst");

    let err = sync_stages(
        PROJECT,
        source,
        destination.clone(),
        FakeBackend::new(),
        lock_manager(),
        SyncOptions {
            workers: 2,
            ..SyncOptions::default()
        },
    )
    .await
    .unwrap_err();

    match err {
        StagehouseError::PartialSyncFailure {
            project,
            succeeded,
            failures,
        } => {
            assert_eq!(project, PROJECT);
            assert_eq!(succeeded, 4);
            assert_eq!(failures.len(), 2);
            assert!(failures[0].contains("sig2-2"));
            assert!(failures[1].contains("sig5-5"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(destination.ids(PROJECT).len(), 4);
}

#[tokio::test]
async fn events_report_plan_then_each_stage() {
    let source = MemoryStagesStorage::new("registry.example/src")
        .with_stages(PROJECT, &[stage("sigA", 1), stage("sigB", 1), stage("sigC", 1)]);
    let destination = MemoryStagesStorage::new("registry.example/dst");
    let synchronizer = StagesSynchronizer::new(
        PROJECT,
        source,
        destination,
        FakeBackend::new(),
        lock_manager(),
        options(),
    );

    let mut planned = None;
    let mut finished = 0;
    let report = synchronizer
        .run(&CancellationToken::new(), |event| match event {
            SyncEvent::Planned { total } => {
                assert_eq!(finished, 0);
                planned = Some(total);
            }
            SyncEvent::Finished(result) => {
                assert!(result.outcome.is_ok());
                finished += 1;
            }
        })
        .await
        .unwrap();

    assert_eq!(planned, Some(3));
    assert_eq!(finished, 3);
    assert!(report.is_success());
}

#[tokio::test]
async fn cancelled_run_reports_every_stage() {
    let ids: Vec<_> = (1..=8).map(|i| stage("sig", i)).collect();
    let source = MemoryStagesStorage::new("registry.example/src").with_stages(PROJECT, &ids);
    source.set_fetch_delay(Duration::from_secs(30));
    let destination = MemoryStagesStorage::new("registry.example/dst");
    let synchronizer = StagesSynchronizer::new(
        PROJECT,
        source,
        destination.clone(),
        FakeBackend::new(),
        lock_manager(),
        SyncOptions {
            workers: 2,
            ..SyncOptions::default()
        },
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        synchronizer.run(&cancel, |_| {}),
    )
    .await
    .expect("cancelled sync must finish promptly")
    .unwrap();

    assert_eq!(report.total, 8);
    assert_eq!(report.synced.len() + report.failed.len() + report.skipped.len(), 8);
    assert!(report.synced.is_empty());
    assert!(destination.ids(PROJECT).is_empty());
}

#[tokio::test]
async fn unreachable_source_fails_before_any_copy() {
    let source = MemoryStagesStorage::new("registry.example/src")
        .with_stages(PROJECT, &[stage("sigA", 1)]);
    source.set_fail_listing(true);
    let destination = MemoryStagesStorage::new("registry.example/dst");

    let err = sync_stages(
        PROJECT,
        source,
        destination.clone(),
        FakeBackend::new(),
        lock_manager(),
        options(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, StagehouseError::StorageUnavailable { .. }));
    assert_eq!(destination.store_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn move_involving_local_storage_is_rejected() {
    let source = MemoryStagesStorage::local().with_stages(PROJECT, &[stage("sigA", 1)]);
    let destination = MemoryStagesStorage::new("registry.example/dst");

    let err = sync_stages(
        PROJECT,
        source.clone(),
        destination.clone(),
        FakeBackend::new(),
        lock_manager(),
        SyncOptions {
            remove_source: true,
            ..options()
        },
    )
    .await
    .unwrap_err();

    assert!(matches!(err, StagehouseError::InvalidSyncOptions(_)));
    assert_eq!(source.list_calls.load(Ordering::SeqCst), 0);
    assert_eq!(source.ids(PROJECT), vec![stage("sigA", 1)]);
}

#[tokio::test]
async fn cleanup_removes_local_intermediates() {
    let source = MemoryStagesStorage::new("registry.example/src")
        .with_stages(PROJECT, &[stage("sigA", 1)]);
    let destination = MemoryStagesStorage::new("registry.example/dst");
    let backend = FakeBackend::new();

    sync_stages(
        PROJECT,
        source,
        destination,
        backend.clone(),
        lock_manager(),
        SyncOptions {
            cleanup_local_cache: true,
            ..options()
        },
    )
    .await
    .unwrap();

    let calls = backend.calls();
    assert!(calls.contains(&"rmi registry.example/src/webapp:sigA-1".to_string()));
    assert!(calls.contains(&"rmi registry.example/dst/webapp:sigA-1".to_string()));
}

#[tokio::test]
async fn held_exclusive_project_lock_blocks_sync() {
    let locks = lock_manager();
    let _held = locks
        .lock_stages_and_images(PROJECT, Default::default())
        .await
        .unwrap();

    let source = MemoryStagesStorage::new("registry.example/src")
        .with_stages(PROJECT, &[stage("sigA", 1)]);
    let err = sync_stages(
        PROJECT,
        source,
        MemoryStagesStorage::new("registry.example/dst"),
        FakeBackend::new(),
        Arc::clone(&locks),
        options(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, StagehouseError::LockAcquisitionExhausted { .. }));
}
