//! Sync command - copy or move stages between stages storages

use super::resolve_project;
use crate::backend::create_backend;
use crate::cli::args::SyncArgs;
use crate::config::Config;
use crate::error::{StagehouseError, StagehouseResult};
use crate::lock::create_lock_manager;
use crate::storage::create_storage;
use crate::sync::{StagesSynchronizer, SyncEvent, SyncOptions, SyncReport};
use crate::ui::{self, SyncProgress, UiContext};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Execute the sync command
pub async fn execute(args: SyncArgs, project: Option<String>, config: &Config) -> StagehouseResult<()> {
    let ctx = UiContext::detect();
    let project = resolve_project(project)?;

    let backend = create_backend(config)?;
    let from = create_storage(&args.from, config, Arc::clone(&backend))?;
    let to = create_storage(&args.to, config, Arc::clone(&backend))?;
    let lock_manager = create_lock_manager(config)?;

    let options = SyncOptions {
        remove_source: args.remove_source,
        cleanup_local_cache: args.cleanup_local_cache,
        workers: args.workers.unwrap_or(config.sync.workers),
        lock: config.sync.lock && !args.no_lock,
    };
    let engine = backend.backend_name();
    let lock = if options.lock {
        lock_manager.locker_name()
    } else {
        "disabled"
    };
    let synchronizer = StagesSynchronizer::new(&project, from, to, backend, lock_manager, options);
    synchronizer.validate()?;

    let verb = if options.remove_source { "Move" } else { "Sync" };
    ui::intro(&ctx, &format!("{} stages of {}", verb, project));
    ui::key_value(&ctx, "From", &args.from);
    ui::key_value(&ctx, "To", &args.to);
    ui::key_value(&ctx, "Engine", engine);
    ui::key_value(&ctx, "Workers", &options.workers.to_string());
    ui::key_value(&ctx, "Lock", lock);

    // Ctrl-C stops handing out new stages; in-flight ones are abandoned
    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling remaining stages");
                cancel.cancel();
            }
        })
    };

    let mut progress = SyncProgress::new(&ctx, 0);
    let result = synchronizer
        .run(&cancel, |event| match event {
            SyncEvent::Planned { total } => progress.set_total(total as u64),
            SyncEvent::Finished(result) => {
                let stage = result.stage.to_string();
                match &result.outcome {
                    Ok(action) => progress.stage_done(&stage, &action.to_string(), false),
                    Err(e) => progress.stage_done(&stage, &root_cause(e), true),
                }
            }
        })
        .await;
    progress.finish();
    interrupt.abort();

    let report = result?;
    print_summary(&ctx, &report);
    report.into_result().map(|_| ())
}

fn print_summary(ctx: &UiContext, report: &SyncReport) {
    if report.total == 0 {
        ui::outro_success(ctx, "Destination is up to date");
        return;
    }

    if !report.skipped.is_empty() {
        ui::step_warn_hint(
            ctx,
            &format!("{} stage(s) skipped", report.skipped.len()),
            "removed from the source while syncing",
        );
    }
    for (stage, e) in &report.failed {
        ui::step_error_detail(ctx, &stage.to_string(), &root_cause(e));
    }

    let summary = format!(
        "{} of {} stage(s) synced to {}",
        report.synced.len(),
        report.total,
        report.to
    );
    if report.is_success() {
        ui::outro_success(ctx, &summary);
    } else {
        ui::outro_warn(ctx, &summary);
    }
}

/// Innermost error message, without the per-stage wrapper
fn root_cause(e: &StagehouseError) -> String {
    match e {
        StagehouseError::StageSync { source, .. } => source.to_string(),
        other => other.to_string(),
    }
}
