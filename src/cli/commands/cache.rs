//! Cache command - inspect or reset the stages storage cache

use super::list::{print_json, print_plain, print_table};
use super::{resolve_project, stages_manager, storage_address};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::Config;
use crate::error::StagehouseResult;
use crate::manager::StagesManager;
use crate::ui::{self, UiContext};

/// Execute the cache command
pub async fn execute(args: CacheArgs, project: Option<String>, config: &Config) -> StagehouseResult<()> {
    let project = resolve_project(project)?;

    match args.action {
        CacheAction::Show {
            signature,
            refresh,
            stage,
            storage,
            format,
        } => {
            let address = storage_address(storage, config);
            let manager = stages_manager(&project, &address, config)?;
            show(&manager, &stage, &signature, refresh, format).await
        }
        CacheAction::Reset { yes } => {
            let address = storage_address(None, config);
            let manager = stages_manager(&project, &address, config)?;
            reset(&manager, yes).await
        }
    }
}

async fn show(
    manager: &StagesManager,
    stage_name: &str,
    signature: &str,
    refresh: bool,
    format: OutputFormat,
) -> StagehouseResult<()> {
    let ctx = UiContext::detect();

    let stages = if refresh {
        manager
            .atomic_get_images_by_signature_from_stages_storage_with_cache_reset(stage_name, signature)
            .await?
    } else {
        match manager
            .get_images_by_signature_from_cache(stage_name, signature)
            .await?
        {
            Some(stages) => stages,
            None => {
                match format {
                    OutputFormat::Json => println!("null"),
                    OutputFormat::Plain => {}
                    OutputFormat::Table => ui::step_warn_hint(
                        &ctx,
                        &format!("Signature {} is not cached", signature),
                        "Use --refresh to read it from the stages storage",
                    ),
                }
                return Ok(());
            }
        }
    };

    match format {
        OutputFormat::Table if stages.is_empty() => ui::step_info(
            &ctx,
            &format!("Signature {} is cached with no stages", signature),
        ),
        OutputFormat::Table => print_table(&stages),
        OutputFormat::Json => print_json(&stages)?,
        OutputFormat::Plain => print_plain(&stages),
    }
    Ok(())
}

async fn reset(manager: &StagesManager, yes: bool) -> StagehouseResult<()> {
    let ctx = UiContext::detect().with_auto_yes(yes);
    let location = manager.cache().location();

    let confirmed = ui::confirm(
        &ctx,
        &format!(
            "Drop every cached listing of {} in {}?",
            manager.project(),
            location
        ),
        false,
    )
    .await?;
    if !confirmed {
        ui::step_info(&ctx, "Cancelled, pass --yes to reset without prompting");
        return Ok(());
    }

    manager.reset_stages_storage_cache().await?;
    ui::step_ok_detail(&ctx, "Stages storage cache reset", &location);
    Ok(())
}
