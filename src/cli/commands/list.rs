//! List command - show the stages of a project in a stages storage

use super::{resolve_project, stages_manager, storage_address};
use crate::cli::args::{ListArgs, OutputFormat};
use crate::config::Config;
use crate::error::StagehouseResult;
use crate::stage::StageDescription;
use crate::ui::{self, TaskSpinner, UiContext};
use console::style;

/// Execute the list command
pub async fn execute(args: ListArgs, project: Option<String>, config: &Config) -> StagehouseResult<()> {
    let ctx = UiContext::detect();
    let project = resolve_project(project)?;
    let address = storage_address(args.storage, config);
    let manager = stages_manager(&project, &address, config)?;

    let stages = if args.format == OutputFormat::Table {
        let mut spinner = TaskSpinner::new(&ctx);
        spinner.start(&format!("Listing stages in {}...", address));
        match manager.get_all_stages().await {
            Ok(stages) => {
                spinner.stop(&format!("Listed {}", address));
                stages
            }
            Err(e) => {
                spinner.stop_error("Listing failed");
                return Err(e);
            }
        }
    } else {
        manager.get_all_stages().await?
    };

    if stages.is_empty() {
        match args.format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => ui::step_info(&ctx, &format!("No stages of {} in {}", project, address)),
        }
        return Ok(());
    }

    match args.format {
        OutputFormat::Table => print_table(&stages),
        OutputFormat::Json => print_json(&stages)?,
        OutputFormat::Plain => print_plain(&stages),
    }

    Ok(())
}

pub(crate) fn print_table(stages: &[StageDescription]) {
    println!(
        "{:<44} {:<16} {:<10} {:<17} {}",
        style("SIGNATURE").bold(),
        style("UNIQUE ID").bold(),
        style("SIZE").bold(),
        style("CREATED").bold(),
        style("IMAGE").bold()
    );
    println!("{}", "-".repeat(110));

    for stage in stages {
        println!(
            "{:<44} {:<16} {:<10} {:<17} {}",
            stage.stage_id.signature,
            stage.stage_id.unique_id,
            format_size(stage.info.size),
            stage.info.created_at.format("%Y-%m-%d %H:%M"),
            style(stage.image_name()).dim()
        );
    }

    println!();
    println!("{} stage(s)", stages.len());
}

pub(crate) fn print_json(stages: &[StageDescription]) -> StagehouseResult<()> {
    let json = serde_json::to_string_pretty(stages)?;
    println!("{}", json);
    Ok(())
}

pub(crate) fn print_plain(stages: &[StageDescription]) {
    for stage in stages {
        println!("{}", stage.stage_id);
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}
