//! Stagehouse - content-addressed stage cache for multi-stage image builds
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use stagehouse::cli::{commands, Cli, Commands};
use stagehouse::config::{Config, ConfigManager};
use stagehouse::error::{StagehouseError, StagehouseResult};
use stagehouse::ui;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> StagehouseResult<()> {
    let cli = Cli::parse();
    ui::init_theme();

    // Completions need neither logging nor config
    if let Commands::Completions(args) = cli.command {
        return commands::completions(args);
    }

    let config_manager = if let Some(ref path) = cli.config {
        ConfigManager::with_path(path.clone())
    } else {
        ConfigManager::new()
    };

    let local_config_path = if cli.no_local {
        None
    } else {
        let cwd = std::env::current_dir()
            .map_err(|e| StagehouseError::io("getting current directory", e))?;
        ConfigManager::find_local_config(&cwd)
    };

    let config = config_manager
        .load_merged(local_config_path.as_deref())
        .await?;

    init_logging(cli.verbose, &config);
    if let Some(ref path) = local_config_path {
        debug!("Found local config: {}", path.display());
    }

    ConfigManager::ensure_state_dirs().await?;

    match cli.command {
        Commands::Completions(_) => unreachable!("Completions handled above"),
        Commands::Sync(args) => commands::sync(args, cli.project, &config).await,
        Commands::List(args) => commands::list(args, cli.project, &config).await,
        Commands::Cache(args) => commands::cache(args, cli.project, &config).await,
        Commands::Config(args) => commands::config(args, &config_manager, &config).await,
    }
}

/// 0 = warn (spinners only), 1 = info, 2+ = debug
fn init_logging(verbose: u8, config: &Config) {
    let filter = match verbose {
        0 => EnvFilter::new("stagehouse=warn"),
        1 => EnvFilter::new("stagehouse=info"),
        _ => EnvFilter::new("stagehouse=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
