//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

/// Stagehouse - content-addressed stage cache for multi-stage image builds
///
/// Lists, inspects and replicates stage images between stages storages:
/// the local container engine (:local), archive directories
/// (archive:<dir>) and registry repositories.
#[derive(Parser, Debug)]
#[command(name = "stagehouse")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Project whose stages to act on (defaults to the current directory name)
    #[arg(short, long, global = true, env = "STAGEHOUSE_PROJECT")]
    pub project: Option<String>,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "STAGEHOUSE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Skip local .stagehouse.toml discovery
    #[arg(long, global = true)]
    pub no_local: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Copy or move stages from one stages storage to another
    Sync(SyncArgs),

    /// List the stages of a project in a stages storage
    List(ListArgs),

    /// Inspect or reset the stages storage cache
    Cache(CacheArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

/// Arguments for the sync command
#[derive(Parser, Debug)]
pub struct SyncArgs {
    /// Source stages storage address
    #[arg(long)]
    pub from: String,

    /// Destination stages storage address
    #[arg(long)]
    pub to: String,

    /// Delete each stage from the source once it is at the destination
    #[arg(long)]
    pub remove_source: bool,

    /// Remove images pulled or tagged locally while syncing
    #[arg(long)]
    pub cleanup_local_cache: bool,

    /// Number of parallel workers (default: from config)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Do not take the project's stages lock
    #[arg(long)]
    pub no_lock: bool,
}

/// Arguments for the list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Stages storage address (default: storage.default from config)
    #[arg(short, long)]
    pub storage: Option<String>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Show the cached stages of a signature
    Show {
        /// Stage signature
        signature: String,

        /// Re-read the stages storage and overwrite the cache entry
        #[arg(long)]
        refresh: bool,

        /// Stage name recorded in logs for this lookup
        #[arg(long, default_value = "cli")]
        stage: String,

        /// Stages storage address (default: storage.default from config)
        #[arg(short, long)]
        storage: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Drop every cached listing of the project
    Reset {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show effective configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write the default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Arguments for the completions command
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Target shell
    pub shell: Shell,
}

/// Output format for listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}
