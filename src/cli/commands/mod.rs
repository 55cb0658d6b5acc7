//! CLI command implementations

pub mod cache;
pub mod completions;
pub mod config;
pub mod list;
pub mod sync;

pub use cache::execute as cache;
pub use completions::execute as completions;
pub use config::execute as config;
pub use list::execute as list;
pub use sync::execute as sync;

use crate::backend::create_backend;
use crate::cache::create_stages_storage_cache;
use crate::config::Config;
use crate::error::{StagehouseError, StagehouseResult};
use crate::lock::create_lock_manager;
use crate::manager::StagesManager;
use crate::storage::create_storage;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Project name from `--project`, falling back to the current directory name
pub(crate) fn resolve_project(project: Option<String>) -> StagehouseResult<String> {
    if let Some(project) = project {
        return validate_project(project);
    }

    let cwd = std::env::current_dir()
        .map_err(|e| StagehouseError::io("getting current directory", e))?;
    let name = project_from_dir(&cwd).ok_or_else(|| {
        StagehouseError::User(format!(
            "Unable to derive a project name from {}: pass --project",
            cwd.display()
        ))
    })?;
    debug!("Using project name '{}' from current directory", name);
    validate_project(name)
}

fn project_from_dir(dir: &Path) -> Option<String> {
    dir.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_string())
}

fn validate_project(project: String) -> StagehouseResult<String> {
    let trimmed = project.trim();
    if trimmed.is_empty() {
        return Err(StagehouseError::User("Project name must not be empty".to_string()));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(StagehouseError::User(format!(
            "Project name '{}' must not contain whitespace",
            trimmed
        )));
    }
    Ok(trimmed.to_string())
}

/// Address given on the command line, or `storage.default`
pub(crate) fn storage_address(explicit: Option<String>, config: &Config) -> String {
    explicit.unwrap_or_else(|| config.storage.default.clone())
}

/// Wire up a stages manager for `project` on `address` from configuration
pub(crate) fn stages_manager(
    project: &str,
    address: &str,
    config: &Config,
) -> StagehouseResult<StagesManager> {
    let backend = create_backend(config)?;
    let storage = create_storage(address, config, Arc::clone(&backend))?;
    let cache = create_stages_storage_cache(config)?;
    let lock_manager = create_lock_manager(config)?;

    Ok(StagesManager::new(project, storage, cache, lock_manager, backend))
}
