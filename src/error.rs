//! Error types for stagehouse
//!
//! All modules use `StagehouseResult<T>` as their return type.

use crate::stage::StageId;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for stagehouse operations
pub type StagehouseResult<T> = Result<T, StagehouseError>;

/// All errors that can occur in stagehouse
#[derive(Error, Debug)]
pub enum StagehouseError {
    // Environment errors
    #[error("Container engine not found: {0}. Install podman or docker, or set backend.engine")]
    EngineNotFound(String),

    #[error("Unsupported container engine: {0}. Supported engines: podman, docker")]
    UnsupportedEngine(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid stages storage address '{address}': {reason}")]
    InvalidStorageAddress { address: String, reason: String },

    #[error("Invalid stage id '{0}': expected <signature>-<unique id>")]
    InvalidStageId(String),

    // Storage errors
    #[error("Stages storage {storage} unavailable: {reason}")]
    StorageUnavailable { storage: String, reason: String },

    #[error(
        "Stage {stage_name} ({stage_id}) of project {project} not found in {storage}: \
         the cached image has been removed from the stages storage"
    )]
    StaleCache {
        project: String,
        stage_name: String,
        stage_id: StageId,
        storage: String,
    },

    #[error("Registry request to {url} failed: {reason}")]
    Registry { url: String, reason: String },

    // Cache errors
    #[error("Stages storage cache entry {project}/{signature} unreadable: {reason}")]
    CacheCorrupted {
        project: String,
        signature: String,
        reason: String,
    },

    // Lock errors
    #[error("Unable to acquire lock {lock} after {attempts} attempt(s){}", last_error.as_ref().map(|e| format!(": {e}")).unwrap_or_default())]
    LockAcquisitionExhausted {
        lock: String,
        attempts: u32,
        last_error: Option<String>,
    },

    #[error("Unable to release lock {lock}: {reason}")]
    LockRelease { lock: String, reason: String },

    #[error("Lock backend error on {lock}: {reason}")]
    LockBackend { lock: String, reason: String },

    // Image errors
    #[error("Image pull failed: {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("Image push failed: {image}: {reason}")]
    ImagePush { image: String, reason: String },

    #[error("Image tag failed: {source_image} -> {target_image}: {reason}")]
    ImageTag {
        source_image: String,
        target_image: String,
        reason: String,
    },

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    // Sync errors
    #[error("Invalid sync options: {0}")]
    InvalidSyncOptions(String),

    #[error("Stage {stage} sync from {from} to {to} failed: {source}")]
    StageSync {
        stage: StageId,
        from: String,
        to: String,
        #[source]
        source: Box<StagehouseError>,
    },

    #[error("Stage {stage} was stored to {storage} but is not present there afterwards")]
    SyncVerification { stage: StageId, storage: String },

    #[error("{}", format_partial_sync(project, *succeeded, failures))]
    PartialSyncFailure {
        project: String,
        succeeded: usize,
        failures: Vec<String>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

fn format_partial_sync(project: &str, succeeded: usize, failures: &[String]) -> String {
    let mut out = format!(
        "Stages sync for project {} finished with errors: {} succeeded, {} failed",
        project,
        succeeded,
        failures.len()
    );
    for failure in failures {
        out.push_str("\n  - ");
        out.push_str(failure);
    }
    out
}

impl StagehouseError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a storage unavailable error
    pub fn storage_unavailable(storage: impl Into<String>, reason: impl ToString) -> Self {
        Self::StorageUnavailable {
            storage: storage.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if error is retryable
    ///
    /// Transient backend failures are retried by the caller; this crate
    /// never retries them itself (locks excepted).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StorageUnavailable { .. }
            | Self::Registry { .. }
            | Self::ImagePull { .. }
            | Self::ImagePush { .. }
            | Self::LockAcquisitionExhausted { .. } => true,
            Self::StageSync { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::EngineNotFound(_) => Some("Install podman (https://podman.io) or set backend.engine = \"docker\""),
            Self::StaleCache { .. } => Some(
                "Run: stagehouse cache reset, then rebuild the project from scratch",
            ),
            Self::LockAcquisitionExhausted { .. } => {
                Some("Another process holds the lock; retry later or raise lock.max_attempts")
            }
            Self::PartialSyncFailure { .. } => {
                Some("Re-run the same sync command; already synced stages are skipped")
            }
            Self::InvalidStorageAddress { .. } => {
                Some("Use :local, archive:<path> or a registry repository address")
            }
            _ => None,
        }
    }
}
