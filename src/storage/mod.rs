//! Stages storages
//!
//! A stages storage holds the stage images of one or more projects, keyed by
//! project and [`StageId`]. Three drivers exist:
//!
//! | Address | Driver | Image name |
//! |---------|--------|------------|
//! | `:local` | [`LocalStagesStorage`] | `stagehouse-stages/<project>:<tag>` |
//! | `archive:<dir>` | [`ArchiveStagesStorage`] | `stagehouse-archive/<project>:<tag>` |
//! | `<registry>/<repo>` | [`RepoStagesStorage`] | `<registry>/<repo>:<tag>` |
//!
//! Images move between storages through the local container engine:
//! [`StagesStorage::fetch_image`] materializes a stage locally and returns
//! its local reference, [`StagesStorage::store_image`] takes any local
//! reference and publishes it under the storage's own naming.

mod archive;
mod local;
pub mod registry;
mod repo;

pub use archive::ArchiveStagesStorage;
pub use local::LocalStagesStorage;
pub use registry::{RegistryApi, RegistryClient};
pub use repo::RepoStagesStorage;

use crate::backend::ContainerBackend;
use crate::config::Config;
use crate::error::{StagehouseError, StagehouseResult};
use crate::stage::{StageDescription, StageId};
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Address of the local sentinel storage
pub const LOCAL_STAGES_STORAGE_ADDRESS: &str = ":local";

const ARCHIVE_PREFIX: &str = "archive:";

/// Parsed stages storage address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageAddress {
    /// The local container engine
    Local,
    /// A directory of image archives
    Archive(PathBuf),
    /// A registry repository
    Repo(String),
}

impl FromStr for StorageAddress {
    type Err = StagehouseError;

    fn from_str(address: &str) -> StagehouseResult<Self> {
        let invalid = |reason: &str| StagehouseError::InvalidStorageAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let address = address.trim();
        if address.is_empty() {
            return Err(invalid("address is empty"));
        }
        if address == LOCAL_STAGES_STORAGE_ADDRESS {
            return Ok(Self::Local);
        }
        if let Some(path) = address.strip_prefix(ARCHIVE_PREFIX) {
            if path.is_empty() {
                return Err(invalid("archive directory is empty"));
            }
            return Ok(Self::Archive(PathBuf::from(path)));
        }
        if address.starts_with(':') {
            return Err(invalid("unknown special storage, only :local is supported"));
        }
        if address.chars().any(char::is_whitespace) {
            return Err(invalid("repository must not contain whitespace"));
        }
        if address.contains('@') {
            return Err(invalid("repository must not carry a digest"));
        }
        let last_segment = address.rsplit('/').next().unwrap_or(address);
        if last_segment.contains(':') {
            return Err(invalid("repository must not carry a tag"));
        }
        if address.ends_with('/') {
            return Err(invalid("repository path is empty"));
        }

        Ok(Self::Repo(address.to_string()))
    }
}

impl fmt::Display for StorageAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str(LOCAL_STAGES_STORAGE_ADDRESS),
            Self::Archive(path) => write!(f, "{}{}", ARCHIVE_PREFIX, path.display()),
            Self::Repo(repo) => f.write_str(repo),
        }
    }
}

/// One stages storage backend
#[async_trait]
pub trait StagesStorage: Send + Sync {
    /// Address this storage was created from
    fn address(&self) -> String;

    /// Whether this is the local sentinel storage
    fn is_local(&self) -> bool {
        false
    }

    /// Image name a stage has in this storage
    fn construct_stage_image_name(&self, project: &str, stage_id: &StageId) -> String;

    /// Every stage of `project`, sorted
    async fn get_all_stages(&self, project: &str) -> StagehouseResult<Vec<StageId>>;

    /// Description of one stage, `None` when it is not stored here
    async fn get_stage_description(
        &self,
        project: &str,
        stage_id: &StageId,
    ) -> StagehouseResult<Option<StageDescription>>;

    /// Stages of `project` with the given signature
    async fn get_stages_by_signature(
        &self,
        project: &str,
        signature: &str,
    ) -> StagehouseResult<Vec<StageId>> {
        Ok(self
            .get_all_stages(project)
            .await?
            .into_iter()
            .filter(|id| id.signature == signature)
            .collect())
    }

    /// Make the stage image available to the local engine
    ///
    /// Returns the local reference of the image.
    async fn fetch_image(
        &self,
        project: &str,
        description: &StageDescription,
    ) -> StagehouseResult<String>;

    /// Publish local image `local_reference` as stage `stage_id`
    async fn store_image(
        &self,
        project: &str,
        stage_id: &StageId,
        local_reference: &str,
    ) -> StagehouseResult<()>;

    /// Remove stages from this storage; already missing stages are skipped
    async fn delete_stages(
        &self,
        project: &str,
        stages: &[StageDescription],
    ) -> StagehouseResult<()>;
}

/// Create the stages storage for `address`
pub fn create_storage(
    address: &str,
    config: &Config,
    backend: Arc<dyn ContainerBackend>,
) -> StagehouseResult<Arc<dyn StagesStorage>> {
    let storage: Arc<dyn StagesStorage> = match address.parse::<StorageAddress>()? {
        StorageAddress::Local => Arc::new(LocalStagesStorage::new(backend)),
        StorageAddress::Archive(root) => Arc::new(ArchiveStagesStorage::new(root, backend)),
        StorageAddress::Repo(repository) => {
            let registry = Arc::new(RegistryClient::new(&config.registry));
            Arc::new(RepoStagesStorage::new(repository, registry, backend))
        }
    };
    Ok(storage)
}

/// Wrap a listing failure so it names the storage
pub(crate) fn unavailable(storage: &str, err: StagehouseError) -> StagehouseError {
    match err {
        StagehouseError::StorageUnavailable { .. } => err,
        other => StagehouseError::storage_unavailable(storage, other),
    }
}

/// Build a stage description from image metadata found under `reference`
pub(crate) fn describe(
    stage_id: &StageId,
    reference: &str,
    mut info: crate::stage::ImageInfo,
) -> StageDescription {
    let (repository, tag) = crate::stage::ImageInfo::split_reference(reference);
    info.name = reference.to_string();
    info.repository = repository;
    info.tag = tag;
    StageDescription::new(stage_id.clone(), info)
}
