//! Archive stages storage
//!
//! Stages are kept as image archives in a directory tree:
//!
//! ```text
//! <root>/<project>/<signature>-<unique id>.tar   image archive
//! <root>/<project>/<signature>-<unique id>.json  ImageInfo sidecar
//! ```
//!
//! The sidecar is written last, so a stage counts as stored only once its
//! archive is complete.

use crate::backend::ContainerBackend;
use crate::error::{StagehouseError, StagehouseResult};
use crate::lock::file_stem;
use crate::stage::{ImageInfo, StageDescription, StageId};
use crate::storage::{describe, unavailable, StagesStorage};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

/// Repository prefix of images loaded from archives
const ARCHIVE_REPOSITORY_PREFIX: &str = "stagehouse-archive";

/// Stages storage backed by a directory of image archives
pub struct ArchiveStagesStorage {
    root: PathBuf,
    backend: Arc<dyn ContainerBackend>,
}

impl ArchiveStagesStorage {
    pub fn new(root: PathBuf, backend: Arc<dyn ContainerBackend>) -> Self {
        Self { root, backend }
    }

    fn project_dir(&self, project: &str) -> PathBuf {
        self.root.join(file_stem(project))
    }

    fn archive_path(&self, project: &str, stage_id: &StageId) -> PathBuf {
        self.project_dir(project).join(format!("{}.tar", stage_id.tag()))
    }

    fn sidecar_path(&self, project: &str, stage_id: &StageId) -> PathBuf {
        self.project_dir(project).join(format!("{}.json", stage_id.tag()))
    }

    fn io_error(&self, context: String, err: std::io::Error) -> StagehouseError {
        StagehouseError::storage_unavailable(
            self.address(),
            StagehouseError::io(context, err),
        )
    }
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[async_trait]
impl StagesStorage for ArchiveStagesStorage {
    fn address(&self) -> String {
        format!("archive:{}", self.root.display())
    }

    fn construct_stage_image_name(&self, project: &str, stage_id: &StageId) -> String {
        format!("{}/{}:{}", ARCHIVE_REPOSITORY_PREFIX, project, stage_id.tag())
    }

    async fn get_all_stages(&self, project: &str) -> StagehouseResult<Vec<StageId>> {
        let dir = self.project_dir(project);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(format!("listing {}", dir.display()), e)),
        };

        let mut ids = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => return Err(self.io_error(format!("listing {}", dir.display()), e)),
            };

            let name = entry.file_name();
            let Some(tag) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Some(id) = StageId::from_tag(tag) {
                ids.push(id);
            }
        }

        ids.sort();
        Ok(ids)
    }

    async fn get_stage_description(
        &self,
        project: &str,
        stage_id: &StageId,
    ) -> StagehouseResult<Option<StageDescription>> {
        let path = self.sidecar_path(project, stage_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(format!("reading {}", path.display()), e)),
        };

        let info: ImageInfo =
            serde_json::from_str(&content).map_err(|e| unavailable(&self.address(), e.into()))?;
        let name = self.construct_stage_image_name(project, stage_id);
        Ok(Some(describe(stage_id, &name, info)))
    }

    async fn fetch_image(
        &self,
        project: &str,
        description: &StageDescription,
    ) -> StagehouseResult<String> {
        let name = self.construct_stage_image_name(project, &description.stage_id);
        if self.backend.is_present(&name).await? {
            debug!(stage = %description.stage_id, "Archive image already loaded: {}", name);
            return Ok(name);
        }

        let archive = self.archive_path(project, &description.stage_id);
        if !archive.exists() {
            return Err(StagehouseError::ImageNotFound(archive.display().to_string()));
        }
        self.backend.load(&archive).await?;

        if !self.backend.is_present(&name).await? {
            return Err(StagehouseError::ImageNotFound(name));
        }
        Ok(name)
    }

    async fn store_image(
        &self,
        project: &str,
        stage_id: &StageId,
        local_reference: &str,
    ) -> StagehouseResult<()> {
        let name = self.construct_stage_image_name(project, stage_id);
        if name != local_reference {
            self.backend.tag(local_reference, &name).await?;
        }

        let info = self
            .backend
            .inspect(&name)
            .await?
            .ok_or_else(|| StagehouseError::ImageNotFound(name.clone()))?;

        let dir = self.project_dir(project);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| self.io_error(format!("creating {}", dir.display()), e))?;

        let archive = self.archive_path(project, stage_id);
        let partial = archive.with_extension("tar.partial");
        info!(stage = %stage_id, "Saving {} to {}", name, archive.display());
        if let Err(e) = self.backend.save(&name, &partial).await {
            let _ = remove_if_exists(&partial).await;
            return Err(e);
        }
        fs::rename(&partial, &archive)
            .await
            .map_err(|e| self.io_error(format!("renaming {}", partial.display()), e))?;

        let sidecar = self.sidecar_path(project, stage_id);
        let partial = sidecar.with_extension("json.partial");
        let content = serde_json::to_string_pretty(&info)?;
        fs::write(&partial, content)
            .await
            .map_err(|e| self.io_error(format!("writing {}", partial.display()), e))?;
        fs::rename(&partial, &sidecar)
            .await
            .map_err(|e| self.io_error(format!("renaming {}", partial.display()), e))?;

        Ok(())
    }

    async fn delete_stages(
        &self,
        project: &str,
        stages: &[StageDescription],
    ) -> StagehouseResult<()> {
        for stage in stages {
            let sidecar = self.sidecar_path(project, &stage.stage_id);
            remove_if_exists(&sidecar)
                .await
                .map_err(|e| self.io_error(format!("removing {}", sidecar.display()), e))?;

            let archive = self.archive_path(project, &stage.stage_id);
            remove_if_exists(&archive)
                .await
                .map_err(|e| self.io_error(format!("removing {}", archive.display()), e))?;

            debug!(stage = %stage.stage_id, "Removed archived stage");
        }
        Ok(())
    }
}
