//! Registry repository stages storage
//!
//! Every stage of a project is one tag of a dedicated repository. Listing
//! and deletion talk to the registry API; pull and push go through the
//! local container engine.

use crate::backend::ContainerBackend;
use crate::error::StagehouseResult;
use crate::stage::{StageDescription, StageId};
use crate::storage::registry::RegistryApi;
use crate::storage::{describe, unavailable, StagesStorage};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Stages storage backed by a registry repository
pub struct RepoStagesStorage {
    repository: String,
    registry: Arc<dyn RegistryApi>,
    backend: Arc<dyn ContainerBackend>,
}

impl RepoStagesStorage {
    pub fn new(
        repository: String,
        registry: Arc<dyn RegistryApi>,
        backend: Arc<dyn ContainerBackend>,
    ) -> Self {
        Self {
            repository,
            registry,
            backend,
        }
    }
}

#[async_trait]
impl StagesStorage for RepoStagesStorage {
    fn address(&self) -> String {
        self.repository.clone()
    }

    fn construct_stage_image_name(&self, _project: &str, stage_id: &StageId) -> String {
        format!("{}:{}", self.repository, stage_id.tag())
    }

    async fn get_all_stages(&self, _project: &str) -> StagehouseResult<Vec<StageId>> {
        let tags = self
            .registry
            .list_tags(&self.repository)
            .await
            .map_err(|e| unavailable(&self.repository, e))?;

        let mut ids: Vec<StageId> = tags.iter().filter_map(|t| StageId::from_tag(t)).collect();
        ids.sort();
        debug!(
            storage = %self.repository,
            tags = tags.len(),
            stages = ids.len(),
            "Listed repository"
        );
        Ok(ids)
    }

    async fn get_stage_description(
        &self,
        project: &str,
        stage_id: &StageId,
    ) -> StagehouseResult<Option<StageDescription>> {
        let info = self
            .registry
            .image_info(&self.repository, &stage_id.tag())
            .await
            .map_err(|e| unavailable(&self.repository, e))?;
        let name = self.construct_stage_image_name(project, stage_id);
        Ok(info.map(|info| describe(stage_id, &name, info)))
    }

    async fn fetch_image(
        &self,
        project: &str,
        description: &StageDescription,
    ) -> StagehouseResult<String> {
        let name = self.construct_stage_image_name(project, &description.stage_id);
        if !self.backend.is_present(&name).await? {
            self.backend.pull(&name).await?;
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
        info!(stage = %stage_id, storage = %self.repository, "Pushing {}", name);
        self.backend.push(&name).await
    }

    async fn delete_stages(
        &self,
        _project: &str,
        stages: &[StageDescription],
    ) -> StagehouseResult<()> {
        for stage in stages {
            debug!(stage = %stage.stage_id, storage = %self.repository, "Deleting tag");
            self.registry
                .delete_tag(&self.repository, &stage.stage_id.tag())
                .await?;
        }
        Ok(())
    }
}
