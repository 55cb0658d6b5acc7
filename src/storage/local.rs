//! Local sentinel stages storage
//!
//! Stages live as images in the local container engine. Fetching is a
//! presence check, storing is a retag.

use crate::backend::ContainerBackend;
use crate::error::{StagehouseError, StagehouseResult};
use crate::stage::{StageDescription, StageId};
use crate::storage::{describe, unavailable, StagesStorage, LOCAL_STAGES_STORAGE_ADDRESS};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Repository prefix of local stage images
const LOCAL_REPOSITORY_PREFIX: &str = "stagehouse-stages";

/// Stages storage backed by the local container engine
pub struct LocalStagesStorage {
    backend: Arc<dyn ContainerBackend>,
}

impl LocalStagesStorage {
    pub fn new(backend: Arc<dyn ContainerBackend>) -> Self {
        Self { backend }
    }

    fn repository(project: &str) -> String {
        format!("{}/{}", LOCAL_REPOSITORY_PREFIX, project)
    }
}

#[async_trait]
impl StagesStorage for LocalStagesStorage {
    fn address(&self) -> String {
        LOCAL_STAGES_STORAGE_ADDRESS.to_string()
    }

    fn is_local(&self) -> bool {
        true
    }

    fn construct_stage_image_name(&self, project: &str, stage_id: &StageId) -> String {
        format!("{}:{}", Self::repository(project), stage_id.tag())
    }

    async fn get_all_stages(&self, project: &str) -> StagehouseResult<Vec<StageId>> {
        let images = self
            .backend
            .list_images(&Self::repository(project))
            .await
            .map_err(|e| unavailable(LOCAL_STAGES_STORAGE_ADDRESS, e))?;

        let mut ids: Vec<StageId> = images
            .iter()
            .filter_map(|info| StageId::from_tag(&info.tag))
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn get_stage_description(
        &self,
        project: &str,
        stage_id: &StageId,
    ) -> StagehouseResult<Option<StageDescription>> {
        let name = self.construct_stage_image_name(project, stage_id);
        let info = self
            .backend
            .inspect(&name)
            .await
            .map_err(|e| unavailable(LOCAL_STAGES_STORAGE_ADDRESS, e))?;
        Ok(info.map(|info| describe(stage_id, &name, info)))
    }

    async fn fetch_image(
        &self,
        _project: &str,
        description: &StageDescription,
    ) -> StagehouseResult<String> {
        let name = description.image_name().to_string();
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
            debug!(stage = %stage_id, "Tagging {} as {}", local_reference, name);
            self.backend.tag(local_reference, &name).await?;
        }
        Ok(())
    }

    async fn delete_stages(
        &self,
        _project: &str,
        stages: &[StageDescription],
    ) -> StagehouseResult<()> {
        for stage in stages {
            debug!(stage = %stage.stage_id, "Removing local stage image {}", stage.image_name());
            self.backend.remove(stage.image_name()).await?;
        }
        Ok(())
    }
}
