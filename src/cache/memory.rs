//! In-process stages storage cache

use crate::cache::StagesStorageCache;
use crate::error::{StagehouseError, StagehouseResult};
use crate::stage::StageDescription;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

type Entries = HashMap<(String, String), Vec<StageDescription>>;

/// Stages storage cache that lives as long as the process
#[derive(Debug, Default)]
pub struct MemoryStagesStorageCache {
    entries: RwLock<Entries>,
}

impl MemoryStagesStorageCache {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StagehouseError {
    StagehouseError::Internal("stages storage cache lock poisoned".to_string())
}

#[async_trait]
impl StagesStorageCache for MemoryStagesStorageCache {
    async fn get_stages_by_signature(
        &self,
        project: &str,
        signature: &str,
    ) -> StagehouseResult<Option<Vec<StageDescription>>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries
            .get(&(project.to_string(), signature.to_string()))
            .cloned())
    }

    async fn store_stages_by_signature(
        &self,
        project: &str,
        signature: &str,
        stages: &[StageDescription],
    ) -> StagehouseResult<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.insert(
            (project.to_string(), signature.to_string()),
            stages.to_vec(),
        );
        Ok(())
    }

    async fn delete_stages_by_signature(
        &self,
        project: &str,
        signature: &str,
    ) -> StagehouseResult<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.remove(&(project.to_string(), signature.to_string()));
        Ok(())
    }

    async fn delete_all_stages(&self, project: &str) -> StagehouseResult<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.retain(|(p, _), _| p != project);
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}
