//! File-backed stages storage cache
//!
//! One JSON file per `(project, signature)`:
//! `<dir>/<format version>/<project>/<signature>.json`. Entries are written
//! to a temporary file and renamed into place, so a reader sees either the
//! old or the new entry, never a partial one.

use crate::cache::StagesStorageCache;
use crate::error::{StagehouseError, StagehouseResult};
use crate::lock::file_stem;
use crate::stage::StageDescription;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

/// Bumped whenever the entry layout changes
const FORMAT_VERSION: &str = "1";

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    stored_at: DateTime<Utc>,
    stages: Vec<StageDescription>,
}

/// Stages storage cache kept on the local filesystem
#[derive(Debug, Clone)]
pub struct FileStagesStorageCache {
    dir: PathBuf,
}

impl FileStagesStorageCache {
    /// Create a cache rooted at `dir`
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn project_dir(&self, project: &str) -> PathBuf {
        self.dir.join(FORMAT_VERSION).join(file_stem(project))
    }

    fn entry_path(&self, project: &str, signature: &str) -> PathBuf {
        self.project_dir(project)
            .join(format!("{}.json", file_stem(signature)))
    }
}

#[async_trait]
impl StagesStorageCache for FileStagesStorageCache {
    async fn get_stages_by_signature(
        &self,
        project: &str,
        signature: &str,
    ) -> StagehouseResult<Option<Vec<StageDescription>>> {
        let path = self.entry_path(project, signature);

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StagehouseError::io(
                    format!("reading cache entry {}", path.display()),
                    e,
                ))
            }
        };

        let entry: CacheEntry =
            serde_json::from_str(&content).map_err(|e| StagehouseError::CacheCorrupted {
                project: project.to_string(),
                signature: signature.to_string(),
                reason: e.to_string(),
            })?;

        debug!(
            project,
            signature,
            stages = entry.stages.len(),
            "Stages storage cache hit"
        );
        Ok(Some(entry.stages))
    }

    async fn store_stages_by_signature(
        &self,
        project: &str,
        signature: &str,
        stages: &[StageDescription],
    ) -> StagehouseResult<()> {
        let path = self.entry_path(project, signature);
        let dir = self.project_dir(project);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StagehouseError::io(format!("creating cache dir {}", dir.display()), e))?;

        let entry = CacheEntry {
            stored_at: Utc::now(),
            stages: stages.to_vec(),
        };
        let content = serde_json::to_string_pretty(&entry)?;

        let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        fs::write(&tmp, content)
            .await
            .map_err(|e| StagehouseError::io(format!("writing cache entry {}", tmp.display()), e))?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StagehouseError::io(
                format!("replacing cache entry {}", path.display()),
                e,
            ));
        }

        debug!(project, signature, stages = stages.len(), "Stored stages storage cache entry");
        Ok(())
    }

    async fn delete_stages_by_signature(
        &self,
        project: &str,
        signature: &str,
    ) -> StagehouseResult<()> {
        let path = self.entry_path(project, signature);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StagehouseError::io(
                format!("removing cache entry {}", path.display()),
                e,
            )),
        }
    }

    async fn delete_all_stages(&self, project: &str) -> StagehouseResult<()> {
        let dir = self.project_dir(project);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StagehouseError::io(
                format!("removing cache dir {}", dir.display()),
                e,
            )),
        }
    }

    fn location(&self) -> String {
        self.dir.display().to_string()
    }
}
