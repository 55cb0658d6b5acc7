//! Stored image metadata

use crate::stage::StageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metadata of one physical image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Full reference (`repository:tag`)
    pub name: String,
    /// Repository part of the reference
    pub repository: String,
    /// Tag part of the reference
    pub tag: String,
    /// Backend image id or manifest digest
    pub id: String,
    /// Size in bytes
    pub size: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Image labels
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl ImageInfo {
    /// Create image info for `repository:tag` with empty metadata
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        let repository = repository.into();
        let tag = tag.into();
        Self {
            name: format!("{}:{}", repository, tag),
            repository,
            tag,
            id: String::new(),
            size: 0,
            created_at: Utc::now(),
            labels: HashMap::new(),
        }
    }

    /// Split a reference into `(repository, tag)`, defaulting the tag to `latest`
    ///
    /// A colon that belongs to a registry port is not a tag separator.
    pub fn split_reference(reference: &str) -> (String, String) {
        let reference = reference.split('@').next().unwrap_or(reference);
        match reference.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
            _ => (reference.to_string(), "latest".to_string()),
        }
    }
}

/// A stage image as found in a stages storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescription {
    /// Stage identity
    pub stage_id: StageId,
    /// Image metadata
    pub info: ImageInfo,
}

impl StageDescription {
    /// Create a description
    pub fn new(stage_id: StageId, info: ImageInfo) -> Self {
        Self { stage_id, info }
    }

    /// Full image reference
    pub fn image_name(&self) -> &str {
        &self.info.name
    }
}

/// Sort candidates by unique id, then creation time
///
/// Storage listings come back in arbitrary order; sorting keeps candidate
/// selection stable across repeated calls.
pub fn sort_candidates(stages: &mut [StageDescription]) {
    stages.sort_by(|a, b| {
        a.stage_id
            .cmp(&b.stage_id)
            .then_with(|| a.info.created_at.cmp(&b.info.created_at))
    });
}
