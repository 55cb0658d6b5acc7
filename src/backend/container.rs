//! Container backend abstraction
//!
//! Provides a trait for single-image operations that can be implemented by
//! different engines (podman, docker, or a test double).

use crate::error::StagehouseResult;
use crate::stage::ImageInfo;
use async_trait::async_trait;
use std::path::Path;

/// Abstract container engine interface
///
/// Every method acts on one image reference. Implementations must be
/// interchangeable: stages storages only rely on this set of operations.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Pull an image from its registry
    async fn pull(&self, reference: &str) -> StagehouseResult<()>;

    /// Push a local image to its registry
    async fn push(&self, reference: &str) -> StagehouseResult<()>;

    /// Add `target` as a new name for local image `source`
    async fn tag(&self, source: &str, target: &str) -> StagehouseResult<()>;

    /// Remove a local image name; missing images are not an error
    async fn remove(&self, reference: &str) -> StagehouseResult<()>;

    /// Inspect a local image, `None` when it is not present
    async fn inspect(&self, reference: &str) -> StagehouseResult<Option<ImageInfo>>;

    /// List local images whose repository equals `repository`
    async fn list_images(&self, repository: &str) -> StagehouseResult<Vec<ImageInfo>>;

    /// Write a local image to an archive file
    async fn save(&self, reference: &str, path: &Path) -> StagehouseResult<()>;

    /// Load images from an archive file
    async fn load(&self, path: &Path) -> StagehouseResult<()>;

    /// Get the human-readable backend name for display
    fn backend_name(&self) -> &'static str;

    /// Whether the image is present locally
    async fn is_present(&self, reference: &str) -> StagehouseResult<bool> {
        Ok(self.inspect(reference).await?.is_some())
    }
}
