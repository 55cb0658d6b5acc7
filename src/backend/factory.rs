//! Backend factory for creating the configured container backend

use crate::backend::cli::{CliBackend, Engine};
use crate::backend::container::ContainerBackend;
use crate::config::Config;
use crate::error::StagehouseResult;
use std::sync::Arc;

/// Create the container backend named by `backend.engine`
///
/// # Returns
/// * `Ok(Arc<dyn ContainerBackend>)` - A shared backend implementation
/// * `Err` - If the engine is not supported
pub fn create_backend(config: &Config) -> StagehouseResult<Arc<dyn ContainerBackend>> {
    let engine = Engine::parse(&config.backend.engine)?;
    Ok(Arc::new(CliBackend::new(engine)))
}
