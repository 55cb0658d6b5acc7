//! Stagehouse - content-addressed stage cache for multi-stage image builds
//!
//! Finds reusable stage images by signature in a stages storage, keeps a
//! per-signature cache of storage listings under cooperative locks, and
//! replicates stages between storages with a bounded worker pool.

pub mod backend;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod lock;
pub mod manager;
pub mod selection;
pub mod stage;
pub mod storage;
pub mod sync;
pub mod ui;

pub use error::{StagehouseError, StagehouseResult};
pub use manager::{FetchedStage, StagesManager};
pub use stage::{BuildStage, StageDescription, StageId, StageRef};
pub use storage::{create_storage, StagesStorage, StorageAddress};
pub use sync::{sync_stages, StagesSynchronizer, SyncOptions, SyncReport};
