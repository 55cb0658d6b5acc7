//! Container backends
//!
//! Provides engine-agnostic single-image operations:
//! - podman (default)
//! - docker

mod cli;
mod container;
mod factory;

pub use cli::{CliBackend, Engine};
pub use container::ContainerBackend;
pub use factory::create_backend;
