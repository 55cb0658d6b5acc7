//! CLI-driven container backend
//!
//! Implements the ContainerBackend trait by executing the podman or docker
//! CLI directly. Both engines accept the same subcommands for the image
//! operations used here.

use crate::backend::container::ContainerBackend;
use crate::error::{StagehouseError, StagehouseResult};
use crate::stage::ImageInfo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Container engine driven through its CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Podman,
    Docker,
}

impl Engine {
    /// Parse an engine name from configuration
    pub fn parse(name: &str) -> StagehouseResult<Self> {
        match name {
            "podman" => Ok(Self::Podman),
            "docker" => Ok(Self::Docker),
            other => Err(StagehouseError::UnsupportedEngine(other.to_string())),
        }
    }

    /// Executable name
    pub fn program(&self) -> &'static str {
        match self {
            Self::Podman => "podman",
            Self::Docker => "docker",
        }
    }
}

/// Container backend using the engine CLI
pub struct CliBackend {
    engine: Engine,
}

impl CliBackend {
    /// Create a new CLI backend
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Execute an engine command and return the output
    async fn exec(&self, args: &[&str]) -> StagehouseResult<std::process::Output> {
        let program = self.engine.program();
        debug!("Executing: {} {:?}", program, args);

        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StagehouseError::EngineNotFound(program.to_string())
                } else {
                    StagehouseError::command_failed(format!("{} {:?}", program, args), e)
                }
            })
    }

    /// Execute and fail with the engine's stderr on non-zero exit
    async fn exec_checked(&self, args: &[&str]) -> StagehouseResult<std::process::Output> {
        let output = self.exec(args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(StagehouseError::command_exec(
                format!("{} {}", self.engine.program(), args.join(" ")),
                stderr.trim(),
            ))
        }
    }
}

/// Whether engine stderr reports a missing image
fn is_missing_image(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("no such image") || stderr.contains("image not known")
}

/// Parse one entry of `image inspect` JSON output
///
/// Podman reports labels at the top level, docker under `Config.Labels`.
pub(crate) fn parse_inspect_entry(reference: &str, entry: &Value) -> ImageInfo {
    let (repository, tag) = ImageInfo::split_reference(reference);
    let mut info = ImageInfo::new(repository, tag);

    info.id = entry
        .get("Id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    info.size = entry.get("Size").and_then(Value::as_u64).unwrap_or(0);
    if let Some(created) = entry
        .get("Created")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    {
        info.created_at = created.with_timezone(&Utc);
    }

    let labels = entry
        .get("Labels")
        .filter(|v| v.is_object())
        .or_else(|| entry.get("Config").and_then(|c| c.get("Labels")));
    if let Some(Value::Object(map)) = labels {
        info.labels = map
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
            .collect::<HashMap<_, _>>();
    }

    info
}

#[async_trait]
impl ContainerBackend for CliBackend {
    async fn pull(&self, reference: &str) -> StagehouseResult<()> {
        info!("Pulling image: {}", reference);

        let output = self.exec(&["pull", reference]).await?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(StagehouseError::ImagePull {
                image: reference.to_string(),
                reason: stderr.trim().to_string(),
            })
        }
    }

    async fn push(&self, reference: &str) -> StagehouseResult<()> {
        info!("Pushing image: {}", reference);

        let output = self.exec(&["push", reference]).await?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(StagehouseError::ImagePush {
                image: reference.to_string(),
                reason: stderr.trim().to_string(),
            })
        }
    }

    async fn tag(&self, source: &str, target: &str) -> StagehouseResult<()> {
        debug!("Tagging image {} as {}", source, target);

        let output = self.exec(&["tag", source, target]).await?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(StagehouseError::ImageTag {
                source_image: source.to_string(),
                target_image: target.to_string(),
                reason: stderr.trim().to_string(),
            })
        }
    }

    async fn remove(&self, reference: &str) -> StagehouseResult<()> {
        debug!("Removing image: {}", reference);

        let output = self.exec(&["rmi", reference]).await?;

        if output.status.success() {
            Ok(())
        } else {
            // Ignore error if image doesn't exist
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_image(&stderr) {
                Ok(())
            } else {
                Err(StagehouseError::command_exec(
                    format!("{} rmi", self.engine.program()),
                    stderr.trim(),
                ))
            }
        }
    }

    async fn inspect(&self, reference: &str) -> StagehouseResult<Option<ImageInfo>> {
        let output = self.exec(&["image", "inspect", reference]).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_image(&stderr) {
                return Ok(None);
            }
            return Err(StagehouseError::command_exec(
                format!("{} image inspect", self.engine.program()),
                stderr.trim(),
            ));
        }

        let entries: Vec<Value> = serde_json::from_slice(&output.stdout)?;
        Ok(entries
            .first()
            .map(|entry| parse_inspect_entry(reference, entry)))
    }

    async fn list_images(&self, repository: &str) -> StagehouseResult<Vec<ImageInfo>> {
        let filter = format!("reference={}", repository);
        let output = self
            .exec_checked(&[
                "images",
                "--format",
                "{{.Repository}}:{{.Tag}}",
                "--filter",
                &filter,
            ])
            .await?;

        // Podman qualifies short names with "localhost/"
        let qualified = format!("localhost/{}", repository);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut images = Vec::new();

        for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (repo, tag) = ImageInfo::split_reference(line);
            if repo != repository && repo != qualified {
                continue;
            }
            if tag == "<none>" {
                continue;
            }

            let reference = format!("{}:{}", repository, tag);
            if let Some(info) = self.inspect(&reference).await? {
                images.push(info);
            }
        }

        debug!("Found {} local images in {}", images.len(), repository);
        Ok(images)
    }

    async fn save(&self, reference: &str, path: &Path) -> StagehouseResult<()> {
        info!("Saving image {} to {}", reference, path.display());
        let path = path.to_string_lossy();
        self.exec_checked(&["save", "-o", &path, reference]).await?;
        Ok(())
    }

    async fn load(&self, path: &Path) -> StagehouseResult<()> {
        info!("Loading image archive {}", path.display());
        let path = path.to_string_lossy();
        self.exec_checked(&["load", "-i", &path]).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        match self.engine {
            Engine::Podman => "Podman",
            Engine::Docker => "Docker",
        }
    }
}
