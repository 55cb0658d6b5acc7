//! Stage identity and metadata
//!
//! A stage is one content-addressed step of a multi-stage image build. It is
//! identified by a signature (hash of the build inputs) plus a unique id that
//! disambiguates several images built for the same signature.

pub mod description;

pub use description::{sort_candidates, ImageInfo, StageDescription};

use crate::error::{StagehouseError, StagehouseResult};
use crate::selection::{CompatibilityPredicate, SelectionPolicy};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of a stored stage image
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId {
    /// Content signature of the build inputs
    pub signature: String,
    /// Disambiguator (creation time in milliseconds)
    pub unique_id: u64,
}

impl StageId {
    /// Create a stage id
    pub fn new(signature: impl Into<String>, unique_id: u64) -> Self {
        Self {
            signature: signature.into(),
            unique_id,
        }
    }

    /// Create a stage id for a freshly built image of `signature`
    pub fn generate(signature: impl Into<String>) -> Self {
        let millis = Utc::now().timestamp_millis().max(0) as u64;
        Self::new(signature, millis)
    }

    /// Image tag used by every stages storage: `<signature>-<unique id>`
    pub fn tag(&self) -> String {
        format!("{}-{}", self.signature, self.unique_id)
    }

    /// Parse a stage id from an image tag, `None` for foreign tags
    pub fn from_tag(tag: &str) -> Option<Self> {
        let (signature, unique_id) = tag.rsplit_once('-')?;
        if signature.is_empty() || unique_id.is_empty() {
            return None;
        }
        if !unique_id.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self::new(signature, unique_id.parse().ok()?))
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.signature, self.unique_id)
    }
}

impl FromStr for StageId {
    type Err = StagehouseError;

    fn from_str(s: &str) -> StagehouseResult<Self> {
        Self::from_tag(s).ok_or_else(|| StagehouseError::InvalidStageId(s.to_string()))
    }
}

/// Build-side view of a stage, supplied by the build pipeline
///
/// The compatibility check decides whether an already stored image for the
/// stage's signature may be reused.
pub trait BuildStage: Send + Sync {
    /// Human-readable stage name (e.g. `from`, `install`, `setup`)
    fn name(&self) -> &str;

    /// Content signature of the stage
    fn signature(&self) -> &str;

    /// Stage image previously selected for this stage, if any
    fn stage_id(&self) -> Option<&StageId>;

    /// Whether `candidate` may be reused for this stage
    fn is_compatible(&self, candidate: &StageDescription) -> bool;
}

/// A named stage with a selection policy
///
/// The plain [`BuildStage`] used when the caller only knows the stage's
/// name, signature and, after selection, its stage id.
#[derive(Debug, Clone)]
pub struct StageRef {
    name: String,
    signature: String,
    stage_id: Option<StageId>,
    policy: SelectionPolicy,
}

impl StageRef {
    /// Create a stage reference accepting any candidate
    pub fn new(name: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            signature: signature.into(),
            stage_id: None,
            policy: SelectionPolicy::Any,
        }
    }

    /// Pin the selected stage image
    pub fn with_stage_id(mut self, stage_id: StageId) -> Self {
        self.stage_id = Some(stage_id);
        self
    }

    /// Replace the selection policy
    pub fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl BuildStage for StageRef {
    fn name(&self) -> &str {
        &self.name
    }

    fn signature(&self) -> &str {
        &self.signature
    }

    fn stage_id(&self) -> Option<&StageId> {
        self.stage_id.as_ref()
    }

    fn is_compatible(&self, candidate: &StageDescription) -> bool {
        candidate.stage_id.signature == self.signature && self.policy.is_suitable(candidate)
    }
}
