//! Candidate selection
//!
//! Given the stored images sharing one signature, pick the first one the
//! build stage accepts. Compatibility rules live with the build pipeline and
//! are injected as a [`CompatibilityPredicate`].

use crate::stage::StageDescription;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Decides whether a stored stage image may be reused
pub trait CompatibilityPredicate: Send + Sync {
    fn is_suitable(&self, candidate: &StageDescription) -> bool;
}

impl<F> CompatibilityPredicate for F
where
    F: Fn(&StageDescription) -> bool + Send + Sync,
{
    fn is_suitable(&self, candidate: &StageDescription) -> bool {
        self(candidate)
    }
}

/// Built-in selection strategies
#[derive(Clone, Default)]
pub enum SelectionPolicy {
    /// Every candidate is suitable
    #[default]
    Any,
    /// Candidate must carry all of these labels with equal values
    MatchLabels(BTreeMap<String, String>),
    /// Caller-supplied rule
    Custom(Arc<dyn CompatibilityPredicate>),
}

impl fmt::Debug for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "Any"),
            Self::MatchLabels(labels) => f.debug_tuple("MatchLabels").field(labels).finish(),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl CompatibilityPredicate for SelectionPolicy {
    fn is_suitable(&self, candidate: &StageDescription) -> bool {
        match self {
            Self::Any => true,
            Self::MatchLabels(required) => required
                .iter()
                .all(|(k, v)| candidate.info.labels.get(k) == Some(v)),
            Self::Custom(predicate) => predicate.is_suitable(candidate),
        }
    }
}

/// Return the first candidate accepted by `predicate`, in list order
pub fn select_suitable_stage<'a>(
    candidates: &'a [StageDescription],
    predicate: &dyn CompatibilityPredicate,
) -> Option<&'a StageDescription> {
    candidates.iter().find(|c| predicate.is_suitable(c))
}
