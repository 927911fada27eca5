//! Supporting types for the CacheInstance CRD

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Outcome of the most recent reconciliation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum CachePhase {
    /// Not reconciled yet
    #[default]
    Pending,
    /// Children were applied (or left alone) without error
    Reconciled,
    /// The last reconciliation returned an error
    Failed,
}

impl std::fmt::Display for CachePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Reconciled => write!(f, "Reconciled"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}
