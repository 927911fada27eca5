//! Custom Resource Definitions for the cache operator

mod cache;
mod types;

pub use cache::{CacheInstance, CacheSpec, CacheStatus};
pub use types::CachePhase;

use kube::CustomResourceExt;

use crate::Error;

/// Render the CacheInstance CRD as YAML
pub fn crd_yaml() -> Result<String, Error> {
    serde_yaml::to_string(&CacheInstance::crd())
        .map_err(|e| Error::serialization(format!("failed to serialize CRD: {e}")))
}
