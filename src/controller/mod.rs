//! Controller for CacheInstance resources
//!
//! Reconciliation follows the observe-diff-act loop: default the spec,
//! derive the desired children, create-or-update each one, and delete them
//! all when the instance goes away.

mod cache;
mod store;

pub use cache::{
    error_policy, handle, reconcile, reconcile_instance, teardown, CacheClient, CacheEvent,
    Context, ContextBuilder, KubeCacheClient, FINALIZER,
};
pub use store::{KubeObjectStore, ObjectStore};
