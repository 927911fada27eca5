//! Object store for CacheInstance children
//!
//! The reconciler only ever creates, replaces and deletes whole objects.
//! Outcomes are mapped onto [`Error::NotFound`] and [`Error::AlreadyExists`]
//! so the create-or-update decision never inspects HTTP status codes.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::workload::{ChildKind, ChildObject};
use crate::Error;

/// Trait abstracting child object persistence
///
/// Implementations must report a missing object as [`Error::NotFound`] and a
/// create collision as [`Error::AlreadyExists`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the object; fails with `AlreadyExists` if it is already present
    async fn create(&self, obj: &ChildObject) -> Result<(), Error>;

    /// Replace the object; fails with `NotFound` if it is absent
    async fn update(&self, obj: &ChildObject) -> Result<(), Error>;

    /// Delete the object; fails with `NotFound` if it is absent
    async fn delete(&self, kind: ChildKind, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Real Kubernetes object store
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    /// Create a new store wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn create_typed<K>(&self, kind: ChildKind, obj: &K) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned
            + Serialize,
    {
        let name = obj.meta().name.clone().unwrap_or_default();
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        self.api::<K>(&namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_error(kind, &name, e))?;
        debug!(%kind, name = %name, namespace = %namespace, "created child");
        Ok(())
    }

    async fn replace_typed<K>(&self, kind: ChildKind, obj: &K) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned
            + Serialize,
    {
        let name = obj.meta().name.clone().unwrap_or_default();
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        self.api::<K>(&namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_error(kind, &name, e))?;
        debug!(%kind, name = %name, namespace = %namespace, "updated child");
        Ok(())
    }

    async fn delete_typed<K>(&self, kind: ChildKind, namespace: &str, name: &str) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_error(kind, name, e))?;
        debug!(%kind, name = %name, namespace = %namespace, "deleted child");
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn create(&self, obj: &ChildObject) -> Result<(), Error> {
        match obj {
            ChildObject::ConfigMap(cm) => self.create_typed(ChildKind::ConfigMap, cm).await,
            ChildObject::Deployment(d) => self.create_typed(ChildKind::Deployment, d).await,
            ChildObject::Service(s) => self.create_typed(ChildKind::Service, s).await,
        }
    }

    async fn update(&self, obj: &ChildObject) -> Result<(), Error> {
        match obj {
            ChildObject::ConfigMap(cm) => self.replace_typed(ChildKind::ConfigMap, cm).await,
            ChildObject::Deployment(d) => self.replace_typed(ChildKind::Deployment, d).await,
            ChildObject::Service(s) => self.replace_typed(ChildKind::Service, s).await,
        }
    }

    async fn delete(&self, kind: ChildKind, namespace: &str, name: &str) -> Result<(), Error> {
        match kind {
            ChildKind::ConfigMap => self.delete_typed::<ConfigMap>(kind, namespace, name).await,
            ChildKind::Deployment => self.delete_typed::<Deployment>(kind, namespace, name).await,
            ChildKind::Service => self.delete_typed::<Service>(kind, namespace, name).await,
        }
    }
}

/// Map a kube API error onto the store's outcome vocabulary
pub(crate) fn map_kube_error(kind: ChildKind, name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(kind.to_string(), name),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            Error::already_exists(kind.to_string(), name)
        }
        other => Error::apply(kind.to_string(), name, other.to_string()),
    }
}
