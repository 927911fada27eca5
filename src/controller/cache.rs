//! CacheInstance controller implementation
//!
//! Two layers live here. The core ([`handle`], [`reconcile_instance`],
//! [`teardown`]) turns create/update/delete events into child object writes
//! and holds no state between calls. The adapter ([`reconcile`],
//! [`error_policy`]) plugs the core into `kube::runtime::Controller`,
//! translating deletion timestamps and finalizers into events and publishing
//! status.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::store::{KubeObjectStore, ObjectStore};
use crate::config::OperatorConfig;
use crate::crd::{CacheInstance, CachePhase, CacheStatus};
use crate::template::{ConfigRenderer, RedisConfigRenderer};
use crate::validation::validate;
use crate::workload::{build, ChildKind, ChildObject};
use crate::Error;

/// Finalizer held on every live CacheInstance
pub const FINALIZER: &str = "cache-operator.io/cleanup";

/// Field manager used for patches
const FIELD_MANAGER: &str = "cache-operator";

/// Order children are removed in on deletion
const TEARDOWN_ORDER: [ChildKind; 3] = [
    ChildKind::Deployment,
    ChildKind::ConfigMap,
    ChildKind::Service,
];

/// Trait abstracting CacheInstance API operations
///
/// Covers the writes the adapter makes to the instance itself; child
/// objects go through [`ObjectStore`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Patch the status subresource of a CacheInstance
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &CacheStatus,
    ) -> Result<(), Error>;

    /// Add [`FINALIZER`] to a CacheInstance if it is not already present
    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Remove [`FINALIZER`] from a CacheInstance
    ///
    /// An instance that is already gone is not an error.
    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeCacheClient {
    client: Client,
}

impl KubeCacheClient {
    /// Create a new client wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<CacheInstance> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patch_finalizers(
        &self,
        api: &Api<CacheInstance>,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });

        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;

        Ok(())
    }
}

#[async_trait]
impl CacheClient for KubeCacheClient {
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &CacheStatus,
    ) -> Result<(), Error> {
        let status_patch = serde_json::json!({
            "status": status
        });

        self.api(namespace)
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await?;

        Ok(())
    }

    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api = self.api(namespace);

        let instance = api.get(name).await?;
        let mut finalizers = instance.metadata.finalizers.unwrap_or_default();

        if finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(());
        }

        finalizers.push(FINALIZER.to_string());
        self.patch_finalizers(&api, name, finalizers).await
    }

    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api = self.api(namespace);

        let instance = match api.get(name).await {
            Ok(i) => i,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(cache = %name, "CacheInstance already gone");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let finalizers: Vec<String> = instance
            .metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().filter(|s| *s != FINALIZER).cloned().collect())
            .unwrap_or_default();

        match self.patch_finalizers(&api, name, finalizers).await {
            Err(Error::Kube(kube::Error::Api(ae))) if ae.code == 404 => Ok(()),
            other => other,
        }
    }
}

/// Controller context shared by every reconciliation
///
/// Holds the collaborators the core talks to and the operator
/// configuration. Use [`ContextBuilder`] in production:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .config(operator_config)
///     .build();
/// ```
pub struct Context {
    /// Child object persistence
    pub store: Arc<dyn ObjectStore>,
    /// Configuration file renderer
    pub renderer: Arc<dyn ConfigRenderer>,
    /// CacheInstance status and finalizer writes
    pub client: Arc<dyn CacheClient>,
    /// Defaults, limits and apply policy
    pub config: OperatorConfig,
}

impl Context {
    /// Create a builder backed by a real Kubernetes client
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Assemble a context from explicit collaborators
    pub fn new(
        store: Arc<dyn ObjectStore>,
        renderer: Arc<dyn ConfigRenderer>,
        client: Arc<dyn CacheClient>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            store,
            renderer,
            client,
            config,
        }
    }

    /// Create a context for testing with the default configuration
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn ObjectStore>,
        renderer: Arc<dyn ConfigRenderer>,
        client: Arc<dyn CacheClient>,
    ) -> Self {
        Self::new(store, renderer, client, OperatorConfig::default())
    }
}

/// Builder for constructing [`Context`] instances
///
/// Anything not overridden is backed by the Kubernetes client handed to
/// [`Context::builder`], and the renderer defaults to
/// [`RedisConfigRenderer`].
pub struct ContextBuilder {
    client: Client,
    store: Option<Arc<dyn ObjectStore>>,
    renderer: Option<Arc<dyn ConfigRenderer>>,
    cache_client: Option<Arc<dyn CacheClient>>,
    config: OperatorConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            store: None,
            renderer: None,
            cache_client: None,
            config: OperatorConfig::default(),
        }
    }

    /// Set the operator configuration
    pub fn config(mut self, config: OperatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the object store
    pub fn store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the configuration renderer
    pub fn renderer(mut self, renderer: Arc<dyn ConfigRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Override the CacheInstance client
    pub fn cache_client(mut self, client: Arc<dyn CacheClient>) -> Self {
        self.cache_client = Some(client);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(KubeObjectStore::new(self.client.clone()))),
            renderer: self
                .renderer
                .unwrap_or_else(|| Arc::new(RedisConfigRenderer::new())),
            client: self
                .cache_client
                .unwrap_or_else(|| Arc::new(KubeCacheClient::new(self.client.clone()))),
            config: self.config,
        }
    }
}

/// A lifecycle event for one CacheInstance
#[derive(Clone, Debug)]
pub enum CacheEvent {
    /// First delivery of a new instance
    Created(Arc<CacheInstance>),
    /// Any later delivery of a live instance
    Updated(Arc<CacheInstance>),
    /// The instance is being removed
    Deleted(Arc<CacheInstance>),
}

impl CacheEvent {
    /// The instance this event is about
    pub fn instance(&self) -> &CacheInstance {
        match self {
            Self::Created(i) | Self::Updated(i) | Self::Deleted(i) => i,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Updated(_) => "updated",
            Self::Deleted(_) => "deleted",
        }
    }
}

/// Route an event to reconciliation or teardown
///
/// A create collision surfaced by [`reconcile_instance`] means another writer
/// created the child first; it is logged and reported as success. Every other
/// error is logged with the instance identity and returned.
pub async fn handle(event: CacheEvent, ctx: &Context) -> Result<(), Error> {
    match dispatch(&event, ctx).await {
        Err(e) if e.is_already_exists() => {
            let instance = event.instance();
            warn!(
                cache = %instance.name_any(),
                namespace = %instance.namespace().unwrap_or_default(),
                error = %e,
                "child created concurrently, treating as reconciled"
            );
            Ok(())
        }
        other => other,
    }
}

/// Route an event without absorbing create collisions
///
/// Errors other than a collision are logged here so [`handle`] and the
/// controller adapter report them the same way.
async fn dispatch(event: &CacheEvent, ctx: &Context) -> Result<(), Error> {
    let instance = event.instance();
    let name = instance.name_any();
    let namespace = instance.namespace().unwrap_or_default();
    debug!(cache = %name, namespace = %namespace, event = event.name(), "handling event");

    let result = match event {
        CacheEvent::Created(i) | CacheEvent::Updated(i) => reconcile_instance(i, ctx).await,
        CacheEvent::Deleted(i) => teardown(i, ctx).await,
    };

    if let Err(e) = &result {
        if !e.is_already_exists() {
            error!(
                cache = %name,
                namespace = %namespace,
                event = event.name(),
                error = %e,
                "failed to handle event"
            );
        }
    }
    result
}

/// Default the spec, derive the children and create-or-update each one
///
/// The caller's instance is never modified. Children are applied in the
/// order ConfigMap, Deployment, Service, and the first failure stops the
/// rest.
#[instrument(skip(instance, ctx), fields(cache = %instance.name_any()))]
pub async fn reconcile_instance(instance: &CacheInstance, ctx: &Context) -> Result<(), Error> {
    let (spec, changed) = instance.spec.with_defaults(&ctx.config.defaults);

    if !ctx.config.apply_policy.should_apply(changed) {
        debug!(policy = %ctx.config.apply_policy, "spec already defaulted, children untouched");
        return Ok(());
    }

    let mut desired = instance.clone();
    desired.spec = spec;

    let children = build(&desired, ctx.renderer.as_ref())?;

    for child in children.in_apply_order() {
        apply_child(ctx.store.as_ref(), &child).await?;
    }

    info!(fingerprint = %children.fingerprint, "children applied");
    Ok(())
}

/// Update a child, falling back to create when it does not exist yet
async fn apply_child(store: &dyn ObjectStore, child: &ChildObject) -> Result<(), Error> {
    match store.update(child).await {
        Err(e) if e.is_not_found() => {
            debug!(kind = %child.kind(), name = %child.name(), "child missing, creating");
            store.create(child).await
        }
        other => other,
    }
}

/// Delete every child of an instance
///
/// Children that are already gone are skipped; any other failure stops the
/// remaining deletes.
#[instrument(skip(instance, ctx), fields(cache = %instance.name_any()))]
pub async fn teardown(instance: &CacheInstance, ctx: &Context) -> Result<(), Error> {
    let name = instance.name_any();
    let namespace = instance
        .namespace()
        .ok_or_else(|| Error::validation(format!("CacheInstance {name} has no namespace")))?;

    for kind in TEARDOWN_ORDER {
        match ctx.store.delete(kind, &namespace, &name).await {
            Ok(()) => debug!(%kind, "child deleted"),
            Err(e) if e.is_not_found() => debug!(%kind, "child already absent"),
            Err(e) => return Err(e),
        }
    }

    info!("children removed");
    Ok(())
}

/// Reconcile a CacheInstance delivered by the kube runtime
///
/// Deleting instances are torn down and released from the finalizer. Live
/// instances get the finalizer, are dispatched as `Created` (no status yet)
/// or `Updated`, and have their status refreshed with the outcome and any
/// validation findings.
///
/// A create collision leaves the remaining children unwritten, and the
/// colliding object carries no owner reference to wake the controller, so
/// the instance is marked `Failed` and requeued rather than reported as
/// reconciled.
#[instrument(skip(instance, ctx), fields(cache = %instance.name_any()))]
pub async fn reconcile(instance: Arc<CacheInstance>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = instance.name_any();
    let namespace = instance.namespace().unwrap_or_default();
    let has_finalizer = instance.finalizers().iter().any(|f| f == FINALIZER);

    if instance.metadata.deletion_timestamp.is_some() {
        if has_finalizer {
            info!("cache instance deleting, removing children");
            handle(CacheEvent::Deleted(instance.clone()), &ctx).await?;
            ctx.client.remove_finalizer(&name, &namespace).await?;
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer {
        debug!("adding finalizer");
        ctx.client.add_finalizer(&name, &namespace).await?;
    }

    let event = if instance.status.is_none() {
        CacheEvent::Created(instance.clone())
    } else {
        CacheEvent::Updated(instance.clone())
    };
    let result = dispatch(&event, &ctx).await;

    let (defaulted, _) = instance.spec.with_defaults(&ctx.config.defaults);
    let violations = validate(&defaulted, &ctx.config.limits);
    for v in &violations {
        warn!(violation = %v, "cache spec violation");
    }

    let status = match &result {
        Ok(()) => CacheStatus::with_phase(CachePhase::Reconciled).errors(violations),
        Err(e) => CacheStatus::with_phase(CachePhase::Failed)
            .errors(violations)
            .error(e.to_string()),
    };

    if instance.status.as_ref() != Some(&status) {
        ctx.client.patch_status(&name, &namespace, &status).await?;
        debug!(phase = %status.phase, "status updated");
    }

    match result {
        Ok(()) => Ok(Action::await_change()),
        Err(e) if e.is_already_exists() => {
            warn!(error = %e, "child created concurrently, retrying remaining children");
            Ok(Action::requeue(ctx.config.requeue_after))
        }
        Err(e) => Err(e),
    }
}

/// Error policy for the controller
///
/// Logs the failure and asks the runtime to redeliver the instance after the
/// configured delay.
pub fn error_policy(instance: Arc<CacheInstance>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cache = %instance.name_any(),
        namespace = %instance.namespace().unwrap_or_default(),
        "reconciliation failed"
    );
    Action::requeue(ctx.config.requeue_after)
}
