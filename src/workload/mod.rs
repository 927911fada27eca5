//! Desired child objects for a CacheInstance
//!
//! Every CacheInstance owns exactly three children, all named after it:
//! - ConfigMap: rendered `redis.conf` under the `redis.config` key
//! - Deployment: one replica running the cache with the ConfigMap mounted
//! - Service: ClusterIP exposure of the cache port
//!
//! The Deployment's pod template carries a fingerprint of the rendered
//! configuration so a config change rolls the pods.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, KeyToPath, PodSpec,
    PodTemplateSpec, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};

use crate::crd::CacheInstance;
use crate::template::ConfigRenderer;
use crate::Error;

/// ConfigMap key holding the rendered configuration
pub const CONFIG_KEY: &str = "redis.config";

/// File name the configuration is projected to inside the pod
pub const CONFIG_FILE: &str = "redis.conf";

/// Directory the configuration volume is mounted at
pub const CONFIG_MOUNT_PATH: &str = "/usr/local/etc/redis/";

/// Full path handed to the cache server
pub const CONFIG_PATH: &str = "/usr/local/etc/redis/redis.conf";

/// Pod template annotation carrying the configuration fingerprint
pub const CONFIG_HASH_ANNOTATION: &str = "configmap/hash";

/// Name of the configuration volume
pub const CONFIG_VOLUME: &str = "redis-config";

/// Name of the container and service port
pub const PORT_NAME: &str = "redis";

/// Command the cache container runs
pub const SERVER_BINARY: &str = "redis-server";

/// Label marking objects managed by this operator
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "cache-operator";

/// Label carrying the owning instance's name
pub const INSTANCE_LABEL: &str = "cache-operator.io/instance";

/// Kind of a child object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChildKind {
    /// Rendered configuration
    ConfigMap,
    /// Cache workload
    Deployment,
    /// Network exposure
    Service,
}

impl std::fmt::Display for ChildKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigMap => write!(f, "ConfigMap"),
            Self::Deployment => write!(f, "Deployment"),
            Self::Service => write!(f, "Service"),
        }
    }
}

/// A single desired child object
#[derive(Clone, Debug, PartialEq)]
pub enum ChildObject {
    /// ConfigMap child
    ConfigMap(ConfigMap),
    /// Deployment child
    Deployment(Deployment),
    /// Service child
    Service(Service),
}

impl ChildObject {
    /// Kind of this child
    pub fn kind(&self) -> ChildKind {
        match self {
            Self::ConfigMap(_) => ChildKind::ConfigMap,
            Self::Deployment(_) => ChildKind::Deployment,
            Self::Service(_) => ChildKind::Service,
        }
    }

    fn meta(&self) -> &ObjectMeta {
        match self {
            Self::ConfigMap(o) => &o.metadata,
            Self::Deployment(o) => &o.metadata,
            Self::Service(o) => &o.metadata,
        }
    }

    /// Name of this child
    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    /// Namespace of this child
    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }
}

/// The three children derived from one CacheInstance
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredChildSet {
    /// Rendered configuration
    pub config_map: ConfigMap,
    /// Cache workload
    pub deployment: Deployment,
    /// Network exposure
    pub service: Service,
    /// Hex SHA-256 of the rendered configuration
    pub fingerprint: String,
}

impl DesiredChildSet {
    /// Children in the order they are applied: ConfigMap, Deployment, Service
    ///
    /// The ConfigMap goes first so the Deployment never mounts a missing
    /// volume source.
    pub fn in_apply_order(&self) -> [ChildObject; 3] {
        [
            ChildObject::ConfigMap(self.config_map.clone()),
            ChildObject::Deployment(self.deployment.clone()),
            ChildObject::Service(self.service.clone()),
        ]
    }
}

/// Labels shared by every child and used by every selector
pub fn instance_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (INSTANCE_LABEL.to_string(), name.to_string()),
    ])
}

/// Lowercase hex SHA-256 of the given text (always 64 characters)
pub fn fingerprint(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Derive the desired children for an instance whose spec is already defaulted
pub fn build(
    instance: &CacheInstance,
    renderer: &dyn ConfigRenderer,
) -> Result<DesiredChildSet, Error> {
    let name = instance.name_any();
    let namespace = instance
        .namespace()
        .ok_or_else(|| Error::validation(format!("CacheInstance {name} has no namespace")))?;

    let rendered = renderer.render(&instance.spec)?;
    let hash = fingerprint(&rendered);

    let meta = ObjectMeta {
        name: Some(name.clone()),
        namespace: Some(namespace),
        labels: Some(instance_labels(&name)),
        owner_references: instance.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    };

    Ok(DesiredChildSet {
        config_map: compile_config_map(meta.clone(), rendered),
        deployment: compile_deployment(meta.clone(), instance, &hash),
        service: compile_service(meta, instance),
        fingerprint: hash,
    })
}

fn compile_config_map(metadata: ObjectMeta, rendered: String) -> ConfigMap {
    ConfigMap {
        metadata,
        data: Some(BTreeMap::from([(CONFIG_KEY.to_string(), rendered)])),
        ..Default::default()
    }
}

fn compile_deployment(metadata: ObjectMeta, instance: &CacheInstance, hash: &str) -> Deployment {
    let name = instance.name_any();
    let labels = instance_labels(&name);

    let container = Container {
        name: name.clone(),
        image: Some(instance.spec.image.clone()),
        command: Some(vec![SERVER_BINARY.to_string(), CONFIG_PATH.to_string()]),
        ports: Some(vec![ContainerPort {
            name: Some(PORT_NAME.to_string()),
            container_port: instance.spec.port,
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: CONFIG_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let volume = Volume {
        name: CONFIG_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: name.clone(),
            items: Some(vec![KeyToPath {
                key: CONFIG_KEY.to_string(),
                path: CONFIG_FILE.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(BTreeMap::from([(
                        CONFIG_HASH_ANNOTATION.to_string(),
                        hash.to_string(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![volume]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn compile_service(metadata: ObjectMeta, instance: &CacheInstance) -> Service {
    let port = instance.spec.port;

    Service {
        metadata,
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            session_affinity: Some("None".to_string()),
            selector: Some(instance_labels(&instance.name_any())),
            ports: Some(vec![ServicePort {
                name: Some(PORT_NAME.to_string()),
                protocol: Some("TCP".to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheDefaults;
    use crate::crd::CacheSpec;
    use crate::template::{MockConfigRenderer, RedisConfigRenderer};

    fn instance(name: &str, spec: CacheSpec) -> CacheInstance {
        let mut ci = CacheInstance::new(name, spec);
        ci.metadata.namespace = Some("default".to_string());
        ci
    }

    fn defaulted(name: &str, spec: CacheSpec) -> CacheInstance {
        let (spec, _) = spec.with_defaults(&CacheDefaults::default());
        instance(name, spec)
    }

    fn pod_labels(d: &Deployment) -> BTreeMap<String, String> {
        d.spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.clone())
            .unwrap()
    }

    fn pod_hash(d: &Deployment) -> String {
        d.spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.annotations.as_ref())
            .and_then(|a| a.get(CONFIG_HASH_ANNOTATION).cloned())
            .unwrap()
    }

    // =========================================================================
    // Story: A freshly defaulted instance
    // =========================================================================

    /// Story: An instance with port and memory unset gets the defaults
    /// everywhere they surface
    #[test]
    fn story_default_instance_children() {
        let ci = defaulted("c1", CacheSpec::default());
        let renderer = RedisConfigRenderer::new();
        let set = build(&ci, &renderer).unwrap();

        // Service forwards the default port
        let svc = set.service.spec.as_ref().unwrap();
        let port = &svc.ports.as_ref().unwrap()[0];
        assert_eq!(port.port, 6379);
        assert_eq!(port.target_port, Some(IntOrString::Int(6379)));
        assert_eq!(port.name.as_deref(), Some("redis"));
        assert_eq!(port.protocol.as_deref(), Some("TCP"));
        assert_eq!(svc.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(svc.session_affinity.as_deref(), Some("None"));

        // ConfigMap holds the rendered default config
        let expected = renderer.render(&ci.spec).unwrap();
        let data = set.config_map.data.as_ref().unwrap();
        assert_eq!(data.get(CONFIG_KEY), Some(&expected));
        assert!(expected.contains("maxmemory 2mb"));

        // Deployment is annotated with the fingerprint of that config
        assert_eq!(pod_hash(&set.deployment), fingerprint(&expected));
        assert_eq!(set.fingerprint, fingerprint(&expected));
    }

    #[test]
    fn story_deployment_runs_one_configured_replica() {
        let ci = defaulted("c1", CacheSpec::default());
        let set = build(&ci, &RedisConfigRenderer::new()).unwrap();
        let spec = set.deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));

        let pod = spec.template.spec.as_ref().unwrap();
        let container = &pod.containers[0];
        assert_eq!(container.name, "c1");
        assert_eq!(container.image.as_deref(), Some("redis:4-alpine"));
        assert_eq!(
            container.command.as_ref().unwrap(),
            &vec!["redis-server".to_string(), CONFIG_PATH.to_string()]
        );
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 6379);

        let mount = &container.volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.name, CONFIG_VOLUME);
        assert_eq!(mount.mount_path, CONFIG_MOUNT_PATH);

        let volume = &pod.volumes.as_ref().unwrap()[0];
        let source = volume.config_map.as_ref().unwrap();
        assert_eq!(source.name, "c1");
        let item = &source.items.as_ref().unwrap()[0];
        assert_eq!(item.key, CONFIG_KEY);
        assert_eq!(item.path, CONFIG_FILE);
    }

    // =========================================================================
    // Story: Naming and labels
    // =========================================================================

    #[test]
    fn story_children_share_the_instance_identity() {
        let ci = defaulted("orders-cache", CacheSpec::default());
        let set = build(&ci, &RedisConfigRenderer::new()).unwrap();

        for child in set.in_apply_order() {
            assert_eq!(child.name(), "orders-cache");
            assert_eq!(child.namespace(), "default");
        }
        let kinds: Vec<_> = set.in_apply_order().iter().map(ChildObject::kind).collect();
        assert_eq!(
            kinds,
            vec![ChildKind::ConfigMap, ChildKind::Deployment, ChildKind::Service]
        );
    }

    #[test]
    fn story_instance_label_uses_the_operator_group() {
        let labels = instance_labels("c1");
        assert_eq!(
            labels.get("cache-operator.io/instance").map(String::as_str),
            Some("c1")
        );
        assert!(labels.keys().all(|k| !k.contains("lattice")));
    }

    #[test]
    fn story_selectors_match_pod_labels() {
        let ci = defaulted("c1", CacheSpec::default());
        let set = build(&ci, &RedisConfigRenderer::new()).unwrap();

        let pod = pod_labels(&set.deployment);
        let selector = set
            .deployment
            .spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.clone())
            .unwrap();
        let svc_selector = set
            .service
            .spec
            .as_ref()
            .and_then(|s| s.selector.clone())
            .unwrap();

        assert_eq!(pod, selector);
        assert_eq!(pod, svc_selector);
        assert_eq!(pod, instance_labels("c1"));
    }

    #[test]
    fn story_owner_reference_only_with_uid() {
        let ci = defaulted("c1", CacheSpec::default());
        let set = build(&ci, &RedisConfigRenderer::new()).unwrap();
        assert!(set.service.metadata.owner_references.is_none());

        let mut ci = ci;
        ci.metadata.uid = Some("1234-abcd".to_string());
        let set = build(&ci, &RedisConfigRenderer::new()).unwrap();
        let owners = set.config_map.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "CacheInstance");
        assert_eq!(owners[0].name, "c1");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn story_missing_namespace_is_rejected() {
        let (spec, _) = CacheSpec::default().with_defaults(&CacheDefaults::default());
        let ci = CacheInstance::new("c1", spec);
        assert!(matches!(
            build(&ci, &RedisConfigRenderer::new()),
            Err(Error::Validation(_))
        ));
    }

    // =========================================================================
    // Story: Fingerprinting
    // =========================================================================

    #[test]
    fn story_fingerprint_is_fixed_width_hex() {
        let fp = fingerprint("port 6379\n");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
        assert_eq!(fp, fingerprint("port 6379\n"));
        assert_ne!(fp, fingerprint("port 6380\n"));
    }

    #[test]
    fn story_config_change_changes_pod_annotation() {
        let renderer = RedisConfigRenderer::new();
        let a = build(&defaulted("c1", CacheSpec::default()), &renderer).unwrap();
        let b = build(
            &defaulted(
                "c1",
                CacheSpec {
                    max_memory: "64mb".to_string(),
                    ..Default::default()
                },
            ),
            &renderer,
        )
        .unwrap();
        let again = build(&defaulted("c1", CacheSpec::default()), &renderer).unwrap();

        assert_ne!(pod_hash(&a.deployment), pod_hash(&b.deployment));
        assert_eq!(pod_hash(&a.deployment), pod_hash(&again.deployment));
    }

    #[test]
    fn story_image_change_keeps_fingerprint() {
        let renderer = RedisConfigRenderer::new();
        let a = build(&defaulted("c1", CacheSpec::default()), &renderer).unwrap();
        let b = build(
            &defaulted(
                "c1",
                CacheSpec {
                    image: "redis:7-alpine".to_string(),
                    ..Default::default()
                },
            ),
            &renderer,
        )
        .unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_ne!(a.deployment, b.deployment);
    }

    #[test]
    fn story_render_failure_aborts_build() {
        let mut renderer = MockConfigRenderer::new();
        renderer
            .expect_render()
            .returning(|_| Err(Error::render("template exploded")));

        let ci = defaulted("c1", CacheSpec::default());
        assert!(matches!(build(&ci, &renderer), Err(Error::Render(_))));
    }
}
