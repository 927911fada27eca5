//! CacheInstance Custom Resource Definition
//!
//! A CacheInstance declares one cache deployment. The operator derives a
//! ConfigMap, a Deployment and a Service from it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::CachePhase;
use crate::config::CacheDefaults;

/// Specification for a CacheInstance
///
/// Every field may be left at its zero value; the reconciler fills those
/// from the operator's [`CacheDefaults`] before deriving children.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cache-operator.io",
    version = "v1alpha1",
    kind = "CacheInstance",
    plural = "cacheinstances",
    shortname = "ci",
    status = "CacheStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"MaxMemory","type":"string","jsonPath":".spec.maxMemory"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CacheSpec {
    /// Container image; empty selects the default
    #[serde(default)]
    pub image: String,

    /// Port the cache listens on and the Service exposes; zero selects the default
    #[serde(default)]
    pub port: i32,

    /// Name of the secret holding the access credential
    #[serde(default)]
    pub password_secret: String,

    /// Memory ceiling such as `2mb`; empty selects the default
    #[serde(default)]
    pub max_memory: String,

    /// Eviction policy name; empty selects the default
    #[serde(default)]
    pub max_memory_eviction_policy: String,
}

impl CacheSpec {
    /// Return a copy with every zero-valued field replaced by its default
    ///
    /// The boolean is true when at least one field was filled. Fields that
    /// are already set are never overwritten, so applying the result again
    /// returns it unchanged with `false`.
    pub fn with_defaults(&self, defaults: &CacheDefaults) -> (CacheSpec, bool) {
        let mut spec = self.clone();
        let mut changed = false;

        if spec.max_memory.is_empty() {
            spec.max_memory = defaults.max_memory.clone();
            changed = true;
        }

        if spec.max_memory_eviction_policy.is_empty() {
            spec.max_memory_eviction_policy = defaults.max_memory_eviction_policy.clone();
            changed = true;
        }

        if spec.port == 0 {
            spec.port = defaults.port;
            changed = true;
        }

        if spec.image.is_empty() {
            spec.image = defaults.image.clone();
            changed = true;
        }

        (spec, changed)
    }
}

/// Status for a CacheInstance
///
/// Observational only; reconciliation never reads it back.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    /// Outcome of the last reconciliation
    #[serde(default)]
    pub phase: CachePhase,

    /// Spec violations and reconciliation errors, in the order found
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl CacheStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: CachePhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Append an error message and return self for chaining
    pub fn error(mut self, msg: impl Into<String>) -> Self {
        self.errors.push(msg.into());
        self
    }

    /// Append several error messages and return self for chaining
    pub fn errors(mut self, msgs: impl IntoIterator<Item = String>) -> Self {
        self.errors.extend(msgs);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn full_spec() -> CacheSpec {
        CacheSpec {
            image: "redis:7-alpine".to_string(),
            port: 6380,
            password_secret: "cache-auth".to_string(),
            max_memory: "64mb".to_string(),
            max_memory_eviction_policy: "volatile-lru".to_string(),
        }
    }

    // =========================================================================
    // Defaulting Stories
    // =========================================================================

    /// Story: An empty spec is filled with every default
    #[test]
    fn story_empty_spec_gets_all_defaults() {
        let (spec, changed) = CacheSpec::default().with_defaults(&CacheDefaults::default());

        assert!(changed);
        assert_eq!(spec.image, "redis:4-alpine");
        assert_eq!(spec.port, 6379);
        assert_eq!(spec.max_memory, "2mb");
        assert_eq!(spec.max_memory_eviction_policy, "allkeys-lru");
        // No default exists for the credential reference
        assert!(spec.password_secret.is_empty());
    }

    /// Story: Defaulting twice is the same as defaulting once
    #[test]
    fn story_defaulting_is_idempotent() {
        let defaults = CacheDefaults::default();
        let partial = CacheSpec {
            port: 7000,
            ..Default::default()
        };

        let (once, first_changed) = partial.with_defaults(&defaults);
        let (twice, second_changed) = once.with_defaults(&defaults);

        assert!(first_changed);
        assert!(!second_changed);
        assert_eq!(once, twice);
    }

    /// Story: Fields the user set are never overwritten
    #[test]
    fn story_user_values_survive_defaulting() {
        let spec = full_spec();
        let (defaulted, changed) = spec.with_defaults(&CacheDefaults::default());

        assert!(!changed);
        assert_eq!(defaulted, spec);
    }

    /// Story: A single missing field is enough to report a change
    #[test]
    fn story_each_field_sets_changed() {
        let defaults = CacheDefaults::default();
        let blanks: [fn(&mut CacheSpec); 4] = [
            |s| s.image.clear(),
            |s| s.port = 0,
            |s| s.max_memory.clear(),
            |s| s.max_memory_eviction_policy.clear(),
        ];

        for blank in blanks {
            let mut spec = full_spec();
            blank(&mut spec);
            let (_, changed) = spec.with_defaults(&defaults);
            assert!(changed);
        }
    }

    /// Story: Defaulting never mutates the caller's spec
    #[test]
    fn story_defaulting_leaves_input_untouched() {
        let original = CacheSpec::default();
        let _ = original.with_defaults(&CacheDefaults::default());
        assert_eq!(original, CacheSpec::default());
    }

    /// Story: Operators can change the defaults without touching code
    #[test]
    fn story_custom_defaults_are_used() {
        let defaults = CacheDefaults {
            image: "registry.local/redis:7".to_string(),
            port: 16379,
            max_memory: "128mb".to_string(),
            max_memory_eviction_policy: "noeviction".to_string(),
        };
        let (spec, _) = CacheSpec::default().with_defaults(&defaults);
        assert_eq!(spec.image, "registry.local/redis:7");
        assert_eq!(spec.port, 16379);
        assert_eq!(spec.max_memory, "128mb");
        assert_eq!(spec.max_memory_eviction_policy, "noeviction");
    }

    // =========================================================================
    // Wire Format Stories
    // =========================================================================

    /// Story: Users write camelCase YAML and may omit any field
    #[test]
    fn story_spec_deserializes_from_sparse_yaml() {
        let yaml = r#"
port: 6380
passwordSecret: cache-auth
maxMemoryEvictionPolicy: volatile-ttl
"#;
        let spec: CacheSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.port, 6380);
        assert_eq!(spec.password_secret, "cache-auth");
        assert_eq!(spec.max_memory_eviction_policy, "volatile-ttl");
        assert!(spec.image.is_empty());
        assert!(spec.max_memory.is_empty());
    }

    /// Story: Status serializes the phase and omits an empty error list
    #[test]
    fn story_status_serialization() {
        let status = CacheStatus::with_phase(CachePhase::Reconciled);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "Reconciled");
        assert!(json.get("errors").is_none());

        let status = CacheStatus::with_phase(CachePhase::Failed)
            .error("first")
            .errors(vec!["second".to_string()]);
        assert_eq!(status.errors, vec!["first", "second"]);
    }

    /// Story: The generated CRD is namespaced and carries a status subresource
    #[test]
    fn story_crd_shape() {
        let crd = CacheInstance::crd();
        assert_eq!(
            crd.metadata.name.as_deref(),
            Some("cacheinstances.cache-operator.io")
        );
        assert_eq!(crd.spec.scope, "Namespaced");
        let version = &crd.spec.versions[0];
        assert_eq!(version.name, "v1alpha1");
        assert!(version
            .subresources
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .is_some());
    }
}
