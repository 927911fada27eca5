//! Operator configuration
//!
//! Every constant the reconciler depends on (spec defaults, the memory
//! ceiling, the apply policy, the requeue delay) lives here so it can be
//! overridden from the command line and in tests without global state.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::validation::{MemoryQuantity, MemoryUnit};
use crate::Error;

/// Default container image for a cache instance
pub const DEFAULT_IMAGE: &str = "redis:4-alpine";

/// Default cache port
pub const DEFAULT_PORT: i32 = 6379;

/// Default `maxmemory` setting
pub const DEFAULT_MAX_MEMORY: &str = "2mb";

/// Default `maxmemory-policy` setting
pub const DEFAULT_EVICTION_POLICY: &str = "allkeys-lru";

/// Default requeue delay after a failed reconciliation
pub const DEFAULT_REQUEUE_SECS: u64 = 5;

/// Values written into unset `CacheSpec` fields
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheDefaults {
    /// Container image
    pub image: String,
    /// Cache port
    pub port: i32,
    /// Memory ceiling handed to the cache process
    pub max_memory: String,
    /// Eviction policy name
    pub max_memory_eviction_policy: String,
}

impl Default for CacheDefaults {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            port: DEFAULT_PORT,
            max_memory: DEFAULT_MAX_MEMORY.to_string(),
            max_memory_eviction_policy: DEFAULT_EVICTION_POLICY.to_string(),
        }
    }
}

/// Limits checked by the validator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationLimits {
    /// Largest `maxMemory` an instance may request
    pub max_memory: MemoryQuantity,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_memory: MemoryQuantity::new(5, MemoryUnit::Gigabytes),
        }
    }
}

impl ValidationLimits {
    /// Build limits from a memory ceiling such as `"5gb"`
    pub fn with_max_memory(ceiling: &str) -> Result<Self, Error> {
        let max_memory = ceiling
            .parse::<MemoryQuantity>()
            .map_err(|e| Error::validation(format!("invalid memory ceiling: {e}")))?;
        if max_memory.bytes().is_none() {
            return Err(Error::validation(format!(
                "memory ceiling {ceiling} does not fit in 64 bits"
            )));
        }
        Ok(Self { max_memory })
    }
}

/// When the reconciler writes child objects
///
/// `DefaultingGate` only writes when defaulting filled at least one field
/// during this event. Edits from one explicit value to another do not
/// trigger a write under this policy. `Always` writes on every event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ApplyPolicy {
    /// Write only when defaulting changed the spec
    #[default]
    DefaultingGate,
    /// Write on every create/update event
    Always,
}

impl ApplyPolicy {
    /// Decide whether this event writes children, given the defaulting result
    pub fn should_apply(self, defaults_changed: bool) -> bool {
        match self {
            Self::DefaultingGate => defaults_changed,
            Self::Always => true,
        }
    }
}

impl FromStr for ApplyPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "defaulting-gate" => Ok(Self::DefaultingGate),
            "always" => Ok(Self::Always),
            _ => Err(Error::validation(format!(
                "invalid apply policy: {s}, expected one of: defaulting-gate, always"
            ))),
        }
    }
}

impl fmt::Display for ApplyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DefaultingGate => write!(f, "defaulting-gate"),
            Self::Always => write!(f, "always"),
        }
    }
}

/// Complete operator configuration shared by every reconciliation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Spec defaults
    pub defaults: CacheDefaults,
    /// Validator limits
    pub limits: ValidationLimits,
    /// Write gate
    pub apply_policy: ApplyPolicy,
    /// Delay before the runtime redelivers a failed event
    pub requeue_after: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            defaults: CacheDefaults::default(),
            limits: ValidationLimits::default(),
            apply_policy: ApplyPolicy::default(),
            requeue_after: Duration::from_secs(DEFAULT_REQUEUE_SECS),
        }
    }
}

impl OperatorConfig {
    /// Reject configurations that would make the defaulted spec invalid
    pub fn validate(&self) -> Result<(), Error> {
        if self.defaults.image.is_empty() {
            return Err(Error::validation("default image must not be empty"));
        }
        if self.defaults.port <= 0 || self.defaults.port > i32::from(u16::MAX) {
            return Err(Error::validation(format!(
                "default port {} is outside 1-65535",
                self.defaults.port
            )));
        }
        if self.defaults.max_memory_eviction_policy.is_empty() {
            return Err(Error::validation("default eviction policy must not be empty"));
        }
        self.defaults
            .max_memory
            .parse::<MemoryQuantity>()
            .map_err(|e| Error::validation(format!("invalid default max memory: {e}")))?;
        Ok(())
    }
}
