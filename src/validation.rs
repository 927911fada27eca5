//! CacheSpec validation
//!
//! Checks that are advisory rather than blocking: the reconciler still
//! applies the children, and the violations end up in `status.errors`.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::config::ValidationLimits;
use crate::crd::CacheSpec;

/// `<integer><unit>` with nothing before or after
static MEMORY_QUANTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9]+)([A-Za-z]+)$").expect("memory quantity pattern is hardcoded and valid")
});

/// Lowercase RFC 1123 subdomain, the shape of a Secret name
static SECRET_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("secret name pattern is hardcoded and valid")
});

const MAX_SECRET_NAME_LEN: usize = 253;

/// Whether `name` can name a Secret
///
/// An empty name means no secret is referenced and is accepted.
pub fn is_valid_secret_name(name: &str) -> bool {
    name.is_empty() || (name.len() <= MAX_SECRET_NAME_LEN && SECRET_NAME.is_match(name))
}

/// Binary memory units accepted in `maxMemory`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryUnit {
    /// b
    Bytes,
    /// kb (1024 b)
    Kilobytes,
    /// mb (1024 kb)
    Megabytes,
    /// gb (1024 mb)
    Gigabytes,
    /// tb (1024 gb)
    Terabytes,
}

impl MemoryUnit {
    /// Number of bytes in one of this unit
    pub fn multiplier(self) -> u64 {
        match self {
            Self::Bytes => 1,
            Self::Kilobytes => 1 << 10,
            Self::Megabytes => 1 << 20,
            Self::Gigabytes => 1 << 30,
            Self::Terabytes => 1 << 40,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Self::Bytes => "b",
            Self::Kilobytes => "kb",
            Self::Megabytes => "mb",
            Self::Gigabytes => "gb",
            Self::Terabytes => "tb",
        }
    }
}

impl FromStr for MemoryUnit {
    type Err = MemoryParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "b" => Ok(Self::Bytes),
            "kb" => Ok(Self::Kilobytes),
            "mb" => Ok(Self::Megabytes),
            "gb" => Ok(Self::Gigabytes),
            "tb" => Ok(Self::Terabytes),
            _ => Err(MemoryParseError::UnsupportedUnit(s.to_string())),
        }
    }
}

/// Why a memory quantity string was rejected
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MemoryParseError {
    /// The string is not `<integer><unit>`
    #[error("'{0}' is not of the form <integer><unit>")]
    Malformed(String),
    /// The unit is not one of b, kb, mb, gb, tb
    #[error("unsupported unit '{0}', expected one of: b, kb, mb, gb, tb")]
    UnsupportedUnit(String),
    /// The quantity does not fit in 64 bits of bytes
    #[error("'{0}' is too large")]
    Overflow(String),
}

/// A parsed memory quantity such as `2mb`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryQuantity {
    amount: u64,
    unit: MemoryUnit,
}

impl MemoryQuantity {
    /// Create a quantity from an amount and a unit
    pub fn new(amount: u64, unit: MemoryUnit) -> Self {
        Self { amount, unit }
    }

    /// Size in bytes, or `None` if it overflows
    pub fn bytes(&self) -> Option<u64> {
        self.amount.checked_mul(self.unit.multiplier())
    }
}

impl FromStr for MemoryQuantity {
    type Err = MemoryParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = MEMORY_QUANTITY
            .captures(s.trim())
            .ok_or_else(|| MemoryParseError::Malformed(s.to_string()))?;

        let (digits, unit) = match (caps.get(1), caps.get(2)) {
            (Some(d), Some(u)) => (d.as_str(), u.as_str()),
            _ => return Err(MemoryParseError::Malformed(s.to_string())),
        };

        let amount = digits
            .parse::<u64>()
            .map_err(|_| MemoryParseError::Overflow(s.to_string()))?;

        Ok(Self {
            amount,
            unit: unit.parse()?,
        })
    }
}

impl fmt::Display for MemoryQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.unit.suffix())
    }
}

/// Convert a memory quantity string to bytes
pub fn convert_to_bytes(memory: &str) -> Result<u64, MemoryParseError> {
    let quantity = memory.parse::<MemoryQuantity>()?;
    quantity
        .bytes()
        .ok_or_else(|| MemoryParseError::Overflow(memory.to_string()))
}

/// A single spec violation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Violation {
    /// `maxMemory` could not be parsed
    UnsupportedUnit {
        /// The rejected value
        value: String,
        /// Parser detail
        reason: MemoryParseError,
    },
    /// `maxMemory` is above the configured ceiling
    MaxMemoryExceeded {
        /// The requested value
        requested: String,
        /// The configured ceiling
        ceiling: MemoryQuantity,
    },
    /// `passwordSecret` is not a valid Secret name
    InvalidSecretName {
        /// The rejected value
        value: String,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedUnit { value, reason } => write!(
                f,
                "maxMemory setting ( {value} ) has an unsupported unit: {reason}"
            ),
            Self::MaxMemoryExceeded { requested, ceiling } => write!(
                f,
                "maxMemory setting ( {requested} ) greater than allowed maxMemory ( {ceiling} )"
            ),
            Self::InvalidSecretName { value } => {
                write!(f, "passwordSecret {value:?} is not a valid Secret name")
            }
        }
    }
}

/// Check a spec against the limits, returning structured violations
pub fn violations(spec: &CacheSpec, limits: &ValidationLimits) -> Vec<Violation> {
    let mut found = Vec::new();

    match convert_to_bytes(&spec.max_memory) {
        Ok(requested) => {
            // An unrepresentable ceiling admits everything.
            let over = limits
                .max_memory
                .bytes()
                .is_some_and(|ceiling| requested > ceiling);
            if over {
                found.push(Violation::MaxMemoryExceeded {
                    requested: spec.max_memory.clone(),
                    ceiling: limits.max_memory,
                });
            }
        }
        Err(reason) => found.push(Violation::UnsupportedUnit {
            value: spec.max_memory.clone(),
            reason,
        }),
    }

    if !is_valid_secret_name(&spec.password_secret) {
        found.push(Violation::InvalidSecretName {
            value: spec.password_secret.clone(),
        });
    }

    found
}

/// Check a spec against the limits, returning human-readable messages
///
/// An empty result means the spec is valid.
pub fn validate(spec: &CacheSpec, limits: &ValidationLimits) -> Vec<String> {
    violations(spec, limits)
        .iter()
        .map(ToString::to_string)
        .collect()
}
