//! Error types for the cache operator

use thiserror::Error;

/// Main error type for cache operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The object store has no object with this identity
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the child object (ConfigMap, Deployment, Service)
        kind: String,
        /// Name of the child object
        name: String,
    },

    /// The object store already holds an object with this identity
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Kind of the child object
        kind: String,
        /// Name of the child object
        name: String,
    },

    /// Rendering the cache configuration failed
    #[error("render error: {0}")]
    Render(String),

    /// Any other object store failure while applying or deleting a child
    #[error("apply error for {kind} {name}: {message}")]
    Apply {
        /// Kind of the child object
        kind: String,
        /// Name of the child object
        name: String,
        /// Description of what failed
        message: String,
    },

    /// Kubernetes API error outside of child object handling
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid operator configuration
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a not-found error for a child object
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error for a child object
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a render error with the given message
    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render(msg.into())
    }

    /// Create an apply error for a child object
    pub fn apply(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Apply {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True when the object store reported the object as absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when the object store reported the object as already present
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}
