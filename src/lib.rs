//! Cache Operator - CRD-driven Kubernetes operator for cache instances
//!
//! A `CacheInstance` declares one cache deployment. The operator keeps three
//! children in step with it: a ConfigMap holding the rendered server
//! configuration, a single-replica Deployment running the server, and a
//! ClusterIP Service exposing it. Children are removed when the instance is
//! deleted.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definition (CacheInstance)
//! - [`controller`] - Event dispatch, reconciliation and teardown
//! - [`workload`] - Desired child objects and configuration fingerprinting
//! - [`template`] - Configuration file rendering
//! - [`validation`] - Memory quantity parsing and spec checks
//! - [`config`] - Operator defaults, limits and apply policy
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod template;
pub mod validation;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
