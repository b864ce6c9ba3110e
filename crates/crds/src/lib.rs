//! Manifest CRD Definitions
//!
//! Kubernetes Custom Resource Definitions consumed by the declarative
//! reconciler and the manifest controller.

pub mod manifest;

pub use manifest::*;
