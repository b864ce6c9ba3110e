//! Controller-specific error types.
//!
//! Engine failures are carried as [`DeclarativeError`]; everything else the
//! controller can fail on is listed here.

use declarative::DeclarativeError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the Manifest Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Reconciliation engine error
    #[error("Reconciliation failed: {0}")]
    Declarative(#[from] DeclarativeError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}
