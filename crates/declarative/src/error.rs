//! Reconciliation errors
//!
//! Besides hard failures, a few variants are expected signals that only ask
//! the caller to requeue: [`DeclarativeError::ResourcesNotReady`],
//! [`DeclarativeError::DeletionNotFinished`],
//! [`DeclarativeError::ResourceSyncStateDiff`] and the status correction
//! variants.

use std::fmt;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = DeclarativeError> = std::result::Result<T, E>;

/// Errors that can occur while reconciling a Manifest
#[derive(Debug, Error)]
pub enum DeclarativeError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rendered text could not be parsed into objects
    #[error("Manifest parsing error: {0}")]
    Parse(String),

    /// Renderer failed
    #[error("Render error: {0}")]
    Render(String),

    /// Spec could not be resolved
    #[error("Spec error: {0}")]
    Spec(String),

    /// No REST mapping could be found for a kind
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Target cluster client could not be built
    #[error("Client initialization error: {0}")]
    ClientInit(String),

    /// Object is malformed (missing name, kind, apiVersion)
    #[error("Invalid object: {0}")]
    InvalidObject(String),

    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Write rejected because the object changed underneath
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Operation on a single resource failed
    #[error("{resource}: {source}")]
    Resource {
        /// Resource the operation targeted
        resource: String,
        /// Underlying failure
        source: Box<DeclarativeError>,
    },

    /// A resource reached a terminal failure (e.g. a failed Job)
    #[error("Resource failed: {0}")]
    Failed(String),

    /// Hook returned an error
    #[error("Hook error: {0}")]
    Hook(String),

    /// At least one resource is not ready yet
    #[error("resources are not ready")]
    ResourcesNotReady,

    /// Some deleted resources still carry a deletion timestamp
    #[error("deletion of resources is not finished")]
    DeletionNotFinished,

    /// The synced set changed and has to be persisted first
    #[error("resource syncTarget state diff detected")]
    ResourceSyncStateDiff,

    /// The installation condition flipped and has to be persisted first
    #[error("installation condition needs an update")]
    InstallationConditionRequiresUpdate,

    /// Deletion timestamp set while the state is not Deleting
    #[error("resource is not set to deleting yet")]
    DeletionTimestampSetButNotInDeletingState,

    /// Status has no state yet
    #[error("object has an empty state")]
    ObjectHasEmptyState,

    /// Ready instance whose generation moved past the observed one
    #[error("object generation changed")]
    GenerationChanged,

    /// Several concurrent operations failed
    #[error("{0}")]
    Multi(MultiError),
}

impl DeclarativeError {
    /// Attaches the resource an operation failed on.
    pub fn for_resource(self, resource: impl std::fmt::Display) -> Self {
        DeclarativeError::Resource {
            resource: resource.to_string(),
            source: Box::new(self),
        }
    }

    /// Whether the API server rejected a write with 409.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        match self {
            DeclarativeError::Conflict(_) => true,
            DeclarativeError::Kube(kube::Error::Api(ae)) => ae.code == 409,
            _ => false,
        }
    }

    /// Whether the object was not found.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            DeclarativeError::NotFound(_) => true,
            DeclarativeError::Kube(err) => is_not_found(err),
            _ => false,
        }
    }

    /// Whether this only asks for a retry and never moves to Error.
    #[must_use]
    pub fn is_retry(&self) -> bool {
        matches!(
            self,
            DeclarativeError::ResourcesNotReady
                | DeclarativeError::DeletionNotFinished
                | DeclarativeError::ResourceSyncStateDiff
                | DeclarativeError::InstallationConditionRequiresUpdate
                | DeclarativeError::DeletionTimestampSetButNotInDeletingState
                | DeclarativeError::ObjectHasEmptyState
                | DeclarativeError::GenerationChanged
        )
    }
}

/// Whether a kube error is a 404.
#[must_use]
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Aggregate of errors from concurrent per-resource operations.
#[derive(Debug, Default)]
pub struct MultiError {
    /// Individual failures, in arrival order
    pub errors: Vec<DeclarativeError>,
}

impl MultiError {
    /// Collapses the collected errors: none is `Ok`, one or more is a `Multi`.
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(DeclarativeError::Multi(self))
        }
    }

    /// Number of collected errors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Whether nothing failed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds a failure.
    pub fn push(&mut self, err: DeclarativeError) {
        self.errors.push(err);
    }
}

impl From<Vec<DeclarativeError>> for MultiError {
    fn from(errors: Vec<DeclarativeError>) -> Self {
        Self { errors }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, " [{err}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
