//! Concurrent deletion of a prune set.
//!
//! Custom resource definitions and namespaces are deleted only once every
//! other resource is gone, since deleting them first would cascade into
//! objects that still have to be cleaned up in order.

use crate::cluster::{ClusterClient, DeleteOutcome};
use crate::error::{DeclarativeError, MultiError, Result};
use crate::resource::ResourceInfo;
use crate::task::fan_out;
use std::sync::Arc;
use tracing::{debug, warn};

const PREREQUISITE_KINDS: [&str; 2] = ["CustomResourceDefinition", "Namespace"];

/// Whether `info` must be deleted after everything else.
#[must_use]
pub fn is_prerequisite(info: &ResourceInfo) -> bool {
    PREREQUISITE_KINDS.contains(&info.kind())
}

/// Deletes resources in parallel and reports whether deletion finished.
pub struct ConcurrentCleanup {
    cluster: Arc<dyn ClusterClient>,
}

impl ConcurrentCleanup {
    /// Creates a cleanup for `cluster`.
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }

    /// Deletes all resources.
    ///
    /// Returns [`DeclarativeError::DeletionNotFinished`] while any object is
    /// still terminating and a multi error for hard failures.
    pub async fn run(&self, resources: &[ResourceInfo]) -> Result<()> {
        let (prerequisites, regular): (Vec<_>, Vec<_>) =
            resources.iter().cloned().partition(is_prerequisite);

        self.delete_all(&regular).await?;
        self.delete_all(&prerequisites).await
    }

    async fn delete_all(&self, resources: &[ResourceInfo]) -> Result<()> {
        if resources.is_empty() {
            return Ok(());
        }

        let mut results = fan_out(resources, |info| {
            let cluster = Arc::clone(&self.cluster);
            async move {
                cluster
                    .delete(&info)
                    .await
                    .map_err(|e| e.for_resource(&info))
            }
        });

        let mut pending = 0usize;
        let mut errs = MultiError::default();
        for _ in 0..resources.len() {
            match results.recv().await {
                Some(Ok(DeleteOutcome::Deleted)) => {}
                Some(Ok(DeleteOutcome::Pending)) => pending += 1,
                Some(Err(e)) => {
                    warn!("Delete failed: {}", e);
                    errs.push(e);
                }
                None => break,
            }
        }

        if !errs.is_empty() {
            return errs.into_result();
        }
        if pending > 0 {
            debug!("{} of {} resource(s) still terminating", pending, resources.len());
            return Err(DeclarativeError::DeletionNotFinished);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCluster, test_infos};

    #[tokio::test]
    async fn test_absent_resource_counts_as_deleted() {
        let cluster = Arc::new(MockCluster::new());
        let infos = test_infos(&cluster, &["gone"]).await;

        ConcurrentCleanup::new(cluster.clone()).run(&infos).await.unwrap();
        assert_eq!(cluster.deleted_names(), vec!["gone"]);
    }

    #[tokio::test]
    async fn test_terminating_resource_is_not_finished() {
        let cluster = Arc::new(MockCluster::new());
        let infos = test_infos(&cluster, &["a", "b"]).await;
        cluster.insert_all(&infos);
        cluster.block_deletion("b");

        let err = ConcurrentCleanup::new(cluster.clone()).run(&infos).await.unwrap_err();
        assert!(matches!(err, DeclarativeError::DeletionNotFinished));
        assert!(!cluster.contains("ConfigMap", "default", "a"));
        assert!(cluster.contains("ConfigMap", "default", "b"));
    }

    #[tokio::test]
    async fn test_hard_failure_wins_over_pending() {
        let cluster = Arc::new(MockCluster::new());
        let infos = test_infos(&cluster, &["a", "b"]).await;
        cluster.insert_all(&infos);
        cluster.block_deletion("a");
        cluster.fail_delete("b");

        let err = ConcurrentCleanup::new(cluster).run(&infos).await.unwrap_err();
        assert!(matches!(err, DeclarativeError::Multi(_)));
    }

    #[tokio::test]
    async fn test_namespaces_are_deleted_last() {
        let cluster = Arc::new(MockCluster::new());
        let mut infos = cluster
            .infos_from_yaml("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: team\n")
            .await;
        infos.extend(test_infos(&cluster, &["a"]).await);
        cluster.insert_all(&infos);
        cluster.block_deletion("a");

        let err = ConcurrentCleanup::new(cluster.clone()).run(&infos).await.unwrap_err();
        assert!(matches!(err, DeclarativeError::DeletionNotFinished));
        assert!(cluster.contains("Namespace", "", "team"));
        assert_eq!(cluster.deleted_names(), vec!["a"]);
    }
}
