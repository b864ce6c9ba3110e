//! Mirroring of a Manifest into its target cluster.
//!
//! The remote copy carries the finalizer too, so it cannot disappear before
//! the native instance finished its cleanup.

use crate::cluster::{ClusterClient, DeleteOutcome};
use crate::error::Result;
use crate::resource::ResourceInfo;
use crds::{Manifest, SyncStrategy, MANIFEST_FINALIZER};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::{Resource, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

fn remote_namespace(obj: &Manifest) -> String {
    if obj.spec.sync.namespace.is_empty() {
        obj.namespace().unwrap_or_default()
    } else {
        obj.spec.sync.namespace.clone()
    }
}

/// Whether `obj` asks for a remote copy that is not the instance itself.
///
/// The local client with the instance's own namespace resolves to the native
/// object, so nothing is mirrored.
#[must_use]
pub fn should_sync(obj: &Manifest) -> bool {
    obj.spec.sync.enabled
        && !(obj.spec.sync.strategy == SyncStrategy::LocalClient
            && remote_namespace(obj) == obj.namespace().unwrap_or_default())
}

/// Keeps the remote copy of an instance in step with the native one.
pub struct RemoteSync {
    cluster: Arc<dyn ClusterClient>,
    field_owner: String,
}

impl RemoteSync {
    /// Syncs through `cluster`, the instance's target cluster.
    pub fn new(cluster: Arc<dyn ClusterClient>, field_owner: impl Into<String>) -> Self {
        Self {
            cluster,
            field_owner: field_owner.into(),
        }
    }

    async fn remote_info(&self, obj: &Manifest) -> Result<ResourceInfo> {
        let gvk = GroupVersionKind::gvk(&Manifest::group(&()), &Manifest::version(&()), &Manifest::kind(&()));
        let mapping = self.cluster.mapping(&gvk).await?;
        let namespace = remote_namespace(obj);

        let mut object = DynamicObject::new(&obj.name_any(), &mapping.api_resource).within(&namespace);
        object.metadata.labels = obj.metadata.labels.clone();
        object.metadata.finalizers = Some(vec![MANIFEST_FINALIZER.to_string()]);
        object.data = json!({ "spec": obj.spec });
        Ok(ResourceInfo::new(object, mapping))
    }

    /// Applies the spec copy and pushes the native status onto it.
    pub async fn sync_to_remote(&self, obj: &Manifest) -> Result<()> {
        let mut info = self.remote_info(obj).await?;
        self.cluster.apply(&info, &self.field_owner).await?;

        info.object.metadata.finalizers = None;
        info.object.data = json!({ "status": obj.status_or_default() });
        self.cluster.apply_status(&info, &self.field_owner).await?;
        debug!("Synced {} to remote namespace {}", obj.name_any(), info.namespace().unwrap_or_default());
        Ok(())
    }

    /// Deletes the remote copy.
    pub async fn delete_remote(&self, obj: &Manifest) -> Result<DeleteOutcome> {
        let info = self.remote_info(obj).await?;
        self.cluster.delete(&info).await
    }

    /// Drops the finalizer from the remote copy so its deletion can finish.
    pub async fn remove_remote_finalizer(&self, obj: &Manifest) -> Result<()> {
        let info = self.remote_info(obj).await?;
        let Some(remote) = self.cluster.get(&info).await? else {
            return Ok(());
        };
        let finalizers: Vec<String> = remote
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != MANIFEST_FINALIZER)
            .cloned()
            .collect();
        if finalizers.len() == remote.finalizers().len() {
            return Ok(());
        }
        self.cluster
            .patch_merge(&info, &json!({ "metadata": { "finalizers": finalizers } }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCluster, test_manifest};
    use crds::State;

    #[tokio::test]
    async fn test_sync_delete_and_release() {
        let cluster = Arc::new(MockCluster::new());
        let remote = RemoteSync::new(cluster.clone(), "owner");
        let mut obj = test_manifest("m");
        obj.spec.sync.enabled = true;
        obj.spec.sync.namespace = "kyma-system".to_string();
        obj.status = Some(crds::ManifestStatus::default().with_state(State::Ready));

        remote.sync_to_remote(&obj).await.unwrap();
        assert!(cluster.contains("Manifest", "kyma-system", "m"));
        assert_eq!(cluster.status_of("Manifest", "kyma-system", "m").unwrap()["state"], "Ready");

        cluster.block_deletion("m");
        assert_eq!(remote.delete_remote(&obj).await.unwrap(), DeleteOutcome::Pending);

        remote.remove_remote_finalizer(&obj).await.unwrap();
        assert!(!cluster.contains("Manifest", "kyma-system", "m"));
    }

    #[test]
    fn test_local_copy_in_own_namespace_is_not_synced() {
        let mut obj = test_manifest("m");
        assert!(!should_sync(&obj));

        obj.spec.sync.enabled = true;
        assert!(!should_sync(&obj));
        obj.spec.sync.namespace = "default".to_string();
        assert!(!should_sync(&obj));

        obj.spec.sync.namespace = "kyma-system".to_string();
        assert!(should_sync(&obj));

        obj.spec.sync.namespace = String::new();
        obj.spec.sync.strategy = SyncStrategy::Secret;
        assert!(should_sync(&obj));
    }
}
