//! Extension points around rendering, applying and deletion.

use crate::cluster::ClusterClient;
use crate::error::Result;
use async_trait::async_trait;
use crds::Manifest;
use kube::core::DynamicObject;
use kube::ResourceExt;

/// Label naming the controller that manages an object.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Label naming the owning Manifest as `namespace__name`.
pub const OWNED_BY_LABEL: &str = "operator.declarative.io/owned-by";

/// Mutates parsed objects before they are resolved and applied.
#[async_trait]
pub trait PostRenderTransform: Send + Sync {
    /// Transforms `objects` in place.
    async fn transform(&self, obj: &Manifest, objects: &mut [DynamicObject]) -> Result<()>;
}

/// Runs after a successful apply, before readiness is checked.
#[async_trait]
pub trait PostRun: Send + Sync {
    /// Runs the hook against the target cluster.
    async fn run(&self, cluster: &dyn ClusterClient, obj: &Manifest) -> Result<()>;
}

/// Runs before resources are pruned during deletion.
#[async_trait]
pub trait PreDelete: Send + Sync {
    /// Runs the hook against the target cluster.
    async fn run(&self, cluster: &dyn ClusterClient, obj: &Manifest) -> Result<()>;
}

/// Stamps managed-by and owner labels onto every rendered object.
#[derive(Debug, Clone)]
pub struct ManagedByLabels {
    manager: String,
}

impl ManagedByLabels {
    /// Objects are labelled as managed by `manager`.
    pub fn new(manager: impl Into<String>) -> Self {
        Self {
            manager: manager.into(),
        }
    }
}

#[async_trait]
impl PostRenderTransform for ManagedByLabels {
    async fn transform(&self, obj: &Manifest, objects: &mut [DynamicObject]) -> Result<()> {
        let owner = format!("{}__{}", obj.namespace().unwrap_or_default(), obj.name_any());
        for object in objects.iter_mut() {
            let labels = object.labels_mut();
            labels.insert(MANAGED_BY_LABEL.to_string(), self.manager.clone());
            labels.insert(OWNED_BY_LABEL.to_string(), owner.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parse_manifests;
    use crate::mock::test_manifest;

    #[tokio::test]
    async fn test_labels_every_object() {
        let mut objects = parse_manifests(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n  labels:\n    keep: me\n---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: b\n",
        )
        .unwrap();

        ManagedByLabels::new("declarative")
            .transform(&test_manifest("m"), &mut objects)
            .await
            .unwrap();

        for object in &objects {
            assert_eq!(object.labels()[MANAGED_BY_LABEL], "declarative");
            assert_eq!(object.labels()[OWNED_BY_LABEL], "default__m");
        }
        assert_eq!(objects[0].labels()["keep"], "me");
    }
}
