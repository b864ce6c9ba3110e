//! Access to the Manifest instances on the control-plane cluster.

use crate::error::Result;
use async_trait::async_trait;
use crds::{Manifest, OverrideSelector};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::warn;

/// Event published on an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceEvent {
    /// Warning rather than Normal
    pub warning: bool,
    /// Short reason, e.g. `ServerSideApply`
    pub reason: String,
    /// Human readable message
    pub message: String,
}

impl InstanceEvent {
    /// Normal event.
    pub fn normal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            warning: false,
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Warning event.
    pub fn warning(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            warning: true,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Reads and writes Manifest instances.
#[async_trait]
pub trait InstanceClient: Send + Sync {
    /// Latest version of an instance.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Manifest>>;

    /// Server-side applies `obj.status` with forced ownership.
    async fn apply_status(&self, obj: &Manifest, field_owner: &str) -> Result<()>;

    /// Adds `finalizer` through a server-side apply of the metadata.
    async fn add_finalizer(&self, obj: &Manifest, finalizer: &str, field_owner: &str) -> Result<()>;

    /// Removes `finalizer`, guarded by the object's resourceVersion.
    async fn remove_finalizer(&self, obj: &Manifest, finalizer: &str) -> Result<()>;

    /// Publishes an event. Failures are only logged.
    async fn publish_event(&self, obj: &Manifest, event: InstanceEvent);

    /// Data of every ConfigMap in `namespace` matching `selector`, merged in name order.
    async fn override_values(
        &self,
        namespace: &str,
        selector: &OverrideSelector,
    ) -> Result<BTreeMap<String, String>>;
}

/// [`InstanceClient`] backed by the kube API.
#[derive(Clone)]
pub struct KubeInstanceClient {
    client: Client,
    reporter: Reporter,
}

impl std::fmt::Debug for KubeInstanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeInstanceClient")
            .field("reporter", &self.reporter.controller)
            .finish_non_exhaustive()
    }
}

impl KubeInstanceClient {
    /// Events are reported as `controller`.
    pub fn new(client: Client, controller: impl Into<String>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }

    fn api(&self, namespace: &str) -> Api<Manifest> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn remaining_finalizers(obj: &Manifest, finalizer: &str) -> Vec<String> {
    obj.finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect()
}

#[async_trait]
impl InstanceClient for KubeInstanceClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Manifest>> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn apply_status(&self, obj: &Manifest, field_owner: &str) -> Result<()> {
        let namespace = obj.namespace().unwrap_or_default();
        let patch = json!({
            "apiVersion": Manifest::api_version(&()),
            "kind": Manifest::kind(&()),
            "metadata": { "name": obj.name_any(), "namespace": namespace },
            "status": obj.status_or_default(),
        });
        self.api(&namespace)
            .patch_status(
                &obj.name_any(),
                &PatchParams::apply(field_owner).force(),
                &Patch::Apply(&patch),
            )
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, obj: &Manifest, finalizer: &str, field_owner: &str) -> Result<()> {
        let namespace = obj.namespace().unwrap_or_default();
        let patch = json!({
            "apiVersion": Manifest::api_version(&()),
            "kind": Manifest::kind(&()),
            "metadata": {
                "name": obj.name_any(),
                "namespace": namespace,
                "finalizers": [finalizer],
            },
        });
        self.api(&namespace)
            .patch(
                &obj.name_any(),
                &PatchParams::apply(field_owner).force(),
                &Patch::Apply(&patch),
            )
            .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, obj: &Manifest, finalizer: &str) -> Result<()> {
        let namespace = obj.namespace().unwrap_or_default();
        let patch = json!({
            "metadata": {
                "finalizers": remaining_finalizers(obj, finalizer),
                "resourceVersion": obj.resource_version(),
            },
        });
        self.api(&namespace)
            .patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn publish_event(&self, obj: &Manifest, event: InstanceEvent) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone());
        let result = recorder
            .publish(
                &Event {
                    type_: if event.warning { EventType::Warning } else { EventType::Normal },
                    reason: event.reason.clone(),
                    note: Some(event.message),
                    action: "Reconcile".into(),
                    secondary: None,
                },
                &obj.object_ref(&()),
            )
            .await;
        if let Err(e) = result {
            warn!("Failed to publish event {} for {}: {}", event.reason, obj.name_any(), e);
        }
    }

    async fn override_values(
        &self,
        namespace: &str,
        selector: &OverrideSelector,
    ) -> Result<BTreeMap<String, String>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let mut config_maps = api
            .list(&ListParams::default().labels(&selector.to_label_selector()))
            .await?
            .items;
        config_maps.sort_by_key(ResourceExt::name_any);

        let mut values = BTreeMap::new();
        for cm in config_maps {
            values.extend(cm.data.unwrap_or_default());
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::test_manifest;

    #[test]
    fn test_remaining_finalizers_keeps_foreign_entries() {
        let mut obj = test_manifest("m");
        obj.metadata.finalizers = Some(vec![
            "foreign.io/keep".to_string(),
            crds::MANIFEST_FINALIZER.to_string(),
        ]);
        assert_eq!(
            remaining_finalizers(&obj, crds::MANIFEST_FINALIZER),
            vec!["foreign.io/keep".to_string()]
        );
    }
}
