//! Target cluster access.
//!
//! Every cluster operation the engine needs goes through [`ClusterClient`] so
//! the concurrent primitives and the reconciler can run against an in-memory
//! cluster in tests.

use crate::error::{is_not_found, DeclarativeError, Result};
use crate::resource::{Mapping, ResourceInfo};
use async_trait::async_trait;
use either::Either;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::{self, Scope};
use kube::Client;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Outcome of a single delete call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The object is gone, or was never there
    Deleted,
    /// Deletion was accepted but the object still exists
    Pending,
}

/// Operations against one target cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// REST mapping of `gvk`.
    async fn mapping(&self, gvk: &GroupVersionKind) -> Result<Mapping>;

    /// Server-side applies the object with forced ownership.
    async fn apply(&self, info: &ResourceInfo, field_owner: &str) -> Result<()>;

    /// Server-side applies the status subresource with forced ownership.
    async fn apply_status(&self, info: &ResourceInfo, field_owner: &str) -> Result<()>;

    /// Live object, `None` if it does not exist.
    async fn get(&self, info: &ResourceInfo) -> Result<Option<DynamicObject>>;

    /// Deletes the object. Not found counts as deleted.
    async fn delete(&self, info: &ResourceInfo) -> Result<DeleteOutcome>;

    /// JSON merge patch against the object.
    async fn patch_merge(&self, info: &ResourceInfo, patch: &serde_json::Value) -> Result<()>;
}

type GvkKey = (String, String, String);

/// [`ClusterClient`] backed by a kube client, with a per-cluster discovery cache.
pub struct KubeCluster {
    client: Client,
    mappings: RwLock<HashMap<GvkKey, Mapping>>,
}

impl std::fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster").finish_non_exhaustive()
    }
}

impl KubeCluster {
    /// Wraps an existing client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            mappings: RwLock::new(HashMap::new()),
        }
    }

    /// Underlying kube client.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, info: &ResourceInfo) -> Api<DynamicObject> {
        match info.namespace() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &info.api_resource),
            None => Api::all_with(self.client.clone(), &info.api_resource),
        }
    }
}

/// Strips server-populated metadata that must not be sent with an apply.
fn apply_body(info: &ResourceInfo) -> DynamicObject {
    let mut object = info.object.clone();
    object.metadata.uid = None;
    object.metadata.resource_version = None;
    object.metadata.managed_fields = None;
    object.metadata.creation_timestamp = None;
    object
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn mapping(&self, gvk: &GroupVersionKind) -> Result<Mapping> {
        let key = (gvk.group.clone(), gvk.version.clone(), gvk.kind.clone());
        let cached = self
            .mappings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        if let Some(mapping) = cached {
            return Ok(mapping);
        }

        let (api_resource, caps) = discovery::pinned_kind(&self.client, gvk)
            .await
            .map_err(|e| {
                DeclarativeError::Discovery(format!(
                    "no mapping for {}/{} {}: {e}",
                    gvk.group, gvk.version, gvk.kind
                ))
            })?;
        let mapping = Mapping {
            api_resource,
            namespaced: caps.scope == Scope::Namespaced,
        };
        debug!("Discovered {}/{} {} (namespaced: {})", gvk.group, gvk.version, gvk.kind, mapping.namespaced);
        self.mappings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, mapping.clone());
        Ok(mapping)
    }

    async fn apply(&self, info: &ResourceInfo, field_owner: &str) -> Result<()> {
        let body = apply_body(info);
        self.api(info)
            .patch(info.name(), &PatchParams::apply(field_owner).force(), &Patch::Apply(&body))
            .await?;
        Ok(())
    }

    async fn apply_status(&self, info: &ResourceInfo, field_owner: &str) -> Result<()> {
        let body = apply_body(info);
        self.api(info)
            .patch_status(info.name(), &PatchParams::apply(field_owner).force(), &Patch::Apply(&body))
            .await?;
        Ok(())
    }

    async fn get(&self, info: &ResourceInfo) -> Result<Option<DynamicObject>> {
        Ok(self.api(info).get_opt(info.name()).await?)
    }

    async fn delete(&self, info: &ResourceInfo) -> Result<DeleteOutcome> {
        match self.api(info).delete(info.name(), &DeleteParams::background()).await {
            Ok(Either::Left(object)) if object.metadata.deletion_timestamp.is_some() => {
                Ok(DeleteOutcome::Pending)
            }
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(e) if is_not_found(&e) => Ok(DeleteOutcome::Deleted),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_merge(&self, info: &ResourceInfo, patch: &serde_json::Value) -> Result<()> {
        self.api(info)
            .patch(info.name(), &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}
