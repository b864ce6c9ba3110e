//! Resource handles and conversion to and from recorded resources.
//!
//! A [`ResourceInfo`] carries the object content together with its REST
//! mapping so it can be applied, fetched or deleted. A [`Resource`] is the
//! identity-only record persisted in `status.synced`.

use crate::cluster::ClusterClient;
use crate::error::{DeclarativeError, Result};
use crds::Resource;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta};
use std::fmt;

/// REST mapping of a kind.
#[derive(Debug, Clone)]
pub struct Mapping {
    /// Discovered API resource
    pub api_resource: ApiResource,
    /// Whether objects of this kind live in a namespace
    pub namespaced: bool,
}

/// Identity used for diffing handles.
///
/// The API version is left out so a version bump of a rendered object is not
/// treated as a different object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// API group
    pub group: String,
    /// Kind
    pub kind: String,
    /// Namespace, empty for cluster-scoped objects
    pub namespace: String,
    /// Name
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)?;
        } else {
            write!(f, "{}.{}", self.kind, self.group)?;
        }
        if self.namespace.is_empty() {
            write!(f, " {}", self.name)
        } else {
            write!(f, " {}/{}", self.namespace, self.name)
        }
    }
}

/// Object content plus its REST mapping.
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    /// Object content
    pub object: DynamicObject,
    /// Discovered API resource
    pub api_resource: ApiResource,
    /// Whether the object is namespaced
    pub namespaced: bool,
}

impl ResourceInfo {
    /// Builds a handle and stamps apiVersion/kind onto the object.
    #[must_use]
    pub fn new(mut object: DynamicObject, mapping: Mapping) -> Self {
        object.types = Some(TypeMeta {
            api_version: mapping.api_resource.api_version.clone(),
            kind: mapping.api_resource.kind.clone(),
        });
        if !mapping.namespaced {
            object.metadata.namespace = None;
        }
        Self {
            object,
            api_resource: mapping.api_resource,
            namespaced: mapping.namespaced,
        }
    }

    /// Object name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.object.metadata.name.as_deref().unwrap_or_default()
    }

    /// Object namespace, `None` for cluster-scoped objects.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        if self.namespaced {
            self.object.metadata.namespace.as_deref()
        } else {
            None
        }
    }

    /// Kind
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.api_resource.kind
    }

    /// Diff identity.
    #[must_use]
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            group: self.api_resource.group.clone(),
            kind: self.api_resource.kind.clone(),
            namespace: self.namespace().unwrap_or_default().to_string(),
            name: self.name().to_string(),
        }
    }

    /// Recorded form of this handle.
    #[must_use]
    pub fn to_resource(&self) -> Resource {
        Resource {
            group: self.api_resource.group.clone(),
            version: self.api_resource.version.clone(),
            kind: self.api_resource.kind.clone(),
            name: self.name().to_string(),
            namespace: self.namespace().unwrap_or_default().to_string(),
        }
    }
}

impl fmt::Display for ResourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.key().fmt(f)
    }
}

/// Splits an `apiVersion` into group and version.
#[must_use]
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// GVK of a parsed object.
pub fn gvk_of(object: &DynamicObject) -> Result<GroupVersionKind> {
    let types = object.types.as_ref().ok_or_else(|| {
        DeclarativeError::InvalidObject(format!(
            "object {} has no apiVersion/kind",
            object.metadata.name.as_deref().unwrap_or("<unnamed>")
        ))
    })?;
    if types.kind.is_empty() || types.api_version.is_empty() {
        return Err(DeclarativeError::InvalidObject(format!(
            "object {} has an empty apiVersion or kind",
            object.metadata.name.as_deref().unwrap_or("<unnamed>")
        )));
    }
    let (group, version) = split_api_version(&types.api_version);
    Ok(GroupVersionKind::gvk(group, version, &types.kind))
}

/// Converts rendered objects and recorded resources into handles.
pub struct ResourceConverter<'a> {
    cluster: &'a dyn ClusterClient,
    default_namespace: String,
}

impl<'a> ResourceConverter<'a> {
    /// Namespaced objects without a namespace get `default_namespace`.
    pub fn new(cluster: &'a dyn ClusterClient, default_namespace: impl Into<String>) -> Self {
        Self {
            cluster,
            default_namespace: default_namespace.into(),
        }
    }

    /// Resolves rendered objects, keeping their order.
    pub async fn objects_to_infos(&self, objects: Vec<DynamicObject>) -> Result<Vec<ResourceInfo>> {
        let mut infos = Vec::with_capacity(objects.len());
        for mut object in objects {
            if object.metadata.name.as_deref().is_none_or(str::is_empty) {
                return Err(DeclarativeError::InvalidObject(
                    "rendered object has no metadata.name".to_string(),
                ));
            }
            let gvk = gvk_of(&object)?;
            let mapping = self.cluster.mapping(&gvk).await?;
            if mapping.namespaced && object.metadata.namespace.as_deref().is_none_or(str::is_empty) {
                object.metadata.namespace = Some(self.default_namespace.clone());
            }
            infos.push(ResourceInfo::new(object, mapping));
        }
        Ok(infos)
    }

    /// Resolves recorded resources into handles carrying identity only.
    pub async fn resources_to_infos(&self, resources: &[Resource]) -> Result<Vec<ResourceInfo>> {
        let mut infos = Vec::with_capacity(resources.len());
        for resource in resources {
            let gvk = GroupVersionKind::gvk(&resource.group, &resource.version, &resource.kind);
            let mapping = self.cluster.mapping(&gvk).await?;
            let mut object = DynamicObject::new(&resource.name, &mapping.api_resource);
            if !resource.namespace.is_empty() {
                object.metadata.namespace = Some(resource.namespace.clone());
            }
            infos.push(ResourceInfo::new(object, mapping));
        }
        Ok(infos)
    }
}

/// Recorded form of every handle, in order.
#[must_use]
pub fn infos_to_resources(infos: &[ResourceInfo]) -> Vec<Resource> {
    infos.iter().map(ResourceInfo::to_resource).collect()
}
