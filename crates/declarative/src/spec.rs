//! Resolution of a Manifest into a render specification.

use crate::error::{DeclarativeError, Result};
use crate::instance::InstanceClient;
use async_trait::async_trait;
use crds::{InstallSource, Manifest, RenderMode};
use kube::ResourceExt;
use std::collections::HashSet;
use std::sync::Arc;

/// One installation ready to be rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallSpec {
    /// Installation name
    pub name: String,
    /// Source with override values merged in
    pub source: InstallSource,
}

impl InstallSpec {
    /// Rendering backend.
    #[must_use]
    pub fn mode(&self) -> RenderMode {
        self.source.mode
    }
}

/// Everything needed to render a Manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct Spec {
    /// Name used as release name for every installation
    pub manifest_name: String,
    /// Installations in declaration order
    pub installs: Vec<InstallSpec>,
}

/// Turns a Manifest into a [`Spec`].
#[async_trait]
pub trait SpecResolver: Send + Sync {
    /// Resolves the spec of `obj`.
    async fn spec(&self, obj: &Manifest) -> Result<Spec>;
}

/// Resolves installs from the Manifest spec and merges override ConfigMaps.
pub struct ManifestSpecResolver {
    instances: Arc<dyn InstanceClient>,
}

impl ManifestSpecResolver {
    /// Override values are read through `instances`.
    pub fn new(instances: Arc<dyn InstanceClient>) -> Self {
        Self { instances }
    }
}

fn validate(name: &str, source: &InstallSource) -> Result<()> {
    let missing = |field: &str| {
        DeclarativeError::Spec(format!(
            "install '{name}' with mode {} requires '{field}'",
            source.mode
        ))
    };
    match source.mode {
        RenderMode::Raw | RenderMode::Overlay if source.path.as_deref().is_none_or(str::is_empty) => {
            Err(missing("path"))
        }
        RenderMode::Chart if source.chart_name.as_deref().is_none_or(str::is_empty) => {
            Err(missing("chartName"))
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl SpecResolver for ManifestSpecResolver {
    async fn spec(&self, obj: &Manifest) -> Result<Spec> {
        let namespace = obj.namespace().unwrap_or_default();
        let mut installs = Vec::with_capacity(obj.spec.installs.len().max(1));
        let mut seen = HashSet::new();

        for item in &obj.spec.installs {
            if !seen.insert(item.name.as_str()) {
                return Err(DeclarativeError::Spec(format!(
                    "install '{}' is declared more than once",
                    item.name
                )));
            }
            validate(&item.name, &item.source)?;

            let mut source = item.source.clone();
            if let Some(selector) = &item.override_selector {
                let overrides = self.instances.override_values(&namespace, selector).await?;
                source.values.extend(overrides);
            }
            installs.push(InstallSpec {
                name: item.name.clone(),
                source,
            });
        }

        if installs.is_empty() {
            let Some(default) = &obj.spec.default_config else {
                return Err(DeclarativeError::Spec(
                    "neither installs nor defaultConfig are declared".to_string(),
                ));
            };
            validate(&obj.name_any(), default)?;
            installs.push(InstallSpec {
                name: obj.name_any(),
                source: default.clone(),
            });
        }

        Ok(Spec {
            manifest_name: obj.name_any(),
            installs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockInstanceClient, test_manifest};
    use crds::{InstallItem, OverrideSelector};
    use std::collections::BTreeMap;

    fn raw(path: &str) -> InstallSource {
        InstallSource {
            mode: RenderMode::Raw,
            path: Some(path.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_merges_override_values() {
        let instances = Arc::new(MockInstanceClient::new());
        instances.add_override("default", "app=web", BTreeMap::from([("replicas".to_string(), "3".to_string())]));

        let mut obj = test_manifest("m");
        let mut source = raw("web");
        source.values.insert("replicas".to_string(), "1".to_string());
        source.values.insert("image".to_string(), "nginx".to_string());
        obj.spec.installs = vec![InstallItem {
            name: "web".to_string(),
            source,
            override_selector: Some(OverrideSelector {
                match_labels: BTreeMap::from([("app".to_string(), "web".to_string())]),
            }),
        }];

        let spec = ManifestSpecResolver::new(instances).spec(&obj).await.unwrap();
        let values = &spec.installs[0].source.values;
        assert_eq!(values["replicas"], "3");
        assert_eq!(values["image"], "nginx");
    }

    #[tokio::test]
    async fn test_falls_back_to_default_config() {
        let mut obj = test_manifest("m");
        obj.spec.installs.clear();
        obj.spec.default_config = Some(raw("base"));

        let spec = ManifestSpecResolver::new(Arc::new(MockInstanceClient::new()))
            .spec(&obj)
            .await
            .unwrap();
        assert_eq!(spec.installs.len(), 1);
        assert_eq!(spec.installs[0].name, "m");
    }

    #[tokio::test]
    async fn test_rejects_duplicate_and_incomplete_installs() {
        let resolver = ManifestSpecResolver::new(Arc::new(MockInstanceClient::new()));
        let item = InstallItem {
            name: "a".to_string(),
            source: raw("p"),
            override_selector: None,
        };

        let mut obj = test_manifest("m");
        obj.spec.installs = vec![item.clone(), item.clone()];
        assert!(matches!(resolver.spec(&obj).await, Err(DeclarativeError::Spec(_))));

        obj.spec.installs = vec![InstallItem {
            source: InstallSource { mode: RenderMode::Chart, ..Default::default() },
            ..item
        }];
        assert!(matches!(resolver.spec(&obj).await, Err(DeclarativeError::Spec(_))));

        obj.spec.installs.clear();
        obj.spec.default_config = None;
        assert!(matches!(resolver.spec(&obj).await, Err(DeclarativeError::Spec(_))));
    }
}
