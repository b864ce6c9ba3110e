use super::Renderer;
use crate::error::Result;
use crate::spec::InstallSpec;
use async_trait::async_trait;
use crds::Manifest;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Rendered manifests keyed by instance, generation and source.
#[derive(Debug, Default)]
pub struct RenderCache {
    entries: RwLock<HashMap<String, String>>,
}

impl RenderCache {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: String, manifest: String) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, manifest);
    }

    /// Number of cached manifests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caches the output of another renderer until the instance generation or
/// the installation source changes.
pub struct CachedRenderer {
    inner: Box<dyn Renderer>,
    cache: std::sync::Arc<RenderCache>,
    install: String,
    source: String,
}

impl CachedRenderer {
    /// Wraps `inner`.
    pub fn new(inner: Box<dyn Renderer>, cache: std::sync::Arc<RenderCache>, install: &InstallSpec) -> Self {
        Self {
            inner,
            cache,
            install: install.name.clone(),
            source: serde_json::to_string(&install.source).unwrap_or_default(),
        }
    }

    fn key(&self, obj: &Manifest) -> String {
        format!(
            "{}/{}/{}@{}:{}",
            obj.namespace().unwrap_or_default(),
            obj.name_any(),
            self.install,
            obj.metadata.generation.unwrap_or_default(),
            self.source
        )
    }
}

#[async_trait]
impl Renderer for CachedRenderer {
    async fn initialize(&self, obj: &Manifest) -> Result<()> {
        self.inner.initialize(obj).await
    }

    async fn ensure_prerequisites(&self, obj: &Manifest) -> Result<()> {
        self.inner.ensure_prerequisites(obj).await
    }

    async fn render(&self, obj: &Manifest) -> Result<String> {
        let key = self.key(obj);
        if let Some(manifest) = self.cache.get(&key) {
            debug!("Render cache hit for {}", self.install);
            return Ok(manifest);
        }
        let manifest = self.inner.render(obj).await?;
        self.cache.set(key, manifest.clone());
        Ok(manifest)
    }

    async fn remove_prerequisites(&self, obj: &Manifest) -> Result<()> {
        self.inner.remove_prerequisites(obj).await
    }
}
