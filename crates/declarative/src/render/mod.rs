//! Renderers turn an installation into manifest text.
//!
//! Raw files are rendered in process. Chart and overlay backends are
//! registered through [`RendererRegistry`] and are wrapped in a
//! [`CachedRenderer`].

mod cached;
mod raw;

pub use cached::{CachedRenderer, RenderCache};
pub use raw::RawRenderer;

use crate::error::{DeclarativeError, Result};
use crate::spec::{InstallSpec, Spec};
use async_trait::async_trait;
use crds::{Manifest, RenderMode};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Produces manifest text for an instance.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Prepares the renderer for `obj`.
    async fn initialize(&self, obj: &Manifest) -> Result<()>;

    /// Installs anything the rendered resources depend on (e.g. CRDs).
    async fn ensure_prerequisites(&self, obj: &Manifest) -> Result<()>;

    /// Renders the manifest text.
    async fn render(&self, obj: &Manifest) -> Result<String>;

    /// Removes what `ensure_prerequisites` installed.
    async fn remove_prerequisites(&self, obj: &Manifest) -> Result<()>;
}

/// Builds a renderer for one installation of an external backend.
pub trait RendererFactory: Send + Sync {
    /// Creates the renderer for `install`.
    fn create(&self, install: &InstallSpec) -> Result<Box<dyn Renderer>>;
}

/// Renderer backends by mode.
pub struct RendererRegistry {
    manifest_root: PathBuf,
    factories: HashMap<RenderMode, Arc<dyn RendererFactory>>,
    cache: Arc<RenderCache>,
}

impl RendererRegistry {
    /// Raw paths are resolved relative to `manifest_root`.
    pub fn new(manifest_root: impl Into<PathBuf>) -> Self {
        Self {
            manifest_root: manifest_root.into(),
            factories: HashMap::new(),
            cache: Arc::new(RenderCache::default()),
        }
    }

    /// Registers the backend for a chart or overlay mode.
    #[must_use]
    pub fn with_factory(mut self, mode: RenderMode, factory: Arc<dyn RendererFactory>) -> Self {
        self.factories.insert(mode, factory);
        self
    }

    /// Shared render cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<RenderCache> {
        &self.cache
    }

    /// Renderer of one installation.
    pub fn for_install(&self, install: &InstallSpec) -> Result<Box<dyn Renderer>> {
        match install.mode() {
            RenderMode::Raw => {
                let path = install.source.path.clone().unwrap_or_default();
                Ok(Box::new(RawRenderer::new(self.manifest_root.join(path))))
            }
            mode @ (RenderMode::Chart | RenderMode::Overlay) => {
                let factory = self.factories.get(&mode).ok_or_else(|| {
                    DeclarativeError::Render(format!("no renderer registered for mode {mode}"))
                })?;
                let inner = factory.create(install)?;
                Ok(Box::new(CachedRenderer::new(inner, Arc::clone(&self.cache), install)))
            }
        }
    }

    /// Renderer covering every installation of `spec`.
    pub fn for_spec(&self, spec: &Spec) -> Result<CompositeRenderer> {
        let renderers = spec
            .installs
            .iter()
            .map(|install| Ok((install.name.clone(), self.for_install(install)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(CompositeRenderer { renderers })
    }
}

/// Renders several installations as one manifest.
pub struct CompositeRenderer {
    renderers: Vec<(String, Box<dyn Renderer>)>,
}

#[async_trait]
impl Renderer for CompositeRenderer {
    async fn initialize(&self, obj: &Manifest) -> Result<()> {
        for (_, renderer) in &self.renderers {
            renderer.initialize(obj).await?;
        }
        Ok(())
    }

    async fn ensure_prerequisites(&self, obj: &Manifest) -> Result<()> {
        for (_, renderer) in &self.renderers {
            renderer.ensure_prerequisites(obj).await?;
        }
        Ok(())
    }

    async fn render(&self, obj: &Manifest) -> Result<String> {
        let mut documents = Vec::with_capacity(self.renderers.len());
        for (name, renderer) in &self.renderers {
            let text = renderer
                .render(obj)
                .await
                .map_err(|e| DeclarativeError::Render(format!("install '{name}': {e}")))?;
            documents.push(text);
        }
        Ok(documents.join("\n---\n"))
    }

    async fn remove_prerequisites(&self, obj: &Manifest) -> Result<()> {
        for (_, renderer) in self.renderers.iter().rev() {
            renderer.remove_prerequisites(obj).await?;
        }
        Ok(())
    }
}
