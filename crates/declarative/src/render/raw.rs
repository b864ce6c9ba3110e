use super::Renderer;
use crate::error::{DeclarativeError, Result};
use async_trait::async_trait;
use crds::Manifest;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Renders plain YAML from a file or every `*.yaml`/`*.yml` file of a directory.
#[derive(Debug, Clone)]
pub struct RawRenderer {
    path: PathBuf,
}

impl RawRenderer {
    /// Renders from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e == "yaml" || e == "yml")
}

async fn read(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| DeclarativeError::Render(format!("reading {}: {e}", path.display())))
}

#[async_trait]
impl Renderer for RawRenderer {
    async fn initialize(&self, _obj: &Manifest) -> Result<()> {
        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            Ok(())
        } else {
            Err(DeclarativeError::Render(format!("{} does not exist", self.path.display())))
        }
    }

    async fn ensure_prerequisites(&self, _obj: &Manifest) -> Result<()> {
        Ok(())
    }

    async fn render(&self, _obj: &Manifest) -> Result<String> {
        let metadata = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| DeclarativeError::Render(format!("{}: {e}", self.path.display())))?;
        if metadata.is_file() {
            return read(&self.path).await;
        }

        let mut entries = tokio::fs::read_dir(&self.path)
            .await
            .map_err(|e| DeclarativeError::Render(format!("{}: {e}", self.path.display())))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DeclarativeError::Render(format!("{}: {e}", self.path.display())))?
        {
            let path = entry.path();
            if is_yaml(&path) {
                files.push(path);
            }
        }
        files.sort();
        debug!("Rendering {} raw file(s) from {}", files.len(), self.path.display());

        let mut documents = Vec::with_capacity(files.len());
        for file in &files {
            documents.push(read(file).await?);
        }
        Ok(documents.join("\n---\n"))
    }

    async fn remove_prerequisites(&self, _obj: &Manifest) -> Result<()> {
        Ok(())
    }
}
