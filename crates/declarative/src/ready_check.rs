//! Readiness verification of applied resources.

use crate::cluster::ClusterClient;
use crate::error::{DeclarativeError, MultiError, Result};
use crate::readiness;
use crate::resource::ResourceInfo;
use crate::task::fan_out;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Verifies that a set of resources is ready.
///
/// Returns [`DeclarativeError::ResourcesNotReady`] while anything is still
/// converging.
#[async_trait]
pub trait ReadyCheck: Send + Sync {
    /// Checks all resources.
    async fn run(&self, resources: &[ResourceInfo]) -> Result<()>;
}

/// Which readiness check the reconciler uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadyCheckStrategy {
    /// Per-kind readiness, checked in parallel
    #[default]
    Deep,
    /// Existence only, checked sequentially
    Exists,
}

impl ReadyCheckStrategy {
    /// Builds the check against `cluster`.
    #[must_use]
    pub fn build(self, cluster: Arc<dyn ClusterClient>) -> Box<dyn ReadyCheck> {
        match self {
            ReadyCheckStrategy::Deep => Box::new(DeepReadyCheck::new(cluster)),
            ReadyCheckStrategy::Exists => Box::new(ExistsReadyCheck::new(cluster)),
        }
    }
}

impl std::str::FromStr for ReadyCheckStrategy {
    type Err = DeclarativeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "deep" => Ok(ReadyCheckStrategy::Deep),
            "exists" => Ok(ReadyCheckStrategy::Exists),
            other => Err(DeclarativeError::Spec(format!("unknown ready check '{other}'"))),
        }
    }
}

/// Per-kind readiness, one task per resource.
///
/// The first "not ready" result is returned immediately. Remaining tasks still
/// finish into the channel and their results are dropped.
pub struct DeepReadyCheck {
    cluster: Arc<dyn ClusterClient>,
}

impl DeepReadyCheck {
    /// Creates a check against `cluster`.
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl ReadyCheck for DeepReadyCheck {
    async fn run(&self, resources: &[ResourceInfo]) -> Result<()> {
        let start = Instant::now();
        debug!("ReadyCheck on {} resource(s)", resources.len());

        let mut results = fan_out(resources, |info| {
            let cluster = Arc::clone(&self.cluster);
            async move {
                match cluster.get(&info).await {
                    Ok(Some(live)) => readiness::is_ready(live).map_err(|e| e.for_resource(&info)),
                    Ok(None) => Ok(false),
                    Err(e) => Err(e.for_resource(&info)),
                }
            }
        });

        let mut errs = MultiError::default();
        for _ in 0..resources.len() {
            match results.recv().await {
                Some(Ok(true)) => {}
                Some(Ok(false)) => return Err(DeclarativeError::ResourcesNotReady),
                Some(Err(e)) => errs.push(e),
                None => break,
            }
        }
        errs.into_result()?;

        debug!("ReadyCheck finished for {} resource(s) in {:?}", resources.len(), start.elapsed());
        Ok(())
    }
}

/// Sequential existence check.
///
/// A missing object is tolerated as not yet applied and skipped. Any other
/// fetch error is returned as is.
pub struct ExistsReadyCheck {
    cluster: Arc<dyn ClusterClient>,
}

impl ExistsReadyCheck {
    /// Creates a check against `cluster`.
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl ReadyCheck for ExistsReadyCheck {
    async fn run(&self, resources: &[ResourceInfo]) -> Result<()> {
        for info in resources {
            if self.cluster.get(info).await?.is_none() {
                debug!("{} does not exist yet, skipping", info);
            }
        }
        Ok(())
    }
}
