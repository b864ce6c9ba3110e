//! Concurrent server-side apply.

use crate::cluster::ClusterClient;
use crate::error::{MultiError, Result};
use crate::resource::ResourceInfo;
use crate::task::fan_out;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Applies every resource in its own task under one field owner.
pub struct ConcurrentApply {
    cluster: Arc<dyn ClusterClient>,
    field_owner: String,
}

impl ConcurrentApply {
    /// Creates an applier for `cluster`.
    pub fn new(cluster: Arc<dyn ClusterClient>, field_owner: impl Into<String>) -> Self {
        Self {
            cluster,
            field_owner: field_owner.into(),
        }
    }

    /// Applies all resources and waits for every apply to finish.
    ///
    /// Failures are aggregated; one failing resource does not stop the others.
    pub async fn run(&self, resources: &[ResourceInfo]) -> Result<()> {
        let start = Instant::now();
        let mut results = fan_out(resources, |info| {
            let cluster = Arc::clone(&self.cluster);
            let owner = self.field_owner.clone();
            async move {
                cluster
                    .apply(&info, &owner)
                    .await
                    .map_err(|e| e.for_resource(&info))
            }
        });

        let mut errs = MultiError::default();
        for _ in 0..resources.len() {
            match results.recv().await {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    warn!("Apply failed: {}", e);
                    errs.push(e);
                }
                None => break,
            }
        }

        debug!(
            "Applied {} resource(s) in {:?} with {} failure(s)",
            resources.len(),
            start.elapsed(),
            errs.len()
        );
        errs.into_result()
    }
}
