//! Collection of worker responses into the instance status.

use crate::error::Result;
use crate::instance::InstanceClient;
use crate::remote::RemoteSync;
use crate::workers::InstallResponse;
use crds::{Condition, ConditionStatus, Manifest, State};
use kube::ResourceExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Condition type recording the outcome of one installation.
#[must_use]
pub fn install_condition_type(chart_name: &str) -> String {
    format!("Install-{chart_name}")
}

/// How an aggregation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// Responses were folded into the status, which now has this state
    Updated(State),
    /// The finalizer was removed
    Finalized,
    /// The instance disappeared meanwhile
    Gone,
    /// Cancelled, or the responses closed, before every response arrived
    Cancelled,
}

/// Folds the responses of one allocation into the latest instance status.
pub struct ResponseAggregator {
    instances: Arc<dyn InstanceClient>,
    field_owner: String,
    finalizer: String,
}

impl std::fmt::Debug for ResponseAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseAggregator")
            .field("field_owner", &self.field_owner)
            .finish_non_exhaustive()
    }
}

fn response_condition(response: &InstallResponse, generation: Option<i64>) -> Condition {
    let (status, message) = match (&response.err, response.ready) {
        (Some(err), _) => (ConditionStatus::False, format!("installation error: {err}")),
        (None, true) => (ConditionStatus::True, "installation successful".to_string()),
        (None, false) => (ConditionStatus::Unknown, "installation processing".to_string()),
    };
    Condition {
        type_: install_condition_type(&response.chart_name),
        status,
        reason: response.client_config.clone(),
        message,
        observed_generation: generation,
        last_transition_time: None,
    }
}

impl ResponseAggregator {
    /// Writes as `field_owner` and releases `finalizer` on completed deletion.
    pub fn new(
        instances: Arc<dyn InstanceClient>,
        field_owner: impl Into<String>,
        finalizer: impl Into<String>,
    ) -> Self {
        Self {
            instances,
            field_owner: field_owner.into(),
            finalizer: finalizer.into(),
        }
    }

    /// Waits for `expected` responses, then updates the instance.
    ///
    /// `remote` releases the remote copy before the native finalizer.
    pub async fn run(
        &self,
        namespace: &str,
        name: &str,
        expected: usize,
        mut responses: mpsc::Receiver<InstallResponse>,
        cancel: CancellationToken,
        remote: Option<RemoteSync>,
    ) -> Result<Aggregation> {
        let mut collected = Vec::with_capacity(expected);
        while collected.len() < expected {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    warn!("Aggregation for {}/{} cancelled after {} of {} responses", namespace, name, collected.len(), expected);
                    return Ok(Aggregation::Cancelled);
                }
                response = responses.recv() => match response {
                    Some(response) => collected.push(response),
                    None => break,
                },
            }
        }
        if collected.len() < expected {
            warn!(
                "Responses for {}/{} closed after {} of {}, leaving status untouched",
                namespace,
                name,
                collected.len(),
                expected
            );
            return Ok(Aggregation::Cancelled);
        }

        let errors = collected.iter().filter(|r| r.err.is_some()).count();
        let processing = collected.len() - errors - collected.iter().filter(|r| r.ready).count();
        debug!(
            "Collected {} responses for {}/{}: {} failed, {} processing",
            collected.len(),
            namespace,
            name,
            errors,
            processing
        );

        let Some(latest) = self.instances.get(namespace, name).await? else {
            return Ok(Aggregation::Gone);
        };

        if latest.is_deleting() && errors == 0 && processing == 0 {
            return self.finalize(&latest, remote).await;
        }

        let generation = latest.metadata.generation;
        let mut status = latest.status_or_default();
        for response in &collected {
            crate::status::set_condition(&mut status.conditions, response_condition(response, generation));
        }
        let state = if errors > 0 {
            State::Error
        } else if latest.is_deleting() {
            State::Deleting
        } else if processing > 0 {
            State::Processing
        } else {
            State::Ready
        };
        status = status.with_state(state);
        status = match collected.iter().find_map(|r| r.err.as_ref()) {
            Some(err) => status.with_err(err),
            None => status.with_operation(format!("{} installation(s) reported {}", collected.len(), state)),
        };
        status.observed_generation = generation;

        let mut updated = latest;
        updated.status = Some(status);
        match self.instances.apply_status(&updated, &self.field_owner).await {
            Ok(()) => Ok(Aggregation::Updated(state)),
            Err(e) if e.is_conflict() => {
                debug!("Status of {}/{} changed meanwhile, dropping aggregation", namespace, name);
                Ok(Aggregation::Updated(state))
            }
            Err(e) => Err(e),
        }
    }

    async fn finalize(&self, latest: &Manifest, remote: Option<RemoteSync>) -> Result<Aggregation> {
        if let Some(remote) = remote {
            remote.remove_remote_finalizer(latest).await?;
        }
        if latest.has_finalizer(&self.finalizer) {
            self.instances.remove_finalizer(latest, &self.finalizer).await?;
            info!("Released finalizer of {}", latest.name_any());
        }
        Ok(Aggregation::Finalized)
    }
}
