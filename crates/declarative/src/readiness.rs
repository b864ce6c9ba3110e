//! Per-kind readiness of live objects.
//!
//! Workloads are ready once their rollout completed for the current
//! generation, Jobs once they succeeded, Pods once the Ready condition holds,
//! claims once bound, LoadBalancer Services once an ingress is assigned and
//! CRDs once established. Every other kind is ready as soon as it exists.

use crate::error::{DeclarativeError, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::core::DynamicObject;
use kube::Resource;
use serde::de::DeserializeOwned;

/// Evaluates readiness of a live object.
///
/// A failed Job is a hard error rather than "not ready".
pub fn is_ready(object: DynamicObject) -> Result<bool> {
    let kind = object
        .types
        .as_ref()
        .map(|t| t.kind.clone())
        .unwrap_or_default();

    match kind.as_str() {
        "Deployment" => Ok(deployment_ready(&parse::<Deployment>(object)?)),
        "StatefulSet" => Ok(stateful_set_ready(&parse::<StatefulSet>(object)?)),
        "DaemonSet" => Ok(daemon_set_ready(&parse::<DaemonSet>(object)?)),
        "Job" => job_ready(&parse::<Job>(object)?),
        "Pod" => Ok(pod_ready(&parse::<Pod>(object)?)),
        "PersistentVolumeClaim" => Ok(pvc_bound(&parse::<PersistentVolumeClaim>(object)?)),
        "Service" => Ok(service_ready(&parse::<Service>(object)?)),
        "CustomResourceDefinition" => Ok(crd_established(&parse::<CustomResourceDefinition>(object)?)),
        _ => Ok(true),
    }
}

fn parse<K>(object: DynamicObject) -> Result<K>
where
    K: Resource + DeserializeOwned,
{
    let name = object.metadata.name.clone().unwrap_or_default();
    object
        .try_parse::<K>()
        .map_err(|e| DeclarativeError::InvalidObject(format!("{name}: {e}")))
}

/// Whether the controller has seen the latest spec.
fn generation_observed(generation: Option<i64>, observed: Option<i64>) -> bool {
    observed.unwrap_or(0) >= generation.unwrap_or(0)
}

fn deployment_ready(deployment: &Deployment) -> bool {
    let Some(status) = &deployment.status else {
        return false;
    };
    if !generation_observed(deployment.metadata.generation, status.observed_generation) {
        return false;
    }
    let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    status.updated_replicas.unwrap_or(0) >= desired && status.available_replicas.unwrap_or(0) >= desired
}

fn stateful_set_ready(sts: &StatefulSet) -> bool {
    let Some(status) = &sts.status else {
        return false;
    };
    if !generation_observed(sts.metadata.generation, status.observed_generation) {
        return false;
    }
    let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    status.ready_replicas.unwrap_or(0) >= desired && status.updated_replicas.unwrap_or(0) >= desired
}

fn daemon_set_ready(ds: &DaemonSet) -> bool {
    let Some(status) = &ds.status else {
        return false;
    };
    generation_observed(ds.metadata.generation, status.observed_generation)
        && status.updated_number_scheduled.unwrap_or(0) >= status.desired_number_scheduled
        && status.number_ready >= status.desired_number_scheduled
}

fn job_ready(job: &Job) -> Result<bool> {
    let Some(status) = &job.status else {
        return Ok(false);
    };
    let failed = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Failed" && c.status == "True");
    if failed {
        return Err(DeclarativeError::Failed(format!(
            "job {} failed",
            job.metadata.name.as_deref().unwrap_or_default()
        )));
    }
    let completions = job.spec.as_ref().and_then(|s| s.completions).unwrap_or(1);
    Ok(status.succeeded.unwrap_or(0) >= completions)
}

fn pod_ready(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    if status.phase.as_deref() == Some("Succeeded") {
        return true;
    }
    status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True")
}

fn pvc_bound(pvc: &PersistentVolumeClaim) -> bool {
    pvc.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Bound")
}

fn service_ready(service: &Service) -> bool {
    let is_load_balancer = service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .is_some_and(|t| t == "LoadBalancer");
    if !is_load_balancer {
        return true;
    }
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .is_some_and(|ingress| !ingress.is_empty())
}

fn crd_established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .any(|c| c.type_ == "Established" && c.status == "True")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(yaml: &str) -> DynamicObject {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_plain_kinds_are_ready() {
        let cm = object("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\n");
        assert!(is_ready(cm).unwrap());
    }

    #[test]
    fn test_deployment_rollout() {
        let rolling = object(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: d\n  generation: 2\nspec:\n  replicas: 2\n  selector: {}\n  template: {}\nstatus:\n  observedGeneration: 2\n  updatedReplicas: 2\n  availableReplicas: 1\n",
        );
        assert!(!is_ready(rolling).unwrap());

        let done = object(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: d\n  generation: 2\nspec:\n  replicas: 2\n  selector: {}\n  template: {}\nstatus:\n  observedGeneration: 2\n  updatedReplicas: 2\n  availableReplicas: 2\n",
        );
        assert!(is_ready(done).unwrap());

        let stale = object(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: d\n  generation: 3\nspec:\n  replicas: 2\n  selector: {}\n  template: {}\nstatus:\n  observedGeneration: 2\n  updatedReplicas: 2\n  availableReplicas: 2\n",
        );
        assert!(!is_ready(stale).unwrap());
    }

    #[test]
    fn test_failed_job_is_hard_error() {
        let job = object(
            "apiVersion: batch/v1\nkind: Job\nmetadata:\n  name: j\nspec:\n  template: {}\nstatus:\n  conditions:\n  - type: Failed\n    status: \"True\"\n",
        );
        assert!(matches!(is_ready(job), Err(DeclarativeError::Failed(_))));
    }

    #[test]
    fn test_pvc_and_load_balancer() {
        let pending = object("apiVersion: v1\nkind: PersistentVolumeClaim\nmetadata:\n  name: p\nstatus:\n  phase: Pending\n");
        assert!(!is_ready(pending).unwrap());

        let lb = object("apiVersion: v1\nkind: Service\nmetadata:\n  name: s\nspec:\n  type: LoadBalancer\n");
        assert!(!is_ready(lb).unwrap());

        let cluster_ip = object("apiVersion: v1\nkind: Service\nmetadata:\n  name: s\nspec:\n  type: ClusterIP\n");
        assert!(is_ready(cluster_ip).unwrap());
    }
}
