//! Worker-pool reconciliation.
//!
//! Instead of rendering the whole Manifest in one pass, every installation is
//! handed to the [`WorkerPool`] as a job and a [`ResponseAggregator`] folds
//! the job outcomes into the status once all of them reported back.

use crate::aggregator::ResponseAggregator;
use crate::error::Result;
use crate::instance::{InstanceClient, InstanceEvent};
use crate::reconciler::{Outcome, RequeueIntervals};
use crate::remote::{should_sync, RemoteSync};
use crate::spec::{ManifestSpecResolver, SpecResolver};
use crate::target::TargetClients;
use crate::workers::{DeployInfo, Installer, Job, Mode, WorkerPool};
use crds::{Manifest, State};
use kube::ResourceExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Reconciler dispatching installations to a worker pool.
pub struct LegacyReconciler {
    instances: Arc<dyn InstanceClient>,
    spec_resolver: Arc<dyn SpecResolver>,
    targets: TargetClients,
    pool: WorkerPool,
    installer: Arc<dyn Installer>,
    aggregator: Arc<ResponseAggregator>,
    field_owner: String,
    finalizer: String,
    requeue: RequeueIntervals,
    cancel: CancellationToken,
}

impl std::fmt::Debug for LegacyReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyReconciler")
            .field("pool", &self.pool)
            .field("requeue", &self.requeue)
            .finish_non_exhaustive()
    }
}

/// Construction parameters of a [`LegacyReconciler`].
#[derive(Debug, Clone)]
pub struct LegacyOptions {
    /// Field manager of status writes
    pub field_owner: String,
    /// Finalizer guarding instance deletion
    pub finalizer: String,
    /// Number of workers
    pub workers: usize,
    /// Requeue intervals
    pub requeue: RequeueIntervals,
}

impl LegacyReconciler {
    /// Starts the worker pool; it stops when `cancel` fires.
    pub fn new(
        instances: Arc<dyn InstanceClient>,
        targets: TargetClients,
        installer: Arc<dyn Installer>,
        options: LegacyOptions,
        cancel: CancellationToken,
    ) -> Self {
        let pool = WorkerPool::start(options.workers, Arc::clone(&installer), cancel.clone());
        Self {
            spec_resolver: Arc::new(ManifestSpecResolver::new(Arc::clone(&instances))),
            aggregator: Arc::new(ResponseAggregator::new(
                Arc::clone(&instances),
                &options.field_owner,
                &options.finalizer,
            )),
            instances,
            targets,
            pool,
            installer,
            field_owner: options.field_owner,
            finalizer: options.finalizer,
            requeue: options.requeue,
            cancel,
        }
    }

    /// Runs one pass for the instance `namespace/name`.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Outcome> {
        let Some(obj) = self.instances.get(namespace, name).await? else {
            info!("Manifest {}/{} no longer exists", namespace, name);
            return Ok(Outcome::Done);
        };
        if obj.should_skip() {
            return Ok(Outcome::Done);
        }

        let status = obj.status_or_default();
        if obj.is_deleting() && status.state != State::Deleting {
            return self
                .update_state(obj, State::Deleting, "deletion requested")
                .await;
        }
        if !obj.is_deleting() && !obj.has_finalizer(&self.finalizer) {
            return match self.instances.add_finalizer(&obj, &self.finalizer, &self.field_owner).await {
                Ok(()) => Ok(Outcome::Requeue),
                Err(e) if e.is_conflict() => Ok(Outcome::Requeue),
                Err(e) => Err(e),
            };
        }

        match status.state {
            State::Unset => self.update_state(obj, State::Processing, "processing").await,
            State::Processing => {
                self.allocate(obj, Mode::Create).await?;
                Ok(Outcome::RequeueAfter(self.requeue.failure))
            }
            State::Deleting => {
                self.allocate(obj, Mode::Delete).await?;
                Ok(Outcome::RequeueAfter(self.requeue.waiting))
            }
            State::Error => self.update_state(obj, State::Processing, "retrying after error").await,
            State::Ready => {
                if status.observed_generation != obj.metadata.generation {
                    return self.update_state(obj, State::Processing, "spec changed").await;
                }
                self.verify(obj).await
            }
        }
    }

    async fn update_state(&self, mut obj: Manifest, state: State, operation: &str) -> Result<Outcome> {
        let mut status = obj.status_or_default().with_state(state).with_operation(operation);
        status.observed_generation = obj.metadata.generation;
        obj.status = Some(status);
        match self.instances.apply_status(&obj, &self.field_owner).await {
            Ok(()) => Ok(Outcome::Requeue),
            Err(e) if e.is_conflict() => Ok(Outcome::Requeue),
            Err(e) => Err(e),
        }
    }

    async fn deploy_infos(&self, obj: &Manifest) -> std::result::Result<Vec<DeployInfo>, (&'static str, crate::error::DeclarativeError)> {
        let spec = self.spec_resolver.spec(obj).await.map_err(|e| ("Spec", e))?;
        let cluster = self.targets.get(obj).await.map_err(|e| ("ClientInitialization", e))?;
        let client_config = self.targets.cache_key(obj);
        let instance = Arc::new(obj.clone());
        Ok(spec
            .installs
            .into_iter()
            .map(|install| DeployInfo {
                instance: Arc::clone(&instance),
                install,
                cluster: Arc::clone(&cluster),
                client_config: client_config.clone(),
            })
            .collect())
    }

    /// Spawns the aggregator, then queues one job per installation.
    async fn allocate(&self, obj: Manifest, mode: Mode) -> Result<()> {
        let infos = match self.deploy_infos(&obj).await {
            Ok(infos) => infos,
            Err((reason, e)) => {
                self.instances
                    .publish_event(&obj, InstanceEvent::warning(reason, e.to_string()))
                    .await;
                let mut failed = obj;
                let mut status = failed.status_or_default().with_state(State::Error).with_err(&e);
                status.observed_generation = failed.metadata.generation;
                failed.status = Some(status);
                return match self.instances.apply_status(&failed, &self.field_owner).await {
                    Err(err) if !err.is_conflict() => Err(err),
                    _ => Ok(()),
                };
            }
        };

        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let remote = match (should_sync(&obj), infos.first()) {
            (true, Some(info)) => Some(RemoteSync::new(Arc::clone(&info.cluster), &self.field_owner)),
            _ => None,
        };
        let remote = match (mode, remote) {
            (Mode::Create, Some(remote)) => {
                remote.sync_to_remote(&obj).await?;
                None
            }
            (Mode::Delete, Some(remote)) => {
                remote.delete_remote(&obj).await?;
                Some(remote)
            }
            (_, None) => None,
        };

        let (responder, responses) = mpsc::channel(infos.len().max(1));
        let aggregator = Arc::clone(&self.aggregator);
        let cancel = self.cancel.child_token();
        let expected = infos.len();
        {
            let (namespace, name) = (namespace.clone(), name.clone());
            tokio::spawn(async move {
                match aggregator.run(&namespace, &name, expected, responses, cancel, remote).await {
                    Ok(outcome) => debug!("Aggregation for {}/{} ended: {:?}", namespace, name, outcome),
                    Err(e) => error!("Aggregation for {}/{} failed: {}", namespace, name, e),
                }
            });
        }

        debug!("Queueing {} {:?} job(s) for {}/{}", expected, mode, namespace, name);
        for info in infos {
            self.pool
                .submit(Job {
                    info,
                    mode,
                    responder: responder.clone(),
                })
                .await?;
        }
        Ok(())
    }

    /// Re-checks every installation of a Ready instance.
    async fn verify(&self, obj: Manifest) -> Result<Outcome> {
        let infos = match self.deploy_infos(&obj).await {
            Ok(infos) => infos,
            Err((_, e)) => return self.update_state(obj, State::Error, &e.to_string()).await,
        };
        for info in &infos {
            match self.installer.verify(info).await {
                Ok(true) => {}
                Ok(false) => {
                    let message = format!("installation {} is not ready", info.install.name);
                    return self.update_state(obj, State::Processing, &message).await;
                }
                Err(e) => return self.update_state(obj, State::Error, &e.to_string()).await,
            }
        }
        Ok(Outcome::RequeueAfter(self.requeue.success))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryClientCache;
    use crate::error::DeclarativeError;
    use crate::mock::{test_manifest, MockCluster, MockInstanceClient};
    use async_trait::async_trait;
    use crds::{InstallItem, MANIFEST_FINALIZER};
    use std::time::Duration;

    struct ScriptedInstaller {
        ready: bool,
        verified: bool,
    }

    #[async_trait]
    impl Installer for ScriptedInstaller {
        async fn install(&self, _info: &DeployInfo) -> Result<bool> {
            Ok(self.ready)
        }

        async fn uninstall(&self, _info: &DeployInfo) -> Result<bool> {
            Ok(self.ready)
        }

        async fn verify(&self, _info: &DeployInfo) -> Result<bool> {
            if self.verified {
                Ok(true)
            } else {
                Err(DeclarativeError::Failed("drift".to_string()))
            }
        }
    }

    fn reconciler(instances: Arc<MockInstanceClient>, ready: bool, verified: bool) -> LegacyReconciler {
        let targets = TargetClients::new(Arc::new(MemoryClientCache::new()), Arc::new(MockCluster::new()));
        LegacyReconciler::new(
            instances,
            targets,
            Arc::new(ScriptedInstaller { ready, verified }),
            LegacyOptions {
                field_owner: "owner".to_string(),
                finalizer: MANIFEST_FINALIZER.to_string(),
                workers: 2,
                requeue: RequeueIntervals::default(),
            },
            CancellationToken::new(),
        )
    }

    fn two_installs(name: &str) -> Manifest {
        let mut obj = test_manifest(name);
        let mut second: InstallItem = obj.spec.installs[0].clone();
        second.name = "second".to_string();
        obj.spec.installs.push(second);
        obj
    }

    async fn wait_for_state(instances: &MockInstanceClient, state: State) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = instances
                    .manifest("default", "m")
                    .map(|m| m.status_or_default().state);
                if current == Some(state) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_walks_to_ready() {
        let instances = Arc::new(MockInstanceClient::new());
        instances.insert(two_installs("m"));
        let reconciler = reconciler(instances.clone(), true, true);

        assert_eq!(reconciler.reconcile("default", "m").await.unwrap(), Outcome::Requeue);
        assert_eq!(reconciler.reconcile("default", "m").await.unwrap(), Outcome::Requeue);
        assert_eq!(instances.manifest("default", "m").unwrap().status_or_default().state, State::Processing);

        reconciler.reconcile("default", "m").await.unwrap();
        wait_for_state(&instances, State::Ready).await;

        assert_eq!(
            reconciler.reconcile("default", "m").await.unwrap(),
            Outcome::RequeueAfter(RequeueIntervals::default().success)
        );
    }

    #[tokio::test]
    async fn test_ready_instance_with_drift_moves_to_error() {
        let instances = Arc::new(MockInstanceClient::new());
        let mut obj = test_manifest("m");
        obj.metadata.finalizers = Some(vec![MANIFEST_FINALIZER.to_string()]);
        let mut status = crds::ManifestStatus::default().with_state(State::Ready);
        status.observed_generation = Some(1);
        obj.status = Some(status);
        instances.insert(obj);

        let reconciler = reconciler(instances.clone(), true, false);
        assert_eq!(reconciler.reconcile("default", "m").await.unwrap(), Outcome::Requeue);
        assert_eq!(instances.manifest("default", "m").unwrap().status_or_default().state, State::Error);

        assert_eq!(reconciler.reconcile("default", "m").await.unwrap(), Outcome::Requeue);
        assert_eq!(instances.manifest("default", "m").unwrap().status_or_default().state, State::Processing);
    }

    #[tokio::test]
    async fn test_deletion_releases_finalizer_once_uninstalled() {
        let instances = Arc::new(MockInstanceClient::new());
        let mut obj = two_installs("m");
        obj.metadata.finalizers = Some(vec![MANIFEST_FINALIZER.to_string()]);
        obj.status = Some(crds::ManifestStatus::default().with_state(State::Ready));
        instances.insert(obj);
        instances.mark_deleted("default", "m");

        let reconciler = reconciler(instances.clone(), true, true);
        assert_eq!(reconciler.reconcile("default", "m").await.unwrap(), Outcome::Requeue);
        assert_eq!(instances.manifest("default", "m").unwrap().status_or_default().state, State::Deleting);

        reconciler.reconcile("default", "m").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while instances.manifest("default", "m").is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
