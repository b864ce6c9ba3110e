//! Fixed-size worker pool executing install and uninstall jobs.
//!
//! Jobs are handed over through a rendezvous channel, so a producer waits
//! until a worker is free. Each job carries its own response channel.

use crate::apply::ConcurrentApply;
use crate::cleanup::ConcurrentCleanup;
use crate::cluster::ClusterClient;
use crate::error::{DeclarativeError, Result};
use crate::manifest::parse_manifests;
use crate::ready_check::ReadyCheckStrategy;
use crate::render::RendererRegistry;
use crate::resource::{ResourceConverter, ResourceInfo};
use crate::spec::InstallSpec;
use async_trait::async_trait;
use crds::Manifest;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Whether a job installs or removes its resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Render, apply and check readiness
    Create,
    /// Render and delete
    Delete,
}

/// One installation of one instance.
#[derive(Clone)]
pub struct DeployInfo {
    /// Instance the installation belongs to
    pub instance: Arc<Manifest>,
    /// Installation to render
    pub install: InstallSpec,
    /// Target cluster
    pub cluster: Arc<dyn ClusterClient>,
    /// Cache key identifying the target cluster
    pub client_config: String,
}

impl std::fmt::Debug for DeployInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployInfo")
            .field("instance", &self.instance.name_any())
            .field("install", &self.install.name)
            .field("client_config", &self.client_config)
            .finish_non_exhaustive()
    }
}

/// Work item on the pool's queue.
#[derive(Debug)]
pub struct Job {
    /// What to install
    pub info: DeployInfo,
    /// Install or remove
    pub mode: Mode,
    /// Where the outcome is sent
    pub responder: mpsc::Sender<InstallResponse>,
}

/// Outcome of one job.
#[derive(Debug)]
pub struct InstallResponse {
    /// Resources are in the desired state
    pub ready: bool,
    /// Namespace of the instance
    pub namespace: String,
    /// Name of the instance
    pub manifest: String,
    /// Failure, if any
    pub err: Option<DeclarativeError>,
    /// Installation the response is for
    pub chart_name: String,
    /// Cache key of the target cluster
    pub client_config: String,
    /// Values the installation was rendered with
    pub overrides: BTreeMap<String, String>,
}

/// Executes the work of a single job.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Installs; `Ok(false)` while resources are not ready yet.
    async fn install(&self, info: &DeployInfo) -> Result<bool>;

    /// Uninstalls; `Ok(false)` while deletion is still in progress.
    async fn uninstall(&self, info: &DeployInfo) -> Result<bool>;

    /// Checks that an installed release is still complete and ready.
    async fn verify(&self, info: &DeployInfo) -> Result<bool>;
}

/// [`Installer`] rendering through a [`RendererRegistry`].
pub struct ManifestInstaller {
    renderers: Arc<RendererRegistry>,
    field_owner: String,
    ready_check: ReadyCheckStrategy,
}

impl std::fmt::Debug for ManifestInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestInstaller")
            .field("field_owner", &self.field_owner)
            .finish_non_exhaustive()
    }
}

impl ManifestInstaller {
    /// Applies as `field_owner` and verifies with `ready_check`.
    pub fn new(
        renderers: Arc<RendererRegistry>,
        field_owner: impl Into<String>,
        ready_check: ReadyCheckStrategy,
    ) -> Self {
        Self {
            renderers,
            field_owner: field_owner.into(),
            ready_check,
        }
    }

    async fn resources(&self, info: &DeployInfo, prerequisites: bool) -> Result<Vec<ResourceInfo>> {
        let renderer = self.renderers.for_install(&info.install)?;
        renderer.initialize(&info.instance).await?;
        if prerequisites {
            renderer.ensure_prerequisites(&info.instance).await?;
        }
        let objects = parse_manifests(&renderer.render(&info.instance).await?)?;
        ResourceConverter::new(info.cluster.as_ref(), info.instance.namespace().unwrap_or_default())
            .objects_to_infos(objects)
            .await
    }

    async fn is_ready(&self, info: &DeployInfo, resources: &[ResourceInfo]) -> Result<bool> {
        match self.ready_check.build(Arc::clone(&info.cluster)).run(resources).await {
            Ok(()) => Ok(true),
            Err(DeclarativeError::ResourcesNotReady) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Installer for ManifestInstaller {
    async fn install(&self, info: &DeployInfo) -> Result<bool> {
        let resources = self.resources(info, true).await?;
        ConcurrentApply::new(Arc::clone(&info.cluster), &self.field_owner)
            .run(&resources)
            .await?;
        self.is_ready(info, &resources).await
    }

    async fn uninstall(&self, info: &DeployInfo) -> Result<bool> {
        let resources = self.resources(info, false).await?;
        match ConcurrentCleanup::new(Arc::clone(&info.cluster)).run(&resources).await {
            Ok(()) => Ok(true),
            Err(DeclarativeError::DeletionNotFinished) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn verify(&self, info: &DeployInfo) -> Result<bool> {
        let resources = self.resources(info, false).await?;
        self.is_ready(info, &resources).await
    }
}

/// Workers consuming jobs until cancelled or the queue closes.
pub struct WorkerPool {
    jobs: flume::Sender<Job>,
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.handles.len())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Starts `size` workers running `installer`.
    pub fn start(size: usize, installer: Arc<dyn Installer>, cancel: CancellationToken) -> Self {
        let (jobs, queue) = flume::bounded::<Job>(0);
        let handles = (0..size.max(1))
            .map(|id| {
                let queue = queue.clone();
                let installer = Arc::clone(&installer);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => break,
                            job = queue.recv_async() => match job {
                                Ok(job) => process(id, job, installer.as_ref()).await,
                                Err(_) => break,
                            },
                        }
                    }
                    debug!("Worker {} stopped", id);
                })
            })
            .collect();
        info!("Started {} install workers", size.max(1));
        Self { jobs, handles }
    }

    /// Hands `job` to the next free worker.
    pub async fn submit(&self, job: Job) -> Result<()> {
        self.jobs
            .send_async(job)
            .await
            .map_err(|_| DeclarativeError::Failed("worker pool is shut down".to_string()))
    }

    /// Number of workers.
    #[must_use]
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Waits for every worker to stop.
    pub async fn join(self) {
        drop(self.jobs);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Install worker panicked: {}", e);
            }
        }
    }
}

async fn process(worker: usize, job: Job, installer: &dyn Installer) {
    let Job { info, mode, responder } = job;
    debug!("Worker {} processing {:?} of {:?}", worker, mode, info);

    let result = match mode {
        Mode::Create => installer.install(&info).await,
        Mode::Delete => installer.uninstall(&info).await,
    };
    let (ready, err) = match result {
        Ok(ready) => (ready, None),
        Err(e) => (false, Some(e)),
    };

    let response = InstallResponse {
        ready,
        namespace: info.instance.namespace().unwrap_or_default(),
        manifest: info.instance.name_any(),
        err,
        chart_name: info.install.name.clone(),
        client_config: info.client_config.clone(),
        overrides: info.install.source.values.clone(),
    };
    if responder.send(response).await.is_err() {
        debug!("Response for {} dropped, aggregator is gone", info.install.name);
    }
}
