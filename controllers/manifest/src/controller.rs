//! Main controller implementation.
//!
//! Wires the Kubernetes clients, the renderer registry and the selected
//! reconciliation engine together and runs the Manifest watcher until it
//! exits or the process is asked to stop.

use crate::config::{Config, Strategy};
use crate::error::ControllerError;
use crate::watcher::{watch_manifests, Context, Engine};
use crds::{Manifest, MANIFEST_FINALIZER};
use declarative::{
    ClusterClient, InstanceClient, KubeCluster, KubeInstanceClient, KubeconfigSecretResolver, LegacyOptions,
    LegacyReconciler, ManagedByLabels, ManifestInstaller, MemoryClientCache, Reconciler, ReconcilerOptions,
    RendererRegistry, StrategyResolver, TargetClients,
};
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Name events are reported under.
pub const CONTROLLER_NAME: &str = "manifest-controller";

/// Main controller for Manifest resources.
pub struct Controller {
    watcher: JoinHandle<Result<(), ControllerError>>,
    cancel: CancellationToken,
}

impl Controller {
    /// Connects to the cluster and starts watching.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        let client = Client::try_default().await?;

        let instances: Arc<dyn InstanceClient> =
            Arc::new(KubeInstanceClient::new(client.clone(), CONTROLLER_NAME));
        let local: Arc<dyn ClusterClient> = Arc::new(KubeCluster::new(client.clone()));
        let renderers = Arc::new(RendererRegistry::new(&config.manifest_root));
        let targets = TargetClients::new(Arc::new(MemoryClientCache::new()), Arc::clone(&local)).with_resolver(
            Arc::new(StrategyResolver::new(
                Arc::clone(&local),
                Arc::new(KubeconfigSecretResolver::new(client.clone())),
            )),
        );

        let cancel = CancellationToken::new();
        let engine = match config.strategy {
            Strategy::Declarative => {
                let options = ReconcilerOptions {
                    field_owner: config.field_owner.clone(),
                    finalizer: MANIFEST_FINALIZER.to_string(),
                    namespace: config.install_namespace.clone(),
                    create_namespace: config.create_namespace,
                    delete_prerequisites: config.delete_prerequisites,
                    ready_check: config.ready_check,
                    requeue: config.requeue,
                };
                Engine::Declarative(
                    Reconciler::new(Arc::clone(&instances), local, renderers, options)
                        .with_targets(targets)
                        .with_post_render_transform(Arc::new(ManagedByLabels::new(CONTROLLER_NAME))),
                )
            }
            Strategy::WorkerPool => {
                let installer = Arc::new(ManifestInstaller::new(
                    renderers,
                    config.field_owner.clone(),
                    config.ready_check,
                ));
                let options = LegacyOptions {
                    field_owner: config.field_owner.clone(),
                    finalizer: MANIFEST_FINALIZER.to_string(),
                    workers: config.workers,
                    requeue: config.requeue,
                };
                Engine::WorkerPool(LegacyReconciler::new(
                    Arc::clone(&instances),
                    targets,
                    installer,
                    options,
                    cancel.child_token(),
                ))
            }
        };

        let api: Api<Manifest> = match config.watch_namespace.as_deref() {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        };
        let ctx = Arc::new(Context::new(engine));
        let watcher = tokio::spawn(watch_manifests(api, ctx, config.max_concurrent_reconciles));

        Ok(Self { watcher, cancel })
    }

    /// Runs until the watcher exits or a shutdown signal arrives.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Manifest Controller running");

        let exited = tokio::select! {
            result = &mut self.watcher => Some(result),
            () = shutdown_signal() => None,
        };
        self.cancel.cancel();

        match exited {
            Some(result) => result
                .map_err(|e| ControllerError::Watch(format!("Manifest watcher panicked: {e}")))?
                .map_err(|e| ControllerError::Watch(format!("Manifest watcher error: {e}"))),
            None => {
                info!("Shutdown requested, stopping watcher");
                self.watcher.abort();
                Ok(())
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
