//! Declarative Reconciliation Engine
//!
//! Drives `Manifest` instances towards the state their installations
//! describe: render the installations, diff the result against the resources
//! recorded in the status, prune what disappeared, server-side apply the rest
//! and verify readiness before reporting `Ready`.
//!
//! # Example
//!
//! ```no_run
//! use declarative::{
//!     KubeCluster, KubeInstanceClient, Outcome, Reconciler, ReconcilerOptions, RendererRegistry,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let reconciler = Reconciler::new(
//!     Arc::new(KubeInstanceClient::new(client.clone(), "manifest-controller")),
//!     Arc::new(KubeCluster::new(client)),
//!     Arc::new(RendererRegistry::new("/manifests")),
//!     ReconcilerOptions::default(),
//! );
//!
//! match reconciler.reconcile("kyma-system", "sample").await? {
//!     Outcome::RequeueAfter(interval) => println!("stable, next check in {interval:?}"),
//!     other => println!("not settled yet: {other:?}"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Pruning**: resources dropped from the render are deleted before apply
//! - **Deletion**: the finalizer is released only once every resource is gone
//! - **Remote sync**: optional copy of the instance on the target cluster
//! - **Worker pool**: alternate per-installation path in [`legacy`]

pub mod aggregator;
pub mod apply;
pub mod cache;
pub mod cleanup;
pub mod cluster;
pub mod diff;
pub mod error;
pub mod hooks;
pub mod instance;
pub mod legacy;
pub mod manifest;
pub mod readiness;
pub mod ready_check;
pub mod reconciler;
pub mod remote;
pub mod render;
pub mod resource;
pub mod spec;
pub mod status;
pub mod target;
pub mod workers;
mod task;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

#[cfg(test)]
mod reconciler_test;

pub use cache::{ClientCache, MemoryClientCache, NoopClientCache};
pub use cluster::{ClusterClient, DeleteOutcome, KubeCluster};
pub use error::{DeclarativeError, Result};
pub use hooks::{ManagedByLabels, PostRenderTransform, PostRun, PreDelete};
pub use instance::{InstanceClient, InstanceEvent, KubeInstanceClient};
pub use legacy::{LegacyOptions, LegacyReconciler};
pub use ready_check::ReadyCheckStrategy;
pub use reconciler::{Outcome, Reconciler, ReconcilerOptions, RequeueIntervals};
pub use render::{Renderer, RendererFactory, RendererRegistry};
pub use resource::ResourceInfo;
pub use spec::{ManifestSpecResolver, SpecResolver};
pub use target::{KubeconfigSecretResolver, StrategyResolver, TargetClients, TargetClusterResolver};
pub use workers::{Installer, ManifestInstaller, WorkerPool};
