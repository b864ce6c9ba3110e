//! Declarative reconciliation of a single Manifest.
//!
//! Each pass moves an instance one step: status corrections and the
//! finalizer are persisted before any resource is touched, rendered
//! resources are diffed against `status.synced`, the difference is pruned,
//! the target set is applied and the installation is verified. Every status
//! change ends the pass with a requeue so the next pass starts from the
//! persisted state.

use crate::apply::ConcurrentApply;
use crate::cache::MemoryClientCache;
use crate::cleanup::ConcurrentCleanup;
use crate::cluster::{ClusterClient, DeleteOutcome};
use crate::diff::{difference, resources_diff};
use crate::error::{DeclarativeError, Result};
use crate::hooks::{PostRenderTransform, PostRun, PreDelete};
use crate::instance::{InstanceClient, InstanceEvent};
use crate::manifest::parse_manifests;
use crate::ready_check::ReadyCheckStrategy;
use crate::remote::{should_sync, RemoteSync};
use crate::render::{CompositeRenderer, Renderer, RendererRegistry};
use crate::resource::{infos_to_resources, ResourceConverter, ResourceInfo};
use crate::spec::{ManifestSpecResolver, SpecResolver};
use crate::status::{
    installation_condition, is_condition_true, resources_condition, set_condition,
    set_condition_if_absent, CONDITION_TYPE_INSTALLATION, CONDITION_TYPE_RESOURCES,
};
use crate::target::{ensure_namespace, InstallOptions, TargetClients};
use crds::{ConditionStatus, Manifest, State, MANIFEST_FINALIZER};
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the caller should do after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Run again soon, rate limited per instance
    Requeue,
    /// Run again after the interval
    RequeueAfter(Duration),
    /// Nothing left to do until the instance changes
    Done,
}

/// Requeue intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequeueIntervals {
    /// After a pass that reached Ready
    pub success: Duration,
    /// After a failed pass
    pub failure: Duration,
    /// While waiting on a dependency
    pub waiting: Duration,
}

impl Default for RequeueIntervals {
    fn default() -> Self {
        Self {
            success: Duration::from_secs(30),
            failure: Duration::from_secs(10),
            waiting: Duration::from_secs(3),
        }
    }
}

/// Reconciler settings.
#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    /// Field manager of every server-side apply
    pub field_owner: String,
    /// Finalizer guarding instance deletion
    pub finalizer: String,
    /// Namespace rendered resources default to; empty means the instance namespace
    pub namespace: String,
    /// Apply the install namespace before rendering
    pub create_namespace: bool,
    /// Remove renderer prerequisites (e.g. CRDs) when an instance is deleted
    pub delete_prerequisites: bool,
    /// How readiness is verified
    pub ready_check: ReadyCheckStrategy,
    /// Requeue intervals
    pub requeue: RequeueIntervals,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            field_owner: "declarative.operator.io/applier".to_string(),
            finalizer: MANIFEST_FINALIZER.to_string(),
            namespace: String::new(),
            create_namespace: false,
            delete_prerequisites: false,
            ready_check: ReadyCheckStrategy::default(),
            requeue: RequeueIntervals::default(),
        }
    }
}

/// Declarative Manifest reconciler.
pub struct Reconciler {
    instances: Arc<dyn InstanceClient>,
    spec_resolver: Arc<dyn SpecResolver>,
    renderers: Arc<RendererRegistry>,
    targets: TargetClients,
    post_render: Vec<Arc<dyn PostRenderTransform>>,
    post_runs: Vec<Arc<dyn PostRun>>,
    pre_deletes: Vec<Arc<dyn PreDelete>>,
    options: ReconcilerOptions,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler installing into `cluster` unless a target resolver
    /// is configured.
    pub fn new(
        instances: Arc<dyn InstanceClient>,
        cluster: Arc<dyn ClusterClient>,
        renderers: Arc<RendererRegistry>,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            spec_resolver: Arc::new(ManifestSpecResolver::new(Arc::clone(&instances))),
            instances,
            renderers,
            targets: TargetClients::new(Arc::new(MemoryClientCache::new()), cluster),
            post_render: Vec::new(),
            post_runs: Vec::new(),
            pre_deletes: Vec::new(),
            options,
        }
    }

    /// Replaces the spec resolver.
    #[must_use]
    pub fn with_spec_resolver(mut self, resolver: Arc<dyn SpecResolver>) -> Self {
        self.spec_resolver = resolver;
        self
    }

    /// Replaces the client cache and the target cluster selection.
    #[must_use]
    pub fn with_targets(mut self, targets: TargetClients) -> Self {
        self.targets = targets;
        self
    }

    /// Adds a transform run on parsed objects.
    #[must_use]
    pub fn with_post_render_transform(mut self, transform: Arc<dyn PostRenderTransform>) -> Self {
        self.post_render.push(transform);
        self
    }

    /// Adds a hook run after a successful apply.
    #[must_use]
    pub fn with_post_run(mut self, hook: Arc<dyn PostRun>) -> Self {
        self.post_runs.push(hook);
        self
    }

    /// Adds a hook run before resources are pruned on deletion.
    #[must_use]
    pub fn with_pre_delete(mut self, hook: Arc<dyn PreDelete>) -> Self {
        self.pre_deletes.push(hook);
        self
    }

    /// Settings of this reconciler.
    #[must_use]
    pub fn options(&self) -> &ReconcilerOptions {
        &self.options
    }

    fn install_options(&self, obj: &Manifest) -> InstallOptions {
        let namespace = if self.options.namespace.is_empty() {
            obj.namespace().unwrap_or_default()
        } else {
            self.options.namespace.clone()
        };
        InstallOptions {
            namespace,
            create_namespace: self.options.create_namespace,
            field_owner: self.options.field_owner.clone(),
        }
    }

    /// Runs one pass for the instance `namespace/name`.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Outcome> {
        let Some(mut obj) = self.instances.get(namespace, name).await? else {
            info!("Manifest {}/{} no longer exists", namespace, name);
            return Ok(Outcome::Done);
        };

        if obj.should_skip() {
            debug!("Skipping reconciliation of {}/{}", namespace, name);
            return Ok(Outcome::Done);
        }

        if let Err(e) = initialize(&mut obj) {
            debug!("Correcting status of {}/{}: {}", namespace, name, e);
            return self.write_status(&mut obj).await;
        }

        if !obj.is_deleting() && !obj.has_finalizer(&self.options.finalizer) {
            return match self
                .instances
                .add_finalizer(&obj, &self.options.finalizer, &self.options.field_owner)
                .await
            {
                Ok(()) => Ok(Outcome::Requeue),
                Err(e) if e.is_conflict() => Ok(Outcome::Requeue),
                Err(e) => Err(e),
            };
        }

        let spec = match self.spec_resolver.spec(&obj).await {
            Ok(spec) => spec,
            Err(e) => return self.fail(&mut obj, "Spec", e).await,
        };

        let cluster = match self.target_cluster(&obj).await {
            Ok(cluster) => cluster,
            Err(e) => return self.fail(&mut obj, "ClientInitialization", e).await,
        };

        let renderer = match self.initialize_renderer(&obj, &spec).await {
            Ok(renderer) => renderer,
            Err(e) => return self.fail(&mut obj, "RendererInitialization", e).await,
        };

        let (target, current) = match self.render_resources(&mut obj, &renderer, &cluster).await {
            Ok(sets) => sets,
            Err(_) => return self.write_status(&mut obj).await,
        };

        let prune = difference(&current, &target);
        match self.prune_diff(&mut obj, &cluster, &renderer, &prune).await {
            Ok(()) => {}
            Err(DeclarativeError::DeletionNotFinished) => {
                debug!("Deletion of {}/{} is not finished", namespace, name);
                return Ok(Outcome::Requeue);
            }
            Err(_) => return self.write_status(&mut obj).await,
        }

        if obj.is_deleting() {
            return self.finalize(&mut obj, &cluster).await;
        }

        if should_sync(&obj) {
            let remote = RemoteSync::new(Arc::clone(&cluster), &self.options.field_owner);
            if let Err(e) = remote.sync_to_remote(&obj).await {
                return self.fail(&mut obj, "RemoteSync", e).await;
            }
        }

        match self.sync_resources(&mut obj, &cluster, &target).await {
            Ok(()) => Ok(Outcome::RequeueAfter(self.options.requeue.success)),
            Err(e) => {
                debug!("Pass for {}/{} ended with: {}", namespace, name, e);
                self.write_status(&mut obj).await
            }
        }
    }

    async fn target_cluster(&self, obj: &Manifest) -> Result<Arc<dyn ClusterClient>> {
        let cluster = self.targets.get(obj).await?;
        let options = self.install_options(obj);
        if options.needs_namespace() {
            ensure_namespace(cluster.as_ref(), &options.namespace, &options.field_owner).await?;
        }
        Ok(cluster)
    }

    async fn initialize_renderer(&self, obj: &Manifest, spec: &crate::spec::Spec) -> Result<CompositeRenderer> {
        let renderer = self.renderers.for_spec(spec)?;
        renderer.initialize(obj).await?;
        renderer.ensure_prerequisites(obj).await?;
        Ok(renderer)
    }

    /// Target and current handles. Errors are recorded on the status.
    async fn render_resources(
        &self,
        obj: &mut Manifest,
        renderer: &CompositeRenderer,
        cluster: &Arc<dyn ClusterClient>,
    ) -> Result<(Vec<ResourceInfo>, Vec<ResourceInfo>)> {
        let options = self.install_options(obj);
        let converter = ResourceConverter::new(cluster.as_ref(), options.namespace);

        let target = if obj.is_deleting() {
            Vec::new()
        } else {
            self.render_target(obj, renderer, &converter).await?
        };

        let mut status = obj.status_or_default();
        let current = match converter.resources_to_infos(&status.synced).await {
            Ok(current) => current,
            Err(e) => {
                self.record_error(obj, "CurrentResourceParsing", &e).await;
                return Err(e);
            }
        };

        if !is_condition_true(&status.conditions, CONDITION_TYPE_RESOURCES) {
            let mut condition = resources_condition(obj.metadata.generation);
            condition.status = ConditionStatus::True;
            let message = condition.message.clone();
            self.instances
                .publish_event(obj, InstanceEvent::normal(&condition.reason, &message))
                .await;
            set_condition(&mut status.conditions, condition);
            status = status.with_operation(message);
        }
        obj.status = Some(status);
        Ok((target, current))
    }

    async fn render_target(
        &self,
        obj: &mut Manifest,
        renderer: &CompositeRenderer,
        converter: &ResourceConverter<'_>,
    ) -> Result<Vec<ResourceInfo>> {
        let text = match renderer.render(obj).await {
            Ok(text) => text,
            Err(e) => {
                self.record_error(obj, "Render", &e).await;
                return Err(e);
            }
        };

        let mut objects = match parse_manifests(&text) {
            Ok(objects) => objects,
            Err(e) => {
                self.record_error(obj, "ManifestParsing", &e).await;
                return Err(e);
            }
        };

        for transform in &self.post_render {
            if let Err(e) = transform.transform(obj, &mut objects).await {
                self.record_error(obj, "PostRenderTransform", &e).await;
                return Err(e);
            }
        }

        match converter.objects_to_infos(objects).await {
            Ok(target) => Ok(target),
            Err(e) => {
                self.record_error(obj, "TargetResourceParsing", &e).await;
                Err(e)
            }
        }
    }

    async fn prune_diff(
        &self,
        obj: &mut Manifest,
        cluster: &Arc<dyn ClusterClient>,
        renderer: &CompositeRenderer,
        prune: &[ResourceInfo],
    ) -> Result<()> {
        if obj.is_deleting() {
            for hook in &self.pre_deletes {
                if let Err(e) = hook.run(cluster.as_ref(), obj).await {
                    self.record_error(obj, "PreDelete", &e).await;
                    return Err(e);
                }
            }
        }

        if !prune.is_empty() {
            info!("Pruning {} resources of {}", prune.len(), obj.name_any());
        }
        match ConcurrentCleanup::new(Arc::clone(cluster)).run(prune).await {
            Ok(()) => {}
            Err(DeclarativeError::DeletionNotFinished) => {
                self.instances
                    .publish_event(obj, InstanceEvent::normal("Deletion", "waiting for resources to be deleted"))
                    .await;
                return Err(DeclarativeError::DeletionNotFinished);
            }
            Err(e) => {
                self.record_error(obj, "Deletion", &e).await;
                return Err(e);
            }
        }

        if obj.is_deleting() && self.options.delete_prerequisites {
            if let Err(e) = renderer.remove_prerequisites(obj).await {
                self.record_error(obj, "PrerequisiteRemoval", &e).await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Releases a deleting instance once everything it owned is gone.
    async fn finalize(&self, obj: &mut Manifest, cluster: &Arc<dyn ClusterClient>) -> Result<Outcome> {
        if should_sync(obj) {
            let remote = RemoteSync::new(Arc::clone(cluster), &self.options.field_owner);
            let released = match remote.delete_remote(obj).await {
                Ok(DeleteOutcome::Deleted) => Ok(()),
                Ok(DeleteOutcome::Pending) => remote.remove_remote_finalizer(obj).await,
                Err(e) => Err(e),
            };
            if let Err(e) = released {
                self.instances
                    .publish_event(obj, InstanceEvent::warning("RemoteSync", e.to_string()))
                    .await;
                obj.status = Some(obj.status_or_default().with_state(State::Deleting).with_err(&e));
                return self.write_status(obj).await;
            }
        }

        if obj.has_finalizer(&self.options.finalizer) {
            return match self.instances.remove_finalizer(obj, &self.options.finalizer).await {
                Ok(()) => {
                    info!("Released finalizer of {}", obj.name_any());
                    Ok(Outcome::Done)
                }
                Err(e) if e.is_conflict() || e.is_not_found() => Ok(Outcome::Requeue),
                Err(e) => {
                    self.instances
                        .publish_event(obj, InstanceEvent::warning("FinalizerRemoval", e.to_string()))
                        .await;
                    Err(e)
                }
            };
        }

        let message = format!(
            "waiting as other finalizers are present: {}",
            obj.finalizers().join(", ")
        );
        self.instances
            .publish_event(obj, InstanceEvent::normal("FinalizerRemoval", &message))
            .await;
        obj.status = Some(obj.status_or_default().with_state(State::Deleting).with_operation(message));
        self.write_status(obj).await
    }

    async fn sync_resources(
        &self,
        obj: &mut Manifest,
        cluster: &Arc<dyn ClusterClient>,
        target: &[ResourceInfo],
    ) -> Result<()> {
        if let Err(e) = ConcurrentApply::new(Arc::clone(cluster), &self.options.field_owner)
            .run(target)
            .await
        {
            self.record_error(obj, "ServerSideApply", &e).await;
            return Err(e);
        }

        let mut status = obj.status_or_default();
        let synced = infos_to_resources(target);
        let changed = !resources_diff(&status.synced, &synced).is_empty();
        status.synced = synced;
        if changed {
            let err = DeclarativeError::ResourceSyncStateDiff;
            set_condition(&mut status.conditions, installation_condition(obj.metadata.generation));
            obj.status = Some(status.with_state(State::Processing).with_err(&err));
            return Err(err);
        }
        obj.status = Some(status);

        for hook in &self.post_runs {
            if let Err(e) = hook.run(cluster.as_ref(), obj).await {
                self.record_error(obj, "PostRun", &e).await;
                return Err(e);
            }
        }

        self.check_target_readiness(obj, cluster, target).await
    }

    async fn check_target_readiness(
        &self,
        obj: &mut Manifest,
        cluster: &Arc<dyn ClusterClient>,
        target: &[ResourceInfo],
    ) -> Result<()> {
        let check = self.options.ready_check.build(Arc::clone(cluster));
        let mut status = obj.status_or_default();

        match check.run(target).await {
            Ok(()) => {}
            Err(DeclarativeError::ResourcesNotReady) => {
                let message = "waiting for resources to become ready";
                self.instances
                    .publish_event(obj, InstanceEvent::normal("ResourceReadyCheck", message))
                    .await;
                set_condition(&mut status.conditions, installation_condition(obj.metadata.generation));
                obj.status = Some(status.with_state(State::Processing).with_operation(message));
                return Err(DeclarativeError::ResourcesNotReady);
            }
            Err(e) => {
                self.record_error(obj, "ReadyCheck", &e).await;
                return Err(e);
            }
        }

        if !is_condition_true(&status.conditions, CONDITION_TYPE_INSTALLATION) || status.state != State::Ready {
            let mut condition = installation_condition(obj.metadata.generation);
            condition.status = ConditionStatus::True;
            let message = condition.message.clone();
            self.instances
                .publish_event(obj, InstanceEvent::normal(&condition.reason, &message))
                .await;
            set_condition(&mut status.conditions, condition);
            obj.status = Some(status.with_state(State::Ready).with_operation(message));
            return Err(DeclarativeError::InstallationConditionRequiresUpdate);
        }
        Ok(())
    }

    /// Records `err` as a warning event and moves the status to Error.
    async fn record_error(&self, obj: &mut Manifest, reason: &str, err: &DeclarativeError) {
        warn!("{} failed for {}: {}", reason, obj.name_any(), err);
        self.instances
            .publish_event(obj, InstanceEvent::warning(reason, err.to_string()))
            .await;
        obj.status = Some(obj.status_or_default().with_state(State::Error).with_err(err));
    }

    async fn fail(&self, obj: &mut Manifest, reason: &str, err: DeclarativeError) -> Result<Outcome> {
        self.record_error(obj, reason, &err).await;
        self.write_status(obj).await
    }

    /// Persists the status; a conflict only asks for another pass.
    async fn write_status(&self, obj: &mut Manifest) -> Result<Outcome> {
        let mut status = obj.status_or_default();
        status.observed_generation = obj.metadata.generation;
        obj.status = Some(status);
        match self.instances.apply_status(obj, &self.options.field_owner).await {
            Ok(()) => Ok(Outcome::Requeue),
            Err(e) if e.is_conflict() => {
                debug!("Status write of {} conflicted, requeueing", obj.name_any());
                Ok(Outcome::Requeue)
            }
            Err(e) => Err(e),
        }
    }
}

/// Applies the status corrections that have to be persisted before any work.
fn initialize(obj: &mut Manifest) -> Result<()> {
    let mut status = obj.status_or_default();

    if obj.is_deleting() && status.state != State::Deleting {
        let err = DeclarativeError::DeletionTimestampSetButNotInDeletingState;
        obj.status = Some(status.with_state(State::Deleting).with_err(&err));
        return Err(err);
    }

    let generation = obj.metadata.generation;
    set_condition_if_absent(&mut status.conditions, resources_condition(generation));
    set_condition_if_absent(&mut status.conditions, installation_condition(generation));

    if status.state == State::Unset {
        let err = DeclarativeError::ObjectHasEmptyState;
        obj.status = Some(status.with_state(State::Processing).with_err(&err));
        return Err(err);
    }

    if status.state == State::Ready && status.observed_generation != generation {
        obj.status = Some(
            status
                .with_state(State::Processing)
                .with_operation(format!("reconciling generation {}", generation.unwrap_or_default())),
        );
        return Err(DeclarativeError::GenerationChanged);
    }
    obj.status = Some(status);
    Ok(())
}
