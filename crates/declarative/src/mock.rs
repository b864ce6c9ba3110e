//! In-memory doubles for the cluster, instance and renderer seams.
//!
//! Available to this crate's tests and, behind the `test-util` feature, to
//! dependent crates.

#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

use crate::cluster::{ClusterClient, DeleteOutcome};
use crate::error::{DeclarativeError, Result};
use crate::instance::{InstanceClient, InstanceEvent};
use crate::render::{Renderer, RendererFactory};
use crate::resource::{Mapping, ResourceConverter, ResourceInfo};
use crate::spec::InstallSpec;
use async_trait::async_trait;
use chrono::Utc;
use crds::{
    InstallItem, InstallSource, Manifest, ManifestSpec, ManifestStatus, OverrideSelector, RenderMode,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CLUSTER_SCOPED: &[&str] = &[
    "Namespace",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "PersistentVolume",
    "StorageClass",
];

type ObjectId = (String, String, String);

fn now() -> Time {
    let stamp = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    serde_json::from_value(serde_json::Value::String(stamp)).unwrap()
}

#[derive(Default)]
struct ClusterState {
    objects: BTreeMap<ObjectId, DynamicObject>,
    applied: Vec<String>,
    deleted: Vec<String>,
    fail_apply: HashSet<String>,
    fail_delete: HashSet<String>,
    fail_get: HashSet<String>,
    fail_mapping: HashSet<String>,
    blocked: HashSet<String>,
    get_delays: HashMap<String, Duration>,
    get_calls: usize,
}

/// In-memory target cluster.
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<ClusterState>,
}

impl std::fmt::Debug for MockCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockCluster")
            .field("objects", &self.object_count())
            .finish_non_exhaustive()
    }
}

fn id_of(info: &ResourceInfo) -> ObjectId {
    (
        info.kind().to_string(),
        info.namespace().unwrap_or_default().to_string(),
        info.name().to_string(),
    )
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }

    /// Stores the objects as if they already existed.
    pub fn insert_all(&self, infos: &[ResourceInfo]) {
        let mut state = self.state();
        for info in infos {
            state.objects.insert(id_of(info), info.object.clone());
        }
    }

    pub fn fail_apply(&self, name: &str) {
        self.state().fail_apply.insert(name.to_string());
    }

    pub fn fail_delete(&self, name: &str) {
        self.state().fail_delete.insert(name.to_string());
    }

    pub fn fail_get(&self, name: &str) {
        self.state().fail_get.insert(name.to_string());
    }

    /// Discovery of `kind` fails.
    pub fn fail_mapping(&self, kind: &str) {
        self.state().fail_mapping.insert(kind.to_string());
    }

    /// Deletes of `name` only mark it as terminating.
    pub fn block_deletion(&self, name: &str) {
        self.state().blocked.insert(name.to_string());
    }

    /// Lets terminating `name` disappear, as if its finalizers finished.
    pub fn release(&self, name: &str) {
        let mut state = self.state();
        state.blocked.remove(name);
        state
            .objects
            .retain(|(_, _, n), obj| n != name || obj.metadata.deletion_timestamp.is_none());
    }

    pub fn delay_get(&self, name: &str, delay: Duration) {
        self.state().get_delays.insert(name.to_string(), delay);
    }

    /// Forgets recorded apply and delete calls.
    pub fn clear_history(&self) {
        let mut state = self.state();
        state.applied.clear();
        state.deleted.clear();
    }

    pub fn applied_names(&self) -> Vec<String> {
        let mut names = self.state().applied.clone();
        names.sort();
        names
    }

    pub fn deleted_names(&self) -> Vec<String> {
        let mut names = self.state().deleted.clone();
        names.sort();
        names
    }

    pub fn contains(&self, kind: &str, namespace: &str, name: &str) -> bool {
        self.state()
            .objects
            .contains_key(&(kind.to_string(), namespace.to_string(), name.to_string()))
    }

    pub fn object(&self, kind: &str, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.state()
            .objects
            .get(&(kind.to_string(), namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn status_of(&self, kind: &str, namespace: &str, name: &str) -> Option<serde_json::Value> {
        self.object(kind, namespace, name)
            .and_then(|obj| obj.data.get("status").cloned())
    }

    pub fn object_count(&self) -> usize {
        self.state().objects.len()
    }

    pub fn get_calls(&self) -> usize {
        self.state().get_calls
    }

    /// Parses and resolves `yaml` with `default` as namespace.
    pub async fn infos_from_yaml(&self, yaml: &str) -> Vec<ResourceInfo> {
        let objects = crate::manifest::parse_manifests(yaml).unwrap();
        ResourceConverter::new(self, "default")
            .objects_to_infos(objects)
            .await
            .unwrap()
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn mapping(&self, gvk: &GroupVersionKind) -> Result<Mapping> {
        if self.state().fail_mapping.contains(&gvk.kind) {
            return Err(DeclarativeError::Discovery(format!("no mapping for {}", gvk.kind)));
        }
        Ok(Mapping {
            api_resource: ApiResource::from_gvk(gvk),
            namespaced: !CLUSTER_SCOPED.contains(&gvk.kind.as_str()),
        })
    }

    async fn apply(&self, info: &ResourceInfo, _field_owner: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_apply.contains(info.name()) {
            return Err(DeclarativeError::Failed(format!("apply of {} rejected", info.name())));
        }
        state.applied.push(info.name().to_string());

        let id = id_of(info);
        let mut object = info.object.clone();
        if let Some(existing) = state.objects.get(&id) {
            if object.data.get("status").is_none() {
                if let Some(status) = existing.data.get("status") {
                    object.data["status"] = status.clone();
                }
            }
            object.metadata.deletion_timestamp = existing.metadata.deletion_timestamp.clone();
        }
        state.objects.insert(id, object);
        Ok(())
    }

    async fn apply_status(&self, info: &ResourceInfo, _field_owner: &str) -> Result<()> {
        let mut state = self.state();
        let existing = state
            .objects
            .get_mut(&id_of(info))
            .ok_or_else(|| DeclarativeError::NotFound(info.to_string()))?;
        if let Some(status) = info.object.data.get("status") {
            existing.data["status"] = status.clone();
        }
        Ok(())
    }

    async fn get(&self, info: &ResourceInfo) -> Result<Option<DynamicObject>> {
        let delay = {
            let mut state = self.state();
            state.get_calls += 1;
            state.get_delays.get(info.name()).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state();
        if state.fail_get.contains(info.name()) {
            return Err(DeclarativeError::Failed(format!("get of {} failed", info.name())));
        }
        Ok(state.objects.get(&id_of(info)).cloned())
    }

    async fn delete(&self, info: &ResourceInfo) -> Result<DeleteOutcome> {
        let mut state = self.state();
        if state.fail_delete.contains(info.name()) {
            return Err(DeclarativeError::Failed(format!("delete of {} failed", info.name())));
        }
        state.deleted.push(info.name().to_string());

        let id = id_of(info);
        let blocked = state.blocked.contains(info.name());
        let Some(existing) = state.objects.get_mut(&id) else {
            return Ok(DeleteOutcome::Deleted);
        };
        if blocked || !existing.finalizers().is_empty() {
            existing
                .metadata
                .deletion_timestamp
                .get_or_insert_with(now);
            return Ok(DeleteOutcome::Pending);
        }
        state.objects.remove(&id);
        Ok(DeleteOutcome::Deleted)
    }

    async fn patch_merge(&self, info: &ResourceInfo, patch: &serde_json::Value) -> Result<()> {
        let mut state = self.state();
        let id = id_of(info);
        let existing = state
            .objects
            .get_mut(&id)
            .ok_or_else(|| DeclarativeError::NotFound(info.to_string()))?;
        if let Some(finalizers) = patch.pointer("/metadata/finalizers") {
            existing.metadata.finalizers = serde_json::from_value(finalizers.clone())?;
        }
        let released = existing.metadata.deletion_timestamp.is_some() && existing.finalizers().is_empty();
        if released {
            state.objects.remove(&id);
        }
        Ok(())
    }
}

/// ConfigMap handles named `names` in the `default` namespace.
pub async fn test_infos(cluster: &MockCluster, names: &[&str]) -> Vec<ResourceInfo> {
    cluster.infos_from_yaml(&config_maps_yaml(names)).await
}

/// Manifest in `default` with one chart install named `main`.
pub fn test_manifest(name: &str) -> Manifest {
    let mut obj = Manifest::new(
        name,
        ManifestSpec {
            installs: vec![InstallItem {
                name: "main".to_string(),
                source: InstallSource {
                    mode: RenderMode::Chart,
                    path: Some("main".to_string()),
                    chart_name: Some("main".to_string()),
                    ..Default::default()
                },
                override_selector: None,
            }],
            ..Default::default()
        },
    );
    obj.metadata.namespace = Some("default".to_string());
    obj.metadata.generation = Some(1);
    obj.metadata.resource_version = Some("1".to_string());
    obj.metadata.uid = Some(format!("uid-{name}"));
    obj
}

/// Fresh, empty directory under the system temp dir.
pub fn scratch_dir(name: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let dir = std::env::temp_dir().join(format!(
        "declarative-{name}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[derive(Default)]
struct InstanceState {
    objects: BTreeMap<(String, String), Manifest>,
    status_writes: Vec<ManifestStatus>,
    events: Vec<InstanceEvent>,
    overrides: Vec<(String, String, BTreeMap<String, String>)>,
    conflict_next_status: bool,
    version: u64,
}

/// In-memory control plane holding Manifest instances.
#[derive(Default)]
pub struct MockInstanceClient {
    state: Mutex<InstanceState>,
}

impl std::fmt::Debug for MockInstanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockInstanceClient").finish_non_exhaustive()
    }
}

fn instance_id(obj: &Manifest) -> (String, String) {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

impl MockInstanceClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, InstanceState> {
        self.state.lock().unwrap()
    }

    fn bump(state: &mut InstanceState, obj: &mut Manifest) {
        state.version += 1;
        obj.metadata.resource_version = Some(format!("v{}", state.version));
    }

    /// Stores `obj`, replacing any previous version.
    pub fn insert(&self, mut obj: Manifest) {
        let mut state = self.state();
        Self::bump(&mut state, &mut obj);
        state.objects.insert(instance_id(&obj), obj);
    }

    pub fn manifest(&self, namespace: &str, name: &str) -> Option<Manifest> {
        self.state()
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Marks the stored instance as being deleted.
    pub fn mark_deleted(&self, namespace: &str, name: &str) {
        let mut state = self.state();
        if let Some(obj) = state.objects.get_mut(&(namespace.to_string(), name.to_string())) {
            obj.metadata.deletion_timestamp = Some(now());
        }
    }

    /// Registers ConfigMap data returned for `selector` (`k=v,k2=v2`) in `namespace`.
    pub fn add_override(&self, namespace: &str, selector: &str, values: BTreeMap<String, String>) {
        self.state()
            .overrides
            .push((namespace.to_string(), selector.to_string(), values));
    }

    /// The next status write fails with a conflict.
    pub fn conflict_on_next_status(&self) {
        self.state().conflict_next_status = true;
    }

    pub fn status_writes(&self) -> Vec<ManifestStatus> {
        self.state().status_writes.clone()
    }

    pub fn events(&self) -> Vec<InstanceEvent> {
        self.state().events.clone()
    }

    pub fn event_reasons(&self) -> Vec<String> {
        self.state().events.iter().map(|e| e.reason.clone()).collect()
    }
}

#[async_trait]
impl InstanceClient for MockInstanceClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Manifest>> {
        Ok(self.manifest(namespace, name))
    }

    async fn apply_status(&self, obj: &Manifest, _field_owner: &str) -> Result<()> {
        let mut state = self.state();
        if std::mem::take(&mut state.conflict_next_status) {
            return Err(DeclarativeError::Conflict(obj.name_any()));
        }
        let status = obj.status_or_default();
        let mut stored = state
            .objects
            .remove(&instance_id(obj))
            .ok_or_else(|| DeclarativeError::NotFound(obj.name_any()))?;
        stored.status = Some(status.clone());
        Self::bump(&mut state, &mut stored);
        state.objects.insert(instance_id(obj), stored);
        state.status_writes.push(status);
        Ok(())
    }

    async fn add_finalizer(&self, obj: &Manifest, finalizer: &str, _field_owner: &str) -> Result<()> {
        let mut state = self.state();
        let mut stored = state
            .objects
            .remove(&instance_id(obj))
            .ok_or_else(|| DeclarativeError::NotFound(obj.name_any()))?;
        let finalizers = stored.metadata.finalizers.get_or_insert_with(Vec::new);
        if !finalizers.iter().any(|f| f == finalizer) {
            finalizers.push(finalizer.to_string());
        }
        Self::bump(&mut state, &mut stored);
        state.objects.insert(instance_id(obj), stored);
        Ok(())
    }

    async fn remove_finalizer(&self, obj: &Manifest, finalizer: &str) -> Result<()> {
        let mut state = self.state();
        let id = instance_id(obj);
        let mut stored = state
            .objects
            .remove(&id)
            .ok_or_else(|| DeclarativeError::NotFound(obj.name_any()))?;
        if stored.metadata.resource_version != obj.metadata.resource_version {
            state.objects.insert(id, stored);
            return Err(DeclarativeError::Conflict(obj.name_any()));
        }
        if let Some(finalizers) = stored.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != finalizer);
        }
        if stored.metadata.deletion_timestamp.is_some() && stored.finalizers().is_empty() {
            return Ok(());
        }
        Self::bump(&mut state, &mut stored);
        state.objects.insert(id, stored);
        Ok(())
    }

    async fn publish_event(&self, _obj: &Manifest, event: InstanceEvent) {
        self.state().events.push(event);
    }

    async fn override_values(
        &self,
        namespace: &str,
        selector: &OverrideSelector,
    ) -> Result<BTreeMap<String, String>> {
        let wanted = selector.to_label_selector();
        let mut values = BTreeMap::new();
        for (ns, sel, data) in &self.state().overrides {
            if ns == namespace && *sel == wanted {
                values.extend(data.clone());
            }
        }
        Ok(values)
    }
}

/// Renderer returning a fixed, replaceable text.
#[derive(Clone)]
pub struct MockRenderer {
    text: Arc<Mutex<String>>,
    render_calls: Arc<AtomicUsize>,
    fail_render: Arc<Mutex<bool>>,
}

impl std::fmt::Debug for MockRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRenderer").finish_non_exhaustive()
    }
}

impl MockRenderer {
    pub fn new(text: &str) -> Self {
        Self {
            text: Arc::new(Mutex::new(text.to_string())),
            render_calls: Arc::new(AtomicUsize::new(0)),
            fail_render: Arc::new(Mutex::new(false)),
        }
    }

    pub fn render_calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.render_calls)
    }

    /// Replaces the rendered text for every clone.
    pub fn set_text(&self, text: &str) {
        *self.text.lock().unwrap() = text.to_string();
    }

    pub fn fail_render(&self, fail: bool) {
        *self.fail_render.lock().unwrap() = fail;
    }
}

#[async_trait]
impl Renderer for MockRenderer {
    async fn initialize(&self, _obj: &Manifest) -> Result<()> {
        Ok(())
    }

    async fn ensure_prerequisites(&self, _obj: &Manifest) -> Result<()> {
        Ok(())
    }

    async fn render(&self, _obj: &Manifest) -> Result<String> {
        self.render_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_render.lock().unwrap() {
            return Err(DeclarativeError::Render("mock render failure".to_string()));
        }
        Ok(self.text.lock().unwrap().clone())
    }

    async fn remove_prerequisites(&self, _obj: &Manifest) -> Result<()> {
        Ok(())
    }
}

impl RendererFactory for MockRenderer {
    fn create(&self, _install: &InstallSpec) -> Result<Box<dyn Renderer>> {
        Ok(Box::new(self.clone()))
    }
}

/// ConfigMap manifest text for `names`.
pub fn config_maps_yaml(names: &[&str]) -> String {
    names
        .iter()
        .map(|name| format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\ndata:\n  key: value\n"))
        .collect::<Vec<_>>()
        .join("---\n")
}
