//! Manifest CRD
//!
//! Declares a set of package installations that the declarative reconciler
//! renders, applies and keeps converged on a target cluster.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// API group of the Manifest resource.
pub const MANIFEST_GROUP: &str = "operator.declarative.io";

/// Finalizer added to every Manifest the reconciler manages.
pub const MANIFEST_FINALIZER: &str = "operator.declarative.io/manifest";

/// Label that opts an instance out of reconciliation when set to `"true"`.
pub const SKIP_RECONCILIATION_LABEL: &str = "operator.declarative.io/skip-reconciliation";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "operator.declarative.io",
    version = "v1alpha1",
    kind = "Manifest",
    namespaced,
    status = "ManifestStatus",
    shortname = "mf",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSpec {
    /// Installations rendered into the target cluster
    #[serde(default)]
    pub installs: Vec<InstallItem>,

    /// Remote synchronisation options
    #[serde(default)]
    pub sync: SyncSpec,

    /// Package used when no installs are declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_config: Option<InstallSource>,
}

/// A single named installation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstallItem {
    /// Installation name, unique within the Manifest
    pub name: String,

    /// Where the installation is rendered from
    pub source: InstallSource,

    /// ConfigMaps matching these labels contribute override values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_selector: Option<OverrideSelector>,
}

/// Source reference of an installation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstallSource {
    /// How the source is rendered
    #[serde(default)]
    pub mode: RenderMode,

    /// Local path of a raw manifest file/directory or an overlay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Chart repository URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Chart name inside the repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_name: Option<String>,

    /// Chart or package version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Flat key/value overrides passed to the renderer
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, String>,
}

/// Rendering backend of an installation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum RenderMode {
    /// Chart templates
    Chart,
    /// Overlay (kustomization) directory
    Overlay,
    /// Plain manifest files
    #[default]
    Raw,
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderMode::Chart => write!(f, "Chart"),
            RenderMode::Overlay => write!(f, "Overlay"),
            RenderMode::Raw => write!(f, "Raw"),
        }
    }
}

/// Label selector for override ConfigMaps.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OverrideSelector {
    /// Labels every matching ConfigMap must carry
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl OverrideSelector {
    /// Renders the selector in `key=value,key=value` form.
    #[must_use]
    pub fn to_label_selector(&self) -> String {
        self.match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Remote synchronisation options.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSpec {
    /// Mirror the Manifest into the target cluster
    #[serde(default)]
    pub enabled: bool,

    /// Namespace of the remote copy
    #[serde(default)]
    pub namespace: String,

    /// How the target cluster is looked up
    #[serde(default)]
    pub strategy: SyncStrategy,

    /// Secret holding the kubeconfig when `strategy` is `Secret`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

/// Target cluster lookup strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum SyncStrategy {
    /// Use the controller's own cluster
    #[default]
    LocalClient,
    /// Read a kubeconfig from a Secret
    Secret,
}

/// Lifecycle state of a Manifest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum State {
    /// Not observed yet
    #[default]
    #[serde(rename = "")]
    Unset,
    /// Resources are being installed or verified
    Processing,
    /// Deletion is in progress
    Deleting,
    /// Every resource is applied and ready
    Ready,
    /// The last attempt failed
    Error,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Unset => write!(f, ""),
            State::Processing => write!(f, "Processing"),
            State::Deleting => write!(f, "Deleting"),
            State::Ready => write!(f, "Ready"),
            State::Error => write!(f, "Error"),
        }
    }
}

/// Truth value of a condition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Not known yet
    #[default]
    Unknown,
}

/// A typed status fact.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, unique in the list
    #[serde(rename = "type")]
    pub type_: String,

    /// Current truth value
    pub status: ConditionStatus,

    /// Machine readable reason
    #[serde(default)]
    pub reason: String,

    /// Human readable message
    #[serde(default)]
    pub message: String,

    /// Generation the condition was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last time `status` changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Identity of an object applied on behalf of a Manifest.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// API group, empty for the core group
    #[serde(default)]
    pub group: String,
    /// API version
    pub version: String,
    /// Kind
    pub kind: String,
    /// Object name
    pub name: String,
    /// Namespace, empty for cluster-scoped objects
    #[serde(default)]
    pub namespace: String,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gv = if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        };
        if self.namespace.is_empty() {
            write!(f, "{gv}, Kind={} {}", self.kind, self.name)
        } else {
            write!(f, "{gv}, Kind={} {}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Last operation performed by the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    /// Operation or error message
    pub operation: String,
    /// When it was recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestStatus {
    /// Lifecycle state
    #[serde(default)]
    pub state: State,

    /// Conditions keyed by type
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Objects applied by the last successful sync
    #[serde(default)]
    pub synced: Vec<Resource>,

    /// Generation the status was written for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last operation or error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,
}

impl ManifestStatus {
    /// Returns the status with `state` replaced.
    #[must_use]
    pub fn with_state(mut self, state: State) -> Self {
        self.state = state;
        self
    }

    /// Records `operation` as the last operation.
    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.last_operation = Some(LastOperation {
            operation: operation.into(),
            last_update_time: Some(Utc::now()),
        });
        self
    }

    /// Records an error message as the last operation.
    #[must_use]
    pub fn with_err(self, err: &dyn std::error::Error) -> Self {
        self.with_operation(err.to_string())
    }
}

impl Manifest {
    /// Status, or an empty one if the server has not stored any yet.
    #[must_use]
    pub fn status_or_default(&self) -> ManifestStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Whether the deletion timestamp is set.
    #[must_use]
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the skip label opts this instance out of reconciliation.
    #[must_use]
    pub fn should_skip(&self) -> bool {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(SKIP_RECONCILIATION_LABEL))
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// Whether the finalizer list contains `finalizer`.
    #[must_use]
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == finalizer))
    }
}
