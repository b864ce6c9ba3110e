//! Target cluster selection.

use crate::cache::ClientCache;
use crate::cluster::{ClusterClient, KubeCluster};
use crate::error::{DeclarativeError, Result};
use async_trait::async_trait;
use crds::{Manifest, SyncStrategy};
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::{Client, Config, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info};

/// Data key of the kubeconfig inside a Secret.
pub const KUBECONFIG_SECRET_KEY: &str = "config";

/// Install options derived from the reconciler configuration on every use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    /// Namespace namespaced resources default to
    pub namespace: String,
    /// Apply the namespace before rendering
    pub create_namespace: bool,
    /// Field manager for every apply
    pub field_owner: String,
}

impl InstallOptions {
    /// Whether the namespace has to be applied first.
    #[must_use]
    pub fn needs_namespace(&self) -> bool {
        self.create_namespace && !self.namespace.is_empty() && self.namespace != "default"
    }
}

/// Server-side applies a Namespace.
pub async fn ensure_namespace(cluster: &dyn ClusterClient, name: &str, field_owner: &str) -> Result<()> {
    let gvk = GroupVersionKind::gvk("", "v1", "Namespace");
    let mapping = cluster.mapping(&gvk).await?;
    let object = DynamicObject::new(name, &mapping.api_resource);
    cluster
        .apply(&crate::resource::ResourceInfo::new(object, mapping), field_owner)
        .await
}

/// Cached acquisition of an instance's target cluster client.
pub struct TargetClients {
    cache: Arc<dyn ClientCache>,
    default: Arc<dyn ClusterClient>,
    resolver: Option<Arc<dyn TargetClusterResolver>>,
}

impl TargetClients {
    /// Without a resolver every instance targets `default`.
    pub fn new(cache: Arc<dyn ClientCache>, default: Arc<dyn ClusterClient>) -> Self {
        Self {
            cache,
            default,
            resolver: None,
        }
    }

    /// Selects the target cluster through `resolver`.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn TargetClusterResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Cache key of the instance's client.
    #[must_use]
    pub fn cache_key(&self, obj: &Manifest) -> String {
        let instance = format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any());
        match &self.resolver {
            Some(resolver) => format!("{instance}|{}", resolver.cache_key(obj)),
            None => instance,
        }
    }

    /// Cached client, resolved and cached on a miss.
    pub async fn get(&self, obj: &Manifest) -> Result<Arc<dyn ClusterClient>> {
        let key = self.cache_key(obj);
        if let Some(cluster) = self.cache.get(&key) {
            return Ok(cluster);
        }
        let cluster = match &self.resolver {
            Some(resolver) => resolver.resolve(obj).await?,
            None => Arc::clone(&self.default),
        };
        debug!("Caching target cluster client under {}", key);
        self.cache.set(&key, Arc::clone(&cluster));
        Ok(cluster)
    }
}

/// Resolves which cluster an instance is installed into.
#[async_trait]
pub trait TargetClusterResolver: Send + Sync {
    /// Identity of the selected cluster, part of the client cache key.
    fn cache_key(&self, obj: &Manifest) -> String;

    /// Builds a client for the selected cluster.
    async fn resolve(&self, obj: &Manifest) -> Result<Arc<dyn ClusterClient>>;
}

/// Reads a kubeconfig from a Secret in the instance namespace.
///
/// The Secret is `spec.sync.secretName`, or the instance name when unset.
#[derive(Clone)]
pub struct KubeconfigSecretResolver {
    client: Client,
}

impl std::fmt::Debug for KubeconfigSecretResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeconfigSecretResolver").finish_non_exhaustive()
    }
}

impl KubeconfigSecretResolver {
    /// Secrets are read with `client`.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn secret_name(obj: &Manifest) -> String {
        obj.spec
            .sync
            .secret_name
            .clone()
            .unwrap_or_else(|| obj.name_any())
    }
}

#[async_trait]
impl TargetClusterResolver for KubeconfigSecretResolver {
    fn cache_key(&self, obj: &Manifest) -> String {
        format!("secret:{}", Self::secret_name(obj))
    }

    async fn resolve(&self, obj: &Manifest) -> Result<Arc<dyn ClusterClient>> {
        let namespace = obj.namespace().unwrap_or_default();
        let name = Self::secret_name(obj);
        let secret = Api::<Secret>::namespaced(self.client.clone(), &namespace)
            .get_opt(&name)
            .await?
            .ok_or_else(|| DeclarativeError::ClientInit(format!("secret {namespace}/{name} not found")))?;

        let raw = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_SECRET_KEY))
            .ok_or_else(|| {
                DeclarativeError::ClientInit(format!(
                    "secret {namespace}/{name} has no '{KUBECONFIG_SECRET_KEY}' key"
                ))
            })?;
        let text = String::from_utf8(raw.0.clone())
            .map_err(|e| DeclarativeError::ClientInit(format!("kubeconfig is not UTF-8: {e}")))?;

        let kubeconfig = Kubeconfig::from_yaml(&text)
            .map_err(|e| DeclarativeError::ClientInit(format!("failed to parse kubeconfig: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| DeclarativeError::ClientInit(format!("failed to load kubeconfig: {e}")))?;
        let client = Client::try_from(config)
            .map_err(|e| DeclarativeError::ClientInit(format!("failed to create client: {e}")))?;

        info!("Created target cluster client from secret {}/{}", namespace, name);
        Ok(Arc::new(KubeCluster::new(client)))
    }
}

/// Dispatches on `spec.sync.strategy`: the local cluster or a kubeconfig Secret.
pub struct StrategyResolver {
    local: Arc<dyn ClusterClient>,
    secret: Arc<dyn TargetClusterResolver>,
}

impl StrategyResolver {
    /// `local` serves `LocalClient`, `secret` serves `Secret`.
    pub fn new(local: Arc<dyn ClusterClient>, secret: Arc<dyn TargetClusterResolver>) -> Self {
        Self { local, secret }
    }
}

#[async_trait]
impl TargetClusterResolver for StrategyResolver {
    fn cache_key(&self, obj: &Manifest) -> String {
        match obj.spec.sync.strategy {
            SyncStrategy::LocalClient => "local".to_string(),
            SyncStrategy::Secret => self.secret.cache_key(obj),
        }
    }

    async fn resolve(&self, obj: &Manifest) -> Result<Arc<dyn ClusterClient>> {
        match obj.spec.sync.strategy {
            SyncStrategy::LocalClient => Ok(Arc::clone(&self.local)),
            SyncStrategy::Secret => self.secret.resolve(obj).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCluster, test_manifest};

    struct FixedResolver(Arc<dyn ClusterClient>);

    #[async_trait]
    impl TargetClusterResolver for FixedResolver {
        fn cache_key(&self, obj: &Manifest) -> String {
            format!("fixed:{}", obj.name_any())
        }

        async fn resolve(&self, _obj: &Manifest) -> Result<Arc<dyn ClusterClient>> {
            Ok(Arc::clone(&self.0))
        }
    }

    #[tokio::test]
    async fn test_strategy_dispatch() {
        let local: Arc<dyn ClusterClient> = Arc::new(MockCluster::new());
        let remote: Arc<dyn ClusterClient> = Arc::new(MockCluster::new());
        let resolver = StrategyResolver::new(Arc::clone(&local), Arc::new(FixedResolver(Arc::clone(&remote))));

        let mut obj = test_manifest("m");
        assert_eq!(resolver.cache_key(&obj), "local");
        assert!(Arc::ptr_eq(&resolver.resolve(&obj).await.unwrap(), &local));

        obj.spec.sync.strategy = SyncStrategy::Secret;
        assert_eq!(resolver.cache_key(&obj), "fixed:m");
        assert!(Arc::ptr_eq(&resolver.resolve(&obj).await.unwrap(), &remote));
    }

    #[tokio::test]
    async fn test_target_clients_resolve_once_per_key() {
        let remote: Arc<dyn ClusterClient> = Arc::new(MockCluster::new());
        let cache = Arc::new(crate::cache::MemoryClientCache::new());
        let clients = TargetClients::new(cache.clone(), Arc::new(MockCluster::new()))
            .with_resolver(Arc::new(FixedResolver(Arc::clone(&remote))));

        let obj = test_manifest("m");
        assert_eq!(clients.cache_key(&obj), "default/m|fixed:m");
        let first = clients.get(&obj).await.unwrap();
        let second = clients.get(&obj).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &remote));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_namespace_creation_skips_default() {
        let mut opts = InstallOptions {
            namespace: "default".to_string(),
            create_namespace: true,
            field_owner: "o".to_string(),
        };
        assert!(!opts.needs_namespace());
        opts.namespace = "team".to_string();
        assert!(opts.needs_namespace());
        opts.create_namespace = false;
        assert!(!opts.needs_namespace());
    }

    #[tokio::test]
    async fn test_ensure_namespace_applies_cluster_scoped_object() {
        let cluster = MockCluster::new();
        ensure_namespace(&cluster, "team", "owner").await.unwrap();
        assert!(cluster.contains("Namespace", "", "team"));
    }

    #[tokio::test]
    async fn test_ensure_namespace_propagates_discovery_failure() {
        let cluster = MockCluster::new();
        cluster.fail_mapping("Namespace");

        let err = ensure_namespace(&cluster, "team", "owner").await.unwrap_err();
        assert!(matches!(err, DeclarativeError::Discovery(_)));
        assert_eq!(cluster.object_count(), 0);
    }
}
