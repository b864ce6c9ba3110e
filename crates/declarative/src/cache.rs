//! Process-wide cache of target cluster clients.
//!
//! Entries live for the lifetime of the process. Install options are not part
//! of an entry; the reconciler derives them from its configuration on every
//! use.

use crate::cluster::ClusterClient;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Keyed store of cluster clients.
pub trait ClientCache: Send + Sync {
    /// Cached client for `key`.
    fn get(&self, key: &str) -> Option<Arc<dyn ClusterClient>>;

    /// Stores `client` under `key`.
    fn set(&self, key: &str, client: Arc<dyn ClusterClient>);
}

/// In-memory [`ClientCache`] safe for concurrent reads and inserts.
#[derive(Default)]
pub struct MemoryClientCache {
    clients: RwLock<HashMap<String, Arc<dyn ClusterClient>>>,
}

impl MemoryClientCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no client is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MemoryClientCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryClientCache").field("len", &self.len()).finish()
    }
}

impl ClientCache for MemoryClientCache {
    fn get(&self, key: &str) -> Option<Arc<dyn ClusterClient>> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, client: Arc<dyn ClusterClient>) {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), client);
    }
}

/// [`ClientCache`] that never hits.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopClientCache;

impl ClientCache for NoopClientCache {
    fn get(&self, _key: &str) -> Option<Arc<dyn ClusterClient>> {
        None
    }

    fn set(&self, _key: &str, _client: Arc<dyn ClusterClient>) {}
}
