//! Bounded client cache

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use vso_common::{Error, Result};

use crate::cache_key::ClientCacheKey;
use crate::client::Client;

/// Observer invoked with a key and the client leaving the cache
pub type CacheHook = Box<dyn Fn(&ClientCacheKey, &Arc<Client>) + Send + Sync>;

/// Default maximum number of cached clients
pub const DEFAULT_CACHE_SIZE: usize = 10_000;

/// Capacity-bounded map from [`ClientCacheKey`] to [`Client`]
///
/// When full, adding a new key evicts the least recently used entry. Not
/// synchronized: callers serialize access.
pub struct ClientCache {
    entries: LruCache<ClientCacheKey, Arc<Client>>,
    on_evict: Option<CacheHook>,
    on_remove: Option<CacheHook>,
}

impl ClientCache {
    /// Create a cache holding at most `size` clients
    ///
    /// `on_evict` fires for capacity evictions, `on_remove` for explicit
    /// removals.
    pub fn new(
        size: usize,
        on_evict: Option<CacheHook>,
        on_remove: Option<CacheHook>,
    ) -> Result<Self> {
        let size = NonZeroUsize::new(size).ok_or_else(|| {
            Error::validation_for_field("cacheSize", "client cache size must be greater than zero")
        })?;
        Ok(Self {
            entries: LruCache::new(size),
            on_evict,
            on_remove,
        })
    }

    /// Look up a client, marking it recently used
    pub fn get(&mut self, key: &ClientCacheKey) -> Option<Arc<Client>> {
        self.entries.get(key).cloned()
    }

    /// Look up a client without touching recency
    pub fn peek(&self, key: &ClientCacheKey) -> Option<Arc<Client>> {
        self.entries.peek(key).cloned()
    }

    /// Whether `key` is cached
    pub fn contains(&self, key: &ClientCacheKey) -> bool {
        self.entries.contains(key)
    }

    /// Insert or overwrite a client
    ///
    /// Returns the entry evicted to make room, if any. Overwriting an
    /// existing key is not an eviction.
    pub fn add(
        &mut self,
        key: ClientCacheKey,
        client: Arc<Client>,
    ) -> Option<(ClientCacheKey, Arc<Client>)> {
        match self.entries.push(key.clone(), client) {
            Some((old_key, _)) if old_key == key => None,
            Some((evicted_key, evicted)) => {
                if let Some(hook) = &self.on_evict {
                    hook(&evicted_key, &evicted);
                }
                Some((evicted_key, evicted))
            }
            None => None,
        }
    }

    /// Remove a client
    pub fn remove(&mut self, key: &ClientCacheKey) -> Option<Arc<Client>> {
        let client = self.entries.pop(key)?;
        if let Some(hook) = &self.on_remove {
            hook(key, &client);
        }
        Some(client)
    }

    /// Remove every client matching `filter`
    pub fn prune<F>(&mut self, filter: F) -> Vec<(ClientCacheKey, Arc<Client>)>
    where
        F: Fn(&ClientCacheKey, &Client) -> bool,
    {
        let doomed: Vec<ClientCacheKey> = self
            .entries
            .iter()
            .filter(|(k, c)| filter(k, c))
            .map(|(k, _)| k.clone())
            .collect();
        doomed
            .into_iter()
            .filter_map(|k| self.remove(&k).map(|c| (k, c)))
            .collect()
    }

    /// Number of cached clients
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of cached clients
    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// All cached keys, most recently used first
    pub fn keys(&self) -> Vec<ClientCacheKey> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    /// All cached clients, most recently used first
    pub fn values(&self) -> Vec<Arc<Client>> {
        self.entries.iter().map(|(_, c)| c.clone()).collect()
    }
}
