//! Caching Vault client factory
//!
//! Every reconciler that talks to Vault asks the factory for a client. The
//! factory derives the [`ClientCacheKey`] for the request, takes the lock for
//! that key and only logs in when the cache holds no live client. Concurrent
//! callers for the same key wait on the lock and share the one client that
//! was built; callers for different keys never contend.
//!
//! A single "storage encryption" client, identified by a configured
//! VaultAuth, provides the transit key that protects persisted clients. Its
//! setup is bounded by [`ClientFactoryConfig::setup_timeout`].

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use kube::ResourceExt;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};
use vso_common::crd::{ObjectRef, VaultAuth, VaultConnection};
use vso_common::{metrics, Error, ObjectFetcher, Result, DEFAULT_VAULT_CONNECTION_NAME};
use vso_credentials::CredentialProvider;

use crate::cache::{CacheHook, ClientCache};
use crate::cache_key::ClientCacheKey;
use crate::callbacks::{ClientCallbackHandler, ClientCallbackRegistry, ClientEvent, ClientEvents};
use crate::client::Client;
use crate::config::ClientFactoryConfig;
use crate::storage::ClientCacheStorage;

type KeyLock = Arc<tokio::sync::Mutex<()>>;

/// Creates, caches and renews Vault clients
///
/// Cloning is cheap; clones share the same cache.
#[derive(Clone)]
pub struct CachingClientFactory {
    inner: Arc<FactoryInner>,
}

struct FactoryInner {
    fetcher: Arc<dyn ObjectFetcher>,
    config: ClientFactoryConfig,
    cache: Mutex<ClientCache>,
    locks: DashMap<ClientCacheKey, KeyLock>,
    callbacks: ClientCallbackRegistry,
    encryption_key: tokio::sync::Mutex<Option<ClientCacheKey>>,
    storage: Option<ClientCacheStorage>,
}

enum Lookup {
    Hit(Arc<Client>),
    Dead(Arc<Client>),
    Miss,
}

impl CachingClientFactory {
    /// Create a factory
    ///
    /// Persistence requires a storage encryption VaultAuth.
    pub fn new(fetcher: Arc<dyn ObjectFetcher>, config: ClientFactoryConfig) -> Result<Self> {
        if config.persist && config.storage_encryption_auth.is_none() {
            return Err(Error::validation_for_field(
                "storageEncryptionAuth",
                "client persistence requires a storage encryption VaultAuth",
            ));
        }

        let on_evict: CacheHook = Box::new(|key, client| {
            metrics::CLIENT_CACHE_EVICTIONS.add(1, &[]);
            debug!(cache_key = %key, "Evicting Vault client, cache is full");
            client.stop_renewal();
        });
        let on_remove: CacheHook = Box::new(|_, client| client.stop_renewal());
        let cache = ClientCache::new(config.cache_size, Some(on_evict), Some(on_remove))?;

        let storage = config
            .persist
            .then(|| ClientCacheStorage::new(fetcher.clone(), config.operator_namespace.clone()));

        info!(
            cache_size = config.cache_size,
            persist = config.persist,
            setup_timeout = ?config.setup_timeout,
            "Created Vault client factory"
        );
        Ok(Self {
            inner: Arc::new(FactoryInner {
                fetcher,
                config,
                cache: Mutex::new(cache),
                locks: DashMap::new(),
                callbacks: ClientCallbackRegistry::new(),
                encryption_key: tokio::sync::Mutex::new(None),
                storage,
            }),
        })
    }

    /// Factory configuration
    pub fn config(&self) -> &ClientFactoryConfig {
        &self.inner.config
    }

    /// Subscribe a handler to client lifecycle events
    pub fn register_client_callback_handler(&self, handler: ClientCallbackHandler) {
        debug!(on = ?handler.on, "Registered client callback handler");
        self.inner.callbacks.register(handler);
    }

    /// Invoke every handler subscribed to any of `events`
    pub async fn call_client_callbacks(
        &self,
        client: &Arc<Client>,
        events: ClientEvents,
        wait: bool,
    ) {
        self.inner.callbacks.dispatch(client, events, wait).await;
    }

    /// Get a client for a VaultAuth and VaultConnection
    ///
    /// The credential provider is initialised in `provider_namespace`.
    #[instrument(skip(self, auth, connection), fields(auth = %auth.name_any()))]
    pub async fn get_client(
        &self,
        auth: &VaultAuth,
        connection: &VaultConnection,
        provider_namespace: &str,
    ) -> Result<Arc<Client>> {
        let provider =
            CredentialProvider::new(self.inner.fetcher.as_ref(), auth, provider_namespace).await?;
        self.get_client_with_provider(auth, connection, provider).await
    }

    /// Get a client using an already initialised credential provider
    ///
    /// Providers without a backing object (AWS) get a fresh UID on every
    /// initialisation, so repeat lookups only hit the cache when the caller
    /// keeps its provider.
    pub async fn get_client_with_provider(
        &self,
        auth: &VaultAuth,
        connection: &VaultConnection,
        provider: CredentialProvider,
    ) -> Result<Arc<Client>> {
        let key = ClientCacheKey::compute(auth, connection, provider.uid())?;
        let persist = self.inner.storage.is_some() && !self.inner.is_encryption_auth(auth);
        self.inner
            .get_or_create(
                key,
                Arc::new(auth.clone()),
                Arc::new(connection.clone()),
                provider,
                persist,
            )
            .await
    }

    /// Resolve a VaultAuth reference on behalf of `requester_namespace` and get its client
    #[instrument(skip(self), fields(auth = %auth_ref))]
    pub async fn get_client_for(
        &self,
        auth_ref: &ObjectRef,
        requester_namespace: &str,
    ) -> Result<Arc<Client>> {
        let auth = self
            .inner
            .fetcher
            .get_vault_auth(&auth_ref.namespace, &auth_ref.name)
            .await?;
        if !auth.spec.allows_namespace(&auth_ref.namespace, requester_namespace) {
            return Err(Error::validation_for_field(
                "spec.allowedNamespaces",
                format!("namespace {requester_namespace} may not use VaultAuth {auth_ref}"),
            ));
        }
        let connection = self.inner.resolve_connection(&auth).await?;
        self.get_client(&auth, &connection, requester_namespace).await
    }

    /// The client used for client cache encryption
    ///
    /// Built from the configured storage encryption VaultAuth. Setup that
    /// does not finish within the configured timeout fails with a deadline
    /// exceeded error.
    pub async fn storage_encryption_client(&self) -> Result<Arc<Client>> {
        self.inner.encryption_client().await
    }

    /// Encrypt with the storage encryption transit key
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let client = self.storage_encryption_client().await?;
        let transit = transit_of(&client)?;
        client
            .transit_encrypt(&transit.mount, &transit.key_name, plaintext)
            .await
    }

    /// Decrypt with the storage encryption transit key
    pub async fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>> {
        let client = self.storage_encryption_client().await?;
        let transit = transit_of(&client)?;
        client
            .transit_decrypt(&transit.mount, &transit.key_name, ciphertext)
            .await
    }

    /// Recompute the cache key of a client
    pub fn compute_client_cache_key_from_client(client: &Client) -> Result<ClientCacheKey> {
        client.get_cache_key()
    }

    /// Derive the cache key for a VaultAuth without logging in
    pub async fn compute_client_cache_key_from_obj(
        &self,
        auth: &VaultAuth,
        provider_namespace: &str,
    ) -> Result<ClientCacheKey> {
        let connection = self.inner.resolve_connection(auth).await?;
        let provider =
            CredentialProvider::new(self.inner.fetcher.as_ref(), auth, provider_namespace).await?;
        ClientCacheKey::compute(auth, &connection, provider.uid())
    }

    /// Derive the cache key for a VaultAuth reference without logging in
    pub async fn compute_client_cache_key_from_meta(
        &self,
        auth_ref: &ObjectRef,
        provider_namespace: &str,
    ) -> Result<ClientCacheKey> {
        let auth = self
            .inner
            .fetcher
            .get_vault_auth(&auth_ref.namespace, &auth_ref.name)
            .await?;
        self.compute_client_cache_key_from_obj(&auth, provider_namespace).await
    }

    /// The cached client for `key`, live or not
    pub fn cached(&self, key: &ClientCacheKey) -> Option<Arc<Client>> {
        self.inner.cache.lock().peek(key)
    }

    /// Remove a client from the cache
    ///
    /// Stops its renewal, purges any persisted copy and fires the
    /// cache-removed callbacks. Returns whether a client was removed.
    pub async fn remove(&self, key: &ClientCacheKey) -> bool {
        let removed = self.inner.cache.lock().remove(key);
        match removed {
            Some(client) => {
                self.inner
                    .after_removal(key, client, ClientEvent::CacheRemoved.into(), false)
                    .await;
                true
            }
            None => false,
        }
    }

    /// Remove every client matching `filter`, returning the removed keys
    pub async fn prune<F>(&self, filter: F) -> Vec<ClientCacheKey>
    where
        F: Fn(&ClientCacheKey, &Client) -> bool,
    {
        let pruned = self.inner.cache.lock().prune(filter);
        let mut keys = Vec::with_capacity(pruned.len());
        for (key, client) in pruned {
            self.inner
                .after_removal(&key, client, ClientEvent::CacheRemoved.into(), false)
                .await;
            keys.push(key);
        }
        self.inner.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        if !keys.is_empty() {
            info!(count = keys.len(), "Pruned Vault clients");
        }
        keys
    }

    /// Number of cached clients
    pub fn len(&self) -> usize {
        self.inner.cache.lock().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.inner.cache.lock().is_empty()
    }

    /// Keys of all cached clients
    pub fn cache_keys(&self) -> Vec<ClientCacheKey> {
        self.inner.cache.lock().keys()
    }

    /// Stop the renewal task of every cached client
    pub fn shutdown(&self) {
        let clients = self.inner.cache.lock().values();
        for client in &clients {
            client.stop_renewal();
        }
        info!(clients = clients.len(), "Stopped Vault client renewal");
    }
}

impl FactoryInner {
    fn key_lock(&self, key: &ClientCacheKey) -> KeyLock {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Look up a client, evicting it when dead
    fn lookup(&self, key: &ClientCacheKey) -> Lookup {
        let mut cache = self.cache.lock();
        let Some(client) = cache.get(key) else {
            return Lookup::Miss;
        };
        match client.validate() {
            Ok(()) => Lookup::Hit(client),
            Err(e) => {
                debug!(cache_key = %key, error = %e, "Cached Vault client is dead");
                cache.remove(key);
                Lookup::Dead(client)
            }
        }
    }

    fn is_encryption_auth(&self, auth: &VaultAuth) -> bool {
        self.config.storage_encryption_auth.as_ref().is_some_and(|r| {
            auth.namespace().as_deref() == Some(r.namespace.as_str()) && auth.name_any() == r.name
        })
    }

    async fn resolve_connection(&self, auth: &VaultAuth) -> Result<VaultConnection> {
        let auth_namespace = auth.namespace().unwrap_or_default();
        let conn_ref = match auth.spec.vault_connection_ref.as_deref().map(str::trim) {
            Some(reference) if !reference.is_empty() => {
                ObjectRef::parse(reference, &auth_namespace)?
            }
            _ => ObjectRef::new(&self.config.operator_namespace, DEFAULT_VAULT_CONNECTION_NAME),
        };
        self.fetcher
            .get_vault_connection(&conn_ref.namespace, &conn_ref.name)
            .await
    }

    async fn get_or_create(
        self: &Arc<Self>,
        key: ClientCacheKey,
        auth: Arc<VaultAuth>,
        connection: Arc<VaultConnection>,
        provider: CredentialProvider,
        persist: bool,
    ) -> Result<Arc<Client>> {
        let lock = self.key_lock(&key);
        let guard = lock.lock().await;

        match self.lookup(&key) {
            Lookup::Hit(client) => {
                metrics::record_cache_lookup(true, "hit");
                return Ok(client);
            }
            Lookup::Dead(client) => {
                metrics::record_cache_lookup(false, "invalid");
                self.after_removal(&key, client, ClientEvent::CacheRemoved.into(), false)
                    .await;
            }
            Lookup::Miss => metrics::record_cache_lookup(false, "absent"),
        }

        let client = Arc::new(self.create_client(&key, auth, connection, provider, persist).await?);
        self.start_renewal(&client);
        let (evicted, len) = {
            let mut cache = self.cache.lock();
            let evicted = cache.add(key.clone(), client.clone());
            (evicted, cache.len())
        };
        metrics::CLIENT_CACHE_SIZE.record(len as u64, &[]);
        drop(guard);
        info!(cache_key = %key, cache_size = len, "Cached Vault client");

        if let Some((evicted_key, evicted)) = evicted {
            self.after_removal(&evicted_key, evicted, ClientEvent::CacheRemoved.into(), false)
                .await;
        }
        if persist {
            self.persist(&client).await;
        }
        Ok(client)
    }

    async fn create_client(
        self: &Arc<Self>,
        key: &ClientCacheKey,
        auth: Arc<VaultAuth>,
        connection: Arc<VaultConnection>,
        provider: CredentialProvider,
        persist: bool,
    ) -> Result<Client> {
        if persist {
            match self
                .restore_client(key, auth.clone(), connection.clone(), provider.clone())
                .await
            {
                Ok(Some(client)) => return Ok(client),
                Ok(None) => {}
                Err(e) => {
                    warn!(cache_key = %key, error = %e, "Failed to restore persisted Vault client");
                    self.purge(key).await;
                }
            }
        }
        Client::login(self.fetcher.as_ref(), auth, connection, provider).await
    }

    async fn restore_client(
        self: &Arc<Self>,
        key: &ClientCacheKey,
        auth: Arc<VaultAuth>,
        connection: Arc<VaultConnection>,
        provider: CredentialProvider,
    ) -> Result<Option<Client>> {
        let Some(storage) = &self.storage else {
            return Ok(None);
        };
        let encryptor = self.encryption_client().await?;
        let Some(token) = storage.restore(key, &encryptor).await? else {
            return Ok(None);
        };
        Client::restore(self.fetcher.as_ref(), auth, connection, provider, token)
            .await
            .map(Some)
    }

    async fn persist(self: &Arc<Self>, client: &Client) {
        let Some(storage) = &self.storage else {
            return;
        };
        let result = match self.encryption_client().await {
            Ok(encryptor) => storage.store(client, &encryptor).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(cache_key = %client.cache_key(), error = %e, "Failed to persist Vault client");
        }
    }

    async fn purge(&self, key: &ClientCacheKey) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.purge(key).await {
                warn!(cache_key = %key, error = %e, "Failed to purge persisted Vault client");
            }
        }
    }

    /// Bookkeeping for a client that has left the cache
    async fn after_removal(
        &self,
        key: &ClientCacheKey,
        client: Arc<Client>,
        events: ClientEvents,
        wait: bool,
    ) {
        let len = self.cache.lock().len();
        metrics::CLIENT_CACHE_SIZE.record(len as u64, &[]);
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        info!(cache_key = %key, cache_size = len, "Removed Vault client from cache");

        self.purge(key).await;
        self.callbacks.dispatch(&client, events, wait).await;
    }

    fn start_renewal(self: &Arc<Self>, client: &Arc<Client>) {
        let factory = Arc::downgrade(self);
        client.start_renewal(Box::new(move |client: Arc<Client>| {
            async move {
                if let Some(factory) = factory.upgrade() {
                    factory.on_renewal_done(client).await;
                }
            }
            .boxed()
        }));
    }

    /// Drop a client whose lease can no longer be renewed
    async fn on_renewal_done(self: Arc<Self>, client: Arc<Client>) {
        let key = client.cache_key().clone();
        let lock = self.key_lock(&key);
        let removed = {
            let _guard = lock.lock().await;
            let mut cache = self.cache.lock();
            match cache.peek(&key) {
                Some(current) if Arc::ptr_eq(&current, &client) => cache.remove(&key),
                _ => None,
            }
        };
        drop(lock);
        info!(cache_key = %key, removed = removed.is_some(), "Vault client lease renewal finished");

        match removed {
            Some(client) => {
                self.after_removal(
                    &key,
                    client,
                    ClientEvent::LeaseRenewalDone | ClientEvent::CacheRemoved,
                    true,
                )
                .await
            }
            None => {
                self.callbacks
                    .dispatch(&client, ClientEvent::LeaseRenewalDone.into(), true)
                    .await
            }
        }
    }

    /// Storage encryption client, bounded by the setup timeout
    ///
    /// Boxed to break the type cycle through client restoration.
    fn encryption_client(self: &Arc<Self>) -> BoxFuture<'_, Result<Arc<Client>>> {
        async move {
            let timeout = self.config.setup_timeout;
            let result = match tokio::time::timeout(timeout, self.setup_encryption_client()).await {
                Ok(Ok(client)) => {
                    metrics::record_encryption_setup("success");
                    return Ok(client);
                }
                Ok(Err(e)) => {
                    metrics::record_encryption_setup("error");
                    e
                }
                Err(_) => {
                    metrics::record_encryption_setup("timeout");
                    Error::timeout("failed to setup encryption client", "setup", timeout)
                }
            };
            // a concurrent setup owns the key while it holds the lock
            if let Ok(mut key) = self.encryption_key.try_lock() {
                key.take();
            }
            warn!(error = %result, "Storage encryption client setup failed");
            Err(result)
        }
        .boxed()
    }

    async fn setup_encryption_client(self: &Arc<Self>) -> Result<Arc<Client>> {
        let auth_ref = self.config.storage_encryption_auth.as_ref().ok_or_else(|| {
            Error::validation_for_field(
                "storageEncryptionAuth",
                "no storage encryption VaultAuth is configured",
            )
        })?;
        let mut current = self.encryption_key.lock().await;

        let auth = self
            .fetcher
            .get_vault_auth(&auth_ref.namespace, &auth_ref.name)
            .await?;
        if auth.spec.storage_encryption.is_none() {
            return Err(Error::validation_for_field(
                "spec.storageEncryption",
                format!("VaultAuth {auth_ref} has no storageEncryption configured"),
            ));
        }
        let connection = self.resolve_connection(&auth).await?;

        if let Some(key) = current.take() {
            let cached = self.cache.lock().get(&key);
            if let Some(client) = cached {
                let unchanged =
                    ClientCacheKey::compute(&auth, &connection, client.credential_provider().uid())
                        .is_ok_and(|k| k == key);
                if unchanged && client.is_valid() {
                    *current = Some(key);
                    return Ok(client);
                }
                debug!(cache_key = %key, "Replacing stale storage encryption client");
                let removed = self.cache.lock().remove(&key);
                if let Some(old) = removed {
                    self.after_removal(&key, old, ClientEvent::CacheRemoved.into(), false)
                        .await;
                }
            }
        }

        let provider =
            CredentialProvider::new(self.fetcher.as_ref(), &auth, &auth_ref.namespace).await?;
        let key = ClientCacheKey::compute(&auth, &connection, provider.uid())?;
        *current = Some(key.clone());
        let client = self
            .get_or_create(key, Arc::new(auth), Arc::new(connection), provider, false)
            .await?;
        info!(cache_key = %client.cache_key(), "Storage encryption client ready");
        Ok(client)
    }
}

fn transit_of(client: &Client) -> Result<vso_common::crd::StorageEncryption> {
    client.auth().spec.storage_encryption.clone().ok_or_else(|| {
        Error::validation_for_field(
            "spec.storageEncryption",
            "storage encryption client's VaultAuth has no storageEncryption",
        )
    })
}
