//! Authenticated Vault client and its lease renewal task

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vso_common::crd::{VaultAuth, VaultConnection};
use vso_common::{metrics, Error, ObjectFetcher, Result};
use vso_credentials::CredentialProvider;
use zeroize::Zeroizing;

use crate::api::{SecretAuth, VaultHttpClient, VaultSecret};
use crate::cache_key::ClientCacheKey;

/// Token and lease state of a client
#[derive(Clone)]
pub struct TokenSecret {
    client_token: Zeroizing<String>,
    /// Token accessor
    pub accessor: String,
    /// Attached policies
    pub policies: Vec<String>,
    /// Lease duration as of the last login or renewal
    pub lease_duration: Duration,
    /// Whether the token can be renewed
    pub renewable: bool,
    /// Number of successful renewals
    pub renewals: u64,
}

impl TokenSecret {
    /// Build token state from a login or renewal response
    pub fn from_auth(auth: &SecretAuth) -> Self {
        Self {
            client_token: Zeroizing::new(auth.client_token.clone()),
            accessor: auth.accessor.clone(),
            policies: auth.policies.clone(),
            lease_duration: Duration::from_secs(auth.lease_duration),
            renewable: auth.renewable,
            renewals: 0,
        }
    }

    /// The Vault token
    pub fn client_token(&self) -> &str {
        &self.client_token
    }
}

impl std::fmt::Debug for TokenSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSecret")
            .field("client_token", &"<redacted>")
            .field("accessor", &self.accessor)
            .field("policies", &self.policies)
            .field("lease_duration", &self.lease_duration)
            .field("renewable", &self.renewable)
            .field("renewals", &self.renewals)
            .finish()
    }
}

struct TokenState {
    secret: TokenSecret,
    issued_at: Instant,
}

/// Invoked once when the renewal task finishes on its own
pub(crate) type RenewalDoneHook = Box<dyn FnOnce(Arc<Client>) -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, PartialEq, Eq)]
enum RenewalOutcome {
    /// Lease can no longer be extended
    Completed,
    /// Stopped through the cancellation token
    Cancelled,
    /// Client was dropped
    Dropped,
}

/// An authenticated Vault session
///
/// Holds the VaultAuth, VaultConnection and credential provider it was built
/// from, so its cache key can always be recomputed.
pub struct Client {
    cache_key: ClientCacheKey,
    auth: Arc<VaultAuth>,
    connection: Arc<VaultConnection>,
    provider: CredentialProvider,
    api: VaultHttpClient,
    state: RwLock<TokenState>,
    closed: AtomicBool,
    cancel: CancellationToken,
    renewal: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("cache_key", &self.cache_key)
            .field("method", &self.provider.method())
            .field("address", &self.api.address().as_str())
            .field("token", &self.state.read().secret)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Client {
    /// Log in with the provider's credentials
    pub(crate) async fn login(
        fetcher: &dyn ObjectFetcher,
        auth: Arc<VaultAuth>,
        connection: Arc<VaultConnection>,
        provider: CredentialProvider,
    ) -> Result<Self> {
        let cache_key = ClientCacheKey::compute(&auth, &connection, provider.uid())?;
        let api = VaultHttpClient::from_connection(fetcher, &connection, &auth).await?;
        let payload = provider.credentials(fetcher).await?;

        let method = provider.method();
        let result = api.login(&auth.spec.mount, &payload).await;
        metrics::record_login(method.as_str(), result.is_ok());
        let secret = TokenSecret::from_auth(&result?);

        info!(
            cache_key = %cache_key,
            %method,
            mount = %auth.spec.mount,
            lease_seconds = secret.lease_duration.as_secs(),
            renewable = secret.renewable,
            "Logged in to Vault"
        );
        Ok(Self::new(cache_key, auth, connection, provider, api, secret))
    }

    /// Rebuild a client around an existing token, checked with `lookup-self`
    pub(crate) async fn restore(
        fetcher: &dyn ObjectFetcher,
        auth: Arc<VaultAuth>,
        connection: Arc<VaultConnection>,
        provider: CredentialProvider,
        client_token: Zeroizing<String>,
    ) -> Result<Self> {
        let cache_key = ClientCacheKey::compute(&auth, &connection, provider.uid())?;
        let api = VaultHttpClient::from_connection(fetcher, &connection, &auth).await?;
        let lookup = api.lookup_self(&client_token).await?;
        if lookup.ttl == 0 {
            return Err(Error::vault(None, "restored token has no remaining TTL"));
        }

        let secret = TokenSecret {
            client_token,
            accessor: lookup.accessor,
            policies: lookup.policies,
            lease_duration: Duration::from_secs(lookup.ttl),
            renewable: lookup.renewable,
            renewals: 0,
        };
        info!(
            cache_key = %cache_key,
            lease_seconds = lookup.ttl,
            "Restored Vault client from storage"
        );
        Ok(Self::new(cache_key, auth, connection, provider, api, secret))
    }

    fn new(
        cache_key: ClientCacheKey,
        auth: Arc<VaultAuth>,
        connection: Arc<VaultConnection>,
        provider: CredentialProvider,
        api: VaultHttpClient,
        secret: TokenSecret,
    ) -> Self {
        Self {
            cache_key,
            auth,
            connection,
            provider,
            api,
            state: RwLock::new(TokenState {
                secret,
                issued_at: Instant::now(),
            }),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            renewal: Mutex::new(None),
        }
    }

    /// Key this client is cached under
    pub fn cache_key(&self) -> &ClientCacheKey {
        &self.cache_key
    }

    /// Recompute the cache key from the client's own inputs
    ///
    /// Fails if it no longer matches the key the client was created with.
    pub fn get_cache_key(&self) -> Result<ClientCacheKey> {
        let key = ClientCacheKey::compute(&self.auth, &self.connection, self.provider.uid())?;
        if key != self.cache_key {
            return Err(Error::invalid_cache_key(
                key.as_str(),
                format!("does not match the client's key {}", self.cache_key),
            ));
        }
        Ok(key)
    }

    /// VaultAuth the client was built from
    pub fn auth(&self) -> &Arc<VaultAuth> {
        &self.auth
    }

    /// VaultConnection the client was built from
    pub fn connection(&self) -> &Arc<VaultConnection> {
        &self.connection
    }

    /// Credential provider the client logged in with
    pub fn credential_provider(&self) -> &CredentialProvider {
        &self.provider
    }

    /// Current token state
    pub fn token_secret(&self) -> TokenSecret {
        self.state.read().secret.clone()
    }

    /// Overwrite the lease duration. Zero marks the client dead.
    pub fn set_lease_duration(&self, lease: Duration) {
        self.state.write().secret.lease_duration = lease;
    }

    /// Mark the client dead
    pub fn invalidate(&self) {
        self.set_lease_duration(Duration::ZERO);
    }

    /// Whether [`Client::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Lease time left before the token expires
    pub fn lease_remaining(&self) -> Duration {
        let state = self.state.read();
        state
            .secret
            .lease_duration
            .saturating_sub(state.issued_at.elapsed())
    }

    /// Check that the client can still be used
    ///
    /// A client is dead once closed, when its lease duration is zero, or
    /// when its lease has run out.
    pub fn validate(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::internal_with_context(
                "client",
                format!("client {} is closed", self.cache_key),
            ));
        }
        let state = self.state.read();
        if state.secret.lease_duration.is_zero() {
            return Err(Error::internal_with_context(
                "client",
                format!("client {} has a zero lease duration", self.cache_key),
            ));
        }
        if state.issued_at.elapsed() >= state.secret.lease_duration {
            return Err(Error::internal_with_context(
                "client",
                format!("client {} lease has expired", self.cache_key),
            ));
        }
        Ok(())
    }

    /// Whether [`Client::validate`] passes
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Read a logical path
    pub async fn read(&self, path: &str) -> Result<Option<VaultSecret>> {
        self.validate()?;
        let token = self.token();
        self.api.read(&token, path).await
    }

    /// Write to a logical path
    pub async fn write(&self, path: &str, body: &Value) -> Result<Option<VaultSecret>> {
        self.validate()?;
        let token = self.token();
        self.api.write(&token, path, body).await
    }

    /// Encrypt with a transit key, returning the `vault:v<N>:...` ciphertext
    pub async fn transit_encrypt(
        &self,
        mount: &str,
        key_name: &str,
        plaintext: &[u8],
    ) -> Result<String> {
        let path = format!("{}/encrypt/{key_name}", mount.trim_matches('/'));
        let body = json!({ "plaintext": STANDARD.encode(plaintext) });
        let response = self.write(&path, &body).await?;
        response
            .and_then(|s| s.data)
            .and_then(|mut d| d.remove("ciphertext"))
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| Error::vault(None, format!("{path} response has no ciphertext")))
    }

    /// Decrypt a transit ciphertext
    pub async fn transit_decrypt(
        &self,
        mount: &str,
        key_name: &str,
        ciphertext: &str,
    ) -> Result<Vec<u8>> {
        let path = format!("{}/decrypt/{key_name}", mount.trim_matches('/'));
        let body = json!({ "ciphertext": ciphertext });
        let response = self.write(&path, &body).await?;
        let plaintext = response
            .and_then(|s| s.data)
            .and_then(|mut d| d.remove("plaintext"))
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| Error::vault(None, format!("{path} response has no plaintext")))?;
        STANDARD
            .decode(plaintext)
            .map_err(|e| Error::serialization(format!("transit plaintext is not base64: {e}")))
    }

    /// Stop renewal and optionally revoke the token
    pub async fn close(&self, revoke: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_renewal();
        if revoke {
            let token = self.token();
            if let Err(e) = self.api.revoke_self(&token).await {
                warn!(cache_key = %self.cache_key, error = %e, "Failed to revoke Vault token");
            }
        }
        debug!(cache_key = %self.cache_key, revoke, "Closed Vault client");
    }

    /// Cancel the renewal task without running its completion hook
    pub fn stop_renewal(&self) {
        self.cancel.cancel();
    }

    /// Whether a renewal task was started and is still running
    pub fn renewal_running(&self) -> bool {
        self.renewal
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn token(&self) -> Zeroizing<String> {
        self.state.read().secret.client_token.clone()
    }

    /// Start the lease renewal task
    ///
    /// The task renews at two thirds of the lease. It completes when the
    /// token is not renewable or a renewal fails, then runs `on_done`.
    /// Cancellation through [`Client::stop_renewal`] skips `on_done`.
    pub(crate) fn start_renewal(self: &Arc<Self>, on_done: RenewalDoneHook) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let cache_key = self.cache_key.clone();

        let handle = tokio::spawn(async move {
            let outcome = renewal_loop(weak.clone(), cancel).await;
            debug!(cache_key = %cache_key, ?outcome, "Lease renewal task finished");
            if outcome == RenewalOutcome::Completed {
                if let Some(client) = weak.upgrade() {
                    on_done(client).await;
                }
            }
        });
        *self.renewal.lock() = Some(handle);
    }

    async fn renew(&self) -> Result<()> {
        let token = self.token();
        let result = self.api.renew_self(&token).await;
        metrics::record_renewal(result.is_ok());
        let auth = result?;

        let mut state = self.state.write();
        state.secret.lease_duration = Duration::from_secs(auth.lease_duration);
        state.secret.renewable = auth.renewable;
        state.secret.renewals += 1;
        state.issued_at = Instant::now();
        debug!(
            cache_key = %self.cache_key,
            lease_seconds = auth.lease_duration,
            renewals = state.secret.renewals,
            "Renewed Vault token"
        );
        Ok(())
    }

    /// Time until the next renewal attempt, or `None` when the lease is gone
    fn next_renewal_in(&self) -> Option<Duration> {
        let state = self.state.read();
        let lease = state.secret.lease_duration;
        if lease.is_zero() {
            return None;
        }
        let target = lease * 2 / 3;
        Some(target.saturating_sub(state.issued_at.elapsed()))
    }

    fn is_renewable(&self) -> bool {
        self.state.read().secret.renewable
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn renewal_loop(weak: Weak<Client>, cancel: CancellationToken) -> RenewalOutcome {
    loop {
        let wait = match weak.upgrade() {
            Some(client) => match client.next_renewal_in() {
                Some(wait) => wait,
                None => return RenewalOutcome::Completed,
            },
            None => return RenewalOutcome::Dropped,
        };

        tokio::select! {
            _ = cancel.cancelled() => return RenewalOutcome::Cancelled,
            _ = tokio::time::sleep(wait) => {}
        }

        let Some(client) = weak.upgrade() else {
            return RenewalOutcome::Dropped;
        };
        if !client.is_renewable() {
            debug!(cache_key = %client.cache_key, "Token is not renewable");
            return RenewalOutcome::Completed;
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return RenewalOutcome::Cancelled,
            result = client.renew() => result,
        };
        if let Err(e) = result {
            warn!(cache_key = %client.cache_key, error = %e, "Token renewal failed");
            client.invalidate();
            return RenewalOutcome::Completed;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::VaultHttpOptions;
    use futures::FutureExt;

    pub(crate) const AUTH_UID: &str = "11111111-1111-4111-8111-111111111111";
    pub(crate) const CONN_UID: &str = "22222222-2222-4222-8222-222222222222";

    pub(crate) fn auth() -> VaultAuth {
        let spec = serde_json::from_value(serde_json::json!({
            "method": "aws",
            "mount": "aws",
            "aws": {"role": "ops"}
        }))
        .unwrap();
        let mut auth = VaultAuth::new("default", spec);
        auth.metadata.namespace = Some("tenant-a".to_string());
        auth.metadata.uid = Some(AUTH_UID.to_string());
        auth.metadata.generation = Some(1);
        auth
    }

    pub(crate) fn connection(address: &str) -> VaultConnection {
        let spec = serde_json::from_value(serde_json::json!({"address": address})).unwrap();
        let mut conn = VaultConnection::new("default", spec);
        conn.metadata.namespace = Some("tenant-a".to_string());
        conn.metadata.uid = Some(CONN_UID.to_string());
        conn.metadata.generation = Some(1);
        conn
    }

    /// A client that never talked to Vault
    pub(crate) async fn offline_client(lease: Duration, renewable: bool) -> Client {
        client_at(auth(), "http://127.0.0.1:9", lease, renewable).await
    }

    /// A client for `auth` pointed at `address`, skipping login
    pub(crate) async fn client_at(
        auth: VaultAuth,
        address: &str,
        lease: Duration,
        renewable: bool,
    ) -> Client {
        let provider = CredentialProvider::Aws(aws_provider(&auth).await);
        let connection = connection(address);
        let key = ClientCacheKey::compute(&auth, &connection, provider.uid()).unwrap();
        let api = VaultHttpClient::new(address, VaultHttpOptions::default()).unwrap();
        let secret = TokenSecret::from_auth(&SecretAuth {
            client_token: "hvs.test".to_string(),
            accessor: "acc".to_string(),
            policies: vec!["default".to_string()],
            lease_duration: lease.as_secs(),
            renewable,
        });
        Client::new(key, Arc::new(auth), Arc::new(connection), provider, api, secret)
    }

    async fn aws_provider(auth: &VaultAuth) -> vso_credentials::AwsProvider {
        struct NoObjects;
        #[async_trait::async_trait]
        impl ObjectFetcher for NoObjects {
            async fn get_vault_auth(&self, ns: &str, name: &str) -> Result<VaultAuth> {
                Err(Error::not_found("VaultAuth", ns, name))
            }
            async fn get_vault_connection(&self, ns: &str, name: &str) -> Result<VaultConnection> {
                Err(Error::not_found("VaultConnection", ns, name))
            }
            async fn get_service_account(
                &self,
                ns: &str,
                name: &str,
            ) -> Result<k8s_openapi::api::core::v1::ServiceAccount> {
                Err(Error::not_found("ServiceAccount", ns, name))
            }
            async fn get_secret(
                &self,
                ns: &str,
                name: &str,
            ) -> Result<k8s_openapi::api::core::v1::Secret> {
                Err(Error::not_found("Secret", ns, name))
            }
            async fn create_service_account_token(
                &self,
                ns: &str,
                name: &str,
                _audiences: Vec<String>,
                _expiration_seconds: i64,
            ) -> Result<String> {
                Err(Error::not_found("ServiceAccount", ns, name))
            }
            async fn apply_secret(
                &self,
                _secret: &k8s_openapi::api::core::v1::Secret,
            ) -> Result<()> {
                Ok(())
            }
            async fn delete_secret(&self, _ns: &str, _name: &str) -> Result<()> {
                Ok(())
            }
        }

        match CredentialProvider::new(&NoObjects, auth, "tenant-a").await.unwrap() {
            CredentialProvider::Aws(p) => p,
            other => panic!("unexpected provider {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_lease_is_dead() {
        let client = offline_client(Duration::from_secs(60), true).await;
        assert!(client.is_valid());
        client.invalidate();
        let err = client.validate().unwrap_err();
        assert!(err.to_string().contains("zero lease"), "{err}");
    }

    #[tokio::test]
    async fn closed_client_is_dead() {
        let client = offline_client(Duration::from_secs(60), true).await;
        client.close(false).await;
        assert!(client.is_closed());
        assert!(!client.is_valid());
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_lease_is_dead() {
        let client = offline_client(Duration::from_secs(10), false).await;
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(client.validate().unwrap_err().to_string().contains("expired"));
    }

    #[tokio::test]
    async fn cache_key_round_trips() {
        let client = offline_client(Duration::from_secs(60), true).await;
        assert_eq!(&client.get_cache_key().unwrap(), client.cache_key());
        assert!(client.cache_key().as_str().starts_with("aws-"));
    }

    #[tokio::test]
    async fn token_is_redacted_in_debug() {
        let client = offline_client(Duration::from_secs(60), true).await;
        let rendered = format!("{client:?}");
        assert!(!rendered.contains("hvs.test"), "{rendered}");
        assert_eq!(client.token_secret().client_token(), "hvs.test");
    }

    #[tokio::test(start_paused = true)]
    async fn non_renewable_token_completes_after_two_thirds_of_lease() {
        let client = Arc::new(offline_client(Duration::from_secs(30), false).await);
        let (tx, rx) = tokio::sync::oneshot::channel();
        client.start_renewal(Box::new(move |c: Arc<Client>| {
            async move {
                let _ = tx.send(c.cache_key().clone());
            }
            .boxed()
        }));

        let started = Instant::now();
        let key = rx.await.unwrap();
        assert_eq!(&key, client.cache_key());
        assert!(started.elapsed() >= Duration::from_secs(20));
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_renewal_skips_hook() {
        let client = Arc::new(offline_client(Duration::from_secs(30), false).await);
        let (tx, mut rx) = tokio::sync::oneshot::channel::<()>();
        client.start_renewal(Box::new(move |_: Arc<Client>| {
            async move {
                let _ = tx.send(());
            }
            .boxed()
        }));
        client.stop_renewal();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
        assert!(!client.renewal_running());
    }
}
