//! Encrypted client cache persistence
//!
//! A client's token is stored as a Secret named `vso-cc-<cache-key>` in the
//! operator namespace. The payload is encrypted with the transit key of the
//! storage encryption client, so the Secret alone never exposes a token.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use vso_common::crd::StorageEncryption;
use vso_common::kube_utils::secret_string_data;
use vso_common::{
    Error, ObjectFetcher, Result, LABEL_COMPONENT, LABEL_MANAGED_BY, LABEL_MANAGED_BY_VSO,
};
use zeroize::Zeroizing;

use crate::cache_key::ClientCacheKey;
use crate::client::Client;

/// Prefix of persisted client Secret names
pub const SECRET_NAME_PREFIX: &str = "vso-cc-";

/// Label carrying the cache key of a persisted client
pub const LABEL_CACHE_KEY: &str = "secrets.hashicorp.com/client-cache-key";

/// Component label value of persisted client Secrets
pub const COMPONENT_CLIENT_CACHE: &str = "client-cache";

const PAYLOAD_KEY: &str = "payload";

#[derive(Serialize, Deserialize)]
struct StoredToken {
    cache_key: String,
    client_token: String,
    accessor: String,
    lease_duration_seconds: u64,
    renewable: bool,
    stored_at: i64,
}

/// Stores client tokens in encrypted Secrets
#[derive(Clone)]
pub struct ClientCacheStorage {
    fetcher: Arc<dyn ObjectFetcher>,
    namespace: String,
}

impl ClientCacheStorage {
    /// Create storage writing Secrets into `namespace`
    pub fn new(fetcher: Arc<dyn ObjectFetcher>, namespace: impl Into<String>) -> Self {
        Self {
            fetcher,
            namespace: namespace.into(),
        }
    }

    /// Secret name for a cache key
    pub fn secret_name(key: &ClientCacheKey) -> String {
        format!("{SECRET_NAME_PREFIX}{key}")
    }

    /// Encrypt and persist `client`'s token
    pub async fn store(&self, client: &Client, encryptor: &Client) -> Result<()> {
        let transit = transit_key(encryptor)?;
        let token = client.token_secret();
        let stored = StoredToken {
            cache_key: client.cache_key().to_string(),
            client_token: token.client_token().to_string(),
            accessor: token.accessor.clone(),
            lease_duration_seconds: token.lease_duration.as_secs(),
            renewable: token.renewable,
            stored_at: Utc::now().timestamp(),
        };
        let plaintext = Zeroizing::new(serde_json::to_vec(&stored)?);
        let ciphertext = encryptor
            .transit_encrypt(&transit.mount, &transit.key_name, &plaintext)
            .await?;

        let name = Self::secret_name(client.cache_key());
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([
                    (LABEL_MANAGED_BY.to_string(), LABEL_MANAGED_BY_VSO.to_string()),
                    (LABEL_COMPONENT.to_string(), COMPONENT_CLIENT_CACHE.to_string()),
                    (LABEL_CACHE_KEY.to_string(), client.cache_key().to_string()),
                ])),
                ..Default::default()
            },
            string_data: Some(BTreeMap::from([(PAYLOAD_KEY.to_string(), ciphertext)])),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };
        self.fetcher.apply_secret(&secret).await?;
        info!(cache_key = %client.cache_key(), secret = %name, "Persisted Vault client");
        Ok(())
    }

    /// Load and decrypt the token stored for `key`
    ///
    /// Returns `None` when nothing is stored.
    pub async fn restore(
        &self,
        key: &ClientCacheKey,
        encryptor: &Client,
    ) -> Result<Option<Zeroizing<String>>> {
        let name = Self::secret_name(key);
        let secret = match self.fetcher.get_secret(&self.namespace, &name).await {
            Ok(secret) => secret,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let ciphertext = secret_string_data(&secret).remove(PAYLOAD_KEY).ok_or_else(|| {
            Error::serialization(format!(
                "secret {}/{name} has no {PAYLOAD_KEY} key",
                self.namespace
            ))
        })?;

        let transit = transit_key(encryptor)?;
        let plaintext = Zeroizing::new(
            encryptor
                .transit_decrypt(&transit.mount, &transit.key_name, &ciphertext)
                .await?,
        );
        let stored: StoredToken = serde_json::from_slice(&plaintext)?;
        if stored.cache_key != key.as_str() {
            return Err(Error::invalid_cache_key(
                &stored.cache_key,
                format!("stored in {name} but expected {key}"),
            ));
        }
        debug!(cache_key = %key, stored_at = stored.stored_at, "Loaded persisted Vault client");
        Ok(Some(Zeroizing::new(stored.client_token)))
    }

    /// Delete the Secret stored for `key`
    pub async fn purge(&self, key: &ClientCacheKey) -> Result<()> {
        let name = Self::secret_name(key);
        self.fetcher.delete_secret(&self.namespace, &name).await?;
        debug!(cache_key = %key, secret = %name, "Purged persisted Vault client");
        Ok(())
    }
}

fn transit_key(encryptor: &Client) -> Result<&StorageEncryption> {
    encryptor.auth().spec.storage_encryption.as_ref().ok_or_else(|| {
        Error::validation_for_field(
            "spec.storageEncryption",
            "storage encryption client's VaultAuth has no storageEncryption",
        )
    })
}
