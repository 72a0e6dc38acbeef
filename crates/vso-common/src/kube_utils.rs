//! Cluster object access for the client factory
//!
//! The factory and credential providers only ever need a handful of reads
//! (VaultAuth, VaultConnection, ServiceAccount, Secret), the TokenRequest
//! sub-resource, and Secret writes for client cache persistence. They are
//! collected behind [`ObjectFetcher`] so tests can substitute an in-memory
//! implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, trace};

use crate::crd::{VaultAuth, VaultConnection};
use crate::{Error, Result, FIELD_MANAGER};

#[cfg(test)]
use mockall::automock;

/// Trait abstracting the Kubernetes reads and writes the client factory needs
///
/// Lookups of missing objects fail with [`Error::NotFound`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    /// Get a VaultAuth by namespace and name
    async fn get_vault_auth(&self, namespace: &str, name: &str) -> Result<VaultAuth>;

    /// Get a VaultConnection by namespace and name
    async fn get_vault_connection(&self, namespace: &str, name: &str) -> Result<VaultConnection>;

    /// Get a ServiceAccount by namespace and name
    async fn get_service_account(&self, namespace: &str, name: &str) -> Result<ServiceAccount>;

    /// Get a Secret by namespace and name
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;

    /// Request a short-lived token for a ServiceAccount
    ///
    /// # Arguments
    ///
    /// * `audiences` - Intended audiences of the token (empty for the API server default)
    /// * `expiration_seconds` - Requested token lifetime
    async fn create_service_account_token(
        &self,
        namespace: &str,
        name: &str,
        audiences: Vec<String>,
        expiration_seconds: i64,
    ) -> Result<String>;

    /// Create or update a Secret using server-side apply
    async fn apply_secret(&self, secret: &Secret) -> Result<()>;

    /// Delete a Secret, succeeding if it is already gone
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`ObjectFetcher`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeObjectFetcher {
    client: Client,
}

impl KubeObjectFetcher {
    /// Create a fetcher using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_namespaced<K>(&self, namespace: &str, name: &str) -> Result<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + serde::de::DeserializeOwned,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        trace!(kind = %K::kind(&K::DynamicType::default()), %namespace, %name, "Fetching object");
        api.get_opt(name).await?.ok_or_else(|| {
            Error::not_found(K::kind(&K::DynamicType::default()), namespace, name)
        })
    }
}

#[async_trait]
impl ObjectFetcher for KubeObjectFetcher {
    async fn get_vault_auth(&self, namespace: &str, name: &str) -> Result<VaultAuth> {
        self.get_namespaced(namespace, name).await
    }

    async fn get_vault_connection(&self, namespace: &str, name: &str) -> Result<VaultConnection> {
        self.get_namespaced(namespace, name).await
    }

    async fn get_service_account(&self, namespace: &str, name: &str) -> Result<ServiceAccount> {
        self.get_namespaced(namespace, name).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        self.get_namespaced(namespace, name).await
    }

    async fn create_service_account_token(
        &self,
        namespace: &str,
        name: &str,
        audiences: Vec<String>,
        expiration_seconds: i64,
    ) -> Result<String> {
        let sa_api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);

        let token_request = TokenRequest {
            metadata: Default::default(),
            spec: TokenRequestSpec {
                audiences,
                expiration_seconds: Some(expiration_seconds),
                bound_object_ref: None,
            },
            status: None,
        };

        let result = sa_api
            .create_token_request(name, &PostParams::default(), &token_request)
            .await?;

        let token = result
            .status
            .ok_or_else(|| {
                Error::internal_with_context("token-request", "token response missing status")
            })?
            .token;

        if token.is_empty() {
            return Err(Error::internal_with_context(
                "token-request",
                format!("server returned empty token for ServiceAccount {namespace}/{name}"),
            ));
        }

        debug!(%namespace, service_account = %name, "Issued ServiceAccount token");
        Ok(token)
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<()> {
        let name = secret.name_any();
        let namespace = secret
            .namespace()
            .ok_or_else(|| Error::validation("secret to apply has no namespace"))?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);

        let mut secret = secret.clone();
        secret.metadata.managed_fields = None;
        secret.metadata.resource_version = None;

        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&name, &params, &Patch::Apply(&secret)).await?;
        debug!(%namespace, %name, "Applied Secret");
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Decode a Secret's `data` (and `stringData`) into UTF-8 strings
///
/// Non UTF-8 values are skipped.
pub fn secret_string_data(secret: &Secret) -> BTreeMap<String, String> {
    let mut result = BTreeMap::new();
    if let Some(data) = &secret.data {
        for (key, value) in data {
            if let Ok(s) = String::from_utf8(value.0.clone()) {
                result.insert(key.clone(), s);
            }
        }
    }
    if let Some(string_data) = &secret.string_data {
        result.extend(string_data.clone());
    }
    result
}

/// Object UID, or an empty string when the server has not assigned one
pub fn uid_of<K: Resource>(obj: &K) -> String {
    obj.meta().uid.clone().unwrap_or_default()
}

/// Object generation, or 0 when unset
pub fn generation_of<K: Resource>(obj: &K) -> i64 {
    obj.meta().generation.unwrap_or(0)
}
