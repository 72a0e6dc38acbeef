//! Kubernetes auth: ServiceAccount tokens from the TokenRequest API

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;
use vso_common::crd::VaultAuthConfigKubernetes;
use vso_common::kube_utils::uid_of;
use vso_common::{ObjectFetcher, Result};

use crate::provider::{merge_params, LoginPayload};

/// Logs in with a short-lived token for a ServiceAccount
///
/// The provider UID is the ServiceAccount's UID, so recreating the
/// ServiceAccount yields a new cache key.
#[derive(Debug, Clone)]
pub struct KubernetesProvider {
    config: VaultAuthConfigKubernetes,
    namespace: String,
    uid: String,
    params: BTreeMap<String, String>,
}

impl KubernetesProvider {
    pub(crate) async fn init(
        fetcher: &dyn ObjectFetcher,
        config: VaultAuthConfigKubernetes,
        namespace: &str,
        params: BTreeMap<String, String>,
    ) -> Result<Self> {
        let sa = fetcher
            .get_service_account(namespace, &config.service_account)
            .await?;
        Ok(Self {
            uid: uid_of(&sa),
            namespace: namespace.to_string(),
            config,
            params,
        })
    }

    /// ServiceAccount UID
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Namespace of the ServiceAccount
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Request a new token and build `{role, jwt}`
    pub async fn credentials(&self, fetcher: &dyn ObjectFetcher) -> Result<LoginPayload> {
        let token = fetcher
            .create_service_account_token(
                &self.namespace,
                &self.config.service_account,
                self.config.audiences.clone(),
                self.config.token_expiration_seconds,
            )
            .await?;
        debug!(
            namespace = %self.namespace,
            service_account = %self.config.service_account,
            "Requested ServiceAccount token for Vault login"
        );

        let mut payload = LoginPayload::new();
        payload.insert("role".to_string(), Value::String(self.config.role.clone()));
        payload.insert("jwt".to_string(), Value::String(token));
        merge_params(&mut payload, &self.params);
        Ok(payload)
    }
}
