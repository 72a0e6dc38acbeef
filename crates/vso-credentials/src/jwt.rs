//! JWT auth: a ServiceAccount token or a pre-provisioned token in a Secret

use std::collections::BTreeMap;

use serde_json::Value;
use vso_common::crd::VaultAuthConfigJwt;
use vso_common::kube_utils::{secret_string_data, uid_of};
use vso_common::{Error, ObjectFetcher, Result};

use crate::provider::{merge_params, LoginPayload};

/// Secret key holding a pre-provisioned JWT
pub const JWT_SECRET_KEY: &str = "jwt";

#[derive(Debug, Clone)]
enum JwtSource {
    ServiceAccount(String),
    Secret(String),
}

/// Logs in with a JWT
///
/// A configured ServiceAccount takes precedence over `secretRef`.
#[derive(Debug, Clone)]
pub struct JwtProvider {
    config: VaultAuthConfigJwt,
    source: JwtSource,
    namespace: String,
    uid: String,
    params: BTreeMap<String, String>,
}

impl JwtProvider {
    pub(crate) async fn init(
        fetcher: &dyn ObjectFetcher,
        config: VaultAuthConfigJwt,
        namespace: &str,
        params: BTreeMap<String, String>,
    ) -> Result<Self> {
        let (source, uid) = match (&config.service_account, &config.secret_ref) {
            (Some(sa), _) if !sa.is_empty() => {
                let obj = fetcher.get_service_account(namespace, sa).await?;
                (JwtSource::ServiceAccount(sa.clone()), uid_of(&obj))
            }
            (_, Some(secret)) if !secret.is_empty() => {
                let obj = fetcher.get_secret(namespace, secret).await?;
                (JwtSource::Secret(secret.clone()), uid_of(&obj))
            }
            _ => {
                return Err(Error::validation_for_field(
                    "spec.jwt",
                    "either serviceAccount or secretRef must be set",
                ))
            }
        };

        Ok(Self {
            config,
            source,
            namespace: namespace.to_string(),
            uid,
            params,
        })
    }

    /// UID of the ServiceAccount or Secret backing the token
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Namespace of the backing object
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Fetch the token and build `{role, jwt}`
    pub async fn credentials(&self, fetcher: &dyn ObjectFetcher) -> Result<LoginPayload> {
        let token = match &self.source {
            JwtSource::ServiceAccount(sa) => {
                fetcher
                    .create_service_account_token(
                        &self.namespace,
                        sa,
                        self.config.audiences.clone(),
                        self.config.token_expiration_seconds,
                    )
                    .await?
            }
            JwtSource::Secret(name) => {
                let secret = fetcher.get_secret(&self.namespace, name).await?;
                secret_string_data(&secret)
                    .remove(JWT_SECRET_KEY)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| {
                        Error::credential(
                            "jwt",
                            format!(
                                "secret {}/{name} has no value for key {JWT_SECRET_KEY:?}",
                                self.namespace
                            ),
                        )
                    })?
            }
        };

        let mut payload = LoginPayload::new();
        payload.insert("role".to_string(), Value::String(self.config.role.clone()));
        payload.insert("jwt".to_string(), Value::String(token));
        merge_params(&mut payload, &self.params);
        Ok(payload)
    }
}
