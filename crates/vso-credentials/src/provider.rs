//! The closed set of credential providers

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;
use vso_common::crd::{VaultAuth, VaultAuthMethod};
use vso_common::{Error, ObjectFetcher, Result};

use crate::approle::AppRoleProvider;
use crate::aws::AwsProvider;
use crate::jwt::JwtProvider;
use crate::kubernetes::KubernetesProvider;

/// Body of a Vault `auth/<mount>/login` request
pub type LoginPayload = serde_json::Map<String, Value>;

/// Produces identity and login material for one auth method
///
/// Constructed once per `(VaultAuth, namespace)` through
/// [`CredentialProvider::new`], which dispatches on `spec.method`.
#[derive(Debug, Clone)]
pub enum CredentialProvider {
    /// ServiceAccount token login
    Kubernetes(KubernetesProvider),
    /// JWT login from a ServiceAccount token or a pre-provisioned secret
    Jwt(JwtProvider),
    /// AppRole login with a secret-id read from a Secret
    AppRole(AppRoleProvider),
    /// AWS IAM login with a signed `sts:GetCallerIdentity` request
    Aws(AwsProvider),
}

impl CredentialProvider {
    /// Initialize the provider for `auth` as used from `namespace`
    ///
    /// Resolves the object that backs the provider UID. Fails when the
    /// configuration block for the selected method is missing or the backing
    /// object does not exist.
    pub async fn new(
        fetcher: &dyn ObjectFetcher,
        auth: &VaultAuth,
        namespace: &str,
    ) -> Result<Self> {
        auth.spec
            .validate()
            .map_err(|msg| Error::validation_for_field("spec.method", msg))?;

        let params = auth.spec.params.clone().unwrap_or_default();
        let provider = match auth.spec.method {
            VaultAuthMethod::Kubernetes => {
                let config = auth
                    .spec
                    .kubernetes
                    .clone()
                    .ok_or_else(|| missing_block("kubernetes"))?;
                Self::Kubernetes(
                    KubernetesProvider::init(fetcher, config, namespace, params).await?,
                )
            }
            VaultAuthMethod::Jwt => {
                let config = auth.spec.jwt.clone().ok_or_else(|| missing_block("jwt"))?;
                Self::Jwt(JwtProvider::init(fetcher, config, namespace, params).await?)
            }
            VaultAuthMethod::AppRole => {
                let config = auth.spec.app_role.clone().ok_or_else(|| missing_block("appRole"))?;
                Self::AppRole(AppRoleProvider::init(fetcher, config, namespace, params).await?)
            }
            VaultAuthMethod::Aws => {
                let config = auth.spec.aws.clone().ok_or_else(|| missing_block("aws"))?;
                Self::Aws(AwsProvider::init(config, namespace, params))
            }
        };

        debug!(
            method = %provider.method(),
            %namespace,
            provider_uid = %provider.uid(),
            "Initialized credential provider"
        );
        Ok(provider)
    }

    /// Auth method this provider logs in with
    pub fn method(&self) -> VaultAuthMethod {
        match self {
            Self::Kubernetes(_) => VaultAuthMethod::Kubernetes,
            Self::Jwt(_) => VaultAuthMethod::Jwt,
            Self::AppRole(_) => VaultAuthMethod::AppRole,
            Self::Aws(_) => VaultAuthMethod::Aws,
        }
    }

    /// Stable identifier of the backing credential material
    pub fn uid(&self) -> &str {
        match self {
            Self::Kubernetes(p) => p.uid(),
            Self::Jwt(p) => p.uid(),
            Self::AppRole(p) => p.uid(),
            Self::Aws(p) => p.uid(),
        }
    }

    /// Namespace the provider reads its objects from
    pub fn namespace(&self) -> &str {
        match self {
            Self::Kubernetes(p) => p.namespace(),
            Self::Jwt(p) => p.namespace(),
            Self::AppRole(p) => p.namespace(),
            Self::Aws(p) => p.namespace(),
        }
    }

    /// Produce a fresh login payload
    pub async fn credentials(&self, fetcher: &dyn ObjectFetcher) -> Result<LoginPayload> {
        match self {
            Self::Kubernetes(p) => p.credentials(fetcher).await,
            Self::Jwt(p) => p.credentials(fetcher).await,
            Self::AppRole(p) => p.credentials(fetcher).await,
            Self::Aws(p) => p.credentials(fetcher).await,
        }
    }
}

fn missing_block(block: &str) -> Error {
    Error::validation_for_field(format!("spec.{block}"), "auth method configuration is missing")
}

/// Add `spec.params` entries to a payload without replacing method fields
pub(crate) fn merge_params(payload: &mut LoginPayload, params: &BTreeMap<String, String>) {
    for (key, value) in params {
        payload
            .entry(key.clone())
            .or_insert_with(|| Value::String(value.clone()));
    }
}
