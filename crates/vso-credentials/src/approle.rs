//! AppRole auth: role_id from the VaultAuth, secret_id from a Secret

use std::collections::BTreeMap;

use serde_json::Value;
use vso_common::crd::VaultAuthConfigAppRole;
use vso_common::kube_utils::{secret_string_data, uid_of};
use vso_common::{Error, ObjectFetcher, Result};
use zeroize::Zeroizing;

use crate::provider::{merge_params, LoginPayload};

/// Secret key holding the AppRole secret-id
pub const APPROLE_SECRET_ID_KEY: &str = "id";

/// Logs in with `{role_id, secret_id}`
///
/// The provider UID is the Secret's UID. The secret-id is re-read on every
/// login since it is expected to rotate.
#[derive(Debug, Clone)]
pub struct AppRoleProvider {
    config: VaultAuthConfigAppRole,
    namespace: String,
    uid: String,
    params: BTreeMap<String, String>,
}

impl AppRoleProvider {
    pub(crate) async fn init(
        fetcher: &dyn ObjectFetcher,
        config: VaultAuthConfigAppRole,
        namespace: &str,
        params: BTreeMap<String, String>,
    ) -> Result<Self> {
        if config.role_id.is_empty() {
            return Err(Error::validation_for_field("spec.appRole.roleId", "must not be empty"));
        }
        let secret = fetcher.get_secret(namespace, &config.secret_ref).await?;
        Ok(Self {
            uid: uid_of(&secret),
            namespace: namespace.to_string(),
            config,
            params,
        })
    }

    /// UID of the Secret holding the secret-id
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Namespace of the Secret
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Read the current secret-id and build `{role_id, secret_id}`
    pub async fn credentials(&self, fetcher: &dyn ObjectFetcher) -> Result<LoginPayload> {
        let secret = fetcher
            .get_secret(&self.namespace, &self.config.secret_ref)
            .await?;
        let secret_id = Zeroizing::new(
            secret_string_data(&secret)
                .remove(APPROLE_SECRET_ID_KEY)
                .unwrap_or_default(),
        );
        if secret_id.is_empty() {
            return Err(Error::credential(
                "appRole",
                format!(
                    "secret {}/{} has no value for key {APPROLE_SECRET_ID_KEY:?}",
                    self.namespace, self.config.secret_ref
                ),
            ));
        }

        let mut payload = LoginPayload::new();
        payload.insert("role_id".to_string(), Value::String(self.config.role_id.clone()));
        payload.insert("secret_id".to_string(), Value::String(secret_id.as_str().to_string()));
        merge_params(&mut payload, &self.params);
        Ok(payload)
    }
}
