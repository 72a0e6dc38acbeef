//! Test doubles shared by the unit tests

use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use mockall::mock;
use vso_common::crd::{StorageEncryption, VaultAuth, VaultConnection};
use vso_common::{ObjectFetcher, Result};

// Local mock for ObjectFetcher since the mockall-generated mock is only
// available within the vso-common crate's test configuration
mock! {
    pub Fetcher {}

    #[async_trait::async_trait]
    impl ObjectFetcher for Fetcher {
        async fn get_vault_auth(&self, namespace: &str, name: &str) -> Result<VaultAuth>;
        async fn get_vault_connection(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<VaultConnection>;
        async fn get_service_account(&self, namespace: &str, name: &str) -> Result<ServiceAccount>;
        async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;
        async fn create_service_account_token(
            &self,
            namespace: &str,
            name: &str,
            audiences: Vec<String>,
            expiration_seconds: i64,
        ) -> Result<String>;
        async fn apply_secret(&self, secret: &Secret) -> Result<()>;
        async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;
    }
}

/// The shared test VaultAuth with a transit key configured
pub fn encryption_auth() -> VaultAuth {
    let mut auth = crate::client::tests::auth();
    auth.spec.storage_encryption = Some(StorageEncryption {
        mount: "transit".to_string(),
        key_name: "vso".to_string(),
    });
    auth
}
