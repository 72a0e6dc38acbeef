//! Test doubles shared by the provider tests

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use mockall::mock;
use vso_common::crd::{VaultAuth, VaultAuthSpec, VaultConnection};
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

pub const SA_UID: &str = "0b8d3c1e-5a4f-4e2b-9c7d-2f1e0a9b8c7d";
pub const SECRET_UID: &str = "4d2c1b0a-9e8f-4a7b-8c6d-5e4f3a2b1c0d";

pub fn service_account(namespace: &str, name: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(SA_UID.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn secret(namespace: &str, name: &str, data: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(SECRET_UID.to_string()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect::<BTreeMap<_, _>>(),
        ),
        ..Default::default()
    }
}

/// Build a VaultAuth from a JSON spec
pub fn vault_auth(spec: serde_json::Value) -> VaultAuth {
    let spec: VaultAuthSpec = serde_json::from_value(spec).expect("valid VaultAuthSpec");
    let mut auth = VaultAuth::new("default", spec);
    auth.metadata.namespace = Some("tenant-a".to_string());
    auth
}
