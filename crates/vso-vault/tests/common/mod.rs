//! In-memory cluster and Vault fixtures for factory tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use parking_lot::Mutex;
use serde_json::{json, Value};
use vso_common::crd::{ObjectRef, VaultAuth, VaultConnection};
use vso_common::{Error, ObjectFetcher, Result};
use vso_vault::{CachingClientFactory, ClientFactoryConfig};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const OPERATOR_NS: &str = "vso-system";
pub const TENANT_NS: &str = "tenant-a";

pub const AUTH_UID: &str = "aaaaaaaa-0000-4000-8000-000000000001";
pub const OTHER_AUTH_UID: &str = "aaaaaaaa-0000-4000-8000-000000000003";
pub const ENC_AUTH_UID: &str = "aaaaaaaa-0000-4000-8000-000000000002";
pub const CONN_UID: &str = "cccccccc-0000-4000-8000-000000000001";
pub const SECRET_UID: &str = "55555555-0000-4000-8000-000000000001";
pub const ENC_SECRET_UID: &str = "55555555-0000-4000-8000-000000000002";

pub const TENANT_SECRET_ID: &str = "tenant-secret-id";
pub const ENC_SECRET_ID: &str = "encryption-secret-id";
pub const TENANT_TOKEN: &str = "hvs.tenant";
pub const ENC_TOKEN: &str = "hvs.encryption";

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// Cluster state held in memory
#[derive(Default)]
pub struct FakeCluster {
    auths: Mutex<BTreeMap<Key, VaultAuth>>,
    connections: Mutex<BTreeMap<Key, VaultConnection>>,
    secrets: Mutex<BTreeMap<Key, Secret>>,
}

impl FakeCluster {
    pub fn insert_auth(&self, auth: VaultAuth) {
        let k = key(
            auth.metadata.namespace.as_deref().unwrap_or_default(),
            auth.metadata.name.as_deref().unwrap_or_default(),
        );
        self.auths.lock().insert(k, auth);
    }

    pub fn insert_connection(&self, conn: VaultConnection) {
        let k = key(
            conn.metadata.namespace.as_deref().unwrap_or_default(),
            conn.metadata.name.as_deref().unwrap_or_default(),
        );
        self.connections.lock().insert(k, conn);
    }

    pub fn insert_secret(&self, secret: Secret) {
        let k = key(
            secret.metadata.namespace.as_deref().unwrap_or_default(),
            secret.metadata.name.as_deref().unwrap_or_default(),
        );
        self.secrets.lock().insert(k, secret);
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.secrets.lock().get(&key(namespace, name)).cloned()
    }

    pub fn update_auth(&self, namespace: &str, name: &str, f: impl FnOnce(&mut VaultAuth)) {
        if let Some(auth) = self.auths.lock().get_mut(&key(namespace, name)) {
            f(auth);
        }
    }
}

#[async_trait::async_trait]
impl ObjectFetcher for FakeCluster {
    async fn get_vault_auth(&self, namespace: &str, name: &str) -> Result<VaultAuth> {
        self.auths
            .lock()
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::not_found("VaultAuth", namespace, name))
    }

    async fn get_vault_connection(&self, namespace: &str, name: &str) -> Result<VaultConnection> {
        self.connections
            .lock()
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::not_found("VaultConnection", namespace, name))
    }

    async fn get_service_account(&self, namespace: &str, name: &str) -> Result<ServiceAccount> {
        Err(Error::not_found("ServiceAccount", namespace, name))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        self.secret(namespace, name)
            .ok_or_else(|| Error::not_found("Secret", namespace, name))
    }

    async fn create_service_account_token(
        &self,
        namespace: &str,
        name: &str,
        _audiences: Vec<String>,
        _expiration_seconds: i64,
    ) -> Result<String> {
        Err(Error::not_found("ServiceAccount", namespace, name))
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<()> {
        self.insert_secret(secret.clone());
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        self.secrets.lock().remove(&key(namespace, name));
        Ok(())
    }
}

pub fn approle_auth(namespace: &str, name: &str, uid: &str) -> VaultAuth {
    let spec = serde_json::from_value(json!({
        "method": "appRole",
        "mount": "approle",
        "appRole": {"roleId": "role-1", "secretRef": "approle-secret"}
    }))
    .unwrap();
    let mut auth = VaultAuth::new(name, spec);
    auth.metadata.namespace = Some(namespace.to_string());
    auth.metadata.uid = Some(uid.to_string());
    auth.metadata.generation = Some(1);
    auth
}

pub fn connection(address: &str) -> VaultConnection {
    let spec = serde_json::from_value(json!({"address": address})).unwrap();
    let mut conn = VaultConnection::new("default", spec);
    conn.metadata.namespace = Some(OPERATOR_NS.to_string());
    conn.metadata.uid = Some(CONN_UID.to_string());
    conn.metadata.generation = Some(1);
    conn
}

pub fn approle_secret(namespace: &str, uid: &str, secret_id: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some("approle-secret".to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(uid.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "id".to_string(),
            ByteString(secret_id.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

/// A cluster with a tenant VaultAuth, an encryption VaultAuth and the
/// default VaultConnection pointing at `server`
pub fn cluster(server: &MockServer) -> Arc<FakeCluster> {
    let cluster = FakeCluster::default();
    cluster.insert_connection(connection(&server.uri()));
    cluster.insert_auth(approle_auth(TENANT_NS, "default", AUTH_UID));
    cluster.insert_secret(approle_secret(TENANT_NS, SECRET_UID, TENANT_SECRET_ID));

    let mut enc = approle_auth(OPERATOR_NS, "encryption", ENC_AUTH_UID);
    enc.spec.storage_encryption =
        serde_json::from_value(json!({"mount": "transit", "keyName": "vso"})).unwrap();
    cluster.insert_auth(enc);
    cluster.insert_secret(approle_secret(OPERATOR_NS, ENC_SECRET_UID, ENC_SECRET_ID));
    Arc::new(cluster)
}

pub fn config() -> ClientFactoryConfig {
    ClientFactoryConfig {
        operator_namespace: OPERATOR_NS.to_string(),
        storage_encryption_auth: Some(ObjectRef::new(OPERATOR_NS, "encryption")),
        ..Default::default()
    }
}

pub fn factory(cluster: &Arc<FakeCluster>, config: ClientFactoryConfig) -> CachingClientFactory {
    CachingClientFactory::new(cluster.clone(), config).unwrap()
}

pub fn tenant_auth_ref() -> ObjectRef {
    ObjectRef::new(TENANT_NS, "default")
}

pub fn login_body(token: &str, lease: u64, renewable: bool) -> Value {
    json!({
        "auth": {
            "client_token": token,
            "accessor": format!("{token}-accessor"),
            "policies": ["default"],
            "lease_duration": lease,
            "renewable": renewable
        }
    })
}

/// Login mock for the tenant AppRole credentials
pub fn tenant_login(response: ResponseTemplate) -> Mock {
    Mock::given(method("POST"))
        .and(path("/v1/auth/approle/login"))
        .and(body_partial_json(json!({"secret_id": TENANT_SECRET_ID})))
        .respond_with(response)
}

/// Login mock for the storage encryption AppRole credentials
pub fn encryption_login(response: ResponseTemplate) -> Mock {
    Mock::given(method("POST"))
        .and(path("/v1/auth/approle/login"))
        .and(body_partial_json(json!({"secret_id": ENC_SECRET_ID})))
        .respond_with(response)
}

/// Transit stand-in: the ciphertext is the base64 plaintext behind a prefix
pub struct FakeTransit;

impl Respond for FakeTransit {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or_default();
        if request.url.path().ends_with("/encrypt/vso") {
            let plaintext = body["plaintext"].as_str().unwrap_or_default();
            let ciphertext = format!("vault:v1:{plaintext}");
            ResponseTemplate::new(200).set_body_json(json!({"data": {"ciphertext": ciphertext}}))
        } else {
            let ciphertext = body["ciphertext"].as_str().unwrap_or_default();
            let plaintext = ciphertext.trim_start_matches("vault:v1:");
            ResponseTemplate::new(200).set_body_json(json!({"data": {"plaintext": plaintext}}))
        }
    }
}

pub async fn mount_transit(server: &MockServer) {
    Mock::given(method("POST"))
        .and(wiremock::matchers::path_regex(r"^/v1/transit/(encrypt|decrypt)/vso$"))
        .respond_with(FakeTransit)
        .mount(server)
        .await;
}
