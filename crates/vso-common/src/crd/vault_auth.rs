//! VaultAuth CRD
//!
//! A VaultAuth describes how to authenticate to Vault: which auth method,
//! where it is mounted, and the method-specific credential source. It may
//! also name a transit key used to encrypt persisted client state.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default lifetime requested for ServiceAccount tokens (10 minutes)
pub const DEFAULT_TOKEN_EXPIRATION_SECONDS: i64 = 600;

/// VaultAuth configures a Vault authentication method.
///
/// Example:
/// ```yaml
/// apiVersion: secrets.hashicorp.com/v1beta1
/// kind: VaultAuth
/// metadata:
///   name: default
///   namespace: tenant-a
/// spec:
///   vaultConnectionRef: vso-system/default
///   method: kubernetes
///   mount: kubernetes
///   kubernetes:
///     role: tenant-a
///     serviceAccount: default
///     audiences: ["vault"]
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "secrets.hashicorp.com",
    version = "v1beta1",
    kind = "VaultAuth",
    namespaced,
    status = "VaultAuthStatus",
    printcolumn = r#"{"name":"Method","type":"string","jsonPath":".spec.method"}"#,
    printcolumn = r#"{"name":"Mount","type":"string","jsonPath":".spec.mount"}"#,
    printcolumn = r#"{"name":"Valid","type":"boolean","jsonPath":".status.valid"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VaultAuthSpec {
    /// VaultConnection to use, as `name` or `namespace/name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_connection_ref: Option<String>,

    /// Vault namespace (enterprise feature)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Namespaces allowed to reference this VaultAuth ("*" allows all)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_namespaces: Option<Vec<String>>,

    /// Authentication method
    pub method: VaultAuthMethod,

    /// Mount path of the auth method in Vault
    pub mount: String,

    /// Extra parameters merged into the login payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<BTreeMap<String, String>>,

    /// Extra headers sent with every Vault request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,

    /// Kubernetes auth configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<VaultAuthConfigKubernetes>,

    /// JWT auth configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<VaultAuthConfigJwt>,

    /// AppRole auth configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_role: Option<VaultAuthConfigAppRole>,

    /// AWS IAM auth configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<VaultAuthConfigAws>,

    /// Transit key used to encrypt persisted client cache entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_encryption: Option<StorageEncryption>,
}

/// Supported Vault authentication methods
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum VaultAuthMethod {
    /// Kubernetes ServiceAccount token auth
    Kubernetes,
    /// JWT/OIDC auth
    Jwt,
    /// AppRole auth (role_id + secret_id)
    AppRole,
    /// AWS IAM auth (signed sts:GetCallerIdentity)
    Aws,
}

impl VaultAuthMethod {
    /// All supported methods
    pub const ALL: [VaultAuthMethod; 4] = [
        VaultAuthMethod::Kubernetes,
        VaultAuthMethod::Jwt,
        VaultAuthMethod::AppRole,
        VaultAuthMethod::Aws,
    ];

    /// The method name as written in the CRD
    pub fn as_str(&self) -> &'static str {
        match self {
            VaultAuthMethod::Kubernetes => "kubernetes",
            VaultAuthMethod::Jwt => "jwt",
            VaultAuthMethod::AppRole => "appRole",
            VaultAuthMethod::Aws => "aws",
        }
    }
}

impl std::fmt::Display for VaultAuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kubernetes auth method configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VaultAuthConfigKubernetes {
    /// Vault role to log in as
    pub role: String,

    /// ServiceAccount whose token is presented to Vault
    pub service_account: String,

    /// Token audiences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audiences: Vec<String>,

    /// Requested token lifetime in seconds
    #[serde(default = "default_token_expiration")]
    pub token_expiration_seconds: i64,
}

/// JWT auth method configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VaultAuthConfigJwt {
    /// Vault role to log in as
    pub role: String,

    /// Secret holding a pre-provisioned token under the `jwt` key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,

    /// ServiceAccount whose token is presented to Vault
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,

    /// Token audiences (ServiceAccount tokens only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audiences: Vec<String>,

    /// Requested token lifetime in seconds (ServiceAccount tokens only)
    #[serde(default = "default_token_expiration")]
    pub token_expiration_seconds: i64,
}

/// AppRole auth method configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VaultAuthConfigAppRole {
    /// AppRole role ID
    pub role_id: String,

    /// Secret holding the secret ID under the `id` key
    pub secret_ref: String,
}

/// AWS IAM auth method configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VaultAuthConfigAws {
    /// Vault role to log in as
    pub role: String,

    /// AWS region used for signing (default us-east-1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Value for the `X-Vault-AWS-IAM-Server-ID` header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_value: Option<String>,

    /// STS endpoint override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sts_endpoint: Option<String>,

    /// Secret holding `access_key_id`, `secret_access_key` and optionally
    /// `session_token`; the process environment is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

/// Transit key configuration for client cache encryption
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageEncryption {
    /// Transit secrets engine mount
    pub mount: String,

    /// Transit key name
    pub key_name: String,
}

/// VaultAuth status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VaultAuthStatus {
    /// Whether the configuration validated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,

    /// Last validation error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_token_expiration() -> i64 {
    DEFAULT_TOKEN_EXPIRATION_SECONDS
}

impl VaultAuthSpec {
    /// Validate that the configuration block for the selected method exists
    pub fn validate(&self) -> Result<(), String> {
        if self.mount.trim().is_empty() {
            return Err("spec.mount must not be empty".to_string());
        }
        let present = match self.method {
            VaultAuthMethod::Kubernetes => self.kubernetes.is_some(),
            VaultAuthMethod::Jwt => self.jwt.is_some(),
            VaultAuthMethod::AppRole => self.app_role.is_some(),
            VaultAuthMethod::Aws => self.aws.is_some(),
        };
        if !present {
            return Err(format!(
                "spec.{} is required for auth method {}",
                self.method_block_name(),
                self.method
            ));
        }
        if let Some(enc) = &self.storage_encryption {
            if enc.mount.is_empty() || enc.key_name.is_empty() {
                return Err("spec.storageEncryption requires mount and keyName".to_string());
            }
        }
        Ok(())
    }

    /// Whether `namespace` may reference this VaultAuth from `own_namespace`
    pub fn allows_namespace(&self, own_namespace: &str, namespace: &str) -> bool {
        if own_namespace == namespace {
            return true;
        }
        self.allowed_namespaces
            .as_ref()
            .map(|allowed| allowed.iter().any(|ns| ns == "*" || ns == namespace))
            .unwrap_or(false)
    }

    fn method_block_name(&self) -> &'static str {
        match self.method {
            VaultAuthMethod::Kubernetes => "kubernetes",
            VaultAuthMethod::Jwt => "jwt",
            VaultAuthMethod::AppRole => "appRole",
            VaultAuthMethod::Aws => "aws",
        }
    }
}
