//! Custom Resource Definitions consumed by the client factory

mod vault_auth;
mod vault_connection;

pub use vault_auth::{
    StorageEncryption, VaultAuth, VaultAuthConfigAppRole, VaultAuthConfigAws,
    VaultAuthConfigJwt, VaultAuthConfigKubernetes, VaultAuthMethod, VaultAuthSpec,
    VaultAuthStatus, DEFAULT_TOKEN_EXPIRATION_SECONDS,
};
pub use vault_connection::{
    parse_duration, VaultConnection, VaultConnectionSpec, VaultConnectionStatus,
    DEFAULT_REQUEST_TIMEOUT,
};

/// API group shared by all operator CRDs
pub const API_GROUP: &str = "secrets.hashicorp.com";

/// Reference to a namespaced object, written as `name` or `namespace/name`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectRef {
    /// Create a reference from its parts
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse a `name` or `namespace/name` reference
    ///
    /// A bare name resolves against `default_namespace`.
    pub fn parse(reference: &str, default_namespace: &str) -> crate::Result<Self> {
        let reference = reference.trim();
        match reference.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            None if !reference.is_empty() => Ok(Self::new(default_namespace, reference)),
            _ => Err(crate::Error::validation(format!(
                "invalid object reference {reference:?}, expected name or namespace/name"
            ))),
        }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
