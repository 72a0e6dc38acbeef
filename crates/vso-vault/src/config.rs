//! Client factory configuration

use std::time::Duration;

use vso_common::crd::ObjectRef;
use vso_common::DEFAULT_OPERATOR_NAMESPACE;

use crate::cache::DEFAULT_CACHE_SIZE;

/// Default bound on storage encryption client setup
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for [`crate::CachingClientFactory`]
#[derive(Clone, Debug)]
pub struct ClientFactoryConfig {
    /// Namespace the operator runs in. Holds the default VaultConnection and
    /// persisted client cache Secrets.
    pub operator_namespace: String,

    /// Maximum number of cached clients
    pub cache_size: usize,

    /// VaultAuth whose `storageEncryption` key protects persisted clients
    pub storage_encryption_auth: Option<ObjectRef>,

    /// Bound on creating the storage encryption client
    pub setup_timeout: Duration,

    /// Persist client tokens to encrypted Secrets and restore them on miss
    pub persist: bool,
}

impl Default for ClientFactoryConfig {
    fn default() -> Self {
        Self {
            operator_namespace: DEFAULT_OPERATOR_NAMESPACE.to_string(),
            cache_size: DEFAULT_CACHE_SIZE,
            storage_encryption_auth: None,
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            persist: false,
        }
    }
}
