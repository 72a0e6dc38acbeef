//! Client cache keys
//!
//! A key is `<method>-<hash>`, where the hash is the first 7 bytes (14 hex
//! characters) of the SHA-256 digest of
//! `authUID.authGeneration-connectionUID.connectionGeneration-providerUID`.
//! Keys are embedded in generated resource names, so they never exceed 63
//! characters. A clone key appends `-<namespace>` to a parent key.
//!
//! Only the leading 7 digest bytes are kept. Appending the trailing 4 bytes
//! as well (22 hex characters) would change every key and break
//! [`ClientCacheKey::parent`], which matches exactly 14 hex characters.

use std::fmt;

use aws_lc_rs::digest::{digest, SHA256};
use once_cell::sync::Lazy;
use regex::Regex;
use vso_common::crd::{VaultAuth, VaultConnection};
use vso_common::kube_utils::{generation_of, uid_of};
use vso_common::{Error, Result, UID_LENGTH};

/// Maximum length of a derived key
pub const MAX_CACHE_KEY_LENGTH: usize = 63;

/// Number of digest bytes kept in the key
const HASH_BYTES: usize = 7;

static KEY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^((?:kubernetes|jwt|approle|aws)-[a-f0-9]{14})(?:-(.+))?$")
        .expect("valid cache key pattern")
});

/// Identity inputs a cache key is derived from
#[derive(Clone, Copy, Debug)]
pub struct CacheKeyInputs<'a> {
    /// Auth method name
    pub method: &'a str,
    /// VaultAuth UID
    pub auth_uid: &'a str,
    /// VaultAuth generation
    pub auth_generation: i64,
    /// VaultConnection UID
    pub connection_uid: &'a str,
    /// VaultConnection generation
    pub connection_generation: i64,
    /// Credential provider UID
    pub provider_uid: &'a str,
}

/// Identifier under which a client is cached
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientCacheKey(String);

impl ClientCacheKey {
    /// Derive the key for a VaultAuth, VaultConnection and provider UID
    pub fn compute(
        auth: &VaultAuth,
        connection: &VaultConnection,
        provider_uid: &str,
    ) -> Result<Self> {
        let auth_uid = uid_of(auth);
        let connection_uid = uid_of(connection);
        compute_client_cache_key(&CacheKeyInputs {
            method: auth.spec.method.as_str(),
            auth_uid: &auth_uid,
            auth_generation: generation_of(auth),
            connection_uid: &connection_uid,
            connection_generation: generation_of(connection),
            provider_uid,
        })
    }

    /// Parse a key produced by [`ClientCacheKey::compute`] or [`ClientCacheKey::clone_for`]
    pub fn parse(key: &str) -> Result<Self> {
        if !KEY_PATTERN.is_match(key) {
            return Err(Error::invalid_cache_key(key, "does not match any supported auth method"));
        }
        Ok(Self(key.to_string()))
    }

    /// The key as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The parent key of a clone, or the key itself
    pub fn parent(&self) -> Result<Self> {
        KEY_PATTERN
            .captures(&self.0)
            .and_then(|c| c.get(1))
            .map(|m| Self(m.as_str().to_string()))
            .ok_or_else(|| {
                Error::invalid_cache_key(&self.0, "does not match any supported auth method")
            })
    }

    /// Whether this key is a namespace-scoped clone
    pub fn is_clone(&self) -> bool {
        KEY_PATTERN
            .captures(&self.0)
            .is_some_and(|c| c.get(2).is_some())
    }

    /// Whether both keys share a parent
    pub fn same_parent(&self, other: &ClientCacheKey) -> Result<bool> {
        Ok(self.parent()? == other.parent()?)
    }

    /// A clone of this key scoped to `namespace`
    pub fn clone_for(&self, namespace: &str) -> Result<Self> {
        if namespace.is_empty() {
            return Err(Error::invalid_cache_key(&self.0, "clone namespace must not be empty"));
        }
        if self.is_clone() {
            return Err(Error::invalid_cache_key(&self.0, "cannot clone a clone key"));
        }
        Ok(Self(format!("{}-{namespace}", self.0)))
    }
}

impl fmt::Display for ClientCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ClientCacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derive a cache key from raw identity inputs
///
/// Fails closed: malformed or duplicated UIDs and oversized keys are errors,
/// never truncated.
pub fn compute_client_cache_key(inputs: &CacheKeyInputs<'_>) -> Result<ClientCacheKey> {
    for (object, uid) in [
        ("auth", inputs.auth_uid),
        ("connection", inputs.connection_uid),
        ("provider", inputs.provider_uid),
    ] {
        if uid.len() != UID_LENGTH {
            return Err(Error::invalid_uid_length(object, uid.len()));
        }
    }
    if inputs.auth_uid == inputs.connection_uid
        || inputs.auth_uid == inputs.provider_uid
        || inputs.connection_uid == inputs.provider_uid
    {
        return Err(Error::DuplicateUid);
    }

    let input = format!(
        "{}.{}-{}.{}-{}",
        inputs.auth_uid,
        inputs.auth_generation,
        inputs.connection_uid,
        inputs.connection_generation,
        inputs.provider_uid
    );
    let sum = digest(&SHA256, input.as_bytes());
    let hash: String = sum.as_ref()[..HASH_BYTES]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();

    let key = format!("{}-{hash}", inputs.method.to_lowercase());
    if key.len() > MAX_CACHE_KEY_LENGTH {
        return Err(Error::KeyLengthExceeded { length: key.len() });
    }
    Ok(ClientCacheKey(key))
}
