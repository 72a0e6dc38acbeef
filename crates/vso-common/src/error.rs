//! Error types for the Vault secrets operator
//!
//! Errors fall into four families: configuration errors (bad CRD content,
//! missing references), consistency errors (cache key derivation), remote
//! errors (Kubernetes or Vault rejected a call) and timeouts. Only the last
//! two are ever worth retrying.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A referenced Kubernetes object does not exist
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Object kind (e.g. "Secret", "VaultAuth")
        kind: String,
        /// Object namespace
        namespace: String,
        /// Object name
        name: String,
    },

    /// Invalid or incomplete configuration
    #[error(
        "validation error{}: {message}",
        .field.as_ref().map(|f| format!(" for {f}")).unwrap_or_default()
    )]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.storageEncryption")
        field: Option<String>,
    },

    /// An identity UID is not exactly 36 characters long
    #[error("invalid UID length for {object}: expected 36 characters, got {length}")]
    InvalidUidLength {
        /// Which input carried the malformed UID (auth, connection, provider)
        object: String,
        /// The observed length
        length: usize,
    },

    /// Two of the UIDs combined into a cache key are identical
    #[error("duplicate UID: auth, connection and credential provider UIDs must be distinct")]
    DuplicateUid,

    /// The derived cache key is longer than the allowed bound
    #[error("client cache key length {length} exceeds the maximum of 63 characters")]
    KeyLengthExceeded {
        /// Length of the rejected key
        length: usize,
    },

    /// A string could not be interpreted as a client cache key
    #[error("invalid client cache key {key:?}: {message}")]
    InvalidCacheKey {
        /// The offending key
        key: String,
        /// Why it was rejected
        message: String,
    },

    /// A credential provider could not produce login material from the
    /// objects it references (empty or missing keys)
    #[error("credential error [{method}]: {message}")]
    Credential {
        /// Auth method of the failing provider
        method: String,
        /// Description of what failed
        message: String,
    },

    /// Vault returned an error response
    #[error(
        "vault error{}: {message}",
        .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
    )]
    Vault {
        /// HTTP status code, if a response was received
        status: Option<u16>,
        /// Error text reported by Vault
        message: String,
    },

    /// Vault could not be reached
    #[error("vault transport error: {message}")]
    Transport {
        /// Description of the transport failure
        message: String,
        /// Whether the failure was a client-side request timeout
        timeout: bool,
    },

    /// An operation did not complete within its deadline
    #[error("{operation}: {message}")]
    Timeout {
        /// The operation that timed out
        operation: String,
        /// Description including the elapsed bound
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a not-found error for a namespaced object
    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error naming the offending field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an invalid UID length error
    pub fn invalid_uid_length(object: impl Into<String>, length: usize) -> Self {
        Self::InvalidUidLength {
            object: object.into(),
            length,
        }
    }

    /// Create an invalid cache key error
    pub fn invalid_cache_key(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidCacheKey {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a credential error for an auth method
    pub fn credential(method: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Credential {
            method: method.into(),
            message: msg.into(),
        }
    }

    /// Create a Vault error from a response
    pub fn vault(status: Option<u16>, msg: impl Into<String>) -> Self {
        Self::Vault {
            status,
            message: msg.into(),
        }
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>, timeout: bool) -> Self {
        Self::Transport {
            message: msg.into(),
            timeout,
        }
    }

    /// Create a timeout error for an operation bounded by `after`
    pub fn timeout(operation: impl Into<String>, what: &str, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            message: format!("{what} timed out after {after:?}"),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Configuration errors (including credential material that is missing
    /// or empty) and consistency errors need an object change and are never
    /// retryable. Remote failures and timeouts may succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::NotFound { .. } => true,
            Error::Validation { .. } => false,
            Error::InvalidUidLength { .. } => false,
            Error::DuplicateUid => false,
            Error::KeyLengthExceeded { .. } => false,
            Error::InvalidCacheKey { .. } => false,
            Error::Credential { .. } => false,
            Error::Vault { status, .. } => !matches!(status, Some(s) if (400..500).contains(s)),
            Error::Transport { .. } => true,
            Error::Timeout { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Check if this error represents an exceeded deadline
    pub fn is_deadline_exceeded(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Transport { timeout, .. } => *timeout,
            _ => false,
        }
    }

    /// Check if this error is a Kubernetes or object lookup 404
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_names_field() {
        let err = Error::validation_for_field("spec.storageEncryption", "not configured");
        assert_eq!(
            err.to_string(),
            "validation error for spec.storageEncryption: not configured"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn validation_error_without_field() {
        let err = Error::validation("bad input");
        assert_eq!(err.to_string(), "validation error: bad input");
    }

    #[test]
    fn timeout_error_message_and_kind() {
        let err = Error::timeout(
            "failed to setup encryption client",
            "setup",
            Duration::from_secs(1),
        );
        assert!(err.is_deadline_exceeded());
        assert!(err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("failed to setup encryption client"), "{msg}");
        assert!(msg.contains("setup timed out after 1s"), "{msg}");
    }

    #[test]
    fn transport_timeout_is_deadline_exceeded() {
        assert!(Error::transport("operation timed out", true).is_deadline_exceeded());
        assert!(!Error::transport("connection refused", false).is_deadline_exceeded());
    }

    #[test]
    fn consistency_errors_are_not_retryable() {
        assert!(!Error::DuplicateUid.is_retryable());
        assert!(!Error::KeyLengthExceeded { length: 70 }.is_retryable());
        assert!(!Error::invalid_uid_length("auth", 3).is_retryable());
        assert!(!Error::invalid_cache_key("foo", "no match").is_retryable());
    }

    #[test]
    fn credential_errors_are_not_retryable() {
        let err = Error::credential("appRole", "secret tenant-a/s has no value for key \"id\"");
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "credential error [appRole]: secret tenant-a/s has no value for key \"id\""
        );
    }

    #[test]
    fn vault_errors_retry_only_on_server_side_status() {
        assert!(!Error::vault(Some(403), "permission denied").is_retryable());
        assert!(Error::vault(Some(503), "sealed").is_retryable());
        assert!(Error::vault(None, "unknown").is_retryable());
        assert_eq!(
            Error::vault(Some(400), "invalid role").to_string(),
            "vault error (HTTP 400): invalid role"
        );
    }

    #[test]
    fn not_found_display_and_detection() {
        let err = Error::not_found("Secret", "default", "approle");
        assert_eq!(err.to_string(), "Secret default/approle not found");
        assert!(err.is_not_found());
        assert!(!Error::DuplicateUid.is_not_found());
    }

    #[test]
    fn invalid_uid_length_names_object() {
        let err = Error::invalid_uid_length("connection", 12);
        assert_eq!(
            err.to_string(),
            "invalid UID length for connection: expected 36 characters, got 12"
        );
    }
}
