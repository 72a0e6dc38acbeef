//! VaultConnection CRD
//!
//! Network parameters for reaching a Vault server. Shared by any number of
//! VaultAuth objects.

use std::collections::BTreeMap;
use std::time::Duration;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Request timeout used when the connection does not set one
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// VaultConnection describes how to reach a Vault server.
///
/// Example:
/// ```yaml
/// apiVersion: secrets.hashicorp.com/v1beta1
/// kind: VaultConnection
/// metadata:
///   name: default
/// spec:
///   address: https://vault.vault.svc:8200
///   caCertSecretRef: vault-ca
///   timeout: 10s
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "secrets.hashicorp.com",
    version = "v1beta1",
    kind = "VaultConnection",
    namespaced,
    status = "VaultConnectionStatus",
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".spec.address"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VaultConnectionSpec {
    /// Vault server URL
    pub address: String,

    /// Extra headers sent with every request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,

    /// Secret holding the CA bundle under `ca.crt`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_secret_ref: Option<String>,

    /// Disable TLS certificate verification
    #[serde(default, rename = "skipTLSVerify")]
    pub skip_tls_verify: bool,

    /// Per-request timeout, e.g. "30s", "2m"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// VaultConnection status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VaultConnectionStatus {
    /// Whether the connection validated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,
}

impl VaultConnectionSpec {
    /// Request timeout, falling back to [`DEFAULT_REQUEST_TIMEOUT`]
    pub fn request_timeout(&self) -> Result<Duration> {
        match self.timeout.as_deref() {
            None | Some("") => Ok(DEFAULT_REQUEST_TIMEOUT),
            Some(s) => parse_duration(s)
                .map_err(|e| Error::validation_for_field("spec.timeout", e.to_string())),
        }
    }
}

/// Parse a human-friendly duration string.
///
/// Supports `Nh` (hours), `Nm` (minutes), `Ns` (seconds) and `Nms`
/// (milliseconds). Examples: "1h", "30m", "10s", "500ms".
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let invalid = || Error::validation(format!("invalid duration {s:?}"));

    let (digits, unit): (&str, fn(u64) -> Duration) = if let Some(n) = s.strip_suffix("ms") {
        (n, Duration::from_millis)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, |v| Duration::from_secs(v * 3600))
    } else if let Some(n) = s.strip_suffix('m') {
        (n, |v| Duration::from_secs(v * 60))
    } else if let Some(n) = s.strip_suffix('s') {
        (n, Duration::from_secs)
    } else {
        return Err(invalid());
    };

    let value: u64 = digits.parse().map_err(|_| invalid())?;
    Ok(unit(value))
}
