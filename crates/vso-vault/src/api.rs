//! Minimal Vault HTTP API client
//!
//! Only the endpoints the client factory needs: auth method login, token
//! self-management, and generic logical reads and writes (used for transit
//! encryption).

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};
use url::Url;
use vso_common::crd::{VaultAuth, VaultConnection};
use vso_common::kube_utils::secret_string_data;
use vso_common::{Error, ObjectFetcher, Result};
use vso_credentials::LoginPayload;

/// Header carrying the Vault token
pub const TOKEN_HEADER: &str = "X-Vault-Token";

/// Header selecting a Vault enterprise namespace
pub const NAMESPACE_HEADER: &str = "X-Vault-Namespace";

/// Secret key holding the Vault CA bundle
pub const CA_CERT_KEY: &str = "ca.crt";

/// Response envelope shared by most Vault endpoints
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct VaultSecret {
    /// Request ID assigned by Vault
    #[serde(default)]
    pub request_id: String,
    /// Lease ID for dynamic secrets
    #[serde(default)]
    pub lease_id: String,
    /// Lease duration in seconds
    #[serde(default)]
    pub lease_duration: u64,
    /// Whether the lease can be renewed
    #[serde(default)]
    pub renewable: bool,
    /// Secret data
    #[serde(default)]
    pub data: Option<serde_json::Map<String, Value>>,
    /// Auth block, present on login and token renewal
    #[serde(default)]
    pub auth: Option<SecretAuth>,
    /// Warnings reported alongside the response
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
}

/// Token information returned on login and renewal
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SecretAuth {
    /// The issued token
    pub client_token: String,
    /// Token accessor
    #[serde(default)]
    pub accessor: String,
    /// Attached policies
    #[serde(default)]
    pub policies: Vec<String>,
    /// Token TTL in seconds
    #[serde(default)]
    pub lease_duration: u64,
    /// Whether the token can be renewed
    #[serde(default)]
    pub renewable: bool,
}

/// Subset of `auth/token/lookup-self` data
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TokenLookup {
    /// Token accessor
    #[serde(default)]
    pub accessor: String,
    /// Remaining TTL in seconds
    #[serde(default)]
    pub ttl: u64,
    /// Whether the token can be renewed
    #[serde(default)]
    pub renewable: bool,
    /// Attached policies
    #[serde(default)]
    pub policies: Vec<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<String>,
}

/// Options for building a [`VaultHttpClient`]
#[derive(Clone, Debug, Default)]
pub struct VaultHttpOptions {
    /// Vault enterprise namespace
    pub namespace: Option<String>,
    /// Extra headers sent with every request
    pub headers: BTreeMap<String, String>,
    /// PEM CA bundle to trust
    pub ca_cert_pem: Option<String>,
    /// Disable TLS verification
    pub skip_tls_verify: bool,
    /// Per-request timeout
    pub timeout: Option<Duration>,
}

/// HTTP client bound to one Vault server
#[derive(Clone, Debug)]
pub struct VaultHttpClient {
    http: reqwest::Client,
    address: Url,
    namespace: Option<String>,
    headers: HeaderMap,
}

impl VaultHttpClient {
    /// Create a client for the Vault server at `address`
    pub fn new(address: &str, options: VaultHttpOptions) -> Result<Self> {
        let mut address = Url::parse(address)
            .map_err(|e| Error::validation_for_field("spec.address", e.to_string()))?;
        if !address.path().ends_with('/') {
            let path = format!("{}/", address.path());
            address.set_path(&path);
        }

        let mut builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(options.skip_tls_verify)
            .timeout(options.timeout.unwrap_or(vso_common::crd::DEFAULT_REQUEST_TIMEOUT));
        if let Some(pem) = &options.ca_cert_pem {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes()).map_err(|e| {
                Error::validation_for_field(
                    "spec.caCertSecretRef",
                    format!("invalid CA certificate: {e}"),
                )
            })?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder.build().map_err(|e| {
            Error::internal_with_context("vault-http", format!("failed to build HTTP client: {e}"))
        })?;

        let mut headers = HeaderMap::new();
        headers.insert("X-Vault-Request", HeaderValue::from_static("true"));
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::validation_for_field("spec.headers", format!("{name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::validation_for_field("spec.headers", e.to_string()))?;
            headers.insert(name, value);
        }

        Ok(Self {
            http,
            address,
            namespace: options.namespace.filter(|ns| !ns.is_empty()),
            headers,
        })
    }

    /// Build a client from a VaultConnection, applying the VaultAuth's
    /// namespace and headers on top of the connection's
    pub async fn from_connection(
        fetcher: &dyn ObjectFetcher,
        connection: &VaultConnection,
        auth: &VaultAuth,
    ) -> Result<Self> {
        let conn_ns = connection.metadata.namespace.clone().unwrap_or_default();
        let ca_cert_pem = match connection.spec.ca_cert_secret_ref.as_deref() {
            Some(name) if !name.is_empty() => {
                let secret = fetcher.get_secret(&conn_ns, name).await?;
                let pem = secret_string_data(&secret).remove(CA_CERT_KEY).ok_or_else(|| {
                    Error::validation_for_field(
                        "spec.caCertSecretRef",
                        format!("secret {conn_ns}/{name} has no {CA_CERT_KEY} key"),
                    )
                })?;
                Some(pem)
            }
            _ => None,
        };

        let mut headers = connection.spec.headers.clone().unwrap_or_default();
        headers.extend(auth.spec.headers.clone().unwrap_or_default());

        Self::new(
            &connection.spec.address,
            VaultHttpOptions {
                namespace: auth.spec.namespace.clone(),
                headers,
                ca_cert_pem,
                skip_tls_verify: connection.spec.skip_tls_verify,
                timeout: Some(connection.spec.request_timeout()?),
            },
        )
    }

    /// Vault server address
    pub fn address(&self) -> &Url {
        &self.address
    }

    /// Log in against `auth/<mount>/login`
    pub async fn login(&self, mount: &str, payload: &LoginPayload) -> Result<SecretAuth> {
        let path = format!("auth/{}/login", mount.trim_matches('/'));
        let body = Value::Object(payload.clone());
        let secret = self
            .request(Method::POST, &path, None, Some(&body))
            .await?
            .ok_or_else(|| Error::vault(None, format!("empty response from {path}")))?;
        secret
            .auth
            .ok_or_else(|| Error::vault(None, format!("response from {path} has no auth block")))
    }

    /// Renew the calling token
    pub async fn renew_self(&self, token: &str) -> Result<SecretAuth> {
        let secret = self
            .request(
                Method::POST,
                "auth/token/renew-self",
                Some(token),
                Some(&serde_json::json!({})),
            )
            .await?
            .ok_or_else(|| Error::vault(None, "empty response from renew-self"))?;
        secret
            .auth
            .ok_or_else(|| Error::vault(None, "renew-self response has no auth block"))
    }

    /// Look up the calling token
    pub async fn lookup_self(&self, token: &str) -> Result<TokenLookup> {
        let secret = self
            .request(Method::GET, "auth/token/lookup-self", Some(token), None)
            .await?
            .ok_or_else(|| Error::vault(None, "empty response from lookup-self"))?;
        let data = secret.data.unwrap_or_default();
        Ok(serde_json::from_value(Value::Object(data))?)
    }

    /// Revoke the calling token
    pub async fn revoke_self(&self, token: &str) -> Result<()> {
        self.request(Method::POST, "auth/token/revoke-self", Some(token), None)
            .await
            .map(|_| ())
    }

    /// Read a logical path. Returns `None` on 404.
    pub async fn read(&self, token: &str, path: &str) -> Result<Option<VaultSecret>> {
        self.request(Method::GET, path, Some(token), None).await
    }

    /// Write to a logical path
    pub async fn write(
        &self,
        token: &str,
        path: &str,
        body: &Value,
    ) -> Result<Option<VaultSecret>> {
        self.request(Method::POST, path, Some(token), Some(body)).await
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<&Value>,
    ) -> Result<Option<VaultSecret>> {
        let url = self
            .address
            .join(&format!("v1/{}", path.trim_start_matches('/')))
            .map_err(|e| Error::validation(format!("invalid Vault path {path:?}: {e}")))?;
        trace!(%method, %url, "Vault request");

        let mut req = self.http.request(method.clone(), url).headers(self.headers.clone());
        if let Some(token) = token {
            req = req.header(TOKEN_HEADER, token);
        }
        if let Some(ns) = &self.namespace {
            req = req.header(NAMESPACE_HEADER, ns);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req
            .send()
            .await
            .map_err(|e| Error::transport(e.to_string(), e.is_timeout()))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::transport(e.to_string(), e.is_timeout()))?;

        if status.is_success() {
            if status == StatusCode::NO_CONTENT || bytes.is_empty() {
                return Ok(None);
            }
            return Ok(Some(serde_json::from_slice(&bytes)?));
        }

        let errors = serde_json::from_slice::<ErrorResponse>(&bytes)
            .map(|r| r.errors)
            .unwrap_or_default();
        if status == StatusCode::NOT_FOUND && errors.is_empty() && method == Method::GET {
            return Ok(None);
        }
        let message = if errors.is_empty() {
            String::from_utf8_lossy(&bytes).trim().to_string()
        } else {
            errors.join("; ")
        };
        debug!(%path, status = status.as_u16(), error = %message, "Vault request failed");
        Err(Error::vault(Some(status.as_u16()), message))
    }
}
