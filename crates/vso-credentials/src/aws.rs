//! AWS IAM auth: a SigV4-signed `sts:GetCallerIdentity` request
//!
//! Vault replays the signed request against STS to learn the caller's ARN.
//! No Kubernetes object backs the identity, so the provider UID is a random
//! UUID generated when the provider is created.

use std::collections::BTreeMap;

use aws_lc_rs::digest::{digest, SHA256};
use aws_lc_rs::hmac;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use url::Url;
use vso_common::crd::VaultAuthConfigAws;
use vso_common::kube_utils::secret_string_data;
use vso_common::{Error, ObjectFetcher, Result};
use zeroize::Zeroizing;

use crate::provider::{merge_params, LoginPayload};

/// Region used for signing when the VaultAuth does not set one
pub const DEFAULT_AWS_REGION: &str = "us-east-1";

/// Global STS endpoint
pub const DEFAULT_STS_ENDPOINT: &str = "https://sts.amazonaws.com";

const STS_SERVICE: &str = "sts";
const GET_CALLER_IDENTITY_BODY: &str = "Action=GetCallerIdentity&Version=2011-06-15";
const CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";
const SERVER_ID_HEADER: &str = "x-vault-aws-iam-server-id";

/// Static AWS credentials used to sign the login request
#[derive(Clone)]
pub struct AwsCredentials {
    /// AWS access key ID
    pub access_key_id: String,
    /// AWS secret access key
    pub secret_access_key: Zeroizing<String>,
    /// Optional session token for temporary credentials
    pub session_token: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl AwsCredentials {
    /// Load credentials from environment variables
    pub fn from_env() -> Option<Self> {
        Some(Self {
            access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok()?,
            secret_access_key: Zeroizing::new(std::env::var("AWS_SECRET_ACCESS_KEY").ok()?),
            session_token: std::env::var("AWS_SESSION_TOKEN").ok().map(Zeroizing::new),
        })
    }

    /// Load credentials from a Secret's decoded data
    pub fn from_secret(data: &BTreeMap<String, String>) -> Option<Self> {
        Some(Self {
            access_key_id: data.get("access_key_id").filter(|v| !v.is_empty())?.clone(),
            secret_access_key: Zeroizing::new(
                data.get("secret_access_key").filter(|v| !v.is_empty())?.clone(),
            ),
            session_token: data
                .get("session_token")
                .filter(|v| !v.is_empty())
                .cloned()
                .map(Zeroizing::new),
        })
    }
}

/// Logs in with a signed `sts:GetCallerIdentity` request
#[derive(Debug, Clone)]
pub struct AwsProvider {
    config: VaultAuthConfigAws,
    namespace: String,
    uid: String,
    params: BTreeMap<String, String>,
}

impl AwsProvider {
    pub(crate) fn init(
        config: VaultAuthConfigAws,
        namespace: &str,
        params: BTreeMap<String, String>,
    ) -> Self {
        Self {
            config,
            namespace: namespace.to_string(),
            uid: uuid::Uuid::new_v4().to_string(),
            params,
        }
    }

    /// Random UID fixed for the lifetime of this provider
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Namespace credentials secrets are read from
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Load AWS credentials and sign a fresh identity request
    pub async fn credentials(&self, fetcher: &dyn ObjectFetcher) -> Result<LoginPayload> {
        let creds = match self.config.secret_ref.as_deref().filter(|s| !s.is_empty()) {
            Some(name) => {
                let secret = fetcher.get_secret(&self.namespace, name).await?;
                AwsCredentials::from_secret(&secret_string_data(&secret)).ok_or_else(|| {
                    Error::credential(
                        "aws",
                        format!(
                            "secret {}/{name} must contain access_key_id and secret_access_key",
                            self.namespace
                        ),
                    )
                })?
            }
            None => AwsCredentials::from_env().ok_or_else(|| {
                Error::credential(
                    "aws",
                    "no spec.aws.secretRef and AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY are not set",
                )
            })?,
        };
        self.login_payload(&creds, Utc::now())
    }

    fn login_payload(&self, creds: &AwsCredentials, now: DateTime<Utc>) -> Result<LoginPayload> {
        let region = self
            .config
            .region
            .as_deref()
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_AWS_REGION);
        let endpoint = self
            .config
            .sts_endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
            .unwrap_or(DEFAULT_STS_ENDPOINT);

        let request = sign_get_caller_identity(
            creds,
            region,
            endpoint,
            self.config.header_value.as_deref(),
            now,
        )?;
        debug!(%region, %endpoint, "Signed sts:GetCallerIdentity request");

        let headers: serde_json::Map<String, Value> = request
            .headers
            .iter()
            .map(|(k, v)| (canonical_header_name(k), Value::Array(vec![Value::String(v.clone())])))
            .collect();

        let mut payload = LoginPayload::new();
        payload.insert("role".to_string(), Value::String(self.config.role.clone()));
        payload.insert("iam_http_request_method".to_string(), Value::String("POST".to_string()));
        payload.insert(
            "iam_request_url".to_string(),
            Value::String(STANDARD.encode(request.url.as_bytes())),
        );
        payload.insert(
            "iam_request_body".to_string(),
            Value::String(STANDARD.encode(GET_CALLER_IDENTITY_BODY)),
        );
        payload.insert(
            "iam_request_headers".to_string(),
            Value::String(STANDARD.encode(serde_json::to_vec(&headers)?)),
        );
        merge_params(&mut payload, &self.params);
        Ok(payload)
    }
}

/// A signed request, with headers keyed by lowercase name
#[derive(Debug)]
struct SignedRequest {
    url: String,
    headers: BTreeMap<String, String>,
}

fn sign_get_caller_identity(
    creds: &AwsCredentials,
    region: &str,
    endpoint: &str,
    server_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<SignedRequest> {
    let url = Url::parse(endpoint)
        .map_err(|e| Error::validation_for_field("spec.aws.stsEndpoint", e.to_string()))?;
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => {
            return Err(Error::validation_for_field(
                "spec.aws.stsEndpoint",
                format!("{endpoint} has no host"),
            ))
        }
    };

    let date = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), CONTENT_TYPE.to_string());
    headers.insert("host".to_string(), host);
    headers.insert("x-amz-date".to_string(), amz_date.clone());
    if let Some(token) = &creds.session_token {
        headers.insert("x-amz-security-token".to_string(), token.as_str().to_string());
    }
    if let Some(id) = server_id.filter(|s| !s.is_empty()) {
        headers.insert(SERVER_ID_HEADER.to_string(), id.to_string());
    }

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{k}:{}\n", v.trim()))
        .collect();
    let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "POST\n{}\n\n{}\n{}\n{}",
        url.path(),
        canonical_headers,
        signed_headers,
        hex_sha256(GET_CALLER_IDENTITY_BODY.as_bytes())
    );

    let scope = format!("{date}/{region}/{STS_SERVICE}/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        hex_sha256(canonical_request.as_bytes())
    );

    let signature = signature(&creds.secret_access_key, &date, region, &string_to_sign);
    headers.insert(
        "authorization".to_string(),
        format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            creds.access_key_id
        ),
    );

    Ok(SignedRequest {
        url: url.to_string(),
        headers,
    })
}

fn signature(secret_key: &str, date: &str, region: &str, string_to_sign: &str) -> String {
    let k_secret = Zeroizing::new(format!("AWS4{secret_key}"));
    let k_date = hmac_sha256(k_secret.as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, STS_SERVICE.as_bytes());
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    hex(&hmac_sha256(&k_signing, string_to_sign.as_bytes()))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&key, data).as_ref().to_vec()
}

fn hex_sha256(data: &[u8]) -> String {
    hex(digest(&SHA256, data).as_ref())
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

/// `x-vault-aws-iam-server-id` -> `X-Vault-Aws-Iam-Server-Id`
fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
