//! Credential providers for Vault authentication
//!
//! A [`CredentialProvider`] turns a `VaultAuth` and the namespace it is used
//! from into two things: a stable UID identifying the credential material,
//! and on demand the login payload for the configured auth method.
//!
//! Providers never cache secret contents. Every call to
//! [`CredentialProvider::credentials`] re-reads the backing objects so that
//! rotated secrets are picked up between logins.

#![deny(missing_docs)]

mod approle;
mod aws;
mod jwt;
mod kubernetes;
mod provider;

#[cfg(test)]
pub(crate) mod test_support;

pub use approle::{AppRoleProvider, APPROLE_SECRET_ID_KEY};
pub use aws::{AwsCredentials, AwsProvider, DEFAULT_AWS_REGION, DEFAULT_STS_ENDPOINT};
pub use jwt::{JwtProvider, JWT_SECRET_KEY};
pub use kubernetes::KubernetesProvider;
pub use provider::{CredentialProvider, LoginPayload};
