//! Common types for the Vault secrets operator: CRDs, errors, cluster access
//! and telemetry.

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod metrics;
pub mod telemetry;

pub use error::Error;
pub use kube_utils::{KubeObjectFetcher, ObjectFetcher};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default namespace the operator runs in
pub const DEFAULT_OPERATOR_NAMESPACE: &str = "vault-secrets-operator-system";

/// Name of the VaultConnection used when a VaultAuth does not reference one
pub const DEFAULT_VAULT_CONNECTION_NAME: &str = "default";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "vso-client-factory";

/// Label key for resources managed by the operator
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label value for resources managed by the operator
pub const LABEL_MANAGED_BY_VSO: &str = "vault-secrets-operator";

/// Label key for resources belonging to a specific operator component
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";

/// Length of a Kubernetes object UID (UUID string form)
pub const UID_LENGTH: usize = 36;
