//! Metrics for Vault client caching
//!
//! OpenTelemetry instruments registered on the global meter. They are no-ops
//! until a meter provider is installed by [`crate::telemetry::init_telemetry`].

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

/// Global meter for operator metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("vault-secrets-operator"));

// ============================================================================
// Client Cache Metrics
// ============================================================================

/// Gauge tracking the number of cached Vault clients
pub static CLIENT_CACHE_SIZE: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("vso_client_cache_size")
        .with_description("Number of Vault clients held in the client cache")
        .with_unit("{clients}")
        .build()
});

/// Counter of client cache hits
pub static CLIENT_CACHE_HITS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vso_client_cache_hits_total")
        .with_description("Total number of client cache hits")
        .build()
});

/// Counter of client cache misses
///
/// Labels:
/// - `reason`: absent, invalid
pub static CLIENT_CACHE_MISSES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vso_client_cache_misses_total")
        .with_description("Total number of client cache misses")
        .build()
});

/// Counter of capacity-triggered evictions
pub static CLIENT_CACHE_EVICTIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vso_client_cache_evictions_total")
        .with_description("Total number of clients evicted because the cache was full")
        .build()
});

// ============================================================================
// Vault Session Metrics
// ============================================================================

/// Counter of Vault logins
///
/// Labels:
/// - `method`: kubernetes, jwt, appRole, aws
/// - `result`: success, error
pub static VAULT_LOGINS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vso_vault_logins_total")
        .with_description("Total number of Vault login requests")
        .build()
});

/// Counter of token renewals
///
/// Labels:
/// - `result`: success, error
pub static TOKEN_RENEWALS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vso_token_renewals_total")
        .with_description("Total number of Vault token renewals")
        .build()
});

/// Counter of storage encryption client setups
///
/// Labels:
/// - `result`: success, error, timeout
pub static ENCRYPTION_CLIENT_SETUPS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vso_encryption_client_setups_total")
        .with_description("Total number of storage encryption client setup attempts")
        .build()
});

// ============================================================================
// Helpers
// ============================================================================

/// Record a login attempt for an auth method
pub fn record_login(method: &str, success: bool) {
    VAULT_LOGINS.add(
        1,
        &[
            KeyValue::new("method", method.to_string()),
            KeyValue::new("result", result_label(success)),
        ],
    );
}

/// Record a token renewal attempt
pub fn record_renewal(success: bool) {
    TOKEN_RENEWALS.add(1, &[KeyValue::new("result", result_label(success))]);
}

/// Record a cache lookup outcome
pub fn record_cache_lookup(hit: bool, reason: &'static str) {
    if hit {
        CLIENT_CACHE_HITS.add(1, &[]);
    } else {
        CLIENT_CACHE_MISSES.add(1, &[KeyValue::new("reason", reason)]);
    }
}

/// Record an encryption client setup outcome (success, error, timeout)
pub fn record_encryption_setup(result: &'static str) {
    ENCRYPTION_CLIENT_SETUPS.add(1, &[KeyValue::new("result", result)]);
}

fn result_label(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "error"
    }
}
