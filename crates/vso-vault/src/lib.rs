//! Vault client construction, caching and lease renewal
//!
//! [`CachingClientFactory`] hands out authenticated [`Client`]s keyed by
//! [`ClientCacheKey`]. Each client owns a background task that keeps its
//! token lease alive until the client leaves the cache.

#![deny(missing_docs)]

pub mod api;
pub mod cache;
pub mod cache_key;
pub mod callbacks;
pub mod client;
pub mod config;
pub mod factory;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{VaultHttpClient, VaultHttpOptions, VaultSecret};
pub use cache::{ClientCache, DEFAULT_CACHE_SIZE};
pub use cache_key::{compute_client_cache_key, CacheKeyInputs, ClientCacheKey, MAX_CACHE_KEY_LENGTH};
pub use callbacks::{ClientCallbackHandler, ClientEvent, ClientEvents};
pub use client::{Client, TokenSecret};
pub use config::{ClientFactoryConfig, DEFAULT_SETUP_TIMEOUT};
pub use factory::CachingClientFactory;
pub use storage::ClientCacheStorage;
