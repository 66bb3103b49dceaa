//! Counter key builders for Playmeter
//!
//! Provides standardized key naming patterns for every expiring counter,
//! ensuring the replay guard, rate limiter and anomaly detector never collide.
//!
//! # Key Patterns
//!
//! - `nonce:{access_key}:{nonce}` - Single-use request nonce
//! - `rate:account:{account_id}` - Admitted requests of an account
//! - `rate:address:{address}` - Admitted requests from a source address
//! - `failures:account:{account_id}` - Failed requests of an account
//! - `failures:address:{address}` - Failed requests from an address without a known account
//! - `identities:{address}` - Distinct credentials presented from an address
//!
//! # Example
//!
//! ```
//! use playmeter_cache::keys;
//!
//! assert_eq!(keys::nonce_key("pk_abc", "n-1"), "nonce:pk_abc:n-1");
//! assert_eq!(keys::account_rate_key(42), "rate:account:42");
//! ```

/// Prefix for single-use nonces
pub const NONCE_PREFIX: &str = "nonce";

/// Prefix for sliding-window rate counters
pub const RATE_PREFIX: &str = "rate";

/// Prefix for failure counters
pub const FAILURE_PREFIX: &str = "failures";

/// Prefix for the distinct-credential sets
pub const IDENTITY_PREFIX: &str = "identities";

/// Namespace applied to every key stored in Redis
pub const REDIS_NAMESPACE: &str = "playmeter";

/// Build the nonce marker key for a credential
pub fn nonce_key(access_key: &str, nonce: &str) -> String {
    format!("{}:{}:{}", NONCE_PREFIX, access_key, nonce)
}

pub fn account_rate_key(account_id: i64) -> String {
    format!("{}:account:{}", RATE_PREFIX, account_id)
}

pub fn address_rate_key(address: &str) -> String {
    format!("{}:address:{}", RATE_PREFIX, address)
}

pub fn account_failure_key(account_id: i64) -> String {
    format!("{}:account:{}", FAILURE_PREFIX, account_id)
}

pub fn address_failure_key(address: &str) -> String {
    format!("{}:address:{}", FAILURE_PREFIX, address)
}

/// Build the key of the set of credentials seen from an address
pub fn identity_set_key(address: &str) -> String {
    format!("{}:{}", IDENTITY_PREFIX, address)
}

/// Prefix a key with the Redis namespace
pub fn namespaced(key: &str) -> String {
    format!("{}:{}", REDIS_NAMESPACE, key)
}
