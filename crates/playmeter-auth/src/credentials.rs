//! Device credentials
//!
//! An account is issued an access key (`pk_` + 24 alphanumerics) and a secret
//! (`sk_` + 40 alphanumerics). Only the SHA-256 digest of the secret is
//! stored; devices sign with that same digest, so the plaintext secret never
//! has to be kept server-side. The digest is still a signing credential: a
//! leaked digest lets its holder sign requests for the account.

use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

pub const ACCESS_KEY_PREFIX: &str = "pk_";
pub const SECRET_PREFIX: &str = "sk_";
pub const ACCESS_KEY_RANDOM_LEN: usize = 24;
pub const SECRET_RANDOM_LEN: usize = 40;

fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn generate_access_key() -> String {
    format!("{}{}", ACCESS_KEY_PREFIX, random_alphanumeric(ACCESS_KEY_RANDOM_LEN))
}

pub fn generate_secret() -> String {
    format!("{}{}", SECRET_PREFIX, random_alphanumeric(SECRET_RANDOM_LEN))
}

/// Hex SHA-256 of a secret; stored at rest and used as the HMAC key
pub fn secret_digest(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Cheap shape check before touching the store
pub fn is_well_formed_access_key(access_key: &str) -> bool {
    access_key
        .strip_prefix(ACCESS_KEY_PREFIX)
        .is_some_and(|rest| {
            rest.len() == ACCESS_KEY_RANDOM_LEN && rest.chars().all(|c| c.is_ascii_alphanumeric())
        })
}

/// Freshly issued credential pair
///
/// `secret` is shown to the operator once and then dropped.
#[derive(Clone)]
pub struct IssuedCredential {
    pub access_key: String,
    pub secret: String,
    pub secret_digest: String,
}

impl IssuedCredential {
    pub fn generate() -> Self {
        let secret = generate_secret();
        Self {
            access_key: generate_access_key(),
            secret_digest: secret_digest(&secret),
            secret,
        }
    }
}

impl std::fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCredential")
            .field("access_key", &self.access_key)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}
