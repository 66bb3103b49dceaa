//! Request signatures
//!
//! Devices sign the canonical form
//!
//! ```text
//! METHOD\nPATH\nTIMESTAMP\nNONCE\nhex(sha256(body))
//! ```
//!
//! with HMAC-SHA256 keyed by the secret digest and send the hex MAC in the
//! `X-Signature` header. Verification recomputes the MAC and compares in
//! constant time.
//!
//! `PATH` is the request path exactly as the device sent it, without the
//! query string. The server signs over the path before any trailing-slash
//! normalization (see [`crate::middleware::RawPath`]).
//!
//! The HMAC key is the same digest that is stored at rest. Anyone holding a
//! stored digest can sign as that account, so the credential column must be
//! protected like the secrets themselves.

use hmac::{Hmac, Mac};
use playmeter_core::error::AppError;
use sha2::{Digest, Sha256};
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// The signed parts of a device request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub timestamp: i64,
    pub nonce: &'a str,
    pub body: &'a [u8],
}

impl CanonicalRequest<'_> {
    pub fn string_to_sign(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}",
            self.method.to_ascii_uppercase(),
            self.path,
            self.timestamp,
            self.nonce,
            hex::encode(Sha256::digest(self.body))
        )
    }
}

fn mac_for(signing_key: &str, request: &CanonicalRequest<'_>) -> Result<HmacSha256, AppError> {
    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes())
        .map_err(|e| AppError::Internal(format!("Invalid signing key: {}", e)))?;
    mac.update(request.string_to_sign().as_bytes());
    Ok(mac)
}

/// Hex MAC of a canonical request, as a device computes it
pub fn sign(signing_key: &str, request: &CanonicalRequest<'_>) -> Result<String, AppError> {
    Ok(hex::encode(mac_for(signing_key, request)?.finalize().into_bytes()))
}

/// Check a presented hex signature against the recomputed MAC
///
/// # Errors
///
/// Returns `AppError::SignatureInvalid` when the signature is not hex or does
/// not match.
pub fn verify(
    signing_key: &str,
    request: &CanonicalRequest<'_>,
    presented: &str,
) -> Result<(), AppError> {
    let presented = hex::decode(presented.trim()).map_err(|_| {
        debug!("Signature is not valid hex");
        AppError::SignatureInvalid
    })?;

    mac_for(signing_key, request)?
        .verify_slice(&presented)
        .map_err(|_| AppError::SignatureInvalid)
}

/// Check a shared secret (settlement callbacks) in constant time
///
/// Both values are MACed under a fixed label and the tags compared, so the
/// comparison does not leak the length of a common prefix.
pub fn verify_shared_secret(expected: &str, presented: &str) -> Result<(), AppError> {
    if expected.is_empty() {
        return Err(AppError::Unauthorized("Shared secret not configured".to_string()));
    }

    let tag = |key: &str| -> Result<HmacSha256, AppError> {
        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| AppError::Internal(format!("Invalid shared secret: {}", e)))?;
        mac.update(b"playmeter-shared-secret");
        Ok(mac)
    };

    let expected_tag = tag(expected)?.finalize().into_bytes();
    tag(presented)?
        .verify_slice(&expected_tag)
        .map_err(|_| AppError::Unauthorized("Invalid shared secret".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::secret_digest;

    fn request(body: &[u8]) -> CanonicalRequest<'_> {
        CanonicalRequest {
            method: "post",
            path: "/api/v1/authorize",
            timestamp: 1_760_000_000,
            nonce: "n-001",
            body,
        }
    }

    #[test]
    fn test_string_to_sign_layout() {
        let canonical = request(b"").string_to_sign();
        let lines: Vec<&str> = canonical.split('\n').collect();
        assert_eq!(lines[0], "POST");
        assert_eq!(lines[1], "/api/v1/authorize");
        assert_eq!(lines[2], "1760000000");
        assert_eq!(lines[3], "n-001");
        // SHA-256 of the empty body
        assert_eq!(
            lines[4],
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_sign_and_verify() {
        let key = secret_digest("sk_test");
        let body = br#"{"catalog_item_code":"ZOMBIE_RUSH","venue_id":"venue_1","party_size":5}"#;
        let signature = sign(&key, &request(body)).unwrap();

        assert_eq!(signature.len(), 64);
        assert!(verify(&key, &request(body), &signature).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let key = secret_digest("sk_test");
        let signature = sign(&key, &request(br#"{"party_size":1}"#)).unwrap();

        assert_eq!(
            verify(&key, &request(br#"{"party_size":9}"#), &signature),
            Err(AppError::SignatureInvalid)
        );
    }

    #[test]
    fn test_tampered_envelope_rejected() {
        let key = secret_digest("sk_test");
        let signature = sign(&key, &request(b"{}")).unwrap();

        let mut other = request(b"{}");
        other.nonce = "n-002";
        assert_eq!(verify(&key, &other, &signature), Err(AppError::SignatureInvalid));

        let mut other = request(b"{}");
        other.timestamp += 1;
        assert_eq!(verify(&key, &other, &signature), Err(AppError::SignatureInvalid));
    }

    #[test]
    fn test_wrong_key_and_garbage_rejected() {
        let signature = sign(&secret_digest("sk_a"), &request(b"{}")).unwrap();
        assert_eq!(
            verify(&secret_digest("sk_b"), &request(b"{}"), &signature),
            Err(AppError::SignatureInvalid)
        );
        assert_eq!(
            verify(&secret_digest("sk_a"), &request(b"{}"), "zz-not-hex"),
            Err(AppError::SignatureInvalid)
        );
        assert_eq!(
            verify(&secret_digest("sk_a"), &request(b"{}"), ""),
            Err(AppError::SignatureInvalid)
        );
    }

    #[test]
    fn test_stored_digest_is_the_signing_key() {
        // What the credential store holds is enough to produce a valid MAC
        let issued = crate::credentials::IssuedCredential::generate();
        let signature = sign(&issued.secret_digest, &request(b"{}")).unwrap();
        assert!(verify(&secret_digest(&issued.secret), &request(b"{}"), &signature).is_ok());

        // the plaintext secret itself is not the key
        assert_eq!(
            verify(&issued.secret, &request(b"{}"), &signature),
            Err(AppError::SignatureInvalid)
        );
    }

    #[test]
    fn test_path_is_signed_verbatim() {
        let key = secret_digest("sk_test");
        let signature = sign(&key, &request(b"{}")).unwrap();

        let mut slashed = request(b"{}");
        slashed.path = "/api/v1/authorize/";
        assert_eq!(verify(&key, &slashed, &signature), Err(AppError::SignatureInvalid));
    }

    #[test]
    fn test_shared_secret() {
        assert!(verify_shared_secret("whsec_1", "whsec_1").is_ok());
        assert!(matches!(
            verify_shared_secret("whsec_1", "whsec_2"),
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            verify_shared_secret("", ""),
            Err(AppError::Unauthorized(_))
        ));
    }
}
