//! Request authenticator
//!
//! Resolves the access key to a device credential (cache-backed) and checks
//! the request signature against the stored secret digest.

use std::sync::Arc;

use chrono::Duration;
use playmeter_auth::credentials::is_well_formed_access_key;
use playmeter_auth::signature::{self, CanonicalRequest};
use playmeter_auth::DeviceHeaders;
use playmeter_cache::TtlCache;
use playmeter_core::{
    models::DeviceCredential, traits::AccountRepository, AppError, AppResult, Clock,
};
use tracing::{debug, instrument, warn};

pub struct RequestAuthenticator {
    accounts: Arc<dyn AccountRepository>,
    credentials: TtlCache<String, DeviceCredential>,
    clock: Arc<dyn Clock>,
}

impl RequestAuthenticator {
    pub fn new(accounts: Arc<dyn AccountRepository>, cache_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            accounts,
            credentials: TtlCache::new(cache_ttl),
            clock,
        }
    }

    async fn credential(&self, access_key: &str) -> AppResult<DeviceCredential> {
        if !is_well_formed_access_key(access_key) {
            return Err(AppError::UnknownCredential(access_key.to_string()));
        }

        let now = self.clock.now();
        let key = access_key.to_string();
        if let Some(credential) = self.credentials.get(&key, now) {
            debug!("Credential cache HIT for {}", access_key);
            return Ok(credential);
        }

        let account = self
            .accounts
            .find_by_access_key(access_key)
            .await?
            .filter(|account| account.active)
            .ok_or_else(|| AppError::UnknownCredential(access_key.to_string()))?;

        let credential = DeviceCredential::from(&account);
        self.credentials.insert(key, credential.clone(), now);
        Ok(credential)
    }

    /// Verify the signature of a device request
    ///
    /// # Errors
    ///
    /// - `AppError::UnknownCredential` if the access key is not recognized
    /// - `AppError::SignatureInvalid` if the signature does not match
    #[instrument(skip(self, headers, body), fields(access_key = %headers.access_key))]
    pub async fn authenticate(
        &self,
        headers: &DeviceHeaders,
        body: &[u8],
    ) -> AppResult<DeviceCredential> {
        let credential = self.credential(&headers.access_key).await?;

        let request = CanonicalRequest {
            method: &headers.method,
            path: &headers.path,
            timestamp: headers.timestamp,
            nonce: &headers.nonce,
            body,
        };
        if let Err(e) = signature::verify(&credential.secret_digest, &request, &headers.signature) {
            warn!(account_id = credential.account_id, "Signature mismatch");
            return Err(e);
        }

        Ok(credential)
    }

    /// Forget a cached credential (deactivation, rotation)
    pub fn invalidate(&self, access_key: &str) {
        self.credentials.invalidate(&access_key.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{signed_headers, Fixture};
    use playmeter_core::traits::AccountRepository;

    #[tokio::test]
    async fn test_valid_signature() {
        let fx = Fixture::new().await;
        let body = br#"{"party_size":2}"#;
        let headers = signed_headers(&fx.credential, "POST", "/api/v1/authorize", fx.clock.now(), "n-1", body);

        let credential = fx.authenticator().authenticate(&headers, body).await.unwrap();
        assert_eq!(credential.account_id, fx.account.id);
    }

    #[tokio::test]
    async fn test_tampered_body() {
        let fx = Fixture::new().await;
        let headers = signed_headers(&fx.credential, "POST", "/api/v1/authorize", fx.clock.now(), "n-1", b"{}");

        let err = fx
            .authenticator()
            .authenticate(&headers, br#"{"party_size":8}"#)
            .await
            .unwrap_err();
        assert_eq!(err, AppError::SignatureInvalid);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_keys() {
        let fx = Fixture::new().await;
        let mut headers = signed_headers(&fx.credential, "POST", "/x", fx.clock.now(), "n-1", b"{}");

        headers.access_key = "pk_000000000000000000000000".to_string();
        assert!(matches!(
            fx.authenticator().authenticate(&headers, b"{}").await,
            Err(AppError::UnknownCredential(_))
        ));

        headers.access_key = "not-a-key".to_string();
        assert!(matches!(
            fx.authenticator().authenticate(&headers, b"{}").await,
            Err(AppError::UnknownCredential(_))
        ));
    }

    #[tokio::test]
    async fn test_deactivated_account_stops_authenticating() {
        let fx = Fixture::new().await;
        let authenticator = fx.authenticator();
        let headers = signed_headers(&fx.credential, "POST", "/x", fx.clock.now(), "n-1", b"{}");
        assert!(authenticator.authenticate(&headers, b"{}").await.is_ok());

        AccountRepository::deactivate(fx.store.as_ref(), fx.account.id, fx.clock.now())
            .await
            .unwrap();
        authenticator.invalidate(&fx.credential.access_key);

        assert!(matches!(
            authenticator.authenticate(&headers, b"{}").await,
            Err(AppError::UnknownCredential(_))
        ));
    }
}
