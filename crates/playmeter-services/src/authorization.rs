//! Authorization pipeline
//!
//! Hot path for game-runner devices:
//!
//! ```text
//! authenticate → replay guard → rate limiter → anomaly detector
//!     → idempotency guard → entitlement checker → balance ledger
//! ```
//!
//! The first four steps form the [`DeviceGate`], shared with the telemetry
//! upload. Authentication and validation failures anywhere in the pipeline
//! are reported to the anomaly detector before the error is returned.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use playmeter_auth::DeviceHeaders;
use playmeter_core::{
    models::{Account, AuthorizationOutcome, BusinessKey, VenueId},
    traits::AccountRepository,
    AppError, AppResult, Clock, EnginePolicy,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::anomaly::AnomalyDetector;
use crate::authenticator::RequestAuthenticator;
use crate::entitlement::EntitlementChecker;
use crate::idempotency::IdempotencyGuard;
use crate::ledger::BalanceLedger;
use crate::policy_cache::PolicyCache;
use crate::rate_limiter::RateLimiter;
use crate::replay_guard::ReplayGuard;

/// Venue identifier as sent by devices: `"venue_42"`, `"V42"`, `"42"` or `42`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawVenueId {
    Number(i64),
    Text(String),
}

impl RawVenueId {
    pub fn normalize(&self) -> AppResult<VenueId> {
        match self {
            RawVenueId::Number(n) => VenueId::parse(&n.to_string()),
            RawVenueId::Text(s) => VenueId::parse(s),
        }
    }
}

/// Body of `POST /api/v1/authorize`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub catalog_item_code: String,
    pub venue_id: RawVenueId,
    pub party_size: i32,
}

impl AuthorizationRequest {
    pub fn from_body(body: &[u8]) -> AppResult<Self> {
        serde_json::from_slice(body)
            .map_err(|e| AppError::invalid_field("body", format!("malformed request body: {}", e)))
    }
}

/// Which request windows a device call is counted against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScope {
    /// Billing calls: per-address and per-account windows
    AddressAndAccount,
    /// Follow-up uploads: per-address window only
    AddressOnly,
}

/// An authenticated, admitted device request
#[derive(Debug, Clone)]
pub struct Admission {
    pub account: Account,
    pub policy: EnginePolicy,
    pub now: DateTime<Utc>,
}

/// Authentication, replay, rate and anomaly checks for device requests
pub struct DeviceGate {
    authenticator: Arc<RequestAuthenticator>,
    replay: ReplayGuard,
    limiter: RateLimiter,
    anomaly: Arc<AnomalyDetector>,
    accounts: Arc<dyn AccountRepository>,
    policy: Arc<PolicyCache>,
    clock: Arc<dyn Clock>,
}

impl DeviceGate {
    pub fn new(
        authenticator: Arc<RequestAuthenticator>,
        replay: ReplayGuard,
        limiter: RateLimiter,
        anomaly: Arc<AnomalyDetector>,
        accounts: Arc<dyn AccountRepository>,
        policy: Arc<PolicyCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            authenticator,
            replay,
            limiter,
            anomaly,
            accounts,
            policy,
            clock,
        }
    }

    /// Policy snapshot and time for one request
    pub async fn begin(&self) -> AppResult<(EnginePolicy, DateTime<Utc>)> {
        Ok((self.policy.current().await?, self.clock.now()))
    }

    /// Run the gate checks in order
    #[instrument(skip_all, fields(access_key = %headers.access_key, source = %headers.source_address))]
    pub async fn admit(
        &self,
        headers: &DeviceHeaders,
        body: &[u8],
        scope: RateScope,
        policy: &EnginePolicy,
        now: DateTime<Utc>,
    ) -> AppResult<Admission> {
        let credential = self.authenticator.authenticate(headers, body).await?;

        self.replay
            .check(
                &headers.access_key,
                headers.timestamp,
                &headers.nonce,
                policy,
                now,
            )
            .await?;

        // Fresh read: tier and lock state must not come from a cache
        let account = self
            .accounts
            .find_by_id(credential.account_id)
            .await?
            .filter(|account| account.active)
            .ok_or_else(|| AppError::UnknownCredential(headers.access_key.clone()))?;

        self.limiter
            .check_address(&headers.source_address, policy, now)
            .await?;
        if scope == RateScope::AddressAndAccount {
            self.limiter
                .check_account(account.id, account.tier, policy, now)
                .await?;
        }

        self.anomaly
            .screen(&account, &headers.source_address, policy, now)
            .await?;

        Ok(Admission {
            account,
            policy: policy.clone(),
            now,
        })
    }

    /// Feed a failed request to the anomaly detector if it counts as one
    pub async fn report_failure(
        &self,
        headers: &DeviceHeaders,
        error: &AppError,
        policy: &EnginePolicy,
        now: DateTime<Utc>,
    ) {
        if !error.counts_as_failure() {
            return;
        }
        if let Err(e) = self
            .anomaly
            .record_failure(
                &headers.source_address,
                Some(headers.access_key.as_str()),
                policy,
                now,
            )
            .await
        {
            warn!("Failed to record request failure: {}", e);
        }
    }
}

/// Authorization service: the full device billing pipeline
pub struct AuthorizationService {
    gate: Arc<DeviceGate>,
    idempotency: IdempotencyGuard,
    entitlements: Arc<EntitlementChecker>,
    ledger: Arc<BalanceLedger>,
}

impl AuthorizationService {
    pub fn new(
        gate: Arc<DeviceGate>,
        idempotency: IdempotencyGuard,
        entitlements: Arc<EntitlementChecker>,
        ledger: Arc<BalanceLedger>,
    ) -> Self {
        Self {
            gate,
            idempotency,
            entitlements,
            ledger,
        }
    }

    /// Authorize a signed device request
    ///
    /// A duplicate of a request committed within the idempotency window
    /// returns the original outcome with no new debit.
    pub async fn authorize(
        &self,
        headers: &DeviceHeaders,
        body: &[u8],
    ) -> AppResult<AuthorizationOutcome> {
        let (policy, now) = self.gate.begin().await?;

        let result = self.run(headers, body, &policy, now).await;
        if let Err(e) = &result {
            self.gate.report_failure(headers, e, &policy, now).await;
        }
        result
    }

    #[instrument(skip_all, fields(access_key = %headers.access_key))]
    async fn run(
        &self,
        headers: &DeviceHeaders,
        body: &[u8],
        policy: &EnginePolicy,
        now: DateTime<Utc>,
    ) -> AppResult<AuthorizationOutcome> {
        let admission = self
            .gate
            .admit(headers, body, RateScope::AddressAndAccount, policy, now)
            .await?;
        let account = &admission.account;

        let request = AuthorizationRequest::from_body(body)?;
        let venue_id = request.venue_id.normalize()?;
        let item = self
            .entitlements
            .resolve_item(&request.catalog_item_code, now)
            .await?;

        let key = BusinessKey {
            account_id: account.id,
            catalog_item_id: item.id,
            venue_id,
            party_size: request.party_size,
        };
        if let Some(outcome) = self
            .idempotency
            .lookup(&key, policy.idempotency_window(), now)
            .await?
        {
            return Ok(outcome);
        }

        self.entitlements
            .check_item(account.id, &item, request.party_size, now)
            .await?;

        let client_timestamp = DateTime::<Utc>::from_timestamp(headers.timestamp, 0).unwrap_or(now);
        let draft = BalanceLedger::draft(
            account.id,
            &item,
            venue_id,
            request.party_size,
            client_timestamp,
            now,
        );
        let outcome = self.ledger.authorize(&draft, policy).await?.into_outcome();

        info!(
            account_id = account.id,
            session_id = %outcome.session_id,
            replayed = outcome.replayed,
            "Authorized {} x{} at {}",
            item.code,
            request.party_size,
            venue_id
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{signed_headers, Fixture};
    use chrono::Duration;
    use futures::future::join_all;
    use playmeter_core::models::balance_reconciles;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn body(code: &str, venue: serde_json::Value, party: i32) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "catalog_item_code": code,
            "venue_id": venue,
            "party_size": party,
        }))
        .unwrap()
    }

    async fn call(fx: &Fixture, nonce: &str, body: &[u8]) -> AppResult<AuthorizationOutcome> {
        let headers = signed_headers(
            &fx.credential,
            "POST",
            "/api/v1/authorize",
            fx.clock.now(),
            nonce,
            body,
        );
        fx.engine().authorization.authorize(&headers, body).await
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let fx = Fixture::new().await;
        let request = body("ZOMBIE_RUSH", json!("venue_42"), 5);

        let first = call(&fx, "n-1", &request).await.unwrap();
        assert_eq!(first.total_cost, dec!(50.00));
        assert_eq!(first.remaining_balance, dec!(50.00));
        assert!(!first.replayed);

        fx.clock.advance(Duration::seconds(10));
        let second = call(&fx, "n-2", &request).await.unwrap();
        assert_eq!(second.session_id, first.session_id);
        assert_eq!(second.authorization_token, first.authorization_token);
        assert_eq!(second.remaining_balance, dec!(50.00));

        fx.clock.advance(Duration::seconds(5));
        let err = call(&fx, "n-3", &body("ZOMBIE_RUSH", json!("venue_42"), 8))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AppError::InsufficientBalance {
                required: "80.00".to_string(),
                available: "50.00".to_string()
            }
        );

        let account = fx.reload_account().await;
        assert_eq!(account.balance, dec!(50.00));
        assert!(balance_reconciles(
            account.opening_balance,
            &fx.store_entries().await,
            account.balance
        ));
    }

    #[tokio::test]
    async fn test_same_key_after_window_debits_again() {
        let fx = Fixture::new().await;
        let request = body("ZOMBIE_RUSH", json!(42), 3);

        let first = call(&fx, "n-1", &request).await.unwrap();
        fx.clock.advance(Duration::seconds(31));
        let second = call(&fx, "n-2", &request).await.unwrap();

        assert_ne!(second.session_id, first.session_id);
        assert_eq!(second.remaining_balance, dec!(40.00));
        assert_eq!(fx.store_entries().await.len(), 2);
    }

    #[tokio::test]
    async fn test_venue_forms_share_business_key() {
        let fx = Fixture::new().await;

        let first = call(&fx, "n-1", &body("ZOMBIE_RUSH", json!("venue-7"), 2))
            .await
            .unwrap();
        for (nonce, venue) in [("n-2", json!("V7")), ("n-3", json!("7")), ("n-4", json!(7))] {
            let again = call(&fx, nonce, &body("ZOMBIE_RUSH", venue, 2)).await.unwrap();
            assert_eq!(again.session_id, first.session_id);
        }

        assert!(matches!(
            call(&fx, "n-5", &body("ZOMBIE_RUSH", json!("room-7"), 2)).await,
            Err(AppError::InvalidField { ref field, .. }) if field == "venue_id"
        ));
    }

    #[tokio::test]
    async fn test_replayed_envelope_is_rejected() {
        let fx = Fixture::new().await;
        let request = body("ZOMBIE_RUSH", json!("venue_42"), 1);
        let headers = signed_headers(
            &fx.credential,
            "POST",
            "/api/v1/authorize",
            fx.clock.now(),
            "n-1",
            &request,
        );
        let engine = fx.engine();

        engine.authorization.authorize(&headers, &request).await.unwrap();
        assert_eq!(
            engine.authorization.authorize(&headers, &request).await,
            Err(AppError::NonceReused)
        );

        fx.clock.advance(Duration::minutes(6));
        assert!(matches!(
            engine.authorization.authorize(&headers, &request).await,
            Err(AppError::RequestExpired { .. })
        ));
    }

    #[tokio::test]
    async fn test_tampered_body_rejected() {
        let fx = Fixture::new().await;
        let signed = body("ZOMBIE_RUSH", json!("venue_42"), 1);
        let tampered = body("ZOMBIE_RUSH", json!("venue_42"), 8);
        let headers = signed_headers(
            &fx.credential,
            "POST",
            "/api/v1/authorize",
            fx.clock.now(),
            "n-1",
            &signed,
        );

        assert_eq!(
            fx.engine().authorization.authorize(&headers, &tampered).await,
            Err(AppError::SignatureInvalid)
        );
        assert_eq!(fx.reload_account().await.balance, dec!(100.00));
    }

    #[tokio::test]
    async fn test_eleventh_request_is_rate_limited() {
        let fx = Fixture::with_balance(dec!(1000.00)).await;
        let engine = fx.engine();

        for i in 0..10 {
            let request = body("ZOMBIE_RUSH", json!(i + 1), 1);
            let headers = signed_headers(
                &fx.credential,
                "POST",
                "/api/v1/authorize",
                fx.clock.now(),
                &format!("n-{}", i),
                &request,
            );
            engine.authorization.authorize(&headers, &request).await.unwrap();
            fx.clock.advance(Duration::seconds(1));
        }

        let request = body("ZOMBIE_RUSH", json!(99), 1);
        let headers = signed_headers(
            &fx.credential,
            "POST",
            "/api/v1/authorize",
            fx.clock.now(),
            "n-10",
            &request,
        );
        let err = engine.authorization.authorize(&headers, &request).await.unwrap_err();
        assert!(matches!(err, AppError::RateLimited { ref scope, .. } if scope == "account"));
        assert!(err.retry_after().unwrap() > 0);
        assert_eq!(fx.store_entries().await.len(), 10);
    }

    #[tokio::test]
    async fn test_failure_burst_locks_account() {
        let fx = Fixture::new().await;
        let engine = fx.engine();
        let request = body("ZOMBIE_RUSH", json!("venue_42"), 1);

        for i in 0..21 {
            let mut headers = signed_headers(
                &fx.credential,
                "POST",
                "/api/v1/authorize",
                fx.clock.now(),
                &format!("bad-{}", i),
                &request,
            );
            headers.signature = "00".repeat(32);
            assert_eq!(
                engine.authorization.authorize(&headers, &request).await,
                Err(AppError::SignatureInvalid)
            );
            fx.clock.advance(Duration::seconds(2));
        }

        let account = fx.reload_account().await;
        assert!(account.locked);

        // A correctly signed request from anywhere is now refused
        let mut headers = signed_headers(
            &fx.credential,
            "POST",
            "/api/v1/authorize",
            fx.clock.now(),
            "good-1",
            &request,
        );
        headers.source_address = "10.9.9.9".to_string();
        assert!(matches!(
            engine.authorization.authorize(&headers, &request).await,
            Err(AppError::AccountLocked(_))
        ));
        assert_eq!(fx.reload_account().await.balance, dec!(100.00));
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let fx = Fixture::new().await;

        assert_eq!(
            call(&fx, "n-1", &body("ZOMBIE_RUSH", json!("venue_1"), 9)).await,
            Err(AppError::PartySizeOutOfRange {
                requested: 9,
                min: 1,
                max: 8
            })
        );
        assert_eq!(
            call(&fx, "n-2", &body("LASER_TAG", json!("venue_1"), 2)).await,
            Err(AppError::AppNotAuthorized("LASER_TAG".to_string()))
        );
        assert!(matches!(
            call(&fx, "n-3", b"{not json").await,
            Err(AppError::InvalidField { ref field, .. }) if field == "body"
        ));
    }

    #[tokio::test]
    async fn test_concurrent_identical_requests_bill_once() {
        let fx = Fixture::new().await;
        let engine = Arc::new(fx.engine());
        let request = body("ZOMBIE_RUSH", json!("venue_42"), 5);

        let tasks = (0..8).map(|i| {
            let engine = engine.clone();
            let request = request.clone();
            let headers = signed_headers(
                &fx.credential,
                "POST",
                "/api/v1/authorize",
                fx.clock.now(),
                &format!("c-{}", i),
                &request,
            );
            tokio::spawn(async move { engine.authorization.authorize(&headers, &request).await })
        });
        let outcomes: Vec<_> = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert!(outcomes.iter().all(|o| o.session_id == outcomes[0].session_id));
        assert!(outcomes.iter().all(|o| o.remaining_balance == dec!(50.00)));
        assert_eq!(fx.store_entries().await.len(), 1);
        assert_eq!(fx.reload_account().await.balance, dec!(50.00));
    }
}
