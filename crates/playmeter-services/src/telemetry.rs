//! Post-game telemetry upload
//!
//! Devices upload telemetry against the server-issued session id. Uploads
//! pass the same device gate as billing calls (per-address window only) and
//! overwrite earlier telemetry for the session.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use playmeter_auth::DeviceHeaders;
use playmeter_core::{
    models::{SessionId, SessionTelemetry},
    traits::{LedgerStore, TelemetryRepository},
    AppError, AppResult, EnginePolicy,
};
use serde_json::Value as JsonValue;
use tracing::{info, instrument};

use crate::authorization::{DeviceGate, RateScope};

pub struct TelemetryService {
    gate: Arc<DeviceGate>,
    ledger: Arc<dyn LedgerStore>,
    telemetry: Arc<dyn TelemetryRepository>,
}

impl TelemetryService {
    pub fn new(
        gate: Arc<DeviceGate>,
        ledger: Arc<dyn LedgerStore>,
        telemetry: Arc<dyn TelemetryRepository>,
    ) -> Self {
        Self {
            gate,
            ledger,
            telemetry,
        }
    }

    /// Store (or replace) telemetry for a session owned by the caller
    ///
    /// # Errors
    ///
    /// - `AppError::SessionIdFormatInvalid` for a malformed session id
    /// - `AppError::NotFound` if the session does not exist or belongs to
    ///   another account
    pub async fn upload(
        &self,
        headers: &DeviceHeaders,
        session_id: &str,
        body: &[u8],
    ) -> AppResult<SessionTelemetry> {
        let (policy, now) = self.gate.begin().await?;

        let result = self.run(headers, session_id, body, &policy, now).await;
        if let Err(e) = &result {
            self.gate.report_failure(headers, e, &policy, now).await;
        }
        result
    }

    #[instrument(skip(self, headers, body, policy), fields(access_key = %headers.access_key))]
    async fn run(
        &self,
        headers: &DeviceHeaders,
        session_id: &str,
        body: &[u8],
        policy: &EnginePolicy,
        now: DateTime<Utc>,
    ) -> AppResult<SessionTelemetry> {
        let admission = self
            .gate
            .admit(headers, body, RateScope::AddressOnly, policy, now)
            .await?;
        let account_id = admission.account.id;

        let session = SessionId::parse(session_id)?;
        let not_found = || AppError::NotFound(format!("Session {}", session));
        if session.parts()?.account_id != account_id {
            return Err(not_found());
        }
        let usage = self
            .ledger
            .find_usage_by_session(session.as_str())
            .await?
            .filter(|record| record.account_id == account_id)
            .ok_or_else(not_found)?;

        let payload: JsonValue = serde_json::from_slice(body)
            .map_err(|e| AppError::invalid_field("body", format!("malformed telemetry: {}", e)))?;

        let stored = self
            .telemetry
            .upsert(&usage.session_id, account_id, &payload, now)
            .await?;
        info!(
            "Stored telemetry for session {} (upload #{})",
            stored.session_id, stored.upload_count
        );
        Ok(stored)
    }

    pub async fn get(&self, account_id: i64, session_id: &str) -> AppResult<SessionTelemetry> {
        let session = SessionId::parse(session_id)?;
        self.telemetry
            .find(session.as_str())
            .await?
            .filter(|t| t.account_id == account_id)
            .ok_or_else(|| AppError::NotFound(format!("Telemetry for session {}", session)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{signed_headers, Fixture};
    use chrono::Duration;
    use playmeter_core::{
        models::{BusinessKey, VenueId},
        Clock,
    };
    use rust_decimal_macros::dec;
    use serde_json::json;

    async fn session(fx: &Fixture) -> String {
        fx.commit(
            &BusinessKey {
                account_id: fx.account.id,
                catalog_item_id: fx.item.id,
                venue_id: VenueId(3),
                party_size: 4,
            },
            fx.clock.now(),
        )
        .await
        .session_id
    }

    async fn upload(
        fx: &Fixture,
        credential: &playmeter_auth::IssuedCredential,
        session_id: &str,
        nonce: &str,
        body: &[u8],
    ) -> AppResult<SessionTelemetry> {
        let path = format!("/api/v1/sessions/{}/telemetry", session_id);
        let headers = signed_headers(credential, "PUT", &path, fx.clock.now(), nonce, body);
        fx.engine().telemetry.upload(&headers, session_id, body).await
    }

    #[tokio::test]
    async fn test_repeat_upload_overwrites() {
        let fx = Fixture::new().await;
        let session_id = session(&fx).await;

        let first = serde_json::to_vec(&json!({"score": 120, "waves": 4})).unwrap();
        let stored = upload(&fx, &fx.credential, &session_id, "t-1", &first).await.unwrap();
        assert_eq!(stored.upload_count, 1);

        fx.clock.advance(Duration::seconds(30));
        let second = serde_json::to_vec(&json!({"score": 180})).unwrap();
        let stored = upload(&fx, &fx.credential, &session_id, "t-2", &second).await.unwrap();
        assert_eq!(stored.upload_count, 2);
        assert_eq!(stored.payload, json!({"score": 180}));

        let fetched = fx.engine().telemetry.get(fx.account.id, &session_id).await.unwrap();
        assert_eq!(fetched.payload, json!({"score": 180}));
        assert_eq!(fetched.first_uploaded_at, stored.first_uploaded_at);
    }

    #[tokio::test]
    async fn test_malformed_session_id() {
        let fx = Fixture::new().await;
        assert!(matches!(
            upload(&fx, &fx.credential, "not-a-session", "t-1", b"{}").await,
            Err(AppError::SessionIdFormatInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_and_foreign_sessions_are_not_found() {
        let fx = Fixture::new().await;
        let session_id = session(&fx).await;

        let unknown = format!("{}_1760000000000_ABCDEFGHIJKLMNOP", fx.account.id);
        assert!(matches!(
            upload(&fx, &fx.credential, &unknown, "t-1", b"{}").await,
            Err(AppError::NotFound(_))
        ));

        let (_, other) = fx.add_account("arena-north", dec!(20.00)).await;
        assert!(matches!(
            upload(&fx, &other, &session_id, "t-2", b"{}").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_body_must_be_json() {
        let fx = Fixture::new().await;
        let session_id = session(&fx).await;
        assert!(matches!(
            upload(&fx, &fx.credential, &session_id, "t-1", b"score=1").await,
            Err(AppError::InvalidField { ref field, .. }) if field == "body"
        ));
    }
}
