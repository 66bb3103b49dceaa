//! Replay guard
//!
//! A signed request is accepted only while its timestamp is within the replay
//! window of server time, and only once per nonce. The nonce marker lives
//! until the request's own window closes, so a captured request can never be
//! replayed successfully.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use playmeter_cache::keys::nonce_key;
use playmeter_core::{traits::CounterStore, AppError, AppResult, EnginePolicy};
use tracing::{instrument, warn};

const MAX_NONCE_LEN: usize = 64;

pub struct ReplayGuard {
    counters: Arc<dyn CounterStore>,
}

fn check_nonce_format(nonce: &str) -> AppResult<()> {
    let valid = !nonce.is_empty()
        && nonce.len() <= MAX_NONCE_LEN
        && nonce
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AppError::invalid_field(
            "X-Nonce",
            format!("expected 1-{} characters of [A-Za-z0-9_-]", MAX_NONCE_LEN),
        ))
    }
}

impl ReplayGuard {
    pub fn new(counters: Arc<dyn CounterStore>) -> Self {
        Self { counters }
    }

    /// Accept a (timestamp, nonce) pair at most once
    ///
    /// # Errors
    ///
    /// - `AppError::RequestExpired` if the timestamp is outside the window
    /// - `AppError::NonceReused` if the nonce was already recorded
    #[instrument(skip(self, policy))]
    pub async fn check(
        &self,
        access_key: &str,
        timestamp: i64,
        nonce: &str,
        policy: &EnginePolicy,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        check_nonce_format(nonce)?;

        let window = policy.replay_window();
        let signed_at = DateTime::<Utc>::from_timestamp(timestamp, 0)
            .ok_or_else(|| AppError::invalid_field("X-Timestamp", "timestamp out of range"))?;
        let skew = now - signed_at;
        if skew.num_seconds().abs() > window.num_seconds() {
            warn!(skew_secs = skew.num_seconds(), "Request outside replay window");
            return Err(AppError::RequestExpired {
                skew_secs: skew.num_seconds(),
            });
        }

        // Keep the marker until the request itself stops being acceptable
        let ttl = (signed_at + window - now).max(Duration::seconds(1));
        let fresh = self
            .counters
            .insert_once(&nonce_key(access_key, nonce), ttl, now)
            .await?;
        if !fresh {
            warn!("Nonce reused");
            return Err(AppError::NonceReused);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playmeter_cache::MemoryCounterStore;

    fn guard() -> ReplayGuard {
        ReplayGuard::new(Arc::new(MemoryCounterStore::new()))
    }

    #[tokio::test]
    async fn test_fresh_request_accepted_once() {
        let guard = guard();
        let policy = EnginePolicy::default();
        let now = Utc::now();

        guard.check("pk_a", now.timestamp(), "n-1", &policy, now).await.unwrap();
        assert_eq!(
            guard.check("pk_a", now.timestamp(), "n-1", &policy, now).await,
            Err(AppError::NonceReused)
        );
        // Nonces are scoped per credential
        guard.check("pk_b", now.timestamp(), "n-1", &policy, now).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_and_future_timestamps() {
        let guard = guard();
        let policy = EnginePolicy::default();
        let now = Utc::now();

        let stale = now.timestamp() - 301;
        assert_eq!(
            guard.check("pk_a", stale, "n-1", &policy, now).await,
            Err(AppError::RequestExpired { skew_secs: 301 })
        );

        let future = now.timestamp() + 400;
        assert!(matches!(
            guard.check("pk_a", future, "n-2", &policy, now).await,
            Err(AppError::RequestExpired { .. })
        ));

        let edge = now.timestamp() - 300;
        assert!(guard.check("pk_a", edge, "n-3", &policy, now).await.is_ok());
    }

    #[tokio::test]
    async fn test_replay_rejected_for_whole_window() {
        let guard = guard();
        let policy = EnginePolicy::default();
        let now = Utc::now();
        let signed = now.timestamp() + 200;

        guard.check("pk_a", signed, "n-1", &policy, now).await.unwrap();

        // Still inside the request's window 450s later
        let later = now + Duration::seconds(450);
        assert_eq!(
            guard.check("pk_a", signed, "n-1", &policy, later).await,
            Err(AppError::NonceReused)
        );

        // Past the window the timestamp check rejects it instead
        let expired = now + Duration::seconds(520);
        assert!(matches!(
            guard.check("pk_a", signed, "n-1", &policy, expired).await,
            Err(AppError::RequestExpired { .. })
        ));
    }

    #[tokio::test]
    async fn test_nonce_format() {
        let guard = guard();
        let policy = EnginePolicy::default();
        let now = Utc::now();

        for nonce in ["", "has space", "semi;colon", &"x".repeat(65)] {
            assert!(matches!(
                guard.check("pk_a", now.timestamp(), nonce, &policy, now).await,
                Err(AppError::InvalidField { .. })
            ));
        }
    }
}
