//! Idempotency guard
//!
//! A retried authorization with the same business key inside the window gets
//! the original result back. The decision itself is the pure
//! `replay_within_window`; this service only fetches the latest record. The
//! ledger repeats the same check under the account lock, so concurrent
//! duplicates that all miss here still commit at most once.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use playmeter_core::{
    models::{replay_within_window, AuthorizationOutcome, BusinessKey},
    traits::LedgerStore,
    AppResult,
};
use tracing::{debug, instrument};

pub struct IdempotencyGuard {
    ledger: Arc<dyn LedgerStore>,
}

impl IdempotencyGuard {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    /// The original outcome if `key` was committed within `window` of `now`
    #[instrument(skip(self, key), fields(account_id = key.account_id))]
    pub async fn lookup(
        &self,
        key: &BusinessKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> AppResult<Option<AuthorizationOutcome>> {
        let latest = self
            .ledger
            .latest_usage_for_key(key.account_id, &key.digest())
            .await?;

        let replay = replay_within_window(latest.as_ref(), window, now);
        if let Some(outcome) = &replay {
            debug!("Duplicate request, replaying session {}", outcome.session_id);
        }
        Ok(replay)
    }
}
