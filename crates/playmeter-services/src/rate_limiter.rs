//! Sliding-window rate limiter
//!
//! Two independent windows guard the authorization path: one per source
//! address and one per account. A rejected request does not consume a slot.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use playmeter_cache::keys::{account_rate_key, address_rate_key};
use playmeter_core::{
    models::Tier,
    traits::{CounterStore, WindowAdmission},
    AppError, AppResult, EnginePolicy,
};
use tracing::{instrument, warn};

pub struct RateLimiter {
    counters: Arc<dyn CounterStore>,
}

fn rejection(scope: &str, admission: &WindowAdmission) -> AppError {
    // Round up so a client never retries a fraction of a second too early
    let millis = admission.retry_after.num_milliseconds().max(1);
    AppError::RateLimited {
        scope: scope.to_string(),
        retry_after_secs: ((millis + 999) / 1000) as u64,
    }
}

impl RateLimiter {
    pub fn new(counters: Arc<dyn CounterStore>) -> Self {
        Self { counters }
    }

    /// Per-source-address window
    #[instrument(skip(self, policy))]
    pub async fn check_address(
        &self,
        address: &str,
        policy: &EnginePolicy,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let admission = self
            .counters
            .acquire(
                &address_rate_key(address),
                policy.address_requests_per_window,
                policy.rate_window(),
                now,
            )
            .await?;
        if !admission.allowed {
            warn!(count = admission.count, "Address rate limit exceeded");
            return Err(rejection("address", &admission));
        }
        Ok(())
    }

    /// Per-account window; the limit may depend on the account's tier
    #[instrument(skip(self, policy))]
    pub async fn check_account(
        &self,
        account_id: i64,
        tier: Tier,
        policy: &EnginePolicy,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let admission = self
            .counters
            .acquire(
                &account_rate_key(account_id),
                policy.account_limit_for(tier),
                policy.rate_window(),
                now,
            )
            .await?;
        if !admission.allowed {
            warn!(count = admission.count, "Account rate limit exceeded");
            return Err(rejection("account", &admission));
        }
        Ok(())
    }
}
