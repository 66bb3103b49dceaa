//! Anomaly detector
//!
//! Watches two patterns per source address:
//!
//! - bursts of authentication/validation failures in the failure window
//! - many distinct credentials presented in the distinct-account window
//!
//! When either crosses its threshold the implicated accounts are locked on
//! the spot and an alert is raised for each newly locked account set. The
//! detector never unlocks; only an administrator can.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use playmeter_cache::keys::{account_failure_key, address_failure_key, identity_set_key};
use playmeter_core::{
    models::Account,
    traits::{AccountRepository, Alert, AlertKind, AlertSink, CounterStore},
    AppError, AppResult, EnginePolicy,
};
use tracing::{debug, error, instrument, warn};

pub struct AnomalyDetector {
    counters: Arc<dyn CounterStore>,
    accounts: Arc<dyn AccountRepository>,
    alerts: Arc<dyn AlertSink>,
}

impl AnomalyDetector {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        accounts: Arc<dyn AccountRepository>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            counters,
            accounts,
            alerts,
        }
    }

    /// Screen an authenticated request
    ///
    /// Records the credential against the source address and rejects the
    /// request if its account is (or just became) locked.
    #[instrument(skip(self, account, policy), fields(account_id = account.id))]
    pub async fn screen(
        &self,
        account: &Account,
        address: &str,
        policy: &EnginePolicy,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        account.ensure_billable()?;

        let locked = self
            .track_identity(address, &account.access_key, policy, now)
            .await?;
        if locked.contains(&account.id) {
            return Err(AppError::AccountLocked(switching_reason(address)));
        }
        Ok(())
    }

    /// Record a failed request and lock accounts if the burst threshold is crossed
    ///
    /// `access_key` is whatever credential the request presented, known or not.
    #[instrument(skip(self, policy))]
    pub async fn record_failure(
        &self,
        address: &str,
        access_key: Option<&str>,
        policy: &EnginePolicy,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let presented = access_key.filter(|k| !k.is_empty());
        if let Some(key) = presented {
            self.track_identity(address, key, policy, now).await?;
        }

        let address_failures = self
            .counters
            .record(&address_failure_key(address), policy.failure_window(), now)
            .await?;

        let account = match presented {
            Some(key) => self.accounts.find_by_access_key(key).await?,
            None => None,
        };
        let account_failures = match &account {
            Some(account) => {
                self.counters
                    .record(&account_failure_key(account.id), policy.failure_window(), now)
                    .await?
            }
            None => 0,
        };
        debug!(address_failures, account_failures, "Recorded request failure");

        if address_failures <= policy.failure_threshold
            && account_failures <= policy.failure_threshold
        {
            return Ok(());
        }

        let mut implicated: Vec<i64> = account.iter().map(|a| a.id).collect();
        for id in self.accounts_seen_from(address, policy, now).await? {
            if !implicated.contains(&id) {
                implicated.push(id);
            }
        }

        let reason = format!(
            "failure burst from {}: {} failures in {}s",
            address,
            address_failures.max(account_failures),
            policy.failure_window_secs
        );
        self.lock_all(&implicated, AlertKind::FailureBurst, address, &reason, now)
            .await?;
        Ok(())
    }

    /// Add the credential to the address's identity set; returns the accounts
    /// implicated if the distinct-credential threshold was crossed
    async fn track_identity(
        &self,
        address: &str,
        access_key: &str,
        policy: &EnginePolicy,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<i64>> {
        let distinct = self
            .counters
            .add_member(
                &identity_set_key(address),
                access_key,
                policy.distinct_account_window(),
                now,
            )
            .await?;
        if distinct <= policy.distinct_account_threshold {
            return Ok(Vec::new());
        }

        let implicated = self.accounts_seen_from(address, policy, now).await?;
        let reason = switching_reason(address);
        self.lock_all(&implicated, AlertKind::CredentialSwitching, address, &reason, now)
            .await?;
        Ok(implicated)
    }

    /// Known accounts whose credentials were presented from an address
    async fn accounts_seen_from(
        &self,
        address: &str,
        policy: &EnginePolicy,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<i64>> {
        let keys = self
            .counters
            .members(&identity_set_key(address), policy.distinct_account_window(), now)
            .await?;

        let mut ids = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(account) = self.accounts.find_by_access_key(&key).await? {
                ids.push(account.id);
            }
        }
        Ok(ids)
    }

    async fn lock_all(
        &self,
        account_ids: &[i64],
        kind: AlertKind,
        address: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut newly_locked = Vec::new();
        for &id in account_ids {
            match self.accounts.lock(id, reason, now).await {
                Ok(true) => newly_locked.push(id),
                Ok(false) => {}
                Err(e) => {
                    error!("Failed to lock account {}: {}", id, e);
                    return Err(e);
                }
            }
        }

        if newly_locked.is_empty() {
            return Ok(());
        }

        warn!(accounts = ?newly_locked, "Locked accounts: {}", reason);
        self.alerts.raise(&Alert {
            kind,
            account_ids: newly_locked,
            source: Some(address.to_string()),
            detail: reason.to_string(),
            raised_at: now,
        });
        Ok(())
    }
}

fn switching_reason(address: &str) -> String {
    format!("credential switching from {}", address)
}
