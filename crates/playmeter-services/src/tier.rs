//! Tier classifier
//!
//! Recomputes each active account's tier from its usage spend over one
//! closed calendar month. A change record is written only when the tier
//! changes. There is one record per (account, period): re-running a period
//! with unchanged data is a no-op, and a run over new data overwrites it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use playmeter_core::{
    models::{BillingPeriod, NewTierChange, TierChange, TierRunSummary},
    traits::{AccountRepository, LedgerStore, TierRepository},
    AppError, AppResult, Clock,
};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{info, instrument};

use crate::audit::{Actor, AuditTrail};
use crate::policy_cache::PolicyCache;

/// Minutes past midnight UTC on the 1st when the monthly run fires
const RUN_OFFSET_MINUTES: i64 = 5;

/// First monthly run strictly after `now`
pub fn next_scheduled_run(now: DateTime<Utc>) -> AppResult<DateTime<Utc>> {
    let this_month = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .ok_or_else(|| AppError::Internal(format!("No month start for {}", now)))?
        + Duration::minutes(RUN_OFFSET_MINUTES);
    if this_month > now {
        return Ok(this_month);
    }

    let period = BillingPeriod {
        year: now.year(),
        month: now.month(),
    };
    Ok(period.next().start()? + Duration::minutes(RUN_OFFSET_MINUTES))
}

pub struct TierClassifier {
    ledger: Arc<dyn LedgerStore>,
    accounts: Arc<dyn AccountRepository>,
    tiers: Arc<dyn TierRepository>,
    policy: Arc<PolicyCache>,
    audit: Arc<AuditTrail>,
    clock: Arc<dyn Clock>,
}

impl TierClassifier {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        accounts: Arc<dyn AccountRepository>,
        tiers: Arc<dyn TierRepository>,
        policy: Arc<PolicyCache>,
        audit: Arc<AuditTrail>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            accounts,
            tiers,
            policy,
            audit,
            clock,
        }
    }

    /// Classify every active account by its spend in `period`
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidField` when `period` has not ended yet
    #[instrument(skip(self, period), fields(period = %period))]
    pub async fn run(&self, period: BillingPeriod) -> AppResult<TierRunSummary> {
        let now = self.clock.now();
        let end = period.end()?;
        if end > now {
            return Err(AppError::invalid_field(
                "period",
                format!("{} has not closed yet", period),
            ));
        }

        let thresholds = self.policy.current().await?.tier_thresholds;
        let spend: HashMap<i64, Decimal> = self
            .ledger
            .usage_spend_between(period.start()?, end)
            .await?
            .into_iter()
            .collect();

        let accounts = self.accounts.list_active().await?;
        let mut summary = TierRunSummary {
            period: period.to_string(),
            evaluated: accounts.len(),
            changed: 0,
        };

        for account in accounts {
            let account_spend = spend.get(&account.id).copied().unwrap_or(Decimal::ZERO);
            let new_tier = thresholds.classify(account_spend);
            if new_tier == account.tier {
                continue;
            }

            let recorded = self
                .tiers
                .record_change(&NewTierChange {
                    account_id: account.id,
                    period,
                    previous_tier: account.tier,
                    new_tier,
                    spend: account_spend,
                    created_at: now,
                })
                .await?;
            if let Some(change) = recorded {
                summary.changed += 1;
                info!(
                    "Account {} moved {} -> {} on spend {}",
                    change.account_id, change.previous_tier, change.new_tier, change.spend
                );
            }
        }

        info!(
            "Tier run for {}: {} evaluated, {} changed",
            summary.period, summary.evaluated, summary.changed
        );
        Ok(summary)
    }

    /// Scheduled run over the month before `now`
    pub async fn run_previous_month(&self) -> AppResult<TierRunSummary> {
        self.run(BillingPeriod::previous(self.clock.now())).await
    }

    /// Operator-triggered run; audited
    pub async fn run_manual(&self, actor: &Actor, period: BillingPeriod) -> AppResult<TierRunSummary> {
        let summary = self.run(period).await?;
        self.audit
            .record(
                actor,
                "tier.run",
                "billing_period",
                period,
                json!({ "evaluated": summary.evaluated, "changed": summary.changed }),
            )
            .await;
        Ok(summary)
    }

    pub async fn changes(&self, period: Option<BillingPeriod>) -> AppResult<Vec<TierChange>> {
        let period = period.map(|p| p.to_string());
        self.tiers.list_changes(period.as_deref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use playmeter_core::{
        models::{BusinessKey, Tier, TierThresholds, UserRole, VenueId},
        policy::StaticPolicySource,
        EnginePolicy,
    };
    use rust_decimal_macros::dec;

    fn classifier(fx: &Fixture) -> TierClassifier {
        let policy = EnginePolicy {
            tier_thresholds: TierThresholds {
                silver: dec!(50.00),
                gold: dec!(200.00),
            },
            ..Default::default()
        };
        let clock: Arc<dyn Clock> = fx.clock.clone();
        TierClassifier::new(
            fx.store.clone(),
            fx.store.clone(),
            fx.store.clone(),
            Arc::new(PolicyCache::new(
                Arc::new(StaticPolicySource::new(policy)),
                Duration::seconds(30),
                clock.clone(),
            )),
            Arc::new(AuditTrail::new(fx.store.clone(), clock.clone())),
            clock,
        )
    }

    fn april_first() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 0, 5, 0).unwrap()
    }

    async fn spend(fx: &Fixture, venues: std::ops::Range<i64>, at: DateTime<Utc>) {
        for venue in venues {
            fx.commit(
                &BusinessKey {
                    account_id: fx.account.id,
                    catalog_item_id: fx.item.id,
                    venue_id: VenueId(venue),
                    party_size: 1,
                },
                at,
            )
            .await;
        }
    }

    #[test]
    fn test_next_scheduled_run() {
        let at = |y, m, d, h, min| Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap();
        assert_eq!(
            next_scheduled_run(at(2026, 3, 14, 12, 0)).unwrap(),
            at(2026, 4, 1, 0, 5)
        );
        assert_eq!(
            next_scheduled_run(at(2026, 4, 1, 0, 1)).unwrap(),
            at(2026, 4, 1, 0, 5)
        );
        assert_eq!(
            next_scheduled_run(at(2026, 12, 1, 0, 5)).unwrap(),
            at(2027, 1, 1, 0, 5)
        );
    }

    #[tokio::test]
    async fn test_run_reclassifies_and_is_idempotent() {
        let fx = Fixture::with_balance(dec!(1000.00)).await;
        let classifier = classifier(&fx);
        let period = BillingPeriod::new(2026, 3).unwrap();

        // 6 sessions at 10.00 = 60.00, silver
        spend(&fx, 0..6, fx.clock.now()).await;
        fx.clock.set(april_first());

        let summary = classifier.run(period).await.unwrap();
        assert_eq!(summary.changed, 1);
        assert_eq!(fx.reload_account().await.tier, Tier::Silver);

        let again = classifier.run(period).await.unwrap();
        assert_eq!(again.changed, 0);
        assert_eq!(classifier.changes(Some(period)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rerun_after_late_spend_upgrades() {
        let fx = Fixture::with_balance(dec!(1000.00)).await;
        let classifier = classifier(&fx);
        let period = BillingPeriod::new(2026, 3).unwrap();
        let march = fx.clock.now();

        spend(&fx, 0..6, march).await;
        fx.clock.set(april_first());
        classifier.run(period).await.unwrap();
        assert_eq!(fx.reload_account().await.tier, Tier::Silver);

        // entries settled late but dated inside March
        spend(&fx, 6..26, march + Duration::days(2)).await;
        let rerun = classifier.run(period).await.unwrap();
        assert_eq!(rerun.changed, 1);
        assert_eq!(fx.reload_account().await.tier, Tier::Gold);

        let changes = classifier.changes(Some(period)).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].previous_tier, Tier::Standard);
        assert_eq!(changes[0].new_tier, Tier::Gold);
        assert_eq!(changes[0].spend, dec!(260.00));
    }

    #[tokio::test]
    async fn test_open_period_rejected() {
        let fx = Fixture::with_balance(dec!(1000.00)).await;
        let classifier = classifier(&fx);
        spend(&fx, 0..6, fx.clock.now()).await;
        let admin = Actor::user(1, "root", UserRole::Admin);

        for period in [BillingPeriod::new(2026, 3).unwrap(), BillingPeriod::new(2099, 1).unwrap()] {
            let err = classifier.run_manual(&admin, period).await.unwrap_err();
            assert!(matches!(err, AppError::InvalidField { .. }));
        }
        assert_eq!(fx.reload_account().await.tier, Tier::Standard);
        assert!(classifier.changes(None).await.unwrap().is_empty());
        assert!(!fx.audit_actions().await.contains(&"tier.run".to_string()));
    }

    #[tokio::test]
    async fn test_spend_outside_period_is_ignored() {
        let fx = Fixture::with_balance(dec!(1000.00)).await;
        let classifier = classifier(&fx);

        spend(&fx, 0..25, fx.clock.now()).await;
        fx.clock.set(april_first());

        let february = classifier.run(BillingPeriod::new(2026, 2).unwrap()).await.unwrap();
        assert_eq!(february.changed, 0);

        let march = classifier.run(BillingPeriod::new(2026, 3).unwrap()).await.unwrap();
        assert_eq!(march.changed, 1);
        let change = &classifier.changes(None).await.unwrap()[0];
        assert_eq!(change.new_tier, Tier::Gold);
        assert_eq!(change.spend, dec!(250.00));
    }

    #[tokio::test]
    async fn test_quiet_month_demotes() {
        let fx = Fixture::with_balance(dec!(1000.00)).await;
        let classifier = classifier(&fx);
        spend(&fx, 0..6, fx.clock.now()).await;
        fx.clock.set(Utc.with_ymd_and_hms(2026, 5, 1, 0, 5, 0).unwrap());
        classifier.run(BillingPeriod::new(2026, 3).unwrap()).await.unwrap();

        let april = classifier
            .run_manual(&Actor::user(1, "root", UserRole::Admin), BillingPeriod::new(2026, 4).unwrap())
            .await
            .unwrap();
        assert_eq!(april.changed, 1);
        assert_eq!(fx.reload_account().await.tier, Tier::Standard);
        assert!(fx.audit_actions().await.contains(&"tier.run".to_string()));
    }
}
