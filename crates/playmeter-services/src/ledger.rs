//! Balance ledger service
//!
//! Prices a usage draft from a catalog snapshot and hands every balance
//! change to the `LedgerStore` unit of work with the policy's idempotency
//! window and lock wait.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use playmeter_core::{
    models::{
        BusinessKey, CatalogItem, RefundRequest, SessionId, SettlementOutcome, UsageCommit,
        UsageDraft, VenueId,
    },
    traits::LedgerStore,
    AppResult, EnginePolicy,
};
use tracing::{info, instrument};
use uuid::Uuid;

pub struct BalanceLedger {
    store: Arc<dyn LedgerStore>,
}

impl BalanceLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Build a usage draft with a fresh session id and authorization token
    ///
    /// The price is snapshotted from `item`; later price changes do not
    /// affect the committed record.
    pub fn draft(
        account_id: i64,
        item: &CatalogItem,
        venue_id: VenueId,
        party_size: i32,
        client_timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> UsageDraft {
        UsageDraft {
            key: BusinessKey {
                account_id,
                catalog_item_id: item.id,
                venue_id,
                party_size,
            },
            catalog_item_code: item.code.clone(),
            price_per_participant: item.price_per_participant,
            total_cost: item.total_for(party_size),
            session_id: SessionId::generate(account_id, now),
            authorization_token: Uuid::new_v4(),
            client_timestamp,
            created_at: now,
        }
    }

    /// Debit a usage draft (or replay the committed duplicate)
    ///
    /// # Errors
    ///
    /// - `AppError::InsufficientBalance` with no side effects
    /// - `AppError::LockTimeout` if the account stays busy past the lock wait
    #[instrument(skip(self, draft, policy), fields(account_id = draft.key.account_id, session_id = %draft.session_id))]
    pub async fn authorize(&self, draft: &UsageDraft, policy: &EnginePolicy) -> AppResult<UsageCommit> {
        let commit = self
            .store
            .commit_usage(draft, policy.idempotency_window(), policy.lock_wait())
            .await?;

        if let UsageCommit::Created(outcome) = &commit {
            info!(
                "Debited {} for session {}, remaining {}",
                outcome.total_cost, outcome.session_id, outcome.remaining_balance
            );
        }
        Ok(commit)
    }

    /// Credit a recharge order, exactly once per confirmation id
    #[instrument(skip(self, policy))]
    pub async fn settle_recharge(
        &self,
        order_id: Uuid,
        confirmation_id: &str,
        at: DateTime<Utc>,
        policy: &EnginePolicy,
    ) -> AppResult<SettlementOutcome> {
        let outcome = self
            .store
            .settle_recharge(order_id, confirmation_id, at, policy.lock_wait())
            .await?;

        if let SettlementOutcome::Applied(order) = &outcome {
            info!(
                "Credited {} to account {} from recharge {}",
                order.amount, order.account_id, order.id
            );
        }
        Ok(outcome)
    }

    /// Debit the approved amount of a refund and mark it completed
    #[instrument(skip(self, policy))]
    pub async fn complete_refund(
        &self,
        request_id: Uuid,
        reviewer: &str,
        at: DateTime<Utc>,
        policy: &EnginePolicy,
    ) -> AppResult<RefundRequest> {
        let refund = self
            .store
            .complete_refund(request_id, reviewer, at, policy.lock_wait())
            .await?;
        info!(
            "Disbursed refund {} of {} from account {}",
            refund.id,
            refund.approved_amount.unwrap_or(refund.requested_amount),
            refund.account_id
        );
        Ok(refund)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use futures::future::join_all;
    use playmeter_core::{
        models::{balance_reconciles, EntryType},
        traits::AccountRepository,
        AppError, Clock,
    };
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_draft_snapshots_price() {
        let fx = Fixture::new().await;
        let now = fx.clock.now();
        let draft = BalanceLedger::draft(fx.account.id, &fx.item, VenueId(42), 5, now, now);

        assert_eq!(draft.price_per_participant, dec!(10.00));
        assert_eq!(draft.total_cost, dec!(50.00));
        assert_eq!(draft.session_id.parts().unwrap().account_id, fx.account.id);
        assert_eq!(draft.key.venue_id, VenueId(42));
    }

    #[tokio::test]
    async fn test_insufficient_balance_has_no_side_effects() {
        let fx = Fixture::new().await;
        let ledger = BalanceLedger::new(fx.store.clone());
        let policy = EnginePolicy::default();
        let now = fx.clock.now();

        let draft = BalanceLedger::draft(fx.account.id, &fx.item, VenueId(1), 8, now, now);
        ledger.authorize(&draft, &policy).await.unwrap();

        let again = BalanceLedger::draft(fx.account.id, &fx.item, VenueId(2), 3, now, now);
        assert!(matches!(
            ledger.authorize(&again, &policy).await,
            Err(AppError::InsufficientBalance { .. })
        ));

        let account = fx.reload_account().await;
        assert_eq!(account.balance, dec!(20.00));
        let entries = fx.store_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, EntryType::Usage);
    }

    #[tokio::test]
    async fn test_concurrent_debits_never_overdraw() {
        let fx = Fixture::new().await;
        let ledger = Arc::new(BalanceLedger::new(fx.store.clone()));
        let policy = EnginePolicy::default();
        let now = fx.clock.now();

        // 30 distinct sessions of 10.00 each against a balance of 100.00
        let tasks = (0..30).map(|venue| {
            let ledger = ledger.clone();
            let policy = policy.clone();
            let draft =
                BalanceLedger::draft(fx.account.id, &fx.item, VenueId(venue + 1), 1, now, now);
            tokio::spawn(async move { ledger.authorize(&draft, &policy).await })
        });
        let results: Vec<_> = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(succeeded, 10);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, AppError::InsufficientBalance { .. })));

        let account = fx.reload_account().await;
        assert_eq!(account.balance, Decimal::ZERO);
        assert!(balance_reconciles(
            account.opening_balance,
            &fx.store_entries().await,
            account.balance
        ));
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_commit_once() {
        let fx = Fixture::new().await;
        let ledger = Arc::new(BalanceLedger::new(fx.store.clone()));
        let policy = EnginePolicy::default();
        let now = fx.clock.now();

        let tasks = (0..16).map(|_| {
            let ledger = ledger.clone();
            let policy = policy.clone();
            let draft = BalanceLedger::draft(fx.account.id, &fx.item, VenueId(42), 5, now, now);
            tokio::spawn(async move { ledger.authorize(&draft, &policy).await })
        });
        let outcomes: Vec<_> = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap().into_outcome())
            .collect();

        let first = &outcomes[0].session_id;
        assert!(outcomes.iter().all(|o| &o.session_id == first));
        assert!(outcomes.iter().all(|o| o.remaining_balance == dec!(50.00)));
        assert_eq!(fx.store_entries().await.len(), 1);

        let account = AccountRepository::find_by_id(fx.store.as_ref(), fx.account.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.balance, dec!(50.00));
    }
}
