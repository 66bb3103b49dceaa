//! Balance ledger unit of work on PostgreSQL
//!
//! Every balance change runs in one transaction that first takes a row lock
//! on the account (`SELECT ... FOR UPDATE`) with a bounded `lock_timeout`.
//! Rows that move together with the balance (order, refund request) are
//! locked before the account row so that all writers agree on the order.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use playmeter_core::{
    models::{
        replay_within_window, Account, BalanceMovement, EntryType, LedgerEntry, RechargeOrder,
        RechargeStatus, RefundRequest, RefundStatus, SettlementOutcome, UsageCommit, UsageDraft,
        UsageRecord,
    },
    traits::LedgerStore,
    AppError, AppResult,
};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::pg_error::{is_unique_violation, ledger_error};
use crate::repositories::account_repo::{AccountRow, ACCOUNT_COLUMNS};
use crate::repositories::recharge_repo::{RechargeRow, RECHARGE_COLUMNS};
use crate::repositories::review_repo::{RefundRow, REFUND_COLUMNS};

const USAGE_COLUMNS: &str = r#"
    id, session_id, authorization_token, account_id, catalog_item_id, catalog_item_code,
    venue_id, party_size, business_key, price_per_participant, total_cost, balance_after,
    client_timestamp, created_at
"#;

const LEDGER_COLUMNS: &str =
    "id, account_id, entry_type, amount, balance_before, balance_after, reference, description, created_at";

/// PostgreSQL implementation of LedgerStore
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Begin a transaction whose lock waits give up after `lock_wait`
    async fn begin(&self, lock_wait: std::time::Duration) -> AppResult<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to start transaction: {}", e);
            AppError::Transaction(format!("Failed to start transaction: {}", e))
        })?;

        // SET does not accept bind parameters; the value is a formatted integer
        let wait_ms = lock_wait.as_millis().max(1);
        sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", wait_ms))
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to set lock timeout: {}", e);
                AppError::Transaction(format!("Failed to set lock timeout: {}", e))
            })?;

        Ok(tx)
    }

    async fn commit(tx: Transaction<'static, Postgres>) -> AppResult<()> {
        tx.commit().await.map_err(|e| {
            error!("Failed to commit transaction: {}", e);
            AppError::Transaction(format!("Failed to commit transaction: {}", e))
        })
    }

    async fn lock_account(
        tx: &mut Transaction<'static, Postgres>,
        account_id: i64,
        wait_ms: u64,
    ) -> AppResult<Account> {
        let sql = format!("SELECT {} FROM accounts WHERE id = $1 FOR UPDATE", ACCOUNT_COLUMNS);
        let row = sqlx::query_as::<sqlx::Postgres, AccountRow>(&sql)
            .bind(account_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| ledger_error(e, "lock account", wait_ms))?;

        row.map(Into::into)
            .ok_or_else(|| AppError::AccountNotFound(account_id.to_string()))
    }

    async fn apply_movement(
        tx: &mut Transaction<'static, Postgres>,
        account_id: i64,
        entry_type: EntryType,
        movement: &BalanceMovement,
        reference: &str,
        description: Option<&str>,
        at: DateTime<Utc>,
        wait_ms: u64,
    ) -> AppResult<()> {
        sqlx::query("UPDATE accounts SET balance = $2, updated_at = $3 WHERE id = $1")
            .bind(account_id)
            .bind(movement.balance_after)
            .bind(at)
            .execute(&mut **tx)
            .await
            .map_err(|e| ledger_error(e, "update balance", wait_ms))?;

        sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                account_id, entry_type, amount, balance_before, balance_after,
                reference, description, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(account_id)
        .bind(entry_type.to_string())
        .bind(movement.amount)
        .bind(movement.balance_before)
        .bind(movement.balance_after)
        .bind(reference)
        .bind(description)
        .bind(at)
        .execute(&mut **tx)
        .await
        .map_err(|e| ledger_error(e, "insert ledger entry", wait_ms))?;

        Ok(())
    }

    async fn latest_usage_in(
        tx: &mut Transaction<'static, Postgres>,
        account_id: i64,
        business_key: &str,
        wait_ms: u64,
    ) -> AppResult<Option<UsageRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM usage_records
            WHERE account_id = $1 AND business_key = $2
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
            USAGE_COLUMNS
        );
        let row = sqlx::query_as::<sqlx::Postgres, UsageRow>(&sql)
            .bind(account_id)
            .bind(business_key)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| ledger_error(e, "look up usage", wait_ms))?;

        Ok(row.map(Into::into))
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    #[instrument(skip(self, draft), fields(account_id = draft.key.account_id, session_id = %draft.session_id))]
    async fn commit_usage(
        &self,
        draft: &UsageDraft,
        idempotency_window: Duration,
        lock_wait: std::time::Duration,
    ) -> AppResult<UsageCommit> {
        let wait_ms = lock_wait.as_millis() as u64;
        let account_id = draft.key.account_id;
        let business_key = draft.key.digest();

        let mut tx = self.begin(lock_wait).await?;
        let account = Self::lock_account(&mut tx, account_id, wait_ms).await?;
        account.ensure_billable()?;

        // A concurrent identical request may have committed while we waited
        let latest = Self::latest_usage_in(&mut tx, account_id, &business_key, wait_ms).await?;
        if let Some(outcome) =
            replay_within_window(latest.as_ref(), idempotency_window, draft.created_at)
        {
            debug!("Replaying session {} under the account lock", outcome.session_id);
            return Ok(UsageCommit::Replayed(outcome));
        }

        let movement = BalanceMovement::debit(account.balance, draft.total_cost)?;

        let sql = format!(
            r#"
            INSERT INTO usage_records (
                session_id, authorization_token, account_id, catalog_item_id, catalog_item_code,
                venue_id, party_size, business_key, price_per_participant, total_cost,
                balance_after, client_timestamp, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {}
            "#,
            USAGE_COLUMNS
        );
        let record: UsageRecord = sqlx::query_as::<sqlx::Postgres, UsageRow>(&sql)
            .bind(draft.session_id.as_str())
            .bind(draft.authorization_token)
            .bind(account_id)
            .bind(draft.key.catalog_item_id)
            .bind(&draft.catalog_item_code)
            .bind(draft.key.venue_id.0)
            .bind(draft.key.party_size)
            .bind(&business_key)
            .bind(draft.price_per_participant)
            .bind(draft.total_cost)
            .bind(movement.balance_after)
            .bind(draft.client_timestamp)
            .bind(draft.created_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::Conflict(format!("Session {} already exists", draft.session_id))
                } else {
                    ledger_error(e, "insert usage record", wait_ms)
                }
            })?
            .into();

        let description = format!(
            "{} x{} at {}",
            draft.catalog_item_code, draft.key.party_size, draft.key.venue_id
        );
        Self::apply_movement(
            &mut tx,
            account_id,
            EntryType::Usage,
            &movement,
            &record.session_id,
            Some(&description),
            draft.created_at,
            wait_ms,
        )
        .await?;

        Self::commit(tx).await?;

        info!(
            "Authorized session {} for {} (balance {} -> {})",
            record.session_id, record.total_cost, movement.balance_before, movement.balance_after
        );
        Ok(UsageCommit::Created(record.outcome(false)))
    }

    #[instrument(skip(self))]
    async fn settle_recharge(
        &self,
        order_id: Uuid,
        confirmation_id: &str,
        at: DateTime<Utc>,
        lock_wait: std::time::Duration,
    ) -> AppResult<SettlementOutcome> {
        let wait_ms = lock_wait.as_millis() as u64;
        let mut tx = self.begin(lock_wait).await?;

        let sql = format!("SELECT {} FROM recharge_orders WHERE id = $1 FOR UPDATE", RECHARGE_COLUMNS);
        let order: RechargeOrder = sqlx::query_as::<sqlx::Postgres, RechargeRow>(&sql)
            .bind(order_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| ledger_error(e, "lock recharge order", wait_ms))?
            .map(Into::into)
            .ok_or_else(|| AppError::NotFound(format!("Recharge order {}", order_id)))?;

        if order.status == RechargeStatus::Settled {
            return if order.confirmation_id.as_deref() == Some(confirmation_id) {
                debug!("Confirmation {} already applied", confirmation_id);
                Ok(SettlementOutcome::AlreadySettled(order))
            } else {
                warn!(
                    "Order {} already settled under a different confirmation",
                    order_id
                );
                Err(AppError::Conflict(format!(
                    "Recharge order {} was settled with another confirmation",
                    order_id
                )))
            };
        }
        order.status.ensure_transition(RechargeStatus::Settled)?;

        let (used,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM recharge_orders WHERE confirmation_id = $1)",
        )
        .bind(confirmation_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| ledger_error(e, "check confirmation id", wait_ms))?;
        if used {
            return Err(AppError::Conflict(format!(
                "Confirmation {} belongs to another order",
                confirmation_id
            )));
        }

        let account = Self::lock_account(&mut tx, order.account_id, wait_ms).await?;
        let movement = BalanceMovement::credit(account.balance, order.amount)?;
        Self::apply_movement(
            &mut tx,
            order.account_id,
            EntryType::Recharge,
            &movement,
            &order_id.to_string(),
            Some(confirmation_id),
            at,
            wait_ms,
        )
        .await?;

        let sql = format!(
            r#"
            UPDATE recharge_orders
            SET status = 'settled', confirmation_id = $2, settled_at = $3, updated_at = $3
            WHERE id = $1
            RETURNING {}
            "#,
            RECHARGE_COLUMNS
        );
        let settled: RechargeOrder = sqlx::query_as::<sqlx::Postgres, RechargeRow>(&sql)
            .bind(order_id)
            .bind(confirmation_id)
            .bind(at)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::Conflict(format!(
                        "Confirmation {} belongs to another order",
                        confirmation_id
                    ))
                } else {
                    ledger_error(e, "settle recharge order", wait_ms)
                }
            })?
            .into();

        Self::commit(tx).await?;

        info!(
            "Recharge {} settled: account {} balance {} -> {}",
            order_id, settled.account_id, movement.balance_before, movement.balance_after
        );
        Ok(SettlementOutcome::Applied(settled))
    }

    #[instrument(skip(self))]
    async fn complete_refund(
        &self,
        request_id: Uuid,
        reviewer: &str,
        at: DateTime<Utc>,
        lock_wait: std::time::Duration,
    ) -> AppResult<RefundRequest> {
        let wait_ms = lock_wait.as_millis() as u64;
        let mut tx = self.begin(lock_wait).await?;

        let sql = format!("SELECT {} FROM refund_requests WHERE id = $1 FOR UPDATE", REFUND_COLUMNS);
        let request: RefundRequest = sqlx::query_as::<sqlx::Postgres, RefundRow>(&sql)
            .bind(request_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| ledger_error(e, "lock refund request", wait_ms))?
            .map(Into::into)
            .ok_or_else(|| AppError::NotFound(format!("Refund request {}", request_id)))?;

        request.status.ensure_transition(RefundStatus::Completed)?;
        let amount = request.approved_amount.unwrap_or(request.requested_amount);

        let account = Self::lock_account(&mut tx, request.account_id, wait_ms).await?;
        if amount > account.balance {
            return Err(AppError::RefundExceedsBalance {
                requested: amount.round_dp(2).to_string(),
                available: account.balance.round_dp(2).to_string(),
            });
        }
        let movement = BalanceMovement::debit(account.balance, amount)?;
        Self::apply_movement(
            &mut tx,
            request.account_id,
            EntryType::Refund,
            &movement,
            &request_id.to_string(),
            request.reason.as_deref(),
            at,
            wait_ms,
        )
        .await?;

        let sql = format!(
            r#"
            UPDATE refund_requests
            SET status = 'completed', reviewer = $2, completed_at = $3
            WHERE id = $1
            RETURNING {}
            "#,
            REFUND_COLUMNS
        );
        let completed: RefundRequest = sqlx::query_as::<sqlx::Postgres, RefundRow>(&sql)
            .bind(request_id)
            .bind(reviewer)
            .bind(at)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| ledger_error(e, "complete refund request", wait_ms))?
            .into();

        Self::commit(tx).await?;

        info!(
            "Refund {} completed: account {} balance {} -> {}",
            request_id, completed.account_id, movement.balance_before, movement.balance_after
        );
        Ok(completed)
    }

    #[instrument(skip(self))]
    async fn latest_usage_for_key(
        &self,
        account_id: i64,
        business_key: &str,
    ) -> AppResult<Option<UsageRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM usage_records
            WHERE account_id = $1 AND business_key = $2
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
            USAGE_COLUMNS
        );
        let row = sqlx::query_as::<sqlx::Postgres, UsageRow>(&sql)
            .bind(account_id)
            .bind(business_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error looking up usage: {}", e);
                AppError::Database(format!("Failed to look up usage: {}", e))
            })?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn find_usage_by_session(&self, session_id: &str) -> AppResult<Option<UsageRecord>> {
        let sql = format!("SELECT {} FROM usage_records WHERE session_id = $1", USAGE_COLUMNS);
        let row = sqlx::query_as::<sqlx::Postgres, UsageRow>(&sql)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error finding session {}: {}", session_id, e);
                AppError::Database(format!("Failed to find usage record: {}", e))
            })?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn entries_for_account(&self, account_id: i64) -> AppResult<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE account_id = $1 ORDER BY id",
            LEDGER_COLUMNS
        );
        let rows = sqlx::query_as::<sqlx::Postgres, LedgerRow>(&sql)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error listing ledger of {}: {}", account_id, e);
                AppError::Database(format!("Failed to list ledger entries: {}", e))
            })?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self))]
    async fn usage_spend_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<Vec<(i64, Decimal)>> {
        let rows: Vec<(i64, Decimal)> = sqlx::query_as(
            r#"
            SELECT account_id, SUM(-amount)
            FROM ledger_entries
            WHERE entry_type = 'usage' AND created_at >= $1 AND created_at < $2
            GROUP BY account_id
            ORDER BY account_id
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error aggregating usage spend: {}", e);
            AppError::Database(format!("Failed to aggregate usage spend: {}", e))
        })?;

        Ok(rows)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UsageRow {
    id: i64,
    session_id: String,
    authorization_token: Uuid,
    account_id: i64,
    catalog_item_id: i64,
    catalog_item_code: String,
    venue_id: i64,
    party_size: i32,
    business_key: String,
    price_per_participant: Decimal,
    total_cost: Decimal,
    balance_after: Decimal,
    client_timestamp: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<UsageRow> for UsageRecord {
    fn from(row: UsageRow) -> Self {
        Self {
            id: row.id,
            session_id: row.session_id,
            authorization_token: row.authorization_token,
            account_id: row.account_id,
            catalog_item_id: row.catalog_item_id,
            catalog_item_code: row.catalog_item_code,
            venue_id: row.venue_id,
            party_size: row.party_size,
            business_key: row.business_key,
            price_per_participant: row.price_per_participant,
            total_cost: row.total_cost,
            balance_after: row.balance_after,
            client_timestamp: row.client_timestamp,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    id: i64,
    account_id: i64,
    entry_type: String,
    amount: Decimal,
    balance_before: Decimal,
    balance_after: Decimal,
    reference: String,
    description: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<LedgerRow> for LedgerEntry {
    fn from(row: LedgerRow) -> Self {
        Self {
            id: row.id,
            account_id: row.account_id,
            entry_type: EntryType::from_str(&row.entry_type).unwrap_or(EntryType::Usage),
            amount: row.amount,
            balance_before: row.balance_before,
            balance_after: row.balance_after,
            reference: row.reference,
            description: row.description,
            created_at: row.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::create_pool;
    use playmeter_core::models::{BusinessKey, SessionId, VenueId};
    use rust_decimal_macros::dec;

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_commit_usage_replays_within_window() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = create_pool(&url, Some(2)).await.unwrap();
        let store = PgLedgerStore::new(pool);

        let now = Utc::now();
        let draft = UsageDraft {
            key: BusinessKey {
                account_id: 1,
                catalog_item_id: 1,
                venue_id: VenueId(3),
                party_size: 2,
            },
            catalog_item_code: "arena".to_string(),
            price_per_participant: dec!(1.00),
            total_cost: dec!(2.00),
            session_id: SessionId::generate(1, now),
            authorization_token: Uuid::new_v4(),
            client_timestamp: now,
            created_at: now,
        };

        let first = store
            .commit_usage(&draft, Duration::seconds(30), std::time::Duration::from_secs(2))
            .await
            .unwrap();
        let retry = UsageDraft {
            session_id: SessionId::generate(1, now),
            ..draft
        };
        let second = store
            .commit_usage(&retry, Duration::seconds(30), std::time::Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(first.into_outcome().session_id, second.into_outcome().session_id);
    }
}
