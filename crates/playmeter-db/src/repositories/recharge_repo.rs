//! Recharge order repository implementation
//!
//! Status changes that do not move money (fail, dispute, poll bookkeeping).
//! Settlement credits go through the ledger unit of work.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use playmeter_core::{
    models::{NewRechargeOrder, RechargeOrder, RechargeStatus},
    traits::RechargeRepository,
    AppError, AppResult,
};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub(crate) const RECHARGE_COLUMNS: &str = r#"
    id, account_id, amount, status, gateway_reference, checkout_url, confirmation_id,
    poll_failures, failure_reason, created_at, updated_at, settled_at
"#;

/// PostgreSQL implementation of RechargeRepository
pub struct PgRechargeRepository {
    pool: PgPool,
}

impl PgRechargeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explain why a conditional status update matched no row
    async fn transition_error(&self, id: Uuid, target: RechargeStatus) -> AppError {
        match self.find_by_id(id).await {
            Ok(Some(order)) => order
                .status
                .ensure_transition(target)
                .err()
                .unwrap_or_else(|| AppError::Conflict(format!("Recharge order {} changed concurrently", id))),
            Ok(None) => AppError::NotFound(format!("Recharge order {}", id)),
            Err(e) => e,
        }
    }

    async fn fetch_many(&self, sql: &str, binder: ListFilter) -> AppResult<Vec<RechargeOrder>> {
        let query = sqlx::query_as::<sqlx::Postgres, RechargeRow>(sql);
        let query = match binder {
            ListFilter::Account(account_id) => query.bind(account_id),
            ListFilter::Status(status) => query.bind(status.to_string()),
            ListFilter::Cutoff(cutoff, limit) => query.bind(cutoff).bind(limit),
        };

        let rows = query.fetch_all(&self.pool).await.map_err(|e| {
            error!("Database error listing recharge orders: {}", e);
            AppError::Database(format!("Failed to list recharge orders: {}", e))
        })?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

enum ListFilter {
    Account(i64),
    Status(RechargeStatus),
    Cutoff(DateTime<Utc>, i64),
}

#[async_trait]
impl RechargeRepository for PgRechargeRepository {
    #[instrument(skip(self, order), fields(order_id = %order.id, account_id = order.account_id))]
    async fn create(&self, order: &NewRechargeOrder) -> AppResult<RechargeOrder> {
        let sql = format!(
            r#"
            INSERT INTO recharge_orders (
                id, account_id, amount, status, gateway_reference, checkout_url,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, 'pending', $4, $5, $6, $6)
            RETURNING {}
            "#,
            RECHARGE_COLUMNS
        );
        let row = sqlx::query_as::<sqlx::Postgres, RechargeRow>(&sql)
            .bind(order.id)
            .bind(order.account_id)
            .bind(order.amount)
            .bind(&order.gateway_reference)
            .bind(&order.checkout_url)
            .bind(order.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error creating recharge order: {}", e);
                AppError::Database(format!("Failed to create recharge order: {}", e))
            })?;

        info!("Recharge order {} pending for {}", order.id, order.amount);
        Ok(row.into())
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<RechargeOrder>> {
        let sql = format!("SELECT {} FROM recharge_orders WHERE id = $1", RECHARGE_COLUMNS);
        let row = sqlx::query_as::<sqlx::Postgres, RechargeRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error finding recharge order {}: {}", id, e);
                AppError::Database(format!("Failed to find recharge order: {}", e))
            })?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn list_by_account(&self, account_id: i64) -> AppResult<Vec<RechargeOrder>> {
        let sql = format!(
            "SELECT {} FROM recharge_orders WHERE account_id = $1 ORDER BY created_at DESC",
            RECHARGE_COLUMNS
        );
        self.fetch_many(&sql, ListFilter::Account(account_id)).await
    }

    #[instrument(skip(self))]
    async fn list_by_status(&self, status: RechargeStatus) -> AppResult<Vec<RechargeOrder>> {
        let sql = format!(
            "SELECT {} FROM recharge_orders WHERE status = $1 ORDER BY created_at",
            RECHARGE_COLUMNS
        );
        self.fetch_many(&sql, ListFilter::Status(status)).await
    }

    #[instrument(skip(self))]
    async fn list_awaiting_poll(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<RechargeOrder>> {
        let sql = format!(
            r#"
            SELECT {} FROM recharge_orders
            WHERE status = 'pending' AND created_at <= $1
            ORDER BY created_at
            LIMIT $2
            "#,
            RECHARGE_COLUMNS
        );
        self.fetch_many(&sql, ListFilter::Cutoff(cutoff, limit)).await
    }

    #[instrument(skip(self))]
    async fn mark_failed(&self, id: Uuid, reason: &str, at: DateTime<Utc>) -> AppResult<RechargeOrder> {
        let sql = format!(
            r#"
            UPDATE recharge_orders
            SET status = 'failed', failure_reason = $2, updated_at = $3
            WHERE id = $1 AND status IN ('pending', 'disputed')
            RETURNING {}
            "#,
            RECHARGE_COLUMNS
        );
        let row = sqlx::query_as::<sqlx::Postgres, RechargeRow>(&sql)
            .bind(id)
            .bind(reason)
            .bind(at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error failing recharge order {}: {}", id, e);
                AppError::Database(format!("Failed to update recharge order: {}", e))
            })?;

        match row {
            Some(row) => {
                info!("Recharge order {} failed: {}", id, reason);
                Ok(row.into())
            }
            None => Err(self.transition_error(id, RechargeStatus::Failed).await),
        }
    }

    #[instrument(skip(self))]
    async fn mark_disputed(
        &self,
        id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> AppResult<RechargeOrder> {
        let sql = format!(
            r#"
            UPDATE recharge_orders
            SET status = 'disputed', failure_reason = $2, updated_at = $3
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            RECHARGE_COLUMNS
        );
        let row = sqlx::query_as::<sqlx::Postgres, RechargeRow>(&sql)
            .bind(id)
            .bind(reason)
            .bind(at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error disputing recharge order {}: {}", id, e);
                AppError::Database(format!("Failed to update recharge order: {}", e))
            })?;

        match row {
            Some(row) => {
                warn!("Recharge order {} disputed: {}", id, reason);
                Ok(row.into())
            }
            None => Err(self.transition_error(id, RechargeStatus::Disputed).await),
        }
    }

    #[instrument(skip(self))]
    async fn record_poll_failure(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<RechargeOrder> {
        let sql = format!(
            r#"
            UPDATE recharge_orders
            SET poll_failures = poll_failures + 1, updated_at = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            RECHARGE_COLUMNS
        );
        let row = sqlx::query_as::<sqlx::Postgres, RechargeRow>(&sql)
            .bind(id)
            .bind(at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error recording poll failure for {}: {}", id, e);
                AppError::Database(format!("Failed to update recharge order: {}", e))
            })?;

        match row {
            Some(row) => Ok(row.into()),
            None => Err(self.transition_error(id, RechargeStatus::Pending).await),
        }
    }

    #[instrument(skip(self))]
    async fn reset_poll_failures(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE recharge_orders
            SET poll_failures = 0, updated_at = $2
            WHERE id = $1 AND status = 'pending' AND poll_failures > 0
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error resetting poll failures for {}: {}", id, e);
            AppError::Database(format!("Failed to update recharge order: {}", e))
        })?;

        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RechargeRow {
    id: Uuid,
    account_id: i64,
    amount: Decimal,
    status: String,
    gateway_reference: String,
    checkout_url: Option<String>,
    confirmation_id: Option<String>,
    poll_failures: i32,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    settled_at: Option<DateTime<Utc>>,
}

impl From<RechargeRow> for RechargeOrder {
    fn from(row: RechargeRow) -> Self {
        Self {
            id: row.id,
            account_id: row.account_id,
            amount: row.amount,
            status: RechargeStatus::from_str(&row.status).unwrap_or_default(),
            gateway_reference: row.gateway_reference,
            checkout_url: row.checkout_url,
            confirmation_id: row.confirmation_id,
            poll_failures: row.poll_failures,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
            settled_at: row.settled_at,
        }
    }
}
