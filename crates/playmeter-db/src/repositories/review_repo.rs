//! Refund and invoice request repositories
//!
//! Review decisions are conditional updates on the current status, so two
//! reviewers racing on the same request cannot both succeed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use playmeter_core::{
    models::{
        review::invoice_number, InvoiceRequest, InvoiceStatus, NewInvoiceRequest,
        NewRefundRequest, RefundRequest, RefundStatus, ReviewDecision,
    },
    traits::{InvoiceRepository, RefundRepository},
    AppError, AppResult,
};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{error, info, instrument};
use uuid::Uuid;

pub(crate) const REFUND_COLUMNS: &str = r#"
    id, account_id, requested_amount, approved_amount, balance_snapshot, reason, status,
    reviewer, rejection_reason, created_at, reviewed_at, completed_at
"#;

const INVOICE_COLUMNS: &str = r#"
    id, account_id, amount, balance_snapshot, billing_title, tax_id, status, reviewer,
    rejection_reason, invoice_number, created_at, reviewed_at, issued_at
"#;

/// PostgreSQL implementation of RefundRepository
pub struct PgRefundRepository {
    pool: PgPool,
}

impl PgRefundRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefundRepository for PgRefundRepository {
    #[instrument(skip(self, request), fields(refund_id = %request.id, account_id = request.account_id))]
    async fn create(&self, request: &NewRefundRequest) -> AppResult<RefundRequest> {
        let sql = format!(
            r#"
            INSERT INTO refund_requests (
                id, account_id, requested_amount, balance_snapshot, reason, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, 'pending', $6)
            RETURNING {}
            "#,
            REFUND_COLUMNS
        );
        let row = sqlx::query_as::<sqlx::Postgres, RefundRow>(&sql)
            .bind(request.id)
            .bind(request.account_id)
            .bind(request.requested_amount)
            .bind(request.balance_snapshot)
            .bind(&request.reason)
            .bind(request.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error creating refund request: {}", e);
                AppError::Database(format!("Failed to create refund request: {}", e))
            })?;

        Ok(row.into())
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<RefundRequest>> {
        let sql = format!("SELECT {} FROM refund_requests WHERE id = $1", REFUND_COLUMNS);
        let row = sqlx::query_as::<sqlx::Postgres, RefundRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error finding refund request {}: {}", id, e);
                AppError::Database(format!("Failed to find refund request: {}", e))
            })?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn list(
        &self,
        status: Option<RefundStatus>,
        account_id: Option<i64>,
    ) -> AppResult<Vec<RefundRequest>> {
        let sql = format!(
            r#"
            SELECT {} FROM refund_requests
            WHERE ($1::TEXT IS NULL OR status = $1)
              AND ($2::BIGINT IS NULL OR account_id = $2)
            ORDER BY created_at DESC
            "#,
            REFUND_COLUMNS
        );
        let rows = sqlx::query_as::<sqlx::Postgres, RefundRow>(&sql)
            .bind(status.map(|s| s.to_string()))
            .bind(account_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error listing refund requests: {}", e);
                AppError::Database(format!("Failed to list refund requests: {}", e))
            })?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self, decision), fields(to = %decision.to))]
    async fn review(
        &self,
        id: Uuid,
        decision: &ReviewDecision<RefundStatus>,
    ) -> AppResult<RefundRequest> {
        decision.from.ensure_transition(decision.to)?;

        let sql = format!(
            r#"
            UPDATE refund_requests
            SET status = $3,
                reviewer = $4,
                approved_amount = COALESCE($5, approved_amount),
                rejection_reason = $6,
                reviewed_at = $7
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            REFUND_COLUMNS
        );
        let row = sqlx::query_as::<sqlx::Postgres, RefundRow>(&sql)
            .bind(id)
            .bind(decision.from.to_string())
            .bind(decision.to.to_string())
            .bind(&decision.reviewer)
            .bind(decision.approved_amount)
            .bind(&decision.rejection_reason)
            .bind(decision.at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error reviewing refund request {}: {}", id, e);
                AppError::Database(format!("Failed to update refund request: {}", e))
            })?;

        match row {
            Some(row) => {
                info!("Refund {} {} by {}", id, decision.to, decision.reviewer);
                Ok(row.into())
            }
            None => match self.find_by_id(id).await? {
                Some(current) => Err(AppError::InvalidStateTransition {
                    entity: "refund_request".to_string(),
                    from: current.status.to_string(),
                    to: decision.to.to_string(),
                }),
                None => Err(AppError::NotFound(format!("Refund request {}", id))),
            },
        }
    }
}

/// PostgreSQL implementation of InvoiceRepository
pub struct PgInvoiceRepository {
    pool: PgPool,
}

impl PgInvoiceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn stale_transition(&self, id: Uuid, to: InvoiceStatus) -> AppError {
        match self.find_by_id(id).await {
            Ok(Some(current)) => AppError::InvalidStateTransition {
                entity: "invoice_request".to_string(),
                from: current.status.to_string(),
                to: to.to_string(),
            },
            Ok(None) => AppError::NotFound(format!("Invoice request {}", id)),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl InvoiceRepository for PgInvoiceRepository {
    #[instrument(skip(self, request), fields(invoice_id = %request.id, account_id = request.account_id))]
    async fn create(&self, request: &NewInvoiceRequest) -> AppResult<InvoiceRequest> {
        let sql = format!(
            r#"
            INSERT INTO invoice_requests (
                id, account_id, amount, balance_snapshot, billing_title, tax_id, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7)
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        );
        let row = sqlx::query_as::<sqlx::Postgres, InvoiceRow>(&sql)
            .bind(request.id)
            .bind(request.account_id)
            .bind(request.amount)
            .bind(request.balance_snapshot)
            .bind(&request.billing_title)
            .bind(&request.tax_id)
            .bind(request.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error creating invoice request: {}", e);
                AppError::Database(format!("Failed to create invoice request: {}", e))
            })?;

        Ok(row.into())
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<InvoiceRequest>> {
        let sql = format!("SELECT {} FROM invoice_requests WHERE id = $1", INVOICE_COLUMNS);
        let row = sqlx::query_as::<sqlx::Postgres, InvoiceRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error finding invoice request {}: {}", id, e);
                AppError::Database(format!("Failed to find invoice request: {}", e))
            })?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn list(
        &self,
        status: Option<InvoiceStatus>,
        account_id: Option<i64>,
    ) -> AppResult<Vec<InvoiceRequest>> {
        let sql = format!(
            r#"
            SELECT {} FROM invoice_requests
            WHERE ($1::TEXT IS NULL OR status = $1)
              AND ($2::BIGINT IS NULL OR account_id = $2)
            ORDER BY created_at DESC
            "#,
            INVOICE_COLUMNS
        );
        let rows = sqlx::query_as::<sqlx::Postgres, InvoiceRow>(&sql)
            .bind(status.map(|s| s.to_string()))
            .bind(account_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error listing invoice requests: {}", e);
                AppError::Database(format!("Failed to list invoice requests: {}", e))
            })?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self, decision), fields(to = %decision.to))]
    async fn review(
        &self,
        id: Uuid,
        decision: &ReviewDecision<InvoiceStatus>,
    ) -> AppResult<InvoiceRequest> {
        decision.from.ensure_transition(decision.to)?;

        let sql = format!(
            r#"
            UPDATE invoice_requests
            SET status = $3, reviewer = $4, rejection_reason = $5, reviewed_at = $6
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        );
        let row = sqlx::query_as::<sqlx::Postgres, InvoiceRow>(&sql)
            .bind(id)
            .bind(decision.from.to_string())
            .bind(decision.to.to_string())
            .bind(&decision.reviewer)
            .bind(&decision.rejection_reason)
            .bind(decision.at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error reviewing invoice request {}: {}", id, e);
                AppError::Database(format!("Failed to update invoice request: {}", e))
            })?;

        match row {
            Some(row) => {
                info!("Invoice {} {} by {}", id, decision.to, decision.reviewer);
                Ok(row.into())
            }
            None => Err(self.stale_transition(id, decision.to).await),
        }
    }

    #[instrument(skip(self))]
    async fn issue(&self, id: Uuid, reviewer: &str, at: DateTime<Utc>) -> AppResult<InvoiceRequest> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to start transaction: {}", e);
            AppError::Transaction(format!("Failed to start transaction: {}", e))
        })?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM invoice_requests WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| AppError::Database(format!("Failed to lock invoice request: {}", e)))?;

        let (status,) =
            current.ok_or_else(|| AppError::NotFound(format!("Invoice request {}", id)))?;
        InvoiceStatus::from_str(&status)
            .unwrap_or_default()
            .ensure_transition(InvoiceStatus::Issued)?;

        let (seq,): (i64,) = sqlx::query_as("SELECT nextval('invoice_number_seq')")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| AppError::Database(format!("Failed to allocate invoice number: {}", e)))?;
        let number = invoice_number(at, seq);

        let sql = format!(
            r#"
            UPDATE invoice_requests
            SET status = 'issued', invoice_number = $2, reviewer = $3, issued_at = $4
            WHERE id = $1
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        );
        let row = sqlx::query_as::<sqlx::Postgres, InvoiceRow>(&sql)
            .bind(id)
            .bind(&number)
            .bind(reviewer)
            .bind(at)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                error!("Database error issuing invoice {}: {}", id, e);
                AppError::Database(format!("Failed to issue invoice: {}", e))
            })?;

        tx.commit().await.map_err(|e| {
            error!("Failed to commit transaction: {}", e);
            AppError::Transaction(format!("Failed to commit transaction: {}", e))
        })?;

        info!("Issued invoice {} for request {}", number, id);
        Ok(row.into())
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RefundRow {
    id: Uuid,
    account_id: i64,
    requested_amount: Decimal,
    approved_amount: Option<Decimal>,
    balance_snapshot: Decimal,
    reason: Option<String>,
    status: String,
    reviewer: Option<String>,
    rejection_reason: Option<String>,
    created_at: DateTime<Utc>,
    reviewed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<RefundRow> for RefundRequest {
    fn from(row: RefundRow) -> Self {
        Self {
            id: row.id,
            account_id: row.account_id,
            requested_amount: row.requested_amount,
            approved_amount: row.approved_amount,
            balance_snapshot: row.balance_snapshot,
            reason: row.reason,
            status: RefundStatus::from_str(&row.status).unwrap_or_default(),
            reviewer: row.reviewer,
            rejection_reason: row.rejection_reason,
            created_at: row.created_at,
            reviewed_at: row.reviewed_at,
            completed_at: row.completed_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceRow {
    id: Uuid,
    account_id: i64,
    amount: Decimal,
    balance_snapshot: Decimal,
    billing_title: String,
    tax_id: Option<String>,
    status: String,
    reviewer: Option<String>,
    rejection_reason: Option<String>,
    invoice_number: Option<String>,
    created_at: DateTime<Utc>,
    reviewed_at: Option<DateTime<Utc>>,
    issued_at: Option<DateTime<Utc>>,
}

impl From<InvoiceRow> for InvoiceRequest {
    fn from(row: InvoiceRow) -> Self {
        Self {
            id: row.id,
            account_id: row.account_id,
            amount: row.amount,
            balance_snapshot: row.balance_snapshot,
            billing_title: row.billing_title,
            tax_id: row.tax_id,
            status: InvoiceStatus::from_str(&row.status).unwrap_or_default(),
            reviewer: row.reviewer,
            rejection_reason: row.rejection_reason,
            invoice_number: row.invoice_number,
            created_at: row.created_at,
            reviewed_at: row.reviewed_at,
            issued_at: row.issued_at,
        }
    }
}
