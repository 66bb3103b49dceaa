//! Account repository implementation
//!
//! PostgreSQL-backed storage for accounts. Balance changes are not made here;
//! they go through the ledger unit of work in [`crate::ledger`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use playmeter_core::{
    models::{Account, NewAccount, Tier},
    traits::AccountRepository,
    AppError, AppResult,
};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{debug, error, info, instrument, warn};

use crate::pg_error::is_unique_violation;

pub(crate) const ACCOUNT_COLUMNS: &str = r#"
    id, name, access_key, secret_digest, balance, opening_balance, tier,
    locked, lock_reason, locked_at, active, created_at, updated_at, deactivated_at
"#;

/// PostgreSQL implementation of AccountRepository
pub struct PgAccountRepository {
    pool: PgPool,
}

impl PgAccountRepository {
    /// Create a new account repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountRepository for PgAccountRepository {
    #[instrument(skip(self))]
    async fn find_by_id(&self, id: i64) -> AppResult<Option<Account>> {
        debug!("Finding account by id: {}", id);

        let sql = format!("SELECT {} FROM accounts WHERE id = $1", ACCOUNT_COLUMNS);
        let result = sqlx::query_as::<sqlx::Postgres, AccountRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error finding account {}: {}", id, e);
                AppError::Database(format!("Failed to find account: {}", e))
            })?;

        Ok(result.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn find_by_access_key(&self, access_key: &str) -> AppResult<Option<Account>> {
        debug!("Finding account by access key");

        let sql = format!(
            "SELECT {} FROM accounts WHERE access_key = $1",
            ACCOUNT_COLUMNS
        );
        let result = sqlx::query_as::<sqlx::Postgres, AccountRow>(&sql)
            .bind(access_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error finding account by access key: {}", e);
                AppError::Database(format!("Failed to find account: {}", e))
            })?;

        Ok(result.map(Into::into))
    }

    #[instrument(skip(self, account), fields(name = %account.name))]
    async fn create(&self, account: &NewAccount, at: DateTime<Utc>) -> AppResult<Account> {
        let sql = format!(
            r#"
            INSERT INTO accounts (
                name, access_key, secret_digest, balance, opening_balance,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $4, $5, $5)
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        );

        let row = sqlx::query_as::<sqlx::Postgres, AccountRow>(&sql)
            .bind(&account.name)
            .bind(&account.access_key)
            .bind(&account.secret_digest)
            .bind(account.opening_balance)
            .bind(at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::AlreadyExists("Access key already issued".to_string())
                } else {
                    error!("Database error creating account: {}", e);
                    AppError::Database(format!("Failed to create account: {}", e))
                }
            })?;

        info!("Registered account {}", row.id);
        Ok(row.into())
    }

    #[instrument(skip(self))]
    async fn list(&self, limit: i64, offset: i64) -> AppResult<(Vec<Account>, i64)> {
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM accounts")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error counting accounts: {}", e);
                AppError::Database(format!("Failed to count accounts: {}", e))
            })?;

        let sql = format!(
            "SELECT {} FROM accounts ORDER BY id LIMIT $1 OFFSET $2",
            ACCOUNT_COLUMNS
        );
        let rows = sqlx::query_as::<sqlx::Postgres, AccountRow>(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error listing accounts: {}", e);
                AppError::Database(format!("Failed to fetch accounts: {}", e))
            })?;

        Ok((rows.into_iter().map(Into::into).collect(), total.0))
    }

    #[instrument(skip(self))]
    async fn list_active(&self) -> AppResult<Vec<Account>> {
        let sql = format!(
            "SELECT {} FROM accounts WHERE active ORDER BY id",
            ACCOUNT_COLUMNS
        );
        let rows = sqlx::query_as::<sqlx::Postgres, AccountRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error listing active accounts: {}", e);
                AppError::Database(format!("Failed to fetch accounts: {}", e))
            })?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self))]
    async fn lock(&self, id: i64, reason: &str, at: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET locked = TRUE,
                lock_reason = $2,
                locked_at = $3,
                updated_at = $3
            WHERE id = $1 AND NOT locked
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error locking account {}: {}", id, e);
            AppError::Database(format!("Failed to lock account: {}", e))
        })?;

        let locked = result.rows_affected() > 0;
        if locked {
            warn!("Account {} locked: {}", id, reason);
        }
        Ok(locked)
    }

    #[instrument(skip(self))]
    async fn unlock(&self, id: i64, at: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET locked = FALSE,
                lock_reason = NULL,
                locked_at = NULL,
                updated_at = $2
            WHERE id = $1 AND locked
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error unlocking account {}: {}", id, e);
            AppError::Database(format!("Failed to unlock account: {}", e))
        })?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn deactivate(&self, id: i64, at: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET active = FALSE,
                deactivated_at = $2,
                updated_at = $2
            WHERE id = $1 AND active
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error deactivating account {}: {}", id, e);
            AppError::Database(format!("Failed to deactivate account: {}", e))
        })?;

        Ok(result.rows_affected() > 0)
    }
}

/// Helper struct for mapping database rows
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct AccountRow {
    id: i64,
    name: String,
    access_key: String,
    secret_digest: String,
    pub(crate) balance: Decimal,
    opening_balance: Decimal,
    tier: String,
    locked: bool,
    lock_reason: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deactivated_at: Option<DateTime<Utc>>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            access_key: row.access_key,
            secret_digest: row.secret_digest,
            balance: row.balance,
            opening_balance: row.opening_balance,
            tier: Tier::from_str(&row.tier).unwrap_or_default(),
            locked: row.locked,
            lock_reason: row.lock_reason,
            locked_at: row.locked_at,
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deactivated_at: row.deactivated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_row_conversion_defaults_unknown_tier() {
        let now = Utc::now();
        let row = AccountRow {
            id: 1,
            name: "Arena One".to_string(),
            access_key: "pk_x".to_string(),
            secret_digest: "d".to_string(),
            balance: dec!(100.00),
            opening_balance: dec!(100.00),
            tier: "platinum".to_string(),
            locked: false,
            lock_reason: None,
            locked_at: None,
            active: true,
            created_at: now,
            updated_at: now,
            deactivated_at: None,
        };

        let account: Account = row.into();
        assert_eq!(account.tier, Tier::Standard);
        assert_eq!(account.balance, dec!(100.00));
    }
}
