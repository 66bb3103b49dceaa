//! Tier change repository implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use playmeter_core::{
    models::{NewTierChange, Tier, TierChange},
    traits::TierRepository,
    AppError, AppResult,
};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{debug, error, info, instrument};

const TIER_CHANGE_COLUMNS: &str =
    "id, account_id, period, previous_tier, new_tier, spend, created_at";

/// PostgreSQL implementation of TierRepository
pub struct PgTierRepository {
    pool: PgPool,
}

impl PgTierRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TierRepository for PgTierRepository {
    #[instrument(skip(self, change), fields(account_id = change.account_id, period = %change.period))]
    async fn record_change(&self, change: &NewTierChange) -> AppResult<Option<TierChange>> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to start transaction: {}", e);
            AppError::Transaction(format!("Failed to start transaction: {}", e))
        })?;

        let sql = format!(
            r#"
            INSERT INTO tier_changes (account_id, period, previous_tier, new_tier, spend, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (account_id, period) DO UPDATE
                SET new_tier = EXCLUDED.new_tier,
                    spend = EXCLUDED.spend,
                    created_at = EXCLUDED.created_at
                WHERE tier_changes.new_tier <> EXCLUDED.new_tier
            RETURNING {}
            "#,
            TIER_CHANGE_COLUMNS
        );
        let inserted = sqlx::query_as::<sqlx::Postgres, TierChangeRow>(&sql)
            .bind(change.account_id)
            .bind(change.period.to_string())
            .bind(change.previous_tier.to_string())
            .bind(change.new_tier.to_string())
            .bind(change.spend)
            .bind(change.created_at)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| {
                error!("Database error recording tier change: {}", e);
                AppError::Database(format!("Failed to record tier change: {}", e))
            })?;

        let Some(row) = inserted else {
            debug!("Tier for this period already recorded");
            return Ok(None);
        };

        sqlx::query("UPDATE accounts SET tier = $2, updated_at = $3 WHERE id = $1")
            .bind(change.account_id)
            .bind(change.new_tier.to_string())
            .bind(change.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("Database error updating tier of account {}: {}", change.account_id, e);
                AppError::Database(format!("Failed to update account tier: {}", e))
            })?;

        tx.commit().await.map_err(|e| {
            error!("Failed to commit transaction: {}", e);
            AppError::Transaction(format!("Failed to commit transaction: {}", e))
        })?;

        info!(
            "Account {} moved {} -> {} for {}",
            change.account_id, change.previous_tier, change.new_tier, change.period
        );
        Ok(Some(row.into()))
    }

    #[instrument(skip(self))]
    async fn list_changes(&self, period: Option<&str>) -> AppResult<Vec<TierChange>> {
        let sql = format!(
            r#"
            SELECT {} FROM tier_changes
            WHERE ($1::TEXT IS NULL OR period = $1)
            ORDER BY created_at DESC, id DESC
            "#,
            TIER_CHANGE_COLUMNS
        );
        let rows = sqlx::query_as::<sqlx::Postgres, TierChangeRow>(&sql)
            .bind(period)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error listing tier changes: {}", e);
                AppError::Database(format!("Failed to list tier changes: {}", e))
            })?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TierChangeRow {
    id: i64,
    account_id: i64,
    period: String,
    previous_tier: String,
    new_tier: String,
    spend: Decimal,
    created_at: DateTime<Utc>,
}

impl From<TierChangeRow> for TierChange {
    fn from(row: TierChangeRow) -> Self {
        Self {
            id: row.id,
            account_id: row.account_id,
            period: row.period,
            previous_tier: Tier::from_str(&row.previous_tier).unwrap_or_default(),
            new_tier: Tier::from_str(&row.new_tier).unwrap_or_default(),
            spend: row.spend,
            created_at: row.created_at,
        }
    }
}
