//! Engine policy backed by the `engine_settings` table
//!
//! Rows override the configured base policy key by key, so operators can
//! tune windows and thresholds without a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use playmeter_core::{traits::PolicySource, AppError, AppResult, EnginePolicy};
use sqlx::PgPool;
use tracing::{error, info, instrument};

/// PostgreSQL implementation of PolicySource
pub struct PgPolicySource {
    pool: PgPool,
    base: EnginePolicy,
}

impl PgPolicySource {
    pub fn new(pool: PgPool, base: EnginePolicy) -> Self {
        Self { pool, base }
    }

    /// Store or replace a single setting
    #[instrument(skip(self))]
    pub async fn put(&self, key: &str, value: &str, at: DateTime<Utc>) -> AppResult<()> {
        // Reject values the policy cannot parse before they reach the table
        let mut candidate = self.base.clone();
        candidate.apply_overrides([(key, value)])?;

        sqlx::query(
            r#"
            INSERT INTO engine_settings (key, value, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error storing setting {}: {}", key, e);
            AppError::Database(format!("Failed to store setting: {}", e))
        })?;

        info!("Engine setting {} = {}", key, value);
        Ok(())
    }
}

#[async_trait]
impl PolicySource for PgPolicySource {
    #[instrument(skip(self))]
    async fn load(&self) -> AppResult<EnginePolicy> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM engine_settings ORDER BY key")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    error!("Database error loading engine settings: {}", e);
                    AppError::Database(format!("Failed to load engine settings: {}", e))
                })?;

        let mut policy = self.base.clone();
        policy.apply_overrides(rows.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
        Ok(policy)
    }
}
