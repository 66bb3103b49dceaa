//! Session telemetry repository implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use playmeter_core::{
    models::SessionTelemetry, traits::TelemetryRepository, AppError, AppResult,
};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tracing::{debug, error, instrument};

/// PostgreSQL implementation of TelemetryRepository
pub struct PgTelemetryRepository {
    pool: PgPool,
}

impl PgTelemetryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TelemetryRepository for PgTelemetryRepository {
    #[instrument(skip(self, payload))]
    async fn upsert(
        &self,
        session_id: &str,
        account_id: i64,
        payload: &JsonValue,
        at: DateTime<Utc>,
    ) -> AppResult<SessionTelemetry> {
        let row = sqlx::query_as::<sqlx::Postgres, TelemetryRow>(
            r#"
            INSERT INTO session_telemetry (
                session_id, account_id, payload, upload_count, first_uploaded_at, updated_at
            )
            VALUES ($1, $2, $3, 1, $4, $4)
            ON CONFLICT (session_id) DO UPDATE
            SET payload = EXCLUDED.payload,
                upload_count = session_telemetry.upload_count + 1,
                updated_at = EXCLUDED.updated_at
            RETURNING session_id, account_id, payload, upload_count, first_uploaded_at, updated_at
            "#,
        )
        .bind(session_id)
        .bind(account_id)
        .bind(payload)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error storing telemetry for {}: {}", session_id, e);
            AppError::Database(format!("Failed to store telemetry: {}", e))
        })?;

        debug!("Telemetry upload #{} for {}", row.upload_count, session_id);
        Ok(row.into())
    }

    #[instrument(skip(self))]
    async fn find(&self, session_id: &str) -> AppResult<Option<SessionTelemetry>> {
        let row = sqlx::query_as::<sqlx::Postgres, TelemetryRow>(
            r#"
            SELECT session_id, account_id, payload, upload_count, first_uploaded_at, updated_at
            FROM session_telemetry
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error finding telemetry for {}: {}", session_id, e);
            AppError::Database(format!("Failed to find telemetry: {}", e))
        })?;

        Ok(row.map(Into::into))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TelemetryRow {
    session_id: String,
    account_id: i64,
    payload: JsonValue,
    upload_count: i32,
    first_uploaded_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<TelemetryRow> for SessionTelemetry {
    fn from(row: TelemetryRow) -> Self {
        Self {
            session_id: row.session_id,
            account_id: row.account_id,
            payload: row.payload,
            upload_count: row.upload_count,
            first_uploaded_at: row.first_uploaded_at,
            updated_at: row.updated_at,
        }
    }
}
