//! Audit log repository implementation
//!
//! Provides PostgreSQL-backed storage for audit logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use playmeter_core::{
    models::{AuditLog, AuditLogData},
    traits::AuditRepository,
    AppError, AppResult,
};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

/// PostgreSQL implementation of AuditRepository
pub struct PgAuditRepository {
    pool: PgPool,
}

impl PgAuditRepository {
    /// Create a new audit log repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditRepository for PgAuditRepository {
    #[instrument(skip(self, data))]
    async fn insert(&self, data: &AuditLogData, at: DateTime<Utc>) -> AppResult<()> {
        debug!("Creating audit log: {} on {}", data.action, data.entity_type);

        sqlx::query(
            r#"
            INSERT INTO audit_logs (
                user_id, username, action, entity_type,
                entity_id, details, ip_address, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(data.user_id)
        .bind(&data.username)
        .bind(&data.action)
        .bind(&data.entity_type)
        .bind(&data.entity_id)
        .bind(&data.details)
        .bind(&data.ip_address)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error creating audit log: {}", e);
            AppError::Database(format!("Failed to create audit log: {}", e))
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list(&self, limit: i64, offset: i64) -> AppResult<Vec<AuditLog>> {
        let logs = sqlx::query(
            r#"
            SELECT
                id, user_id, username, action, entity_type,
                entity_id, details, ip_address, created_at
            FROM audit_logs
            ORDER BY created_at DESC, id DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .map(|row: sqlx::postgres::PgRow| AuditLog {
            id: row.get("id"),
            user_id: row.get("user_id"),
            username: row.get("username"),
            action: row.get("action"),
            entity_type: row.get("entity_type"),
            entity_id: row.get("entity_id"),
            details: row.get("details"),
            ip_address: row.get("ip_address"),
            created_at: row.get("created_at"),
        })
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error listing audit logs: {}", e);
            AppError::Database(format!("Failed to list audit logs: {}", e))
        })?;

        Ok(logs)
    }
}
