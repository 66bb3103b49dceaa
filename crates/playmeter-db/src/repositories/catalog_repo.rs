//! Catalog item and entitlement repositories

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use playmeter_core::{
    models::{CatalogItem, Entitlement, NewCatalogItem},
    traits::{CatalogRepository, EntitlementRepository},
    AppError, AppResult,
};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{debug, error, info, instrument};

use crate::pg_error::is_unique_violation;

const CATALOG_COLUMNS: &str = r#"
    id, code, name, price_per_participant, min_party_size, max_party_size,
    active, created_at, updated_at
"#;

const ENTITLEMENT_COLUMNS: &str =
    "id, account_id, catalog_item_id, active, expires_at, granted_at, revoked_at";

/// PostgreSQL implementation of CatalogRepository
pub struct PgCatalogRepository {
    pool: PgPool,
}

impl PgCatalogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogRepository for PgCatalogRepository {
    #[instrument(skip(self))]
    async fn find_by_id(&self, id: i64) -> AppResult<Option<CatalogItem>> {
        let sql = format!("SELECT {} FROM catalog_items WHERE id = $1", CATALOG_COLUMNS);
        let row = sqlx::query_as::<sqlx::Postgres, CatalogRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error finding catalog item {}: {}", id, e);
                AppError::Database(format!("Failed to find catalog item: {}", e))
            })?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn find_by_code(&self, code: &str) -> AppResult<Option<CatalogItem>> {
        debug!("Finding catalog item by code: {}", code);

        let sql = format!(
            "SELECT {} FROM catalog_items WHERE code = $1",
            CATALOG_COLUMNS
        );
        let row = sqlx::query_as::<sqlx::Postgres, CatalogRow>(&sql)
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error finding catalog item {}: {}", code, e);
                AppError::Database(format!("Failed to find catalog item: {}", e))
            })?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self, item), fields(code = %item.code))]
    async fn create(&self, item: &NewCatalogItem, at: DateTime<Utc>) -> AppResult<CatalogItem> {
        item.validate()?;

        let sql = format!(
            r#"
            INSERT INTO catalog_items (
                code, name, price_per_participant, min_party_size, max_party_size,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            RETURNING {}
            "#,
            CATALOG_COLUMNS
        );
        let row = sqlx::query_as::<sqlx::Postgres, CatalogRow>(&sql)
            .bind(&item.code)
            .bind(&item.name)
            .bind(item.price_per_participant)
            .bind(item.min_party_size)
            .bind(item.max_party_size)
            .bind(at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::AlreadyExists(format!("Catalog item {} already exists", item.code))
                } else {
                    error!("Database error creating catalog item: {}", e);
                    AppError::Database(format!("Failed to create catalog item: {}", e))
                }
            })?;

        info!("Created catalog item {}", item.code);
        Ok(row.into())
    }

    #[instrument(skip(self))]
    async fn set_active(&self, id: i64, active: bool, at: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE catalog_items SET active = $2, updated_at = $3 WHERE id = $1 AND active <> $2",
        )
        .bind(id)
        .bind(active)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error updating catalog item {}: {}", id, e);
            AppError::Database(format!("Failed to update catalog item: {}", e))
        })?;

        Ok(result.rows_affected() > 0)
    }
}

/// PostgreSQL implementation of EntitlementRepository
pub struct PgEntitlementRepository {
    pool: PgPool,
}

impl PgEntitlementRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntitlementRepository for PgEntitlementRepository {
    #[instrument(skip(self))]
    async fn find(&self, account_id: i64, catalog_item_id: i64) -> AppResult<Option<Entitlement>> {
        let sql = format!(
            "SELECT {} FROM entitlements WHERE account_id = $1 AND catalog_item_id = $2",
            ENTITLEMENT_COLUMNS
        );
        let row = sqlx::query_as::<sqlx::Postgres, EntitlementRow>(&sql)
            .bind(account_id)
            .bind(catalog_item_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error finding entitlement: {}", e);
                AppError::Database(format!("Failed to find entitlement: {}", e))
            })?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn grant(
        &self,
        account_id: i64,
        catalog_item_id: i64,
        expires_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> AppResult<Entitlement> {
        let sql = format!(
            r#"
            INSERT INTO entitlements (account_id, catalog_item_id, active, expires_at, granted_at)
            VALUES ($1, $2, TRUE, $3, $4)
            ON CONFLICT (account_id, catalog_item_id) DO UPDATE
            SET active = TRUE,
                expires_at = EXCLUDED.expires_at,
                granted_at = EXCLUDED.granted_at,
                revoked_at = NULL
            RETURNING {}
            "#,
            ENTITLEMENT_COLUMNS
        );
        let row = sqlx::query_as::<sqlx::Postgres, EntitlementRow>(&sql)
            .bind(account_id)
            .bind(catalog_item_id)
            .bind(expires_at)
            .bind(at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error granting entitlement: {}", e);
                AppError::Database(format!("Failed to grant entitlement: {}", e))
            })?;

        info!(
            "Granted catalog item {} to account {}",
            catalog_item_id, account_id
        );
        Ok(row.into())
    }

    #[instrument(skip(self))]
    async fn revoke(&self, account_id: i64, catalog_item_id: i64, at: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE entitlements
            SET active = FALSE, revoked_at = $3
            WHERE account_id = $1 AND catalog_item_id = $2 AND active
            "#,
        )
        .bind(account_id)
        .bind(catalog_item_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error revoking entitlement: {}", e);
            AppError::Database(format!("Failed to revoke entitlement: {}", e))
        })?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn count_active_for_item(&self, catalog_item_id: i64) -> AppResult<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM entitlements WHERE catalog_item_id = $1 AND active",
        )
        .bind(catalog_item_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error counting entitlements: {}", e);
            AppError::Database(format!("Failed to count entitlements: {}", e))
        })?;

        Ok(count.0)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CatalogRow {
    id: i64,
    code: String,
    name: String,
    price_per_participant: Decimal,
    min_party_size: i32,
    max_party_size: i32,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<CatalogRow> for CatalogItem {
    fn from(row: CatalogRow) -> Self {
        Self {
            id: row.id,
            code: row.code,
            name: row.name,
            price_per_participant: row.price_per_participant,
            min_party_size: row.min_party_size,
            max_party_size: row.max_party_size,
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EntitlementRow {
    id: i64,
    account_id: i64,
    catalog_item_id: i64,
    active: bool,
    expires_at: Option<DateTime<Utc>>,
    granted_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
}

impl From<EntitlementRow> for Entitlement {
    fn from(row: EntitlementRow) -> Self {
        Self {
            id: row.id,
            account_id: row.account_id,
            catalog_item_id: row.catalog_item_id,
            active: row.active,
            expires_at: row.expires_at,
            granted_at: row.granted_at,
            revoked_at: row.revoked_at,
        }
    }
}
