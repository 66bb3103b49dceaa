//! Entitlement checker
//!
//! Read-only: resolves the catalog item (through a short-lived cache),
//! confirms the account holds a valid entitlement for it and that the party
//! size is within the item's bounds.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use playmeter_cache::TtlCache;
use playmeter_core::{
    models::CatalogItem,
    traits::{CatalogRepository, EntitlementRepository},
    AppError, AppResult,
};
use tracing::{debug, instrument, warn};

pub struct EntitlementChecker {
    catalog: Arc<dyn CatalogRepository>,
    entitlements: Arc<dyn EntitlementRepository>,
    items: TtlCache<String, CatalogItem>,
}

impl EntitlementChecker {
    pub fn new(
        catalog: Arc<dyn CatalogRepository>,
        entitlements: Arc<dyn EntitlementRepository>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            catalog,
            entitlements,
            items: TtlCache::new(cache_ttl),
        }
    }

    async fn item(&self, code: &str, now: DateTime<Utc>) -> AppResult<Option<CatalogItem>> {
        let key = code.to_string();
        if let Some(item) = self.items.get(&key, now) {
            debug!("Catalog cache HIT for {}", code);
            return Ok(Some(item));
        }

        let item = self.catalog.find_by_code(code).await?;
        if let Some(item) = &item {
            self.items.insert(key, item.clone(), now);
        }
        Ok(item)
    }

    /// Resolve an active catalog item by code
    pub async fn resolve_item(&self, catalog_item_code: &str, now: DateTime<Utc>) -> AppResult<CatalogItem> {
        self.item(catalog_item_code, now)
            .await?
            .filter(|item| item.active)
            .ok_or_else(|| AppError::AppNotAuthorized(catalog_item_code.to_string()))
    }

    /// Confirm a valid entitlement and the party size bounds for a resolved item
    #[instrument(skip(self, item), fields(catalog_item = %item.code))]
    pub async fn check_item(
        &self,
        account_id: i64,
        item: &CatalogItem,
        party_size: i32,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let entitled = self
            .entitlements
            .find(account_id, item.id)
            .await?
            .is_some_and(|e| e.is_valid_at(now));
        if !entitled {
            warn!("Account {} has no valid entitlement for {}", account_id, item.code);
            return Err(AppError::AppNotAuthorized(item.code.clone()));
        }

        item.check_party_size(party_size)
    }

    /// Return the catalog item the account may bill for this party
    ///
    /// # Errors
    ///
    /// - `AppError::AppNotAuthorized` for unknown or inactive items and
    ///   missing, revoked or expired entitlements
    /// - `AppError::PartySizeOutOfRange` if the party is outside `[min, max]`
    #[instrument(skip(self))]
    pub async fn check(
        &self,
        account_id: i64,
        catalog_item_code: &str,
        party_size: i32,
        now: DateTime<Utc>,
    ) -> AppResult<CatalogItem> {
        let item = self.resolve_item(catalog_item_code, now).await?;
        self.check_item(account_id, &item, party_size, now).await?;
        Ok(item)
    }

    /// Drop a cached catalog item after an administrative change
    pub fn invalidate(&self, catalog_item_code: &str) {
        self.items.invalidate(&catalog_item_code.to_string());
    }
}
