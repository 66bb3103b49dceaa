//! Catalog items and entitlements

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::AppResult;

/// A billable game experience
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: i64,

    /// Code devices put in `catalog_item_code`
    pub code: String,

    pub name: String,

    /// Price charged per participant
    pub price_per_participant: Decimal,

    pub min_party_size: i32,
    pub max_party_size: i32,

    pub active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CatalogItem {
    /// Validate a requested party size against the configured bounds
    pub fn check_party_size(&self, party_size: i32) -> AppResult<()> {
        if party_size < self.min_party_size || party_size > self.max_party_size {
            return Err(AppError::PartySizeOutOfRange {
                requested: party_size,
                min: self.min_party_size,
                max: self.max_party_size,
            });
        }
        Ok(())
    }

    /// Total cost for a party at the current price
    pub fn total_for(&self, party_size: i32) -> Decimal {
        (self.price_per_participant * Decimal::from(party_size)).round_dp(2)
    }
}

impl Default for CatalogItem {
    fn default() -> Self {
        Self {
            id: 0,
            code: String::new(),
            name: String::new(),
            price_per_participant: Decimal::ZERO,
            min_party_size: 1,
            max_party_size: 1,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

/// Data for creating a catalog item
#[derive(Debug, Clone)]
pub struct NewCatalogItem {
    pub code: String,
    pub name: String,
    pub price_per_participant: Decimal,
    pub min_party_size: i32,
    pub max_party_size: i32,
}

impl NewCatalogItem {
    pub fn validate(&self) -> AppResult<()> {
        if self.code.trim().is_empty() {
            return Err(AppError::invalid_field("code", "must not be empty"));
        }
        if self.price_per_participant < Decimal::ZERO {
            return Err(AppError::invalid_field(
                "price_per_participant",
                "must not be negative",
            ));
        }
        if self.min_party_size < 1 || self.max_party_size < self.min_party_size {
            return Err(AppError::invalid_field(
                "max_party_size",
                "party size bounds must satisfy 1 <= min <= max",
            ));
        }
        Ok(())
    }
}

/// Permission for an account to bill a catalog item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entitlement {
    pub id: i64,
    pub account_id: i64,
    pub catalog_item_id: i64,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub granted_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Entitlement {
    /// Active and not yet expired at `now`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.map_or(true, |exp| exp > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn item() -> CatalogItem {
        CatalogItem {
            code: "ZOMBIE_RUSH".to_string(),
            price_per_participant: dec!(10.00),
            min_party_size: 1,
            max_party_size: 8,
            ..Default::default()
        }
    }

    #[test]
    fn test_total_for_party() {
        assert_eq!(item().total_for(5), dec!(50.00));
        assert_eq!(item().total_for(8), dec!(80.00));
    }

    #[test]
    fn test_party_size_bounds() {
        let item = item();
        assert!(item.check_party_size(1).is_ok());
        assert!(item.check_party_size(8).is_ok());
        assert_eq!(
            item.check_party_size(9),
            Err(AppError::PartySizeOutOfRange {
                requested: 9,
                min: 1,
                max: 8
            })
        );
        assert!(item.check_party_size(0).is_err());
    }

    #[test]
    fn test_entitlement_expiry() {
        let now = Utc::now();
        let mut entitlement = Entitlement {
            id: 1,
            account_id: 1,
            catalog_item_id: 1,
            active: true,
            expires_at: Some(now + Duration::days(1)),
            granted_at: now,
            revoked_at: None,
        };
        assert!(entitlement.is_valid_at(now));
        assert!(!entitlement.is_valid_at(now + Duration::days(2)));

        entitlement.expires_at = None;
        entitlement.active = false;
        assert!(!entitlement.is_valid_at(now));
    }

    #[test]
    fn test_new_catalog_item_validation() {
        let mut new_item = NewCatalogItem {
            code: "X".to_string(),
            name: "X".to_string(),
            price_per_participant: dec!(5),
            min_party_size: 2,
            max_party_size: 1,
        };
        assert!(new_item.validate().is_err());
        new_item.max_party_size = 4;
        assert!(new_item.validate().is_ok());
    }
}
