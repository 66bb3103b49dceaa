//! Account administration DTOs
//!
//! Request and response types for account, catalog and entitlement
//! management.

use chrono::{DateTime, Utc};
use playmeter_core::models::{Account, LedgerEntry, NewCatalogItem, Tier};
use playmeter_services::{AccountStatement, RegisteredAccount};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Account registration request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AccountRegisterRequest {
    /// Display name of the venue operator
    #[validate(length(min = 1, max = 200, message = "Name is required"))]
    pub name: String,

    #[serde(default)]
    pub opening_balance: Decimal,
}

/// Account response
#[derive(Debug, Clone, Serialize)]
pub struct AccountResponse {
    pub id: i64,
    pub name: String,
    pub access_key: String,
    pub balance: Decimal,
    pub opening_balance: Decimal,
    pub tier: Tier,
    pub locked: bool,
    pub lock_reason: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Account> for AccountResponse {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            name: account.name,
            access_key: account.access_key,
            balance: account.balance,
            opening_balance: account.opening_balance,
            tier: account.tier,
            locked: account.locked,
            lock_reason: account.lock_reason,
            active: account.active,
            created_at: account.created_at,
            updated_at: account.updated_at,
        }
    }
}

/// Newly registered account with its one-time secret
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredAccountResponse {
    pub account: AccountResponse,
    pub access_key: String,
    /// Shown once; only its digest is stored
    pub secret: String,
}

impl From<RegisteredAccount> for RegisteredAccountResponse {
    fn from(registered: RegisteredAccount) -> Self {
        Self {
            account: registered.account.into(),
            access_key: registered.access_key,
            secret: registered.secret,
        }
    }
}

/// Account statement: ledger entries plus the reconciliation check
#[derive(Debug, Clone, Serialize)]
pub struct StatementResponse {
    pub account: AccountResponse,
    pub entries: Vec<LedgerEntry>,
    pub reconciled: bool,
}

impl From<AccountStatement> for StatementResponse {
    fn from(statement: AccountStatement) -> Self {
        Self {
            account: statement.account.into(),
            entries: statement.entries,
            reconciled: statement.reconciled,
        }
    }
}

/// Catalog item creation request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CatalogItemCreateRequest {
    #[validate(length(min = 1, max = 64, message = "Code is required"))]
    pub code: String,

    #[validate(length(min = 1, max = 200, message = "Name is required"))]
    pub name: String,

    pub price_per_participant: Decimal,

    #[serde(default = "default_min_party")]
    #[validate(range(min = 1))]
    pub min_party_size: i32,

    #[validate(range(min = 1))]
    pub max_party_size: i32,
}

fn default_min_party() -> i32 {
    1
}

impl CatalogItemCreateRequest {
    pub fn to_new_item(&self) -> NewCatalogItem {
        NewCatalogItem {
            code: self.code.trim().to_string(),
            name: self.name.trim().to_string(),
            price_per_participant: self.price_per_participant,
            min_party_size: self.min_party_size,
            max_party_size: self.max_party_size,
        }
    }
}

/// Catalog item activation toggle
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogStatusRequest {
    pub active: bool,
}

/// Entitlement grant request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct EntitlementGrantRequest {
    #[validate(length(min = 1, message = "Catalog item code is required"))]
    pub catalog_item_code: String,

    /// Never expires when absent
    pub expires_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_register_request_validation() {
        let request: AccountRegisterRequest = serde_json::from_value(serde_json::json!({
            "name": "arena-east",
            "opening_balance": "100.00"
        }))
        .unwrap();
        assert!(request.validate().is_ok());
        assert_eq!(request.opening_balance, dec!(100.00));

        let empty = AccountRegisterRequest {
            name: String::new(),
            opening_balance: Decimal::ZERO,
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_catalog_request_defaults_min_party() {
        let request: CatalogItemCreateRequest = serde_json::from_value(serde_json::json!({
            "code": " ZOMBIE_RUSH ",
            "name": "Zombie Rush",
            "price_per_participant": 10,
            "max_party_size": 8
        }))
        .unwrap();
        assert!(request.validate().is_ok());

        let item = request.to_new_item();
        assert_eq!(item.code, "ZOMBIE_RUSH");
        assert_eq!(item.min_party_size, 1);
    }
}
