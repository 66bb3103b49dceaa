//! Account and catalog administration
//!
//! Registration issues the device credential (the secret is returned once
//! and never stored). Unlocking is the only way a locked account becomes
//! billable again. Accounts are soft-deactivated, never deleted, and a
//! catalog item cannot be deactivated while active entitlements reference it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use playmeter_auth::IssuedCredential;
use playmeter_cache::keys;
use playmeter_core::{
    models::{balance_reconciles, Account, CatalogItem, Entitlement, LedgerEntry, NewAccount, NewCatalogItem},
    traits::{
        AccountRepository, CatalogRepository, CounterStore, EntitlementRepository, LedgerStore,
        PaginatedResponse, Pagination, PaginationMeta,
    },
    AppError, AppResult, Clock,
};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::audit::{Actor, AuditTrail};
use crate::authenticator::RequestAuthenticator;
use crate::entitlement::EntitlementChecker;

/// A newly registered account with its one-time secret
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredAccount {
    pub account: Account,
    pub access_key: String,
    /// Shown once; only its digest is stored
    pub secret: String,
}

/// Balance and ledger history of an account
#[derive(Debug, Clone, Serialize)]
pub struct AccountStatement {
    pub account: Account,
    pub entries: Vec<LedgerEntry>,
    /// `balance == opening_balance + Σ entries` and every snapshot chains
    pub reconciled: bool,
}

fn ensure_admin(actor: &Actor) -> AppResult<()> {
    match actor.role {
        Some(role) if role.is_admin() => Ok(()),
        _ => Err(AppError::Forbidden),
    }
}

pub struct AccountService {
    accounts: Arc<dyn AccountRepository>,
    catalog: Arc<dyn CatalogRepository>,
    entitlements: Arc<dyn EntitlementRepository>,
    ledger: Arc<dyn LedgerStore>,
    counters: Arc<dyn CounterStore>,
    authenticator: Arc<RequestAuthenticator>,
    checker: Arc<EntitlementChecker>,
    audit: Arc<AuditTrail>,
    clock: Arc<dyn Clock>,
}

impl AccountService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        catalog: Arc<dyn CatalogRepository>,
        entitlements: Arc<dyn EntitlementRepository>,
        ledger: Arc<dyn LedgerStore>,
        counters: Arc<dyn CounterStore>,
        authenticator: Arc<RequestAuthenticator>,
        checker: Arc<EntitlementChecker>,
        audit: Arc<AuditTrail>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            accounts,
            catalog,
            entitlements,
            ledger,
            counters,
            authenticator,
            checker,
            audit,
            clock,
        }
    }

    // ===== Accounts =====

    #[instrument(skip(self, actor), fields(actor = %actor.username))]
    pub async fn register(
        &self,
        actor: &Actor,
        name: &str,
        opening_balance: Decimal,
    ) -> AppResult<RegisteredAccount> {
        ensure_admin(actor)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::MissingField("name".to_string()));
        }
        if opening_balance < Decimal::ZERO || opening_balance.scale() > 2 {
            return Err(AppError::invalid_field(
                "opening_balance",
                "must be non-negative with at most 2 decimal places",
            ));
        }

        let credential = IssuedCredential::generate();
        let account = self
            .accounts
            .create(
                &NewAccount {
                    name: name.to_string(),
                    access_key: credential.access_key.clone(),
                    secret_digest: credential.secret_digest.clone(),
                    opening_balance,
                },
                self.clock.now(),
            )
            .await?;

        self.audit
            .record(
                actor,
                "account.register",
                "account",
                account.id,
                json!({ "name": account.name, "opening_balance": opening_balance }),
            )
            .await;
        info!("Registered account {} for {}", account.id, account.name);

        Ok(RegisteredAccount {
            account,
            access_key: credential.access_key,
            secret: credential.secret,
        })
    }

    pub async fn get(&self, account_id: i64) -> AppResult<Account> {
        self.accounts
            .find_by_id(account_id)
            .await?
            .ok_or_else(|| AppError::AccountNotFound(account_id.to_string()))
    }

    pub async fn list(&self, pagination: &Pagination) -> AppResult<PaginatedResponse<Account>> {
        let (data, total) = self
            .accounts
            .list(pagination.limit(), pagination.offset())
            .await?;
        Ok(PaginatedResponse {
            data,
            pagination: PaginationMeta::new(total, pagination.page, pagination.per_page),
        })
    }

    /// Clear the lock flag and the failure history that triggered it
    #[instrument(skip(self, actor), fields(actor = %actor.username))]
    pub async fn unlock(&self, actor: &Actor, account_id: i64) -> AppResult<Account> {
        ensure_admin(actor)?;
        let before = self.get(account_id).await?;

        let unlocked = self.accounts.unlock(account_id, self.clock.now()).await?;
        if unlocked {
            if let Err(e) = self
                .counters
                .remove(&keys::account_failure_key(account_id))
                .await
            {
                warn!("Failed to clear failure counter of account {}: {}", account_id, e);
            }
            self.audit
                .record(
                    actor,
                    "account.unlock",
                    "account",
                    account_id,
                    json!({ "lock_reason": before.lock_reason }),
                )
                .await;
            info!("Account {} unlocked by {}", account_id, actor.username);
        }

        self.get(account_id).await
    }

    /// Soft-deactivate; the credential stops authenticating immediately
    #[instrument(skip(self, actor), fields(actor = %actor.username))]
    pub async fn deactivate(&self, actor: &Actor, account_id: i64) -> AppResult<Account> {
        ensure_admin(actor)?;
        let account = self.get(account_id).await?;

        if self.accounts.deactivate(account_id, self.clock.now()).await? {
            self.authenticator.invalidate(&account.access_key);
            self.audit
                .record(actor, "account.deactivate", "account", account_id, json!({}))
                .await;
            info!("Account {} deactivated by {}", account_id, actor.username);
        }

        self.get(account_id).await
    }

    pub async fn statement(&self, account_id: i64) -> AppResult<AccountStatement> {
        let account = self.get(account_id).await?;
        let entries = self.ledger.entries_for_account(account_id).await?;
        let reconciled = balance_reconciles(account.opening_balance, &entries, account.balance);
        if !reconciled {
            warn!("Ledger of account {} does not reconcile with its balance", account_id);
        }

        Ok(AccountStatement {
            account,
            entries,
            reconciled,
        })
    }

    // ===== Catalog and entitlements =====

    async fn item_by_code(&self, code: &str) -> AppResult<CatalogItem> {
        self.catalog
            .find_by_code(code)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Catalog item {}", code)))
    }

    #[instrument(skip(self, actor, item), fields(actor = %actor.username, code = %item.code))]
    pub async fn create_catalog_item(&self, actor: &Actor, item: NewCatalogItem) -> AppResult<CatalogItem> {
        ensure_admin(actor)?;
        item.validate()?;

        let created = self.catalog.create(&item, self.clock.now()).await?;
        self.audit
            .record(
                actor,
                "catalog.create",
                "catalog_item",
                created.id,
                json!({ "code": created.code, "price_per_participant": created.price_per_participant }),
            )
            .await;
        Ok(created)
    }

    /// Activate or deactivate a catalog item
    ///
    /// # Errors
    ///
    /// `AppError::Conflict` when deactivating an item that active
    /// entitlements still reference.
    #[instrument(skip(self, actor), fields(actor = %actor.username))]
    pub async fn set_catalog_item_active(
        &self,
        actor: &Actor,
        code: &str,
        active: bool,
    ) -> AppResult<CatalogItem> {
        ensure_admin(actor)?;
        let item = self.item_by_code(code).await?;

        if !active {
            let referencing = self.entitlements.count_active_for_item(item.id).await?;
            if referencing > 0 {
                return Err(AppError::Conflict(format!(
                    "Catalog item {} is referenced by {} active entitlements",
                    code, referencing
                )));
            }
        }

        self.catalog.set_active(item.id, active, self.clock.now()).await?;
        self.checker.invalidate(code);
        self.audit
            .record(actor, "catalog.set_active", "catalog_item", item.id, json!({ "active": active }))
            .await;

        self.item_by_code(code).await
    }

    #[instrument(skip(self, actor), fields(actor = %actor.username))]
    pub async fn grant_entitlement(
        &self,
        actor: &Actor,
        account_id: i64,
        catalog_item_code: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> AppResult<Entitlement> {
        ensure_admin(actor)?;
        let now = self.clock.now();
        if expires_at.is_some_and(|at| at <= now) {
            return Err(AppError::invalid_field("expires_at", "must be in the future"));
        }
        let item = self.item_by_code(catalog_item_code).await?;
        if !item.active {
            return Err(AppError::Conflict(format!(
                "Catalog item {} is inactive",
                catalog_item_code
            )));
        }
        self.get(account_id).await?;

        let entitlement = self
            .entitlements
            .grant(account_id, item.id, expires_at, now)
            .await?;
        self.audit
            .record(
                actor,
                "entitlement.grant",
                "account",
                account_id,
                json!({ "catalog_item": item.code, "expires_at": expires_at }),
            )
            .await;
        Ok(entitlement)
    }

    /// Returns `false` if there was no active entitlement to revoke
    #[instrument(skip(self, actor), fields(actor = %actor.username))]
    pub async fn revoke_entitlement(
        &self,
        actor: &Actor,
        account_id: i64,
        catalog_item_code: &str,
    ) -> AppResult<bool> {
        ensure_admin(actor)?;
        let item = self.item_by_code(catalog_item_code).await?;

        let revoked = self
            .entitlements
            .revoke(account_id, item.id, self.clock.now())
            .await?;
        if revoked {
            self.audit
                .record(
                    actor,
                    "entitlement.revoke",
                    "account",
                    account_id,
                    json!({ "catalog_item": item.code }),
                )
                .await;
        }
        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use playmeter_auth::credentials::{is_well_formed_access_key, secret_digest};
    use playmeter_core::models::UserRole;
    use rust_decimal_macros::dec;

    fn admin() -> Actor {
        Actor::user(1, "root", UserRole::Admin).with_ip("10.0.0.9")
    }

    #[tokio::test]
    async fn test_register_returns_secret_once() {
        let fx = Fixture::new().await;
        let accounts = fx.engine().accounts;

        let registered = accounts
            .register(&admin(), "Arena West", dec!(250.00))
            .await
            .unwrap();
        assert!(is_well_formed_access_key(&registered.access_key));
        assert!(registered.secret.starts_with("sk_"));
        assert_eq!(registered.account.secret_digest, secret_digest(&registered.secret));
        assert_eq!(registered.account.balance, dec!(250.00));

        // The stored account never carries the plaintext secret
        let json = serde_json::to_value(&registered.account).unwrap();
        assert!(json.get("secret_digest").is_none());
    }

    #[tokio::test]
    async fn test_register_validation() {
        let fx = Fixture::new().await;
        let accounts = fx.engine().accounts;

        assert!(matches!(
            accounts.register(&admin(), "  ", dec!(0)).await,
            Err(AppError::MissingField(_))
        ));
        assert!(matches!(
            accounts.register(&admin(), "Arena", dec!(-1.00)).await,
            Err(AppError::InvalidField { .. })
        ));
        assert_eq!(
            accounts
                .register(&Actor::user(5, "fin", UserRole::Finance), "Arena", dec!(0))
                .await
                .unwrap_err(),
            AppError::Forbidden
        );
    }

    #[tokio::test]
    async fn test_unlock_clears_lock() {
        let fx = Fixture::new().await;
        let accounts = fx.engine().accounts;
        AccountRepository::lock(fx.store.as_ref(), fx.account.id, "failure burst", fx.clock.now())
            .await
            .unwrap();

        let unlocked = accounts.unlock(&admin(), fx.account.id).await.unwrap();
        assert!(!unlocked.locked);
        assert!(unlocked.lock_reason.is_none());
        assert!(fx.reload_account().await.ensure_billable().is_ok());
        assert!(fx.audit_actions().await.contains(&"account.unlock".to_string()));
    }

    #[tokio::test]
    async fn test_deactivated_account_stops_authenticating() {
        let fx = Fixture::new().await;
        let accounts = fx.engine().accounts;

        let account = accounts.deactivate(&admin(), fx.account.id).await.unwrap();
        assert!(!account.active);
        assert!(account.deactivated_at.is_some());

        // History is kept
        assert!(accounts.get(fx.account.id).await.is_ok());
        assert!(accounts.statement(fx.account.id).await.unwrap().reconciled);
    }

    #[tokio::test]
    async fn test_catalog_item_restrict_semantics() {
        let fx = Fixture::new().await;
        let accounts = fx.engine().accounts;

        assert!(matches!(
            accounts.set_catalog_item_active(&admin(), "ZOMBIE_RUSH", false).await,
            Err(AppError::Conflict(_))
        ));

        assert!(accounts
            .revoke_entitlement(&admin(), fx.account.id, "ZOMBIE_RUSH")
            .await
            .unwrap());
        assert!(!accounts
            .revoke_entitlement(&admin(), fx.account.id, "ZOMBIE_RUSH")
            .await
            .unwrap());

        let item = accounts
            .set_catalog_item_active(&admin(), "ZOMBIE_RUSH", false)
            .await
            .unwrap();
        assert!(!item.active);

        // Inactive items cannot be granted
        assert!(matches!(
            accounts
                .grant_entitlement(&admin(), fx.account.id, "ZOMBIE_RUSH", None)
                .await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_grant_entitlement_for_new_item() {
        let fx = Fixture::new().await;
        let accounts = fx.engine().accounts;

        let item = accounts
            .create_catalog_item(
                &admin(),
                NewCatalogItem {
                    code: "LASER_TAG".to_string(),
                    name: "Laser Tag Arena".to_string(),
                    price_per_participant: dec!(6.50),
                    min_party_size: 2,
                    max_party_size: 12,
                },
            )
            .await
            .unwrap();

        let past = fx.clock.now() - chrono::Duration::hours(1);
        assert!(matches!(
            accounts
                .grant_entitlement(&admin(), fx.account.id, "LASER_TAG", Some(past))
                .await,
            Err(AppError::InvalidField { .. })
        ));

        let entitlement = accounts
            .grant_entitlement(&admin(), fx.account.id, "LASER_TAG", None)
            .await
            .unwrap();
        assert_eq!(entitlement.catalog_item_id, item.id);
        assert!(entitlement.is_valid_at(fx.clock.now()));
    }
}
