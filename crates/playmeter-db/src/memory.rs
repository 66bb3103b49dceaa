//! In-process store for development, tests and single-node runs
//!
//! All tables live behind one `parking_lot::RwLock`; the guard is never held
//! across an await. Ledger operations additionally take a per-account async
//! mutex with a bounded wait, mirroring the row lock the PostgreSQL store
//! takes, so lock timeouts and ordering behave the same way.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use playmeter_core::{
    models::{
        replay_within_window, review::invoice_number, Account, AuditLog, AuditLogData,
        BalanceMovement, CatalogItem, Entitlement, EntryType, InvoiceRequest, InvoiceStatus,
        LedgerEntry, NewAccount, NewCatalogItem, NewInvoiceRequest, NewRechargeOrder,
        NewRefundRequest, NewTierChange, NewUser, RechargeOrder, RechargeStatus, RefundRequest,
        RefundStatus, ReviewDecision, SessionTelemetry, SettlementOutcome, Tier, TierChange,
        UsageCommit, UsageDraft, UsageRecord, User, UserRole,
    },
    traits::{
        AccountRepository, AuditRepository, CatalogRepository, EntitlementRepository,
        InvoiceRepository, LedgerStore, RechargeRepository, RefundRepository,
        TelemetryRepository, TierRepository, UserRepository,
    },
    AppError, AppResult,
};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<i64, Account>,
    catalog: HashMap<i64, CatalogItem>,
    entitlements: HashMap<(i64, i64), Entitlement>,
    usage: Vec<UsageRecord>,
    ledger: Vec<LedgerEntry>,
    recharges: HashMap<Uuid, RechargeOrder>,
    refunds: HashMap<Uuid, RefundRequest>,
    invoices: HashMap<Uuid, InvoiceRequest>,
    tier_changes: Vec<TierChange>,
    telemetry: HashMap<String, SessionTelemetry>,
    users: HashMap<i64, User>,
    audit: Vec<AuditLog>,
    last_id: i64,
    invoice_seq: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn account_mut(&mut self, id: i64) -> AppResult<&mut Account> {
        self.accounts
            .get_mut(&id)
            .ok_or_else(|| AppError::AccountNotFound(id.to_string()))
    }

    fn latest_usage(&self, account_id: i64, business_key: &str) -> Option<&UsageRecord> {
        self.usage
            .iter()
            .rev()
            .find(|r| r.account_id == account_id && r.business_key == business_key)
    }

    /// Apply a movement to an account and append the matching ledger entry
    fn apply_movement(
        &mut self,
        account_id: i64,
        entry_type: EntryType,
        movement: &BalanceMovement,
        reference: String,
        description: Option<String>,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        let id = self.next_id();
        let account = self.account_mut(account_id)?;
        account.balance = movement.balance_after;
        account.updated_at = at;

        self.ledger.push(LedgerEntry {
            id,
            account_id,
            entry_type,
            amount: movement.amount,
            balance_before: movement.balance_before,
            balance_after: movement.balance_after,
            reference,
            description,
            created_at: at,
        });
        Ok(())
    }
}

/// In-memory implementation of every storage trait
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    account_locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize ledger work on one account, giving up after `lock_wait`
    async fn lock_account(
        &self,
        account_id: i64,
        lock_wait: std::time::Duration,
    ) -> AppResult<OwnedMutexGuard<()>> {
        let mutex = self
            .account_locks
            .entry(account_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        tokio::time::timeout(lock_wait, mutex.lock_owned())
            .await
            .map_err(|_| {
                warn!("Timed out waiting for lock on account {}", account_id);
                AppError::LockTimeout {
                    wait_ms: lock_wait.as_millis() as u64,
                }
            })
    }

    fn account_of_recharge(&self, id: Uuid) -> AppResult<i64> {
        self.state
            .read()
            .recharges
            .get(&id)
            .map(|o| o.account_id)
            .ok_or_else(|| AppError::NotFound(format!("Recharge order {}", id)))
    }

    fn account_of_refund(&self, id: Uuid) -> AppResult<i64> {
        self.state
            .read()
            .refunds
            .get(&id)
            .map(|r| r.account_id)
            .ok_or_else(|| AppError::NotFound(format!("Refund request {}", id)))
    }
}

// ==================== Accounts and catalog ====================

#[async_trait]
impl AccountRepository for MemoryStore {
    async fn find_by_id(&self, id: i64) -> AppResult<Option<Account>> {
        Ok(self.state.read().accounts.get(&id).cloned())
    }

    async fn find_by_access_key(&self, access_key: &str) -> AppResult<Option<Account>> {
        Ok(self
            .state
            .read()
            .accounts
            .values()
            .find(|a| a.access_key == access_key)
            .cloned())
    }

    #[instrument(skip(self, account), fields(name = %account.name))]
    async fn create(&self, account: &NewAccount, at: DateTime<Utc>) -> AppResult<Account> {
        if account.opening_balance < Decimal::ZERO {
            return Err(AppError::invalid_field("opening_balance", "must not be negative"));
        }

        let mut state = self.state.write();
        if state.accounts.values().any(|a| a.access_key == account.access_key) {
            return Err(AppError::AlreadyExists(format!(
                "Access key {} already exists",
                account.access_key
            )));
        }

        let created = Account {
            id: state.next_id(),
            name: account.name.clone(),
            access_key: account.access_key.clone(),
            secret_digest: account.secret_digest.clone(),
            balance: account.opening_balance,
            opening_balance: account.opening_balance,
            tier: Tier::Standard,
            locked: false,
            lock_reason: None,
            locked_at: None,
            active: true,
            created_at: at,
            updated_at: at,
            deactivated_at: None,
        };
        state.accounts.insert(created.id, created.clone());

        info!("Created account {} ({})", created.id, created.access_key);
        Ok(created)
    }

    async fn list(&self, limit: i64, offset: i64) -> AppResult<(Vec<Account>, i64)> {
        let state = self.state.read();
        let mut accounts: Vec<Account> = state.accounts.values().cloned().collect();
        accounts.sort_by_key(|a| a.id);
        let total = accounts.len() as i64;
        let page = accounts
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn list_active(&self) -> AppResult<Vec<Account>> {
        let state = self.state.read();
        let mut accounts: Vec<Account> =
            state.accounts.values().filter(|a| a.active).cloned().collect();
        accounts.sort_by_key(|a| a.id);
        Ok(accounts)
    }

    #[instrument(skip(self))]
    async fn lock(&self, id: i64, reason: &str, at: DateTime<Utc>) -> AppResult<bool> {
        let mut state = self.state.write();
        let account = state.account_mut(id)?;
        if account.locked {
            return Ok(false);
        }
        account.locked = true;
        account.lock_reason = Some(reason.to_string());
        account.locked_at = Some(at);
        account.updated_at = at;
        warn!("Account {} locked: {}", id, reason);
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn unlock(&self, id: i64, at: DateTime<Utc>) -> AppResult<bool> {
        let mut state = self.state.write();
        let account = state.account_mut(id)?;
        if !account.locked {
            return Ok(false);
        }
        account.locked = false;
        account.lock_reason = None;
        account.locked_at = None;
        account.updated_at = at;
        info!("Account {} unlocked", id);
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn deactivate(&self, id: i64, at: DateTime<Utc>) -> AppResult<bool> {
        let mut state = self.state.write();
        let account = state.account_mut(id)?;
        if !account.active {
            return Ok(false);
        }
        account.active = false;
        account.deactivated_at = Some(at);
        account.updated_at = at;
        info!("Account {} deactivated", id);
        Ok(true)
    }
}

#[async_trait]
impl CatalogRepository for MemoryStore {
    async fn find_by_id(&self, id: i64) -> AppResult<Option<CatalogItem>> {
        Ok(self.state.read().catalog.get(&id).cloned())
    }

    async fn find_by_code(&self, code: &str) -> AppResult<Option<CatalogItem>> {
        Ok(self
            .state
            .read()
            .catalog
            .values()
            .find(|c| c.code == code)
            .cloned())
    }

    async fn create(&self, item: &NewCatalogItem, at: DateTime<Utc>) -> AppResult<CatalogItem> {
        item.validate()?;

        let mut state = self.state.write();
        if state.catalog.values().any(|c| c.code == item.code) {
            return Err(AppError::AlreadyExists(format!(
                "Catalog item {} already exists",
                item.code
            )));
        }

        let created = CatalogItem {
            id: state.next_id(),
            code: item.code.clone(),
            name: item.name.clone(),
            price_per_participant: item.price_per_participant,
            min_party_size: item.min_party_size,
            max_party_size: item.max_party_size,
            active: true,
            created_at: at,
            updated_at: at,
        };
        state.catalog.insert(created.id, created.clone());
        Ok(created)
    }

    async fn set_active(&self, id: i64, active: bool, at: DateTime<Utc>) -> AppResult<bool> {
        let mut state = self.state.write();
        match state.catalog.get_mut(&id) {
            Some(item) if item.active != active => {
                item.active = active;
                item.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl EntitlementRepository for MemoryStore {
    async fn find(&self, account_id: i64, catalog_item_id: i64) -> AppResult<Option<Entitlement>> {
        Ok(self
            .state
            .read()
            .entitlements
            .get(&(account_id, catalog_item_id))
            .cloned())
    }

    async fn grant(
        &self,
        account_id: i64,
        catalog_item_id: i64,
        expires_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> AppResult<Entitlement> {
        let mut state = self.state.write();
        if !state.accounts.contains_key(&account_id) {
            return Err(AppError::AccountNotFound(account_id.to_string()));
        }
        if !state.catalog.contains_key(&catalog_item_id) {
            return Err(AppError::NotFound(format!("Catalog item {}", catalog_item_id)));
        }

        let id = match state.entitlements.get(&(account_id, catalog_item_id)) {
            Some(existing) => existing.id,
            None => state.next_id(),
        };
        let entitlement = Entitlement {
            id,
            account_id,
            catalog_item_id,
            active: true,
            expires_at,
            granted_at: at,
            revoked_at: None,
        };
        state
            .entitlements
            .insert((account_id, catalog_item_id), entitlement.clone());
        Ok(entitlement)
    }

    async fn revoke(&self, account_id: i64, catalog_item_id: i64, at: DateTime<Utc>) -> AppResult<bool> {
        let mut state = self.state.write();
        match state.entitlements.get_mut(&(account_id, catalog_item_id)) {
            Some(e) if e.active => {
                e.active = false;
                e.revoked_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_active_for_item(&self, catalog_item_id: i64) -> AppResult<i64> {
        Ok(self
            .state
            .read()
            .entitlements
            .values()
            .filter(|e| e.catalog_item_id == catalog_item_id && e.active)
            .count() as i64)
    }
}

// ==================== Ledger ====================

#[async_trait]
impl LedgerStore for MemoryStore {
    #[instrument(skip(self, draft), fields(account_id = draft.key.account_id))]
    async fn commit_usage(
        &self,
        draft: &UsageDraft,
        idempotency_window: Duration,
        lock_wait: std::time::Duration,
    ) -> AppResult<UsageCommit> {
        let account_id = draft.key.account_id;
        let _guard = self.lock_account(account_id, lock_wait).await?;

        let business_key = draft.key.digest();
        let mut state = self.state.write();

        let account = state
            .accounts
            .get(&account_id)
            .ok_or_else(|| AppError::AccountNotFound(account_id.to_string()))?;
        account.ensure_billable()?;

        if let Some(outcome) = replay_within_window(
            state.latest_usage(account_id, &business_key),
            idempotency_window,
            draft.created_at,
        ) {
            debug!("Replaying session {} under the account lock", outcome.session_id);
            return Ok(UsageCommit::Replayed(outcome));
        }

        if state
            .usage
            .iter()
            .any(|r| r.session_id == draft.session_id.as_str())
        {
            return Err(AppError::Conflict(format!(
                "Session {} already exists",
                draft.session_id
            )));
        }

        let movement = BalanceMovement::debit(account.balance, draft.total_cost)?;
        let record = UsageRecord {
            id: state.next_id(),
            session_id: draft.session_id.as_str().to_string(),
            authorization_token: draft.authorization_token,
            account_id,
            catalog_item_id: draft.key.catalog_item_id,
            catalog_item_code: draft.catalog_item_code.clone(),
            venue_id: draft.key.venue_id.0,
            party_size: draft.key.party_size,
            business_key,
            price_per_participant: draft.price_per_participant,
            total_cost: draft.total_cost,
            balance_after: movement.balance_after,
            client_timestamp: draft.client_timestamp,
            created_at: draft.created_at,
        };

        state.apply_movement(
            account_id,
            EntryType::Usage,
            &movement,
            record.session_id.clone(),
            Some(format!(
                "{} x{} at {}",
                draft.catalog_item_code, draft.key.party_size, draft.key.venue_id
            )),
            draft.created_at,
        )?;
        let outcome = record.outcome(false);
        state.usage.push(record);

        info!(
            "Authorized session {} for {} (balance {} -> {})",
            outcome.session_id, outcome.total_cost, movement.balance_before, movement.balance_after
        );
        Ok(UsageCommit::Created(outcome))
    }

    #[instrument(skip(self))]
    async fn settle_recharge(
        &self,
        order_id: Uuid,
        confirmation_id: &str,
        at: DateTime<Utc>,
        lock_wait: std::time::Duration,
    ) -> AppResult<SettlementOutcome> {
        let account_id = self.account_of_recharge(order_id)?;
        let _guard = self.lock_account(account_id, lock_wait).await?;
        let mut state = self.state.write();

        let order = state
            .recharges
            .get(&order_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Recharge order {}", order_id)))?;

        if order.status == RechargeStatus::Settled {
            return if order.confirmation_id.as_deref() == Some(confirmation_id) {
                Ok(SettlementOutcome::AlreadySettled(order))
            } else {
                Err(AppError::Conflict(format!(
                    "Recharge order {} was settled with another confirmation",
                    order_id
                )))
            };
        }
        order.status.ensure_transition(RechargeStatus::Settled)?;

        if state
            .recharges
            .values()
            .any(|o| o.confirmation_id.as_deref() == Some(confirmation_id))
        {
            return Err(AppError::Conflict(format!(
                "Confirmation {} belongs to another order",
                confirmation_id
            )));
        }

        let balance = state.account_mut(account_id)?.balance;
        let movement = BalanceMovement::credit(balance, order.amount)?;
        state.apply_movement(
            account_id,
            EntryType::Recharge,
            &movement,
            order_id.to_string(),
            Some(confirmation_id.to_string()),
            at,
        )?;

        let settled = RechargeOrder {
            status: RechargeStatus::Settled,
            confirmation_id: Some(confirmation_id.to_string()),
            settled_at: Some(at),
            updated_at: at,
            ..order
        };
        state.recharges.insert(order_id, settled.clone());

        info!(
            "Recharge {} settled: account {} balance {} -> {}",
            order_id, account_id, movement.balance_before, movement.balance_after
        );
        Ok(SettlementOutcome::Applied(settled))
    }

    #[instrument(skip(self))]
    async fn complete_refund(
        &self,
        request_id: Uuid,
        reviewer: &str,
        at: DateTime<Utc>,
        lock_wait: std::time::Duration,
    ) -> AppResult<RefundRequest> {
        let account_id = self.account_of_refund(request_id)?;
        let _guard = self.lock_account(account_id, lock_wait).await?;
        let mut state = self.state.write();

        let request = state
            .refunds
            .get(&request_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Refund request {}", request_id)))?;
        request.status.ensure_transition(RefundStatus::Completed)?;

        let amount = request.approved_amount.unwrap_or(request.requested_amount);
        let balance = state.account_mut(account_id)?.balance;
        if amount > balance {
            return Err(AppError::RefundExceedsBalance {
                requested: amount.round_dp(2).to_string(),
                available: balance.round_dp(2).to_string(),
            });
        }
        let movement = BalanceMovement::debit(balance, amount)?;
        state.apply_movement(
            account_id,
            EntryType::Refund,
            &movement,
            request_id.to_string(),
            request.reason.clone(),
            at,
        )?;

        let completed = RefundRequest {
            status: RefundStatus::Completed,
            reviewer: Some(reviewer.to_string()),
            completed_at: Some(at),
            ..request
        };
        state.refunds.insert(request_id, completed.clone());

        info!(
            "Refund {} completed: account {} balance {} -> {}",
            request_id, account_id, movement.balance_before, movement.balance_after
        );
        Ok(completed)
    }

    async fn latest_usage_for_key(
        &self,
        account_id: i64,
        business_key: &str,
    ) -> AppResult<Option<UsageRecord>> {
        Ok(self
            .state
            .read()
            .latest_usage(account_id, business_key)
            .cloned())
    }

    async fn find_usage_by_session(&self, session_id: &str) -> AppResult<Option<UsageRecord>> {
        Ok(self
            .state
            .read()
            .usage
            .iter()
            .find(|r| r.session_id == session_id)
            .cloned())
    }

    async fn entries_for_account(&self, account_id: i64) -> AppResult<Vec<LedgerEntry>> {
        Ok(self
            .state
            .read()
            .ledger
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn usage_spend_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<Vec<(i64, Decimal)>> {
        let state = self.state.read();
        let mut spend: HashMap<i64, Decimal> = HashMap::new();
        for entry in state.ledger.iter().filter(|e| {
            e.entry_type == EntryType::Usage && e.created_at >= start && e.created_at < end
        }) {
            *spend.entry(entry.account_id).or_default() -= entry.amount;
        }

        let mut totals: Vec<(i64, Decimal)> = spend.into_iter().collect();
        totals.sort_by_key(|(account_id, _)| *account_id);
        Ok(totals)
    }
}

// ==================== Recharges and reviews ====================

#[async_trait]
impl RechargeRepository for MemoryStore {
    async fn create(&self, order: &NewRechargeOrder) -> AppResult<RechargeOrder> {
        let mut state = self.state.write();
        if !state.accounts.contains_key(&order.account_id) {
            return Err(AppError::AccountNotFound(order.account_id.to_string()));
        }
        if order.amount <= Decimal::ZERO {
            return Err(AppError::invalid_field("amount", "must be positive"));
        }

        let created = RechargeOrder {
            id: order.id,
            account_id: order.account_id,
            amount: order.amount,
            status: RechargeStatus::Pending,
            gateway_reference: order.gateway_reference.clone(),
            checkout_url: order.checkout_url.clone(),
            confirmation_id: None,
            poll_failures: 0,
            failure_reason: None,
            created_at: order.created_at,
            updated_at: order.created_at,
            settled_at: None,
        };
        state.recharges.insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<RechargeOrder>> {
        Ok(self.state.read().recharges.get(&id).cloned())
    }

    async fn list_by_account(&self, account_id: i64) -> AppResult<Vec<RechargeOrder>> {
        let state = self.state.read();
        let mut orders: Vec<RechargeOrder> = state
            .recharges
            .values()
            .filter(|o| o.account_id == account_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn list_by_status(&self, status: RechargeStatus) -> AppResult<Vec<RechargeOrder>> {
        let state = self.state.read();
        let mut orders: Vec<RechargeOrder> = state
            .recharges
            .values()
            .filter(|o| o.status == status)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn list_awaiting_poll(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<RechargeOrder>> {
        let mut orders = self.list_by_status(RechargeStatus::Pending).await?;
        orders.retain(|o| o.created_at <= cutoff);
        orders.truncate(limit.max(0) as usize);
        Ok(orders)
    }

    async fn mark_failed(&self, id: Uuid, reason: &str, at: DateTime<Utc>) -> AppResult<RechargeOrder> {
        update_recharge(&self.state, id, RechargeStatus::Failed, |o| {
            o.failure_reason = Some(reason.to_string());
            o.updated_at = at;
        })
    }

    async fn mark_disputed(
        &self,
        id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> AppResult<RechargeOrder> {
        update_recharge(&self.state, id, RechargeStatus::Disputed, |o| {
            o.failure_reason = Some(reason.to_string());
            o.updated_at = at;
        })
    }

    async fn record_poll_failure(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<RechargeOrder> {
        let mut state = self.state.write();
        let order = state
            .recharges
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Recharge order {}", id)))?;
        if order.status != RechargeStatus::Pending {
            return Err(AppError::InvalidStateTransition {
                entity: "recharge_order".to_string(),
                from: order.status.to_string(),
                to: RechargeStatus::Pending.to_string(),
            });
        }
        order.poll_failures += 1;
        order.updated_at = at;
        Ok(order.clone())
    }

    async fn reset_poll_failures(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        let mut state = self.state.write();
        if let Some(order) = state.recharges.get_mut(&id) {
            if order.status == RechargeStatus::Pending && order.poll_failures > 0 {
                order.poll_failures = 0;
                order.updated_at = at;
            }
        }
        Ok(())
    }
}

/// Conditional status change shared by fail/dispute
fn update_recharge(
    state: &RwLock<MemoryState>,
    id: Uuid,
    target: RechargeStatus,
    apply: impl FnOnce(&mut RechargeOrder),
) -> AppResult<RechargeOrder> {
    let mut state = state.write();
    let order = state
        .recharges
        .get_mut(&id)
        .ok_or_else(|| AppError::NotFound(format!("Recharge order {}", id)))?;
    order.status.ensure_transition(target)?;
    order.status = target;
    apply(order);
    Ok(order.clone())
}

#[async_trait]
impl RefundRepository for MemoryStore {
    async fn create(&self, request: &NewRefundRequest) -> AppResult<RefundRequest> {
        let mut state = self.state.write();
        if !state.accounts.contains_key(&request.account_id) {
            return Err(AppError::AccountNotFound(request.account_id.to_string()));
        }

        let created = RefundRequest {
            id: request.id,
            account_id: request.account_id,
            requested_amount: request.requested_amount,
            approved_amount: None,
            balance_snapshot: request.balance_snapshot,
            reason: request.reason.clone(),
            status: RefundStatus::Pending,
            reviewer: None,
            rejection_reason: None,
            created_at: request.created_at,
            reviewed_at: None,
            completed_at: None,
        };
        state.refunds.insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<RefundRequest>> {
        Ok(self.state.read().refunds.get(&id).cloned())
    }

    async fn list(
        &self,
        status: Option<RefundStatus>,
        account_id: Option<i64>,
    ) -> AppResult<Vec<RefundRequest>> {
        let state = self.state.read();
        let mut requests: Vec<RefundRequest> = state
            .refunds
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .filter(|r| account_id.map_or(true, |a| r.account_id == a))
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    async fn review(
        &self,
        id: Uuid,
        decision: &ReviewDecision<RefundStatus>,
    ) -> AppResult<RefundRequest> {
        decision.from.ensure_transition(decision.to)?;

        let mut state = self.state.write();
        let request = state
            .refunds
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Refund request {}", id)))?;
        if request.status != decision.from {
            return Err(AppError::InvalidStateTransition {
                entity: "refund_request".to_string(),
                from: request.status.to_string(),
                to: decision.to.to_string(),
            });
        }

        request.status = decision.to;
        request.reviewer = Some(decision.reviewer.clone());
        if decision.approved_amount.is_some() {
            request.approved_amount = decision.approved_amount;
        }
        request.rejection_reason = decision.rejection_reason.clone();
        request.reviewed_at = Some(decision.at);
        Ok(request.clone())
    }
}

#[async_trait]
impl InvoiceRepository for MemoryStore {
    async fn create(&self, request: &NewInvoiceRequest) -> AppResult<InvoiceRequest> {
        let mut state = self.state.write();
        if !state.accounts.contains_key(&request.account_id) {
            return Err(AppError::AccountNotFound(request.account_id.to_string()));
        }

        let created = InvoiceRequest {
            id: request.id,
            account_id: request.account_id,
            amount: request.amount,
            balance_snapshot: request.balance_snapshot,
            billing_title: request.billing_title.clone(),
            tax_id: request.tax_id.clone(),
            status: InvoiceStatus::Pending,
            reviewer: None,
            rejection_reason: None,
            invoice_number: None,
            created_at: request.created_at,
            reviewed_at: None,
            issued_at: None,
        };
        state.invoices.insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<InvoiceRequest>> {
        Ok(self.state.read().invoices.get(&id).cloned())
    }

    async fn list(
        &self,
        status: Option<InvoiceStatus>,
        account_id: Option<i64>,
    ) -> AppResult<Vec<InvoiceRequest>> {
        let state = self.state.read();
        let mut requests: Vec<InvoiceRequest> = state
            .invoices
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .filter(|r| account_id.map_or(true, |a| r.account_id == a))
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    async fn review(
        &self,
        id: Uuid,
        decision: &ReviewDecision<InvoiceStatus>,
    ) -> AppResult<InvoiceRequest> {
        decision.from.ensure_transition(decision.to)?;

        let mut state = self.state.write();
        let request = state
            .invoices
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Invoice request {}", id)))?;
        if request.status != decision.from {
            return Err(AppError::InvalidStateTransition {
                entity: "invoice_request".to_string(),
                from: request.status.to_string(),
                to: decision.to.to_string(),
            });
        }

        request.status = decision.to;
        request.reviewer = Some(decision.reviewer.clone());
        request.rejection_reason = decision.rejection_reason.clone();
        request.reviewed_at = Some(decision.at);
        Ok(request.clone())
    }

    async fn issue(&self, id: Uuid, reviewer: &str, at: DateTime<Utc>) -> AppResult<InvoiceRequest> {
        let mut state = self.state.write();
        let status = state
            .invoices
            .get(&id)
            .map(|r| r.status)
            .ok_or_else(|| AppError::NotFound(format!("Invoice request {}", id)))?;
        status.ensure_transition(InvoiceStatus::Issued)?;

        state.invoice_seq += 1;
        let number = invoice_number(at, state.invoice_seq);

        let request = state
            .invoices
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Invoice request {}", id)))?;
        request.status = InvoiceStatus::Issued;
        request.invoice_number = Some(number.clone());
        request.reviewer = Some(reviewer.to_string());
        request.issued_at = Some(at);

        info!("Issued invoice {} for request {}", number, id);
        Ok(request.clone())
    }
}

// ==================== Tiers, telemetry, users, audit ====================

#[async_trait]
impl TierRepository for MemoryStore {
    async fn record_change(&self, change: &NewTierChange) -> AppResult<Option<TierChange>> {
        let period = change.period.to_string();
        let mut state = self.state.write();
        let existing = state
            .tier_changes
            .iter()
            .position(|c| c.account_id == change.account_id && c.period == period);
        if let Some(index) = existing {
            if state.tier_changes[index].new_tier == change.new_tier {
                return Ok(None);
            }
        }

        let account = state.account_mut(change.account_id)?;
        account.tier = change.new_tier;
        account.updated_at = change.created_at;

        let recorded = match existing {
            Some(index) => {
                let current = &mut state.tier_changes[index];
                current.new_tier = change.new_tier;
                current.spend = change.spend;
                current.created_at = change.created_at;
                current.clone()
            }
            None => {
                let recorded = TierChange {
                    id: state.next_id(),
                    account_id: change.account_id,
                    period,
                    previous_tier: change.previous_tier,
                    new_tier: change.new_tier,
                    spend: change.spend,
                    created_at: change.created_at,
                };
                state.tier_changes.push(recorded.clone());
                recorded
            }
        };
        Ok(Some(recorded))
    }

    async fn list_changes(&self, period: Option<&str>) -> AppResult<Vec<TierChange>> {
        let state = self.state.read();
        Ok(state
            .tier_changes
            .iter()
            .rev()
            .filter(|c| period.map_or(true, |p| c.period == p))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TelemetryRepository for MemoryStore {
    async fn upsert(
        &self,
        session_id: &str,
        account_id: i64,
        payload: &JsonValue,
        at: DateTime<Utc>,
    ) -> AppResult<SessionTelemetry> {
        let mut state = self.state.write();
        if !state.usage.iter().any(|r| r.session_id == session_id) {
            return Err(AppError::NotFound(format!("Session {}", session_id)));
        }

        let entry = state
            .telemetry
            .entry(session_id.to_string())
            .and_modify(|t| {
                t.payload = payload.clone();
                t.upload_count += 1;
                t.updated_at = at;
            })
            .or_insert_with(|| SessionTelemetry {
                session_id: session_id.to_string(),
                account_id,
                payload: payload.clone(),
                upload_count: 1,
                first_uploaded_at: at,
                updated_at: at,
            });
        Ok(entry.clone())
    }

    async fn find(&self, session_id: &str) -> AppResult<Option<SessionTelemetry>> {
        Ok(self.state.read().telemetry.get(session_id).cloned())
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn find_by_id(&self, id: i64) -> AppResult<Option<User>> {
        Ok(self.state.read().users.get(&id).cloned())
    }

    async fn find_by_username(&self, username: &str) -> AppResult<Option<User>> {
        Ok(self
            .state
            .read()
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn create(&self, user: &NewUser, at: DateTime<Utc>) -> AppResult<User> {
        if user.role == UserRole::Venue && user.account_id.is_none() {
            return Err(AppError::MissingField("account_id".to_string()));
        }

        let mut state = self.state.write();
        if state.users.values().any(|u| u.username == user.username) {
            return Err(AppError::AlreadyExists(format!(
                "User {} already exists",
                user.username
            )));
        }

        let created = User {
            id: state.next_id(),
            username: user.username.clone(),
            password_hash: user.password_hash.clone(),
            role: user.role,
            account_id: user.account_id,
            active: true,
            last_login: None,
            created_at: at,
            updated_at: at,
        };
        state.users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_last_login(&self, id: i64, at: DateTime<Utc>) -> AppResult<()> {
        if let Some(user) = self.state.write().users.get_mut(&id) {
            user.last_login = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl AuditRepository for MemoryStore {
    async fn insert(&self, entry: &AuditLogData, at: DateTime<Utc>) -> AppResult<()> {
        let mut state = self.state.write();
        let id = state.next_id();
        state.audit.push(AuditLog {
            id,
            user_id: entry.user_id,
            username: entry.username.clone(),
            action: entry.action.clone(),
            entity_type: entry.entity_type.clone(),
            entity_id: entry.entity_id.clone(),
            details: entry.details.clone(),
            ip_address: entry.ip_address.clone(),
            created_at: at,
        });
        Ok(())
    }

    async fn list(&self, limit: i64, offset: i64) -> AppResult<Vec<AuditLog>> {
        let state = self.state.read();
        Ok(state
            .audit
            .iter()
            .rev()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playmeter_core::models::{balance_reconciles, BusinessKey, SessionId, VenueId};
    use rust_decimal_macros::dec;

    const WAIT: std::time::Duration = std::time::Duration::from_secs(2);

    async fn seed(store: &MemoryStore, balance: Decimal) -> (Account, CatalogItem) {
        let now = Utc::now();
        let account = AccountRepository::create(
            store,
            &NewAccount {
                name: "Arcade One".to_string(),
                access_key: format!("pk_{}", Uuid::new_v4().simple()),
                secret_digest: "digest".to_string(),
                opening_balance: balance,
            },
            now,
        )
        .await
        .unwrap();
        let item = CatalogRepository::create(
            store,
            &NewCatalogItem {
                code: "dragon-raid".to_string(),
                name: "Dragon Raid".to_string(),
                price_per_participant: dec!(10.00),
                min_party_size: 1,
                max_party_size: 10,
            },
            now,
        )
        .await
        .unwrap();
        (account, item)
    }

    fn draft(account: &Account, item: &CatalogItem, party_size: i32, at: DateTime<Utc>) -> UsageDraft {
        UsageDraft {
            key: BusinessKey {
                account_id: account.id,
                catalog_item_id: item.id,
                venue_id: VenueId(7),
                party_size,
            },
            catalog_item_code: item.code.clone(),
            price_per_participant: item.price_per_participant,
            total_cost: item.total_for(party_size),
            session_id: SessionId::generate(account.id, at),
            authorization_token: Uuid::new_v4(),
            client_timestamp: at,
            created_at: at,
        }
    }

    #[tokio::test]
    async fn test_commit_usage_debits_and_replays() {
        let store = MemoryStore::new();
        let (account, item) = seed(&store, dec!(100.00)).await;
        let now = Utc::now();

        let first = store
            .commit_usage(&draft(&account, &item, 5, now), Duration::seconds(30), WAIT)
            .await
            .unwrap();
        let UsageCommit::Created(created) = first else {
            panic!("expected a new session");
        };
        assert_eq!(created.total_cost, dec!(50.00));
        assert_eq!(created.remaining_balance, dec!(50.00));

        let retry = store
            .commit_usage(
                &draft(&account, &item, 5, now + Duration::seconds(10)),
                Duration::seconds(30),
                WAIT,
            )
            .await
            .unwrap();
        let UsageCommit::Replayed(replayed) = retry else {
            panic!("expected a replay");
        };
        assert_eq!(replayed.session_id, created.session_id);
        assert_eq!(replayed.remaining_balance, dec!(50.00));

        let err = store
            .commit_usage(&draft(&account, &item, 8, now), Duration::seconds(30), WAIT)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InsufficientBalance { .. }));

        let current = AccountRepository::find_by_id(&store, account.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.balance, dec!(50.00));
    }

    #[tokio::test]
    async fn test_outside_window_bills_again() {
        let store = MemoryStore::new();
        let (account, item) = seed(&store, dec!(100.00)).await;
        let now = Utc::now();

        store
            .commit_usage(&draft(&account, &item, 2, now), Duration::seconds(30), WAIT)
            .await
            .unwrap();
        let later = store
            .commit_usage(
                &draft(&account, &item, 2, now + Duration::seconds(30)),
                Duration::seconds(30),
                WAIT,
            )
            .await
            .unwrap();

        assert!(matches!(later, UsageCommit::Created(_)));
        let entries = store.entries_for_account(account.id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(balance_reconciles(dec!(100.00), &entries, dec!(60.00)));
    }

    #[tokio::test]
    async fn test_concurrent_identical_requests_bill_once() {
        let store = Arc::new(MemoryStore::new());
        let (account, item) = seed(&store, dec!(1000.00)).await;
        let now = Utc::now();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let d = draft(&account, &item, 3, now);
                tokio::spawn(async move {
                    store.commit_usage(&d, Duration::seconds(30), WAIT).await
                })
            })
            .collect();

        let mut sessions = Vec::new();
        for result in futures::future::join_all(tasks).await {
            sessions.push(result.unwrap().unwrap().into_outcome().session_id);
        }
        sessions.dedup();
        assert_eq!(sessions.len(), 1);

        let entries = store.entries_for_account(account.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, dec!(-30.00));
    }

    #[tokio::test]
    async fn test_locked_account_is_not_billed() {
        let store = MemoryStore::new();
        let (account, item) = seed(&store, dec!(100.00)).await;
        assert!(store.lock(account.id, "failure burst", Utc::now()).await.unwrap());
        assert!(!store.lock(account.id, "again", Utc::now()).await.unwrap());

        let err = store
            .commit_usage(&draft(&account, &item, 1, Utc::now()), Duration::seconds(30), WAIT)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AccountLocked(_)));
    }

    #[tokio::test]
    async fn test_lock_wait_times_out() {
        let store = MemoryStore::new();
        let (account, item) = seed(&store, dec!(100.00)).await;
        let _held = store.lock_account(account.id, WAIT).await.unwrap();

        let err = store
            .commit_usage(
                &draft(&account, &item, 1, Utc::now()),
                Duration::seconds(30),
                std::time::Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::LockTimeout { wait_ms: 20 }));
    }

    #[tokio::test]
    async fn test_settlement_applies_once() {
        let store = MemoryStore::new();
        let (account, _) = seed(&store, dec!(10.00)).await;
        let order_id = Uuid::new_v4();
        RechargeRepository::create(
            &store,
            &NewRechargeOrder {
                id: order_id,
                account_id: account.id,
                amount: dec!(25.00),
                gateway_reference: "gw-1".to_string(),
                checkout_url: None,
                created_at: Utc::now(),
            },
        )
        .await
        .unwrap();

        let first = store
            .settle_recharge(order_id, "conf-1", Utc::now(), WAIT)
            .await
            .unwrap();
        assert!(matches!(first, SettlementOutcome::Applied(_)));
        let again = store
            .settle_recharge(order_id, "conf-1", Utc::now(), WAIT)
            .await
            .unwrap();
        assert!(matches!(again, SettlementOutcome::AlreadySettled(_)));
        let other = store
            .settle_recharge(order_id, "conf-2", Utc::now(), WAIT)
            .await
            .unwrap_err();
        assert!(matches!(other, AppError::Conflict(_)));

        let current = AccountRepository::find_by_id(&store, account.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.balance, dec!(35.00));
    }

    #[tokio::test]
    async fn test_refund_completion_rechecks_balance() {
        let store = MemoryStore::new();
        let (account, item) = seed(&store, dec!(100.00)).await;
        let request_id = Uuid::new_v4();
        RefundRepository::create(
            &store,
            &NewRefundRequest {
                id: request_id,
                account_id: account.id,
                requested_amount: dec!(80.00),
                balance_snapshot: dec!(100.00),
                reason: None,
                created_at: Utc::now(),
            },
        )
        .await
        .unwrap();
        RefundRepository::review(
            &store,
            request_id,
            &ReviewDecision {
                from: RefundStatus::Pending,
                to: RefundStatus::Approved,
                reviewer: "finance".to_string(),
                approved_amount: Some(dec!(80.00)),
                rejection_reason: None,
                at: Utc::now(),
            },
        )
        .await
        .unwrap();

        // Usage drained the balance after approval
        store
            .commit_usage(&draft(&account, &item, 5, Utc::now()), Duration::seconds(30), WAIT)
            .await
            .unwrap();

        let err = store
            .complete_refund(request_id, "finance", Utc::now(), WAIT)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::RefundExceedsBalance { .. }));
    }

    #[tokio::test]
    async fn test_invoice_numbers_are_sequential() {
        let store = MemoryStore::new();
        let (account, _) = seed(&store, dec!(100.00)).await;
        let mut numbers = Vec::new();

        for _ in 0..2 {
            let id = Uuid::new_v4();
            InvoiceRepository::create(
                &store,
                &NewInvoiceRequest {
                    id,
                    account_id: account.id,
                    amount: dec!(40.00),
                    balance_snapshot: dec!(100.00),
                    billing_title: "Arcade One Ltd".to_string(),
                    tax_id: None,
                    created_at: Utc::now(),
                },
            )
            .await
            .unwrap();

            let err = store.issue(id, "finance", Utc::now()).await.unwrap_err();
            assert!(matches!(err, AppError::InvalidStateTransition { .. }));

            InvoiceRepository::review(
                &store,
                id,
                &ReviewDecision {
                    from: InvoiceStatus::Pending,
                    to: InvoiceStatus::Approved,
                    reviewer: "finance".to_string(),
                    approved_amount: None,
                    rejection_reason: None,
                    at: Utc::now(),
                },
            )
            .await
            .unwrap();
            let issued = store.issue(id, "finance", Utc::now()).await.unwrap();
            numbers.push(issued.invoice_number.unwrap());
        }

        assert!(numbers[0].ends_with("-000001"));
        assert!(numbers[1].ends_with("-000002"));
    }

    #[tokio::test]
    async fn test_tier_change_recorded_once_per_period() {
        let store = MemoryStore::new();
        let (account, _) = seed(&store, dec!(0.00)).await;
        let change = NewTierChange {
            account_id: account.id,
            period: playmeter_core::models::BillingPeriod::new(2026, 9).unwrap(),
            previous_tier: Tier::Standard,
            new_tier: Tier::Silver,
            spend: dec!(6000.00),
            created_at: Utc::now(),
        };

        assert!(store.record_change(&change).await.unwrap().is_some());
        assert!(store.record_change(&change).await.unwrap().is_none());
        let current = AccountRepository::find_by_id(&store, account.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.tier, Tier::Silver);
    }

    #[tokio::test]
    async fn test_tier_change_overwritten_when_reclassified() {
        let store = MemoryStore::new();
        let (account, _) = seed(&store, dec!(0.00)).await;
        let silver = NewTierChange {
            account_id: account.id,
            period: playmeter_core::models::BillingPeriod::new(2026, 9).unwrap(),
            previous_tier: Tier::Standard,
            new_tier: Tier::Silver,
            spend: dec!(60.00),
            created_at: Utc::now(),
        };
        store.record_change(&silver).await.unwrap();

        let gold = NewTierChange {
            previous_tier: Tier::Silver,
            new_tier: Tier::Gold,
            spend: dec!(260.00),
            ..silver
        };
        let updated = store.record_change(&gold).await.unwrap().unwrap();
        assert_eq!(updated.previous_tier, Tier::Standard);
        assert_eq!(updated.new_tier, Tier::Gold);
        assert_eq!(updated.spend, dec!(260.00));

        let changes = store.list_changes(Some("2026-09")).await.unwrap();
        assert_eq!(changes.len(), 1);
        let current = AccountRepository::find_by_id(&store, account.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.tier, Tier::Gold);
    }
}
