//! Common traits for repositories, stores and collaborators
//!
//! Services depend on these abstractions only; `playmeter-db` and
//! `playmeter-cache` provide the PostgreSQL, Redis and in-process
//! implementations.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::{
    Account, AuditLog, AuditLogData, CatalogItem, Entitlement, GatewayOrder, GatewayStatus,
    InvoiceRequest, InvoiceStatus, LedgerEntry, NewAccount, NewCatalogItem, NewInvoiceRequest,
    NewRechargeOrder, NewRefundRequest, NewTierChange, NewUser, RechargeOrder, RechargeStatus,
    RefundRequest, RefundStatus, ReviewDecision, SessionTelemetry, SettlementOutcome, TierChange,
    UsageCommit, UsageDraft, UsageRecord, User,
};
use crate::policy::EnginePolicy;
use crate::AppResult;

// ==================== Repositories ====================

/// Account repository
#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn find_by_id(&self, id: i64) -> AppResult<Option<Account>>;

    /// Find account by its device access key
    async fn find_by_access_key(&self, access_key: &str) -> AppResult<Option<Account>>;

    async fn create(&self, account: &NewAccount, at: DateTime<Utc>) -> AppResult<Account>;

    /// List accounts with pagination
    async fn list(&self, limit: i64, offset: i64) -> AppResult<(Vec<Account>, i64)>;

    /// All active accounts, for periodic classification
    async fn list_active(&self) -> AppResult<Vec<Account>>;

    /// Set the lock flag; returns `true` when this call locked the account
    async fn lock(&self, id: i64, reason: &str, at: DateTime<Utc>) -> AppResult<bool>;

    /// Clear the lock flag; returns `true` when the account was locked
    async fn unlock(&self, id: i64, at: DateTime<Utc>) -> AppResult<bool>;

    /// Soft-deactivate; returns `true` when the account was active
    async fn deactivate(&self, id: i64, at: DateTime<Utc>) -> AppResult<bool>;
}

/// Catalog repository
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn find_by_id(&self, id: i64) -> AppResult<Option<CatalogItem>>;

    async fn find_by_code(&self, code: &str) -> AppResult<Option<CatalogItem>>;

    async fn create(&self, item: &NewCatalogItem, at: DateTime<Utc>) -> AppResult<CatalogItem>;

    async fn set_active(&self, id: i64, active: bool, at: DateTime<Utc>) -> AppResult<bool>;
}

/// Entitlement repository
#[async_trait]
pub trait EntitlementRepository: Send + Sync {
    async fn find(&self, account_id: i64, catalog_item_id: i64)
        -> AppResult<Option<Entitlement>>;

    /// Grant or re-activate an entitlement
    async fn grant(
        &self,
        account_id: i64,
        catalog_item_id: i64,
        expires_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> AppResult<Entitlement>;

    async fn revoke(&self, account_id: i64, catalog_item_id: i64, at: DateTime<Utc>)
        -> AppResult<bool>;

    /// Active entitlements referencing a catalog item
    async fn count_active_for_item(&self, catalog_item_id: i64) -> AppResult<i64>;
}

/// Balance ledger unit of work
///
/// Each mutating method runs as one atomic operation serialized per account:
/// the account balance is re-read under an exclusive lock, validated, changed,
/// and the matching ledger entry (plus usage record or status change) is
/// written before the lock is released. Failure at any step leaves nothing
/// behind. A lock that cannot be acquired within `lock_wait` yields
/// `AppError::LockTimeout`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Debit a usage draft, or replay the record already committed under the
    /// same business key inside `idempotency_window`
    async fn commit_usage(
        &self,
        draft: &UsageDraft,
        idempotency_window: Duration,
        lock_wait: std::time::Duration,
    ) -> AppResult<UsageCommit>;

    /// Credit a recharge order exactly once per confirmation id
    async fn settle_recharge(
        &self,
        order_id: Uuid,
        confirmation_id: &str,
        at: DateTime<Utc>,
        lock_wait: std::time::Duration,
    ) -> AppResult<SettlementOutcome>;

    /// Debit the approved amount of a refund and mark it completed
    async fn complete_refund(
        &self,
        request_id: Uuid,
        reviewer: &str,
        at: DateTime<Utc>,
        lock_wait: std::time::Duration,
    ) -> AppResult<RefundRequest>;

    /// Most recent usage record under a business key digest
    async fn latest_usage_for_key(
        &self,
        account_id: i64,
        business_key: &str,
    ) -> AppResult<Option<UsageRecord>>;

    async fn find_usage_by_session(&self, session_id: &str) -> AppResult<Option<UsageRecord>>;

    /// Ledger entries of an account in application order
    async fn entries_for_account(&self, account_id: i64) -> AppResult<Vec<LedgerEntry>>;

    /// Usage spend per account within `[start, end)`
    async fn usage_spend_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<Vec<(i64, Decimal)>>;
}

/// Recharge order repository
#[async_trait]
pub trait RechargeRepository: Send + Sync {
    async fn create(&self, order: &NewRechargeOrder) -> AppResult<RechargeOrder>;

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<RechargeOrder>>;

    async fn list_by_account(&self, account_id: i64) -> AppResult<Vec<RechargeOrder>>;

    async fn list_by_status(&self, status: RechargeStatus) -> AppResult<Vec<RechargeOrder>>;

    /// Pending orders created at or before `cutoff`
    async fn list_awaiting_poll(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<RechargeOrder>>;

    /// Move a pending or disputed order to `failed`
    async fn mark_failed(&self, id: Uuid, reason: &str, at: DateTime<Utc>)
        -> AppResult<RechargeOrder>;

    /// Move a pending order to `disputed`
    async fn mark_disputed(
        &self,
        id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> AppResult<RechargeOrder>;

    /// Increment the consecutive poll failure counter
    async fn record_poll_failure(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<RechargeOrder>;

    /// Reset the counter after a successful poll
    async fn reset_poll_failures(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<()>;
}

/// Refund request repository
#[async_trait]
pub trait RefundRepository: Send + Sync {
    async fn create(&self, request: &NewRefundRequest) -> AppResult<RefundRequest>;

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<RefundRequest>>;

    async fn list(
        &self,
        status: Option<RefundStatus>,
        account_id: Option<i64>,
    ) -> AppResult<Vec<RefundRequest>>;

    /// Apply a decision if the request is still in `decision.from`
    async fn review(
        &self,
        id: Uuid,
        decision: &ReviewDecision<RefundStatus>,
    ) -> AppResult<RefundRequest>;
}

/// Invoice request repository
#[async_trait]
pub trait InvoiceRepository: Send + Sync {
    async fn create(&self, request: &NewInvoiceRequest) -> AppResult<InvoiceRequest>;

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<InvoiceRequest>>;

    async fn list(
        &self,
        status: Option<InvoiceStatus>,
        account_id: Option<i64>,
    ) -> AppResult<Vec<InvoiceRequest>>;

    /// Apply an approve/reject decision if the request is still pending
    async fn review(
        &self,
        id: Uuid,
        decision: &ReviewDecision<InvoiceStatus>,
    ) -> AppResult<InvoiceRequest>;

    /// Assign the next invoice number and mark an approved request issued
    async fn issue(&self, id: Uuid, reviewer: &str, at: DateTime<Utc>)
        -> AppResult<InvoiceRequest>;
}

/// Tier change repository
#[async_trait]
pub trait TierRepository: Send + Sync {
    /// Store the change and update the account's tier together
    ///
    /// There is one record per (account, period). Re-classifying a period
    /// into a different tier overwrites its record, keeping the original
    /// `previous_tier`. Returns `None` when the recorded tier already matches.
    async fn record_change(&self, change: &NewTierChange) -> AppResult<Option<TierChange>>;

    async fn list_changes(&self, period: Option<&str>) -> AppResult<Vec<TierChange>>;
}

/// Session telemetry repository
#[async_trait]
pub trait TelemetryRepository: Send + Sync {
    /// Insert or overwrite the telemetry of a session
    async fn upsert(
        &self,
        session_id: &str,
        account_id: i64,
        payload: &JsonValue,
        at: DateTime<Utc>,
    ) -> AppResult<SessionTelemetry>;

    async fn find(&self, session_id: &str) -> AppResult<Option<SessionTelemetry>>;
}

/// Portal user repository
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: i64) -> AppResult<Option<User>>;

    async fn find_by_username(&self, username: &str) -> AppResult<Option<User>>;

    async fn create(&self, user: &NewUser, at: DateTime<Utc>) -> AppResult<User>;

    async fn update_last_login(&self, id: i64, at: DateTime<Utc>) -> AppResult<()>;
}

/// Audit log repository
#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn insert(&self, entry: &AuditLogData, at: DateTime<Utc>) -> AppResult<()>;

    async fn list(&self, limit: i64, offset: i64) -> AppResult<Vec<AuditLog>>;
}

// ==================== Expiring counters ====================

/// Result of a sliding-window admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAdmission {
    pub allowed: bool,
    /// Hits inside the window after this call
    pub count: u64,
    /// Time until the oldest hit leaves the window (zero when allowed)
    pub retry_after: Duration,
}

/// Counter / expiring-set store shared by the replay guard, rate limiter and
/// anomaly detector
///
/// All operations are atomic with respect to each other for the same key and
/// entries expire on their own.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Record a hit only if fewer than `limit` hits fall inside the trailing window
    async fn acquire(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> AppResult<WindowAdmission>;

    /// Record an event; returns the number of events in the trailing window
    async fn record(&self, key: &str, window: Duration, now: DateTime<Utc>) -> AppResult<u64>;

    /// Add a member; returns the number of distinct members seen in the window
    async fn add_member(
        &self,
        key: &str,
        member: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> AppResult<u64>;

    /// Distinct members seen in the trailing window
    async fn members(&self, key: &str, window: Duration, now: DateTime<Utc>)
        -> AppResult<Vec<String>>;

    /// Insert a single-use marker; `false` if it already exists and has not expired
    async fn insert_once(&self, key: &str, ttl: Duration, now: DateTime<Utc>) -> AppResult<bool>;

    async fn remove(&self, key: &str) -> AppResult<()>;
}

// ==================== Collaborators ====================

/// Source of the dynamic engine policy
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn load(&self) -> AppResult<EnginePolicy>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    FailureBurst,
    CredentialSwitching,
    SettlementDisputed,
}

/// Operator-facing alert
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub account_ids: Vec<i64>,
    pub source: Option<String>,
    pub detail: String,
    pub raised_at: DateTime<Utc>,
}

/// Destination for alerts; must not block
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: &Alert);
}

/// External settlement gateway
#[async_trait]
pub trait SettlementGateway: Send + Sync {
    /// Create a pending payment order for a recharge
    async fn create_pending_order(
        &self,
        order_id: Uuid,
        account_id: i64,
        amount: Decimal,
    ) -> AppResult<GatewayOrder>;

    /// Query the settlement status of an order
    async fn query_status(&self, order: &RechargeOrder) -> AppResult<GatewayStatus>;
}

// ==================== Pagination ====================

/// Pagination parameters
#[derive(Debug, Clone, Default)]
pub struct Pagination {
    pub page: i64,
    pub per_page: i64,
}

impl Pagination {
    pub fn new(page: i64, per_page: i64) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, 500),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.per_page
    }

    pub fn limit(&self) -> i64 {
        self.per_page
    }
}

/// Paginated response wrapper
#[derive(Debug, Clone, Serialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub pagination: PaginationMeta,
}

/// Pagination metadata
#[derive(Debug, Clone, Serialize)]
pub struct PaginationMeta {
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
}

impl PaginationMeta {
    pub fn new(total: i64, page: i64, per_page: i64) -> Self {
        let total_pages = if per_page > 0 {
            (total + per_page - 1) / per_page
        } else {
            0
        };

        Self {
            total,
            page,
            per_page,
            total_pages,
        }
    }
}
