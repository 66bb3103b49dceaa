//! Domain models for Playmeter
//!
//! This module contains all the core domain models used throughout the application.

pub mod account;
pub mod audit;
pub mod catalog;
pub mod ledger;
pub mod recharge;
pub mod review;
pub mod telemetry;
pub mod tier;
pub mod usage;
pub mod user;

pub use account::{Account, DeviceCredential, NewAccount, Tier};
pub use audit::{AuditLog, AuditLogBuilder, AuditLogData};
pub use catalog::{CatalogItem, Entitlement, NewCatalogItem};
pub use ledger::{balance_reconciles, BalanceMovement, EntryType, LedgerEntry};
pub use recharge::{
    GatewayOrder, GatewayStatus, NewRechargeOrder, RechargeOrder, RechargeStatus,
    SettlementOutcome,
};
pub use review::{
    InvoiceRequest, InvoiceStatus, NewInvoiceRequest, NewRefundRequest, RefundRequest,
    RefundStatus, ReviewDecision,
};
pub use telemetry::SessionTelemetry;
pub use tier::{BillingPeriod, NewTierChange, TierChange, TierRunSummary, TierThresholds};
pub use usage::{
    replay_within_window, AuthorizationOutcome, BusinessKey, SessionId, UsageCommit,
    UsageDraft, UsageRecord, VenueId,
};
pub use user::{NewUser, User, UserInfo, UserRole};
