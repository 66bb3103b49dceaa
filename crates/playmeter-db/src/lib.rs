//! Playmeter Database Layer
//!
//! This crate provides storage for the Playmeter billing engine. It includes:
//!
//! - Connection pool management and embedded migrations with sqlx
//! - PostgreSQL repository implementations for all domain entities
//! - The balance ledger unit of work (row locks with bounded waits)
//! - An in-process store implementing the same traits
//!
//! [`Stores`] bundles one implementation of every storage trait so services
//! can be wired without knowing which backend is active.

pub mod ledger;
pub mod memory;
mod pg_error;
pub mod pool;
pub mod repositories;

use std::sync::Arc;

use playmeter_core::traits::{
    AccountRepository, AuditRepository, CatalogRepository, EntitlementRepository,
    InvoiceRepository, LedgerStore, RechargeRepository, RefundRepository, TelemetryRepository,
    TierRepository, UserRepository,
};

pub use ledger::PgLedgerStore;
pub use memory::MemoryStore;
pub use pool::{create_pool, run_migrations};
pub use repositories::*;

// Re-export commonly used types
pub use playmeter_core::{AppError, AppResult};
pub use sqlx::{PgPool, Postgres, Transaction};

/// One handle per storage trait
#[derive(Clone)]
pub struct Stores {
    pub accounts: Arc<dyn AccountRepository>,
    pub catalog: Arc<dyn CatalogRepository>,
    pub entitlements: Arc<dyn EntitlementRepository>,
    pub ledger: Arc<dyn LedgerStore>,
    pub recharges: Arc<dyn RechargeRepository>,
    pub refunds: Arc<dyn RefundRepository>,
    pub invoices: Arc<dyn InvoiceRepository>,
    pub tiers: Arc<dyn TierRepository>,
    pub telemetry: Arc<dyn TelemetryRepository>,
    pub users: Arc<dyn UserRepository>,
    pub audit: Arc<dyn AuditRepository>,
}

impl Stores {
    /// PostgreSQL-backed stores sharing one pool
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            accounts: Arc::new(PgAccountRepository::new(pool.clone())),
            catalog: Arc::new(PgCatalogRepository::new(pool.clone())),
            entitlements: Arc::new(PgEntitlementRepository::new(pool.clone())),
            ledger: Arc::new(PgLedgerStore::new(pool.clone())),
            recharges: Arc::new(PgRechargeRepository::new(pool.clone())),
            refunds: Arc::new(PgRefundRepository::new(pool.clone())),
            invoices: Arc::new(PgInvoiceRepository::new(pool.clone())),
            tiers: Arc::new(PgTierRepository::new(pool.clone())),
            telemetry: Arc::new(PgTelemetryRepository::new(pool.clone())),
            users: Arc::new(PgUserRepository::new(pool.clone())),
            audit: Arc::new(PgAuditRepository::new(pool)),
        }
    }

    /// Every trait served by the same in-process store
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            accounts: store.clone(),
            catalog: store.clone(),
            entitlements: store.clone(),
            ledger: store.clone(),
            recharges: store.clone(),
            refunds: store.clone(),
            invoices: store.clone(),
            tiers: store.clone(),
            telemetry: store.clone(),
            users: store.clone(),
            audit: store,
        }
    }
}
