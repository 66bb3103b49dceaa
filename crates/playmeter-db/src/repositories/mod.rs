//! Repository implementations

pub mod account_repo;
pub mod audit_repo;
pub mod catalog_repo;
pub mod recharge_repo;
pub mod review_repo;
pub mod settings_repo;
pub mod telemetry_repo;
pub mod tier_repo;
pub mod user_repo;

pub use account_repo::PgAccountRepository;
pub use audit_repo::PgAuditRepository;
pub use catalog_repo::{PgCatalogRepository, PgEntitlementRepository};
pub use recharge_repo::PgRechargeRepository;
pub use review_repo::{PgInvoiceRepository, PgRefundRepository};
pub use settings_repo::PgPolicySource;
pub use telemetry_repo::PgTelemetryRepository;
pub use tier_repo::PgTierRepository;
pub use user_repo::PgUserRepository;
