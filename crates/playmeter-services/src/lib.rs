//! Business logic services for Playmeter
//!
//! This crate orchestrates every billing operation: the device request
//! gate, session authorization against the balance ledger, telemetry
//! upload, recharge settlement, refund and invoice review, and monthly
//! tier classification.
//!
//! # Architecture
//!
//! Services are designed to be composable and testable:
//! - Each service owns its dependencies behind trait objects from
//!   `playmeter-core` (repositories, ledger store, counter store, clock)
//! - Services are wrapped in Arc and wired once by [`Engine`]
//! - All operations are instrumented with tracing
//! - Errors surface as `AppError`
//!
//! # Services
//!
//! - `DeviceGate` - Signature, replay, rate-limit and lock checks
//! - `AuthorizationService` - Priced, idempotent session authorization
//! - `TelemetryService` - Post-game telemetry upload
//! - `SettlementService` - Recharge orders and gateway reconciliation
//! - `ReviewService` - Refund and invoice review workflow
//! - `TierClassifier` - Monthly tier recomputation
//! - `AccountService` - Account, catalog and entitlement administration
//! - `UserService` - Portal login and user provisioning

pub mod accounts;
pub mod alerts;
pub mod anomaly;
pub mod audit;
pub mod authenticator;
pub mod authorization;
pub mod engine;
pub mod entitlement;
pub mod gateway;
pub mod idempotency;
pub mod ledger;
pub mod policy_cache;
pub mod rate_limiter;
pub mod replay_guard;
pub mod review;
pub mod settlement;
pub mod telemetry;
pub mod tier;
pub mod user_service;
pub mod workers;

#[cfg(test)]
pub(crate) mod testing;

pub use accounts::{AccountService, AccountStatement, RegisteredAccount};
pub use alerts::{MemoryAlertSink, TracingAlertSink};
pub use audit::{Actor, AuditTrail};
pub use authorization::{AuthorizationRequest, AuthorizationService, DeviceGate, RawVenueId};
pub use engine::{Engine, EngineDeps, EngineSettings};
pub use gateway::{HttpSettlementGateway, ManualSettlementGateway};
pub use review::ReviewService;
pub use settlement::{PollSummary, Resolution, SettlementService, SettlementSettings};
pub use telemetry::TelemetryService;
pub use tier::TierClassifier;
pub use user_service::{LoginResult, UserService};
