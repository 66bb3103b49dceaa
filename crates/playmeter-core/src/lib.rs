//! Playmeter Core Library
//!
//! Foundational types shared by every Playmeter crate:
//!
//! - Domain models (Account, CatalogItem, UsageRecord, LedgerEntry, ...)
//! - Repository, ledger-store and counter traits
//! - Unified error handling with HTTP response mapping
//! - Application configuration and the dynamic engine policy
//! - An injectable clock

pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod policy;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use error::AppError;
pub use policy::EnginePolicy;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
