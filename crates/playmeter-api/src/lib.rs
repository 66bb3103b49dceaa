//! API layer for Playmeter
//!
//! HTTP handlers for device authorization and telemetry, the venue
//! self-service surface (recharges, refunds, invoices), the finance review
//! queues, account administration and portal login.

#![forbid(unsafe_code)]

pub mod dto;
pub mod handlers;
pub mod state;

// Re-export DTOs (common types)
pub use dto::{ApiResponse, PaginationParams};

pub use handlers::{
    configure_accounts, configure_api, configure_audit, configure_auth, configure_billing,
    configure_catalog, configure_device, configure_health, configure_review, configure_tiers,
};
pub use state::AppState;
