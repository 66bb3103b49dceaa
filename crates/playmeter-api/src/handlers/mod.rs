//! HTTP request handlers
//!
//! Device endpoints answer with the bare payload the game runners expect;
//! portal endpoints wrap their payload in [`ApiResponse`](crate::dto::ApiResponse).

pub mod account;
pub mod audit;
pub mod auth;
pub mod billing;
pub mod catalog;
pub mod device;
pub mod health;
pub mod review;
pub mod tier;

use actix_web::{web, HttpRequest};
use playmeter_auth::{middleware::source_address, AuthenticatedUser};
use playmeter_services::Actor;

pub use account::configure as configure_accounts;
pub use audit::configure as configure_audit;
pub use auth::configure as configure_auth;
pub use billing::configure as configure_billing;
pub use catalog::configure as configure_catalog;
pub use device::configure as configure_device;
pub use health::configure as configure_health;
pub use review::configure as configure_review;
pub use tier::configure as configure_tiers;

/// Mount every route under `/api/v1`
pub fn configure_api(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .configure(configure_health)
            .configure(configure_auth)
            .configure(configure_device)
            .configure(configure_billing)
            .configure(configure_review)
            .configure(configure_accounts)
            .configure(configure_catalog)
            .configure(configure_tiers)
            .configure(configure_audit),
    );
}

/// Audit actor for a portal user, tagged with the client address
pub(crate) fn actor_for(user: &AuthenticatedUser, req: &HttpRequest) -> Actor {
    Actor::user(user.user_id, user.username.clone(), user.role).with_ip(source_address(req))
}
