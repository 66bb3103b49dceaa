//! Health check

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use playmeter_core::Clock;
use serde_json::json;
use tracing::warn;

/// GET /api/v1/health
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let counters_ok = match state.counters.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!("Counter store health check failed: {}", e);
            false
        }
    };

    let body = json!({
        "status": if counters_ok { "healthy" } else { "degraded" },
        "service": "playmeter",
        "version": env!("CARGO_PKG_VERSION"),
        "storage": state.storage_backend,
        "counters": state.counters.backend_name(),
        "timestamp": state.engine.clock.now().to_rfc3339(),
    });

    if counters_ok {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

/// Configure health route
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health));
}
