//! Audit log handlers (admin only)

use crate::dto::{ApiResponse, PaginationParams};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use playmeter_auth::AdminUser;
use playmeter_core::traits::Pagination;
use playmeter_core::AppError;
use tracing::{debug, warn};
use validator::Validate;

/// Most recent audit entries first
///
/// GET /api/v1/admin/audit
pub async fn list_audit_logs(
    state: web::Data<AppState>,
    query: web::Query<PaginationParams>,
    _admin: AdminUser,
) -> Result<HttpResponse, AppError> {
    query.validate().map_err(|e| {
        warn!("Pagination validation failed: {}", e);
        AppError::Validation(e.to_string())
    })?;
    debug!("Listing audit logs");

    let entries = state.engine.audit.recent(&Pagination::from(&*query)).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(entries)))
}

/// Configure audit routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/admin/audit", web::get().to(list_audit_logs));
}
