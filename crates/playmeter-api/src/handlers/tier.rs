//! Tier classification handlers

use crate::dto::{ApiResponse, PeriodParams};
use crate::handlers::actor_for;
use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use playmeter_auth::AdminUser;
use playmeter_core::models::BillingPeriod;
use playmeter_core::{AppError, Clock};
use tracing::instrument;

/// Run the classifier for `period`, defaulting to the previous month
///
/// POST /api/v1/admin/tiers/run?period=YYYY-MM
#[instrument(skip(state, req, admin), fields(admin = %admin.username))]
pub async fn run_classifier(
    state: web::Data<AppState>,
    req: HttpRequest,
    query: web::Query<PeriodParams>,
    admin: AdminUser,
) -> Result<HttpResponse, AppError> {
    let period = match query.parse()? {
        Some(period) => period,
        None => BillingPeriod::previous(state.engine.clock.now()),
    };
    let summary = state
        .engine
        .tiers
        .run_manual(&actor_for(&admin, &req), period)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(summary)))
}

/// GET /api/v1/admin/tiers/changes?period=YYYY-MM
#[instrument(skip(state, _admin))]
pub async fn list_changes(
    state: web::Data<AppState>,
    query: web::Query<PeriodParams>,
    _admin: AdminUser,
) -> Result<HttpResponse, AppError> {
    let changes = state.engine.tiers.changes(query.parse()?).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(changes)))
}

/// Configure tier routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/admin/tiers")
            .route("/run", web::post().to(run_classifier))
            .route("/changes", web::get().to(list_changes)),
    );
}
