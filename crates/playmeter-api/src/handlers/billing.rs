//! Recharge and settlement handlers
//!
//! Venue users open recharge orders; the settlement gateway confirms or
//! fails them through callbacks authenticated by a shared secret; operators
//! resolve orders the poller escalated to `disputed`.

use crate::dto::{
    ApiResponse, RechargeCreateRequest, ResolveRequest, SettlementConfirmRequest,
    SettlementFailRequest, SettlementResponse,
};
use crate::handlers::actor_for;
use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use playmeter_auth::{signature::verify_shared_secret, AdminUser, AuthenticatedUser};
use playmeter_core::models::SettlementOutcome;
use playmeter_core::AppError;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Header carrying the gateway's shared secret
pub const WEBHOOK_SECRET_HEADER: &str = "X-Webhook-Secret";

fn verify_webhook(state: &AppState, req: &HttpRequest) -> Result<(), AppError> {
    let presented = req
        .headers()
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    verify_shared_secret(&state.webhook_secret, presented).map_err(|e| {
        warn!(path = %req.path(), "Settlement callback rejected: {}", e);
        e
    })
}

// ===== Venue =====

/// Open a recharge order
///
/// POST /api/v1/recharges
#[instrument(skip(state, user, body), fields(username = %user.username))]
pub async fn create_recharge(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    body: web::Json<RechargeCreateRequest>,
) -> Result<HttpResponse, AppError> {
    let account_id = user.account_id()?;
    let order = state
        .engine
        .settlement
        .initiate_recharge(account_id, body.amount)
        .await?;

    Ok(HttpResponse::Created().json(ApiResponse::with_message(
        order,
        "Recharge order created",
    )))
}

/// List the caller's recharge orders
///
/// GET /api/v1/recharges
#[instrument(skip(state, user), fields(username = %user.username))]
pub async fn list_recharges(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, AppError> {
    let account_id = user.account_id()?;
    let orders = state.engine.settlement.list_for_account(account_id).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(orders)))
}

/// GET /api/v1/recharges/{id}
#[instrument(skip(state, user), fields(username = %user.username))]
pub async fn get_recharge(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, AppError> {
    let order_id = path.into_inner();
    let order = state.engine.settlement.get(order_id).await?;
    if !user.role.can_review() && order.account_id != user.account_id()? {
        return Err(AppError::NotFound(format!("Recharge order {}", order_id)));
    }
    Ok(HttpResponse::Ok().json(ApiResponse::success(order)))
}

// ===== Gateway callbacks =====

/// POST /api/v1/settlements/confirm
#[instrument(skip(state, req, body), fields(order_id = %body.order_id))]
pub async fn confirm_settlement(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<SettlementConfirmRequest>,
) -> Result<HttpResponse, AppError> {
    verify_webhook(&state, &req)?;
    body.validate().map_err(|e| {
        warn!("Settlement confirmation validation failed: {}", e);
        AppError::Validation(e.to_string())
    })?;

    let outcome = state
        .engine
        .settlement
        .confirm(body.order_id, &body.confirmation_id)
        .await?;
    let applied = matches!(outcome, SettlementOutcome::Applied(_));
    if !applied {
        info!("Duplicate confirmation for order {}", body.order_id);
    }

    let order = outcome.order();
    Ok(HttpResponse::Ok().json(SettlementResponse {
        order_id: order.id,
        applied,
        status: order.status.to_string(),
    }))
}

/// POST /api/v1/settlements/fail
#[instrument(skip(state, req, body), fields(order_id = %body.order_id))]
pub async fn fail_settlement(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<SettlementFailRequest>,
) -> Result<HttpResponse, AppError> {
    verify_webhook(&state, &req)?;
    body.validate().map_err(|e| {
        warn!("Settlement failure validation failed: {}", e);
        AppError::Validation(e.to_string())
    })?;

    let order = state
        .engine
        .settlement
        .fail(body.order_id, body.reason.trim())
        .await?;
    Ok(HttpResponse::Ok().json(SettlementResponse {
        order_id: order.id,
        applied: true,
        status: order.status.to_string(),
    }))
}

// ===== Operators =====

/// GET /api/v1/admin/recharges/disputed
#[instrument(skip(state, _admin))]
pub async fn list_disputed(
    state: web::Data<AppState>,
    _admin: AdminUser,
) -> Result<HttpResponse, AppError> {
    let orders = state.engine.settlement.list_disputed().await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(orders)))
}

/// POST /api/v1/admin/recharges/{id}/resolve
#[instrument(skip(state, req, admin, body), fields(admin = %admin.username))]
pub async fn resolve_recharge(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<Uuid>,
    admin: AdminUser,
    body: web::Json<ResolveRequest>,
) -> Result<HttpResponse, AppError> {
    let resolution = body.to_resolution()?;
    let order = state
        .engine
        .settlement
        .resolve_disputed(&actor_for(&admin, &req), path.into_inner(), resolution)
        .await?;

    Ok(HttpResponse::Ok().json(ApiResponse::with_message(
        order,
        "Disputed order resolved",
    )))
}

/// Configure recharge and settlement routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/recharges")
            .route("", web::post().to(create_recharge))
            .route("", web::get().to(list_recharges))
            .route("/{id}", web::get().to(get_recharge)),
    )
    .service(
        web::scope("/settlements")
            .route("/confirm", web::post().to(confirm_settlement))
            .route("/fail", web::post().to(fail_settlement)),
    )
    .service(
        web::scope("/admin/recharges")
            .route("/disputed", web::get().to(list_disputed))
            .route("/{id}/resolve", web::post().to(resolve_recharge)),
    );
}
