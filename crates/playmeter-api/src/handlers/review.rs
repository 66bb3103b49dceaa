//! Refund and invoice handlers
//!
//! Venue users file requests against their own account; finance and admin
//! users work the review queues. Listing is shared: venue users only ever
//! see their own requests.

use crate::dto::{
    ApiResponse, InvoiceCreateRequest, InvoiceFilterParams, RefundApproveRequest,
    RefundCreateRequest, RefundFilterParams, RejectRequest,
};
use crate::handlers::actor_for;
use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use playmeter_auth::{AuthenticatedUser, ReviewerUser};
use playmeter_core::AppError;
use tracing::{instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Account filter for a listing: forced to the caller's own for venue users
fn scoped_account(user: &AuthenticatedUser, requested: Option<i64>) -> Result<Option<i64>, AppError> {
    if user.role.can_review() {
        Ok(requested)
    } else {
        user.account_id().map(Some)
    }
}

fn ensure_visible(user: &AuthenticatedUser, owner: i64, what: &str, id: Uuid) -> Result<(), AppError> {
    if user.role.can_review() || user.account_id()? == owner {
        Ok(())
    } else {
        Err(AppError::NotFound(format!("{} {}", what, id)))
    }
}

fn validate_reason(body: &RejectRequest) -> Result<(), AppError> {
    body.validate().map_err(|e| {
        warn!("Rejection validation failed: {}", e);
        AppError::Validation(e.to_string())
    })
}

// ===== Refunds =====

/// POST /api/v1/refunds
#[instrument(skip(state, user, body), fields(username = %user.username))]
pub async fn create_refund(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    body: web::Json<RefundCreateRequest>,
) -> Result<HttpResponse, AppError> {
    body.validate().map_err(|e| {
        warn!("Refund request validation failed: {}", e);
        AppError::Validation(e.to_string())
    })?;
    let account_id = user.account_id()?;
    let body = body.into_inner();

    let request = state
        .engine
        .reviews
        .request_refund(account_id, body.amount, body.reason)
        .await?;
    Ok(HttpResponse::Created().json(ApiResponse::with_message(
        request,
        "Refund request submitted",
    )))
}

/// GET /api/v1/refunds
#[instrument(skip(state, user), fields(username = %user.username))]
pub async fn list_refunds(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    filters: web::Query<RefundFilterParams>,
) -> Result<HttpResponse, AppError> {
    let account_id = scoped_account(&user, filters.account_id)?;
    let requests = state
        .engine
        .reviews
        .list_refunds(filters.status, account_id)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(requests)))
}

/// GET /api/v1/refunds/{id}
#[instrument(skip(state, user), fields(username = %user.username))]
pub async fn get_refund(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    let request = state.engine.reviews.get_refund(id).await?;
    ensure_visible(&user, request.account_id, "Refund request", id)?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(request)))
}

/// POST /api/v1/refunds/{id}/approve
#[instrument(skip(state, req, reviewer, body), fields(reviewer = %reviewer.username))]
pub async fn approve_refund(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<Uuid>,
    reviewer: ReviewerUser,
    body: Option<web::Json<RefundApproveRequest>>,
) -> Result<HttpResponse, AppError> {
    let approved_amount = body.and_then(|b| b.into_inner().approved_amount);
    let request = state
        .engine
        .reviews
        .approve_refund(&actor_for(&reviewer, &req), path.into_inner(), approved_amount)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::with_message(request, "Refund approved")))
}

/// POST /api/v1/refunds/{id}/reject
#[instrument(skip(state, req, reviewer, body), fields(reviewer = %reviewer.username))]
pub async fn reject_refund(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<Uuid>,
    reviewer: ReviewerUser,
    body: web::Json<RejectRequest>,
) -> Result<HttpResponse, AppError> {
    validate_reason(&body)?;
    let request = state
        .engine
        .reviews
        .reject_refund(&actor_for(&reviewer, &req), path.into_inner(), &body.reason)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::with_message(request, "Refund rejected")))
}

/// POST /api/v1/refunds/{id}/complete
#[instrument(skip(state, req, reviewer), fields(reviewer = %reviewer.username))]
pub async fn complete_refund(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<Uuid>,
    reviewer: ReviewerUser,
) -> Result<HttpResponse, AppError> {
    let request = state
        .engine
        .reviews
        .complete_refund(&actor_for(&reviewer, &req), path.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::with_message(request, "Refund completed")))
}

// ===== Invoices =====

/// POST /api/v1/invoices
#[instrument(skip(state, user, body), fields(username = %user.username))]
pub async fn create_invoice(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    body: web::Json<InvoiceCreateRequest>,
) -> Result<HttpResponse, AppError> {
    body.validate().map_err(|e| {
        warn!("Invoice request validation failed: {}", e);
        AppError::Validation(e.to_string())
    })?;
    let account_id = user.account_id()?;
    let body = body.into_inner();

    let request = state
        .engine
        .reviews
        .request_invoice(account_id, body.amount, &body.billing_title, body.tax_id)
        .await?;
    Ok(HttpResponse::Created().json(ApiResponse::with_message(
        request,
        "Invoice request submitted",
    )))
}

/// GET /api/v1/invoices
#[instrument(skip(state, user), fields(username = %user.username))]
pub async fn list_invoices(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    filters: web::Query<InvoiceFilterParams>,
) -> Result<HttpResponse, AppError> {
    let account_id = scoped_account(&user, filters.account_id)?;
    let requests = state
        .engine
        .reviews
        .list_invoices(filters.status, account_id)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(requests)))
}

/// GET /api/v1/invoices/{id}
#[instrument(skip(state, user), fields(username = %user.username))]
pub async fn get_invoice(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    let request = state.engine.reviews.get_invoice(id).await?;
    ensure_visible(&user, request.account_id, "Invoice request", id)?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(request)))
}

/// POST /api/v1/invoices/{id}/approve
#[instrument(skip(state, req, reviewer), fields(reviewer = %reviewer.username))]
pub async fn approve_invoice(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<Uuid>,
    reviewer: ReviewerUser,
) -> Result<HttpResponse, AppError> {
    let request = state
        .engine
        .reviews
        .approve_invoice(&actor_for(&reviewer, &req), path.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::with_message(request, "Invoice approved")))
}

/// POST /api/v1/invoices/{id}/reject
#[instrument(skip(state, req, reviewer, body), fields(reviewer = %reviewer.username))]
pub async fn reject_invoice(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<Uuid>,
    reviewer: ReviewerUser,
    body: web::Json<RejectRequest>,
) -> Result<HttpResponse, AppError> {
    validate_reason(&body)?;
    let request = state
        .engine
        .reviews
        .reject_invoice(&actor_for(&reviewer, &req), path.into_inner(), &body.reason)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::with_message(request, "Invoice rejected")))
}

/// POST /api/v1/invoices/{id}/issue
#[instrument(skip(state, req, reviewer), fields(reviewer = %reviewer.username))]
pub async fn issue_invoice(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<Uuid>,
    reviewer: ReviewerUser,
) -> Result<HttpResponse, AppError> {
    let request = state
        .engine
        .reviews
        .issue_invoice(&actor_for(&reviewer, &req), path.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::with_message(request, "Invoice issued")))
}

/// Configure refund and invoice routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/refunds")
            .route("", web::post().to(create_refund))
            .route("", web::get().to(list_refunds))
            .route("/{id}", web::get().to(get_refund))
            .route("/{id}/approve", web::post().to(approve_refund))
            .route("/{id}/reject", web::post().to(reject_refund))
            .route("/{id}/complete", web::post().to(complete_refund)),
    )
    .service(
        web::scope("/invoices")
            .route("", web::post().to(create_invoice))
            .route("", web::get().to(list_invoices))
            .route("/{id}", web::get().to(get_invoice))
            .route("/{id}/approve", web::post().to(approve_invoice))
            .route("/{id}/reject", web::post().to(reject_invoice))
            .route("/{id}/issue", web::post().to(issue_invoice)),
    );
}
