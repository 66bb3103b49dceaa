//! Account handlers
//!
//! Administration of venue accounts (`/admin/accounts`) and the venue
//! user's read-only view of its own account (`/account`).

use crate::dto::{
    AccountRegisterRequest, AccountResponse, ApiResponse, EntitlementGrantRequest,
    PaginationParams, RegisteredAccountResponse, StatementResponse,
};
use crate::handlers::actor_for;
use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use playmeter_auth::{AdminUser, AuthenticatedUser};
use playmeter_core::traits::{PaginatedResponse, Pagination};
use playmeter_core::AppError;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

// ===== Administration =====

/// Register a venue account; the secret is only ever returned here
///
/// POST /api/v1/admin/accounts
#[instrument(skip(state, req, admin, body), fields(admin = %admin.username))]
pub async fn register_account(
    state: web::Data<AppState>,
    req: HttpRequest,
    admin: AdminUser,
    body: web::Json<AccountRegisterRequest>,
) -> Result<HttpResponse, AppError> {
    body.validate().map_err(|e| {
        warn!("Account registration validation failed: {}", e);
        AppError::Validation(e.to_string())
    })?;

    let registered = state
        .engine
        .accounts
        .register(&actor_for(&admin, &req), &body.name, body.opening_balance)
        .await?;
    info!(id = registered.account.id, "Account registered");

    Ok(HttpResponse::Created().json(ApiResponse::with_message(
        RegisteredAccountResponse::from(registered),
        "Account registered; store the secret now, it is not shown again",
    )))
}

/// GET /api/v1/admin/accounts
#[instrument(skip(state, _admin))]
pub async fn list_accounts(
    state: web::Data<AppState>,
    query: web::Query<PaginationParams>,
    _admin: AdminUser,
) -> Result<HttpResponse, AppError> {
    query.validate().map_err(|e| {
        warn!("Pagination validation failed: {}", e);
        AppError::Validation(e.to_string())
    })?;
    debug!(page = query.page, per_page = query.per_page, "Listing accounts");

    let page = state
        .engine
        .accounts
        .list(&Pagination::from(&*query))
        .await?;
    let response = PaginatedResponse {
        data: page
            .data
            .into_iter()
            .map(AccountResponse::from)
            .collect::<Vec<_>>(),
        pagination: page.pagination,
    };
    Ok(HttpResponse::Ok().json(response))
}

/// GET /api/v1/admin/accounts/{id}
#[instrument(skip(state, _admin))]
pub async fn get_account(
    state: web::Data<AppState>,
    path: web::Path<i64>,
    _admin: AdminUser,
) -> Result<HttpResponse, AppError> {
    let account = state.engine.accounts.get(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(AccountResponse::from(account))))
}

/// GET /api/v1/admin/accounts/{id}/statement
#[instrument(skip(state, _admin))]
pub async fn get_statement(
    state: web::Data<AppState>,
    path: web::Path<i64>,
    _admin: AdminUser,
) -> Result<HttpResponse, AppError> {
    let statement = state.engine.accounts.statement(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(StatementResponse::from(statement))))
}

/// Clear an anomaly lock
///
/// POST /api/v1/admin/accounts/{id}/unlock
#[instrument(skip(state, req, admin), fields(admin = %admin.username))]
pub async fn unlock_account(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
    admin: AdminUser,
) -> Result<HttpResponse, AppError> {
    let account = state
        .engine
        .accounts
        .unlock(&actor_for(&admin, &req), path.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::with_message(
        AccountResponse::from(account),
        "Account unlocked",
    )))
}

/// POST /api/v1/admin/accounts/{id}/deactivate
#[instrument(skip(state, req, admin), fields(admin = %admin.username))]
pub async fn deactivate_account(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
    admin: AdminUser,
) -> Result<HttpResponse, AppError> {
    let account = state
        .engine
        .accounts
        .deactivate(&actor_for(&admin, &req), path.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::with_message(
        AccountResponse::from(account),
        "Account deactivated",
    )))
}

/// POST /api/v1/admin/accounts/{id}/entitlements
#[instrument(skip(state, req, admin, body), fields(admin = %admin.username))]
pub async fn grant_entitlement(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
    admin: AdminUser,
    body: web::Json<EntitlementGrantRequest>,
) -> Result<HttpResponse, AppError> {
    body.validate().map_err(|e| {
        warn!("Entitlement validation failed: {}", e);
        AppError::Validation(e.to_string())
    })?;

    let entitlement = state
        .engine
        .accounts
        .grant_entitlement(
            &actor_for(&admin, &req),
            path.into_inner(),
            body.catalog_item_code.trim(),
            body.expires_at,
        )
        .await?;
    Ok(HttpResponse::Created().json(ApiResponse::success(entitlement)))
}

/// DELETE /api/v1/admin/accounts/{id}/entitlements/{code}
#[instrument(skip(state, req, admin), fields(admin = %admin.username))]
pub async fn revoke_entitlement(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<(i64, String)>,
    admin: AdminUser,
) -> Result<HttpResponse, AppError> {
    let (account_id, code) = path.into_inner();
    let revoked = state
        .engine
        .accounts
        .revoke_entitlement(&actor_for(&admin, &req), account_id, &code)
        .await?;
    if !revoked {
        return Err(AppError::NotFound(format!(
            "Active entitlement of account {} for {}",
            account_id, code
        )));
    }
    Ok(HttpResponse::NoContent().finish())
}

// ===== Venue self-service =====

/// GET /api/v1/account
#[instrument(skip(state, user), fields(username = %user.username))]
pub async fn my_account(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, AppError> {
    let account = state.engine.accounts.get(user.account_id()?).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(AccountResponse::from(account))))
}

/// GET /api/v1/account/statement
#[instrument(skip(state, user), fields(username = %user.username))]
pub async fn my_statement(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, AppError> {
    let statement = state.engine.accounts.statement(user.account_id()?).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(StatementResponse::from(statement))))
}

/// Configure account routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/admin/accounts")
            .route("", web::post().to(register_account))
            .route("", web::get().to(list_accounts))
            .route("/{id}", web::get().to(get_account))
            .route("/{id}/statement", web::get().to(get_statement))
            .route("/{id}/unlock", web::post().to(unlock_account))
            .route("/{id}/deactivate", web::post().to(deactivate_account))
            .route("/{id}/entitlements", web::post().to(grant_entitlement))
            .route(
                "/{id}/entitlements/{code}",
                web::delete().to(revoke_entitlement),
            ),
    )
    .service(
        web::scope("/account")
            .route("", web::get().to(my_account))
            .route("/statement", web::get().to(my_statement)),
    );
}
