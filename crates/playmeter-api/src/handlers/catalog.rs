//! Catalog administration handlers

use crate::dto::{ApiResponse, CatalogItemCreateRequest, CatalogStatusRequest};
use crate::handlers::actor_for;
use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use playmeter_auth::AdminUser;
use playmeter_core::AppError;
use tracing::{instrument, warn};
use validator::Validate;

/// POST /api/v1/admin/catalog
#[instrument(skip(state, req, admin, body), fields(admin = %admin.username, code = %body.code))]
pub async fn create_item(
    state: web::Data<AppState>,
    req: HttpRequest,
    admin: AdminUser,
    body: web::Json<CatalogItemCreateRequest>,
) -> Result<HttpResponse, AppError> {
    body.validate().map_err(|e| {
        warn!("Catalog item validation failed: {}", e);
        AppError::Validation(e.to_string())
    })?;

    let item = state
        .engine
        .accounts
        .create_catalog_item(&actor_for(&admin, &req), body.to_new_item())
        .await?;
    Ok(HttpResponse::Created().json(ApiResponse::with_message(item, "Catalog item created")))
}

/// Activate or deactivate an item; deactivation is refused while
/// entitlements still reference it
///
/// POST /api/v1/admin/catalog/{code}/status
#[instrument(skip(state, req, admin, body), fields(admin = %admin.username))]
pub async fn set_status(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    admin: AdminUser,
    body: web::Json<CatalogStatusRequest>,
) -> Result<HttpResponse, AppError> {
    let item = state
        .engine
        .accounts
        .set_catalog_item_active(&actor_for(&admin, &req), &path.into_inner(), body.active)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(item)))
}

/// Configure catalog routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/admin/catalog")
            .route("", web::post().to(create_item))
            .route("/{code}/status", web::post().to(set_status)),
    );
}
