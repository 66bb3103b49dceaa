//! Device handlers
//!
//! Signed endpoints called by game-runner devices. The raw body is passed
//! through untouched because the signature covers its exact bytes.

use crate::dto::ApiResponse;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use playmeter_auth::{AuthenticatedUser, DeviceHeaders};
use playmeter_core::AppError;
use tracing::{debug, instrument};

/// Authorize a paid session
///
/// POST /api/v1/authorize
#[instrument(skip_all, fields(access_key = %headers.access_key))]
pub async fn authorize(
    state: web::Data<AppState>,
    headers: DeviceHeaders,
    body: web::Bytes,
) -> Result<HttpResponse, AppError> {
    let outcome = state.engine.authorization.authorize(&headers, &body).await?;
    debug!(session_id = %outcome.session_id, replayed = outcome.replayed, "Authorization served");
    Ok(HttpResponse::Ok().json(outcome))
}

/// Upload (or replace) post-game telemetry
///
/// PUT /api/v1/sessions/{session_id}/telemetry
#[instrument(skip(state, headers, body), fields(access_key = %headers.access_key))]
pub async fn upload_telemetry(
    state: web::Data<AppState>,
    path: web::Path<String>,
    headers: DeviceHeaders,
    body: web::Bytes,
) -> Result<HttpResponse, AppError> {
    let stored = state
        .engine
        .telemetry
        .upload(&headers, &path.into_inner(), &body)
        .await?;
    Ok(HttpResponse::Ok().json(stored))
}

/// Read telemetry of one of the caller's sessions
///
/// GET /api/v1/sessions/{session_id}/telemetry
#[instrument(skip(state, user), fields(username = %user.username))]
pub async fn get_telemetry(
    state: web::Data<AppState>,
    path: web::Path<String>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, AppError> {
    let account_id = user.account_id()?;
    let telemetry = state
        .engine
        .telemetry
        .get(account_id, &path.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(telemetry)))
}

/// Configure device routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/authorize", web::post().to(authorize)).service(
        web::scope("/sessions").route(
            "/{session_id}/telemetry",
            web::put().to(upload_telemetry),
        )
        .route("/{session_id}/telemetry", web::get().to(get_telemetry)),
    );
}
