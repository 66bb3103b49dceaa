//! Authentication handlers
//!
//! Portal login for venue, finance and admin users, plus user provisioning.

use crate::dto::auth::{LoginRequest, LoginResponse, MeResponse, UserCreateRequest};
use crate::dto::ApiResponse;
use crate::handlers::actor_for;
use crate::state::AppState;
use actix_web::{cookie::Cookie, web, HttpRequest, HttpResponse};
use chrono::{TimeZone, Utc};
use playmeter_auth::{middleware::source_address, AdminUser, AuthenticatedUser};
use playmeter_core::AppError;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

/// Login endpoint
///
/// POST /api/v1/auth/login
#[instrument(skip(state, req, body))]
pub async fn login(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<LoginRequest>,
) -> Result<HttpResponse, AppError> {
    body.validate().map_err(|e| {
        warn!("Login validation failed: {}", e);
        AppError::Validation(e.to_string())
    })?;

    let result = state
        .engine
        .users
        .login(&body.username, &body.password, Some(source_address(&req)))
        .await?;
    let response = LoginResponse::from(result);

    let cookie = Cookie::build("token", response.access_token.clone())
        .path("/")
        .http_only(true)
        .max_age(actix_web::cookie::time::Duration::seconds(response.expires_in))
        .finish();

    Ok(HttpResponse::Ok()
        .cookie(cookie)
        .json(ApiResponse::success(response)))
}

/// Logout endpoint; tokens are stateless, so this only clears the cookie
///
/// POST /api/v1/auth/logout
pub async fn logout(user: AuthenticatedUser) -> HttpResponse {
    info!(username = %user.username, "User logged out");

    let cookie = Cookie::build("token", "")
        .path("/")
        .http_only(true)
        .max_age(actix_web::cookie::time::Duration::seconds(0))
        .finish();

    HttpResponse::Ok()
        .cookie(cookie)
        .json(ApiResponse::with_message((), "Logged out successfully"))
}

/// Get current user info
///
/// GET /api/v1/auth/me
#[instrument(skip(user), fields(username = %user.username))]
pub async fn me(user: AuthenticatedUser) -> HttpResponse {
    debug!("Getting current user info");
    let response = MeResponse {
        username: user.username.clone(),
        role: user.role,
        account_id: user.claims.account_id,
        token_expires_at: Utc.timestamp_opt(user.claims.exp, 0).single(),
    };
    HttpResponse::Ok().json(ApiResponse::success(response))
}

/// Create a portal user (admin only)
///
/// POST /api/v1/admin/users
#[instrument(skip(state, req, admin, body), fields(admin = %admin.username))]
pub async fn create_user(
    state: web::Data<AppState>,
    req: HttpRequest,
    admin: AdminUser,
    body: web::Json<UserCreateRequest>,
) -> Result<HttpResponse, AppError> {
    body.validate().map_err(|e| {
        warn!("User creation validation failed: {}", e);
        AppError::Validation(e.to_string())
    })?;

    let user = state
        .engine
        .users
        .create_user(
            &actor_for(&admin, &req),
            &body.username,
            &body.password,
            body.role,
            body.account_id,
        )
        .await?;

    Ok(HttpResponse::Created().json(ApiResponse::with_message(
        user,
        "User created successfully",
    )))
}

/// Configure auth routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/auth")
            .route("/login", web::post().to(login))
            .route("/logout", web::post().to(logout))
            .route("/me", web::get().to(me)),
    )
    .route("/admin/users", web::post().to(create_user));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_request_validation() {
        let valid_req = LoginRequest {
            username: "admin".to_string(),
            password: "password".to_string(),
        };
        assert!(valid_req.validate().is_ok());

        let invalid_req = LoginRequest {
            username: "".to_string(),
            password: "".to_string(),
        };
        assert!(invalid_req.validate().is_err());
    }
}
