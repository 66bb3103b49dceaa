//! Authentication DTOs
//!
//! Request and response types for portal login and user provisioning.

use chrono::{DateTime, Utc};
use playmeter_core::models::{UserInfo, UserRole};
use playmeter_services::LoginResult;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Login request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LoginRequest {
    /// Username
    #[validate(length(min = 1, max = 100, message = "Username is required"))]
    pub username: String,

    /// Password
    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,
}

/// Login response
#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    /// Access token (JWT)
    pub access_token: String,

    /// Token type (always "Bearer")
    pub token_type: String,

    /// Token expiration time in seconds
    pub expires_in: i64,

    /// User information
    pub user: UserInfo,
}

impl From<LoginResult> for LoginResponse {
    fn from(result: LoginResult) -> Self {
        Self {
            access_token: result.token,
            token_type: result.token_type,
            expires_in: result.expires_in,
            user: result.user,
        }
    }
}

/// Portal user creation request (admin only)
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UserCreateRequest {
    #[validate(length(
        min = 3,
        max = 100,
        message = "Username must be between 3 and 100 characters"
    ))]
    pub username: String,

    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub password: String,

    pub role: UserRole,

    /// Required for venue users
    pub account_id: Option<i64>,
}

/// Current user response
#[derive(Debug, Clone, Serialize)]
pub struct MeResponse {
    pub username: String,
    pub role: UserRole,
    pub account_id: Option<i64>,

    /// Token expiration timestamp
    pub token_expires_at: Option<DateTime<Utc>>,
}
