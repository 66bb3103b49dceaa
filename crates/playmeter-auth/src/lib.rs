//! Authentication for Playmeter
//!
//! Two kinds of callers reach the engine:
//!
//! - Game-runner devices sign every request with HMAC-SHA256 over a canonical
//!   form of the request ([`signature`]) using credentials issued at account
//!   registration ([`credentials`]).
//! - Portal users (venue operators, finance reviewers, administrators) log in
//!   with an Argon2-hashed password and present a JWT.
//!
//! # Examples
//!
//! ## Signing a device request
//!
//! ```
//! use playmeter_auth::credentials::IssuedCredential;
//! use playmeter_auth::signature::{sign, verify, CanonicalRequest};
//!
//! let credential = IssuedCredential::generate();
//! let request = CanonicalRequest {
//!     method: "POST",
//!     path: "/api/v1/authorize",
//!     timestamp: 1_760_000_000,
//!     nonce: "3f1c",
//!     body: br#"{"party_size":4}"#,
//! };
//! let signature = sign(&credential.secret_digest, &request)?;
//! verify(&credential.secret_digest, &request, &signature)?;
//! # Ok::<(), playmeter_core::error::AppError>(())
//! ```
//!
//! ## Portal tokens
//!
//! ```no_run
//! use playmeter_auth::{Claims, JwtService};
//! use playmeter_core::models::UserRole;
//!
//! let jwt_service = JwtService::new("your-secret-key", 1800);
//! let token = jwt_service.create_token(&Claims::new(1, "finance-ops", UserRole::Finance, None))?;
//! # Ok::<(), playmeter_core::error::AppError>(())
//! ```

pub mod claims;
pub mod credentials;
pub mod jwt;
pub mod middleware;
pub mod password;
pub mod signature;

pub use claims::Claims;
pub use credentials::IssuedCredential;
pub use jwt::JwtService;
pub use middleware::{
    AdminUser, AuthenticatedUser, DeviceHeaders, RawPath, ReviewerUser, TrustedProxies,
};
pub use password::PasswordService;
pub use signature::CanonicalRequest;

#[cfg(test)]
mod tests {
    use super::*;
    use playmeter_core::models::{User, UserRole};

    #[test]
    fn test_login_round_trip() {
        let password_service = PasswordService::new();
        let jwt_service = JwtService::new("test-secret-key-12345", 3600);

        let user = User {
            id: 12,
            username: "arena-east".to_string(),
            password_hash: password_service.hash_password("open-sesame").unwrap(),
            role: UserRole::Venue,
            account_id: Some(3),
            ..Default::default()
        };

        assert!(password_service
            .verify_password("open-sesame", &user.password_hash)
            .unwrap());
        let token = jwt_service.create_token_for_user(&user).unwrap();
        let claims = jwt_service.validate_token(&token).unwrap();

        assert_eq!(claims.sub, "arena-east");
        assert_eq!(claims.account_id, Some(3));
        assert_eq!(claims.role, UserRole::Venue);
    }
}
