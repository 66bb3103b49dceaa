//! JWT issuance and validation for portal sessions

use crate::claims::Claims;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use playmeter_core::error::AppError;
use playmeter_core::models::User;
use tracing::{debug, error, warn};

#[derive(Clone)]
pub struct JwtService {
    /// Default token lifetime in seconds
    expiration_secs: i64,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    /// # Examples
    ///
    /// ```
    /// use playmeter_auth::JwtService;
    ///
    /// let jwt_service = JwtService::new("my-secret-key", 1800);
    /// assert_eq!(jwt_service.expiration_secs(), 1800);
    /// ```
    pub fn new(secret: &str, expiration_secs: i64) -> Self {
        Self {
            expiration_secs,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Sign claims, applying the default lifetime when `exp` is unset
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidToken` if encoding fails
    pub fn create_token(&self, claims: &Claims) -> Result<String, AppError> {
        let mut token_claims = claims.clone();
        if token_claims.exp == 0 {
            token_claims.exp = (Utc::now() + Duration::seconds(self.expiration_secs)).timestamp();
        }

        debug!(
            username = %token_claims.sub,
            role = %token_claims.role,
            exp = token_claims.exp,
            "Creating JWT token"
        );

        encode(&Header::default(), &token_claims, &self.encoding_key).map_err(|e| {
            error!(error = %e, "Failed to create JWT token");
            AppError::InvalidToken(format!("Token creation failed: {}", e))
        })
    }

    pub fn create_token_for_user(&self, user: &User) -> Result<String, AppError> {
        self.create_token(&Claims::for_user(user))
    }

    /// Validate a token and return its claims
    ///
    /// # Errors
    ///
    /// - `AppError::TokenExpired` if the token has expired
    /// - `AppError::InvalidToken` for any other decoding failure
    pub fn validate_token(&self, token: &str) -> Result<Claims, AppError> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => {
                    warn!("Token expired");
                    AppError::TokenExpired
                }
                _ => {
                    warn!(error = %e, "Invalid token");
                    AppError::InvalidToken(format!("Token validation failed: {}", e))
                }
            })?;

        let claims = token_data.claims;
        // Validation::default() allows 60s of leeway
        if claims.is_expired() {
            warn!(username = %claims.sub, "Token expired within leeway");
            return Err(AppError::TokenExpired);
        }

        Ok(claims)
    }

    pub fn expiration_secs(&self) -> i64 {
        self.expiration_secs
    }
}

impl std::fmt::Debug for JwtService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtService")
            .field("expiration_secs", &self.expiration_secs)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playmeter_core::models::UserRole;

    const TEST_SECRET: &str = "test-secret-key-for-jwt-testing-12345";

    #[test]
    fn test_create_and_validate_token() {
        let jwt_service = JwtService::new(TEST_SECRET, 3600);
        let claims = Claims::new(3, "reviewer", UserRole::Finance, None);

        let token = jwt_service.create_token(&claims).unwrap();
        let decoded = jwt_service.validate_token(&token).unwrap();

        assert_eq!(decoded.sub, "reviewer");
        assert_eq!(decoded.uid, 3);
        assert_eq!(decoded.role, UserRole::Finance);
        assert!(decoded.exp > decoded.iat);
    }

    #[test]
    fn test_token_for_venue_user_carries_account() {
        let jwt_service = JwtService::new(TEST_SECRET, 3600);
        let user = User {
            id: 9,
            username: "arena".to_string(),
            role: UserRole::Venue,
            account_id: Some(77),
            ..Default::default()
        };

        let token = jwt_service.create_token_for_user(&user).unwrap();
        let claims = jwt_service.validate_token(&token).unwrap();
        assert_eq!(claims.account_id, Some(77));
    }

    #[test]
    fn test_expired_token() {
        let jwt_service = JwtService::new(TEST_SECRET, 3600);
        let claims = Claims::new(1, "user", UserRole::Venue, Some(1)).with_expiration(-120);
        let token = jwt_service.create_token(&claims).unwrap();

        assert_eq!(jwt_service.validate_token(&token), Err(AppError::TokenExpired));
    }

    #[test]
    fn test_wrong_secret() {
        let issuer = JwtService::new("secret-one", 3600);
        let verifier = JwtService::new("secret-two", 3600);
        let token = issuer
            .create_token(&Claims::new(1, "ops", UserRole::Admin, None))
            .unwrap();

        assert!(matches!(
            verifier.validate_token(&token),
            Err(AppError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let debug = format!("{:?}", JwtService::new("super-secret", 60));
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("super-secret"));
    }
}
