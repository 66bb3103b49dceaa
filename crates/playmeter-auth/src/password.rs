//! Argon2id password hashing for portal users

use argon2::{
    password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use playmeter_core::error::AppError;
use rand_core::OsRng;
use tracing::error;

#[derive(Debug, Clone, Default)]
pub struct PasswordService {
    argon2: Argon2<'static>,
}

impl PasswordService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash a password into a PHC string with a fresh random salt
    pub fn hash_password(&self, password: &str) -> Result<String, AppError> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| {
                error!(error = %e, "Failed to hash password");
                AppError::PasswordHash(format!("Password hashing failed: {}", e))
            })
    }

    /// `Ok(false)` on mismatch; a malformed stored hash is an error
    pub fn verify_password(&self, password: &str, hash: &str) -> Result<bool, AppError> {
        let parsed = PasswordHash::new(hash).map_err(|e| {
            error!(error = %e, "Stored password hash is malformed");
            AppError::PasswordHash(format!("Invalid hash format: {}", e))
        })?;

        match self.argon2.verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(e) => {
                error!(error = %e, "Password verification failed");
                Err(AppError::PasswordHash(format!("Verification failed: {}", e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let service = PasswordService::new();
        let hash = service.hash_password("venue-pass-1").unwrap();

        assert!(hash.starts_with("$argon2"));
        assert!(service.verify_password("venue-pass-1", &hash).unwrap());
        assert!(!service.verify_password("venue-pass-2", &hash).unwrap());
    }

    #[test]
    fn test_salts_differ() {
        let service = PasswordService::new();
        assert_ne!(
            service.hash_password("same").unwrap(),
            service.hash_password("same").unwrap()
        );
    }

    #[test]
    fn test_malformed_hash() {
        let service = PasswordService::new();
        assert!(matches!(
            service.verify_password("x", "not-a-phc-string"),
            Err(AppError::PasswordHash(_))
        ));
    }
}
