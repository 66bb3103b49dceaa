//! JWT claims for portal users
//!
//! Venue users carry the id of the account they act for; finance and admin
//! users do not.

use chrono::{Duration, Utc};
use playmeter_core::models::{User, UserRole};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    /// Subject (username)
    pub sub: String,

    /// Portal user id
    pub uid: i64,

    pub role: UserRole,

    /// Bound account, present for venue users
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<i64>,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Expiration time (Unix timestamp), filled in by `JwtService` when zero
    pub exp: i64,
}

impl Claims {
    pub fn new(uid: i64, username: &str, role: UserRole, account_id: Option<i64>) -> Self {
        Self {
            sub: username.to_string(),
            uid,
            role,
            account_id,
            iat: Utc::now().timestamp(),
            exp: 0,
        }
    }

    /// Claims for a stored user
    pub fn for_user(user: &User) -> Self {
        Self::new(user.id, &user.username, user.role, user.account_id)
    }

    /// Claims expiring `expires_in_secs` from now (negative values produce an expired token)
    pub fn with_expiration(mut self, expires_in_secs: i64) -> Self {
        self.exp = (Utc::now() + Duration::seconds(expires_in_secs)).timestamp();
        self
    }

    pub fn is_expired(&self) -> bool {
        self.exp <= Utc::now().timestamp()
    }

    pub fn can_review(&self) -> bool {
        self.role.can_review()
    }

    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claims_for_venue_user() {
        let user = User {
            id: 5,
            username: "arena-north".to_string(),
            role: UserRole::Venue,
            account_id: Some(42),
            ..Default::default()
        };
        let claims = Claims::for_user(&user);
        assert_eq!(claims.sub, "arena-north");
        assert_eq!(claims.uid, 5);
        assert_eq!(claims.account_id, Some(42));
        assert!(!claims.can_review());
    }

    #[test]
    fn test_expiration() {
        let claims = Claims::new(1, "ops", UserRole::Finance, None).with_expiration(-10);
        assert!(claims.is_expired());

        let claims = Claims::new(1, "ops", UserRole::Finance, None).with_expiration(3600);
        assert!(!claims.is_expired());
        assert!(claims.can_review());
        assert!(!claims.is_admin());
    }

    #[test]
    fn test_account_id_omitted_for_staff() {
        let claims = Claims::new(1, "ops", UserRole::Admin, None);
        let json = serde_json::to_value(&claims).unwrap();
        assert!(json.get("account_id").is_none());
        assert_eq!(json["role"], "admin");
    }
}
