//! Portal users: login and provisioning

use std::sync::Arc;

use playmeter_auth::{JwtService, PasswordService};
use playmeter_core::{
    models::{NewUser, User, UserInfo, UserRole},
    traits::{AccountRepository, UserRepository},
    AppError, AppResult, Clock,
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::audit::{Actor, AuditTrail};

/// Minimum portal password length
pub const MIN_PASSWORD_LEN: usize = 8;

/// Result of a successful login
#[derive(Debug, Clone, Serialize)]
pub struct LoginResult {
    pub token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub user: UserInfo,
}

pub struct UserService {
    users: Arc<dyn UserRepository>,
    accounts: Arc<dyn AccountRepository>,
    passwords: PasswordService,
    jwt: Arc<JwtService>,
    audit: Arc<AuditTrail>,
    clock: Arc<dyn Clock>,
}

impl UserService {
    pub fn new(
        users: Arc<dyn UserRepository>,
        accounts: Arc<dyn AccountRepository>,
        jwt: Arc<JwtService>,
        audit: Arc<AuditTrail>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            users,
            accounts,
            passwords: PasswordService::new(),
            jwt,
            audit,
            clock,
        }
    }

    /// Verify a username/password pair and issue a JWT
    ///
    /// Unknown users, inactive users and wrong passwords all fail with
    /// `AppError::InvalidCredentials`.
    #[instrument(skip(self, password, ip_address))]
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        ip_address: Option<String>,
    ) -> AppResult<LoginResult> {
        let username = username.trim();
        debug!(username = %username, "Processing login request");

        let user = self.users.find_by_username(username).await?.ok_or_else(|| {
            info!(username = %username, "Login failed: user not found");
            AppError::InvalidCredentials
        })?;

        if !user.can_login() {
            warn!(username = %username, "Login failed: user is inactive");
            return Err(AppError::InvalidCredentials);
        }

        let password_valid = self
            .passwords
            .verify_password(password, &user.password_hash)
            .map_err(|e| {
                error!("Password verification error: {}", e);
                AppError::Internal("Password verification failed".to_string())
            })?;
        if !password_valid {
            info!(username = %username, "Login failed: invalid password");
            return Err(AppError::InvalidCredentials);
        }

        let now = self.clock.now();
        if let Err(e) = self.users.update_last_login(user.id, now).await {
            warn!("Failed to update last login for user {}: {}", user.id, e);
        }

        let token = self.jwt.create_token_for_user(&user)?;
        info!(username = %username, role = %user.role, "Login successful");

        let mut actor = Actor::user(user.id, user.username.clone(), user.role);
        if let Some(ip) = ip_address {
            actor = actor.with_ip(ip);
        }
        self.audit
            .record(&actor, "login", "auth", user.id, json!({}))
            .await;

        let user = User {
            last_login: Some(now),
            ..user
        };
        Ok(LoginResult {
            token,
            token_type: "Bearer".to_string(),
            expires_in: self.jwt.expiration_secs(),
            user: UserInfo::from(&user),
        })
    }

    /// Create a portal user; venue users must be bound to an existing account
    #[instrument(skip(self, actor, password), fields(actor = %actor.username))]
    pub async fn create_user(
        &self,
        actor: &Actor,
        username: &str,
        password: &str,
        role: UserRole,
        account_id: Option<i64>,
    ) -> AppResult<UserInfo> {
        if !actor.role.is_some_and(|r| r.is_admin()) {
            return Err(AppError::Forbidden);
        }
        let username = username.trim();
        if username.is_empty() {
            return Err(AppError::MissingField("username".to_string()));
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(AppError::invalid_field(
                "password",
                format!("must be at least {} characters", MIN_PASSWORD_LEN),
            ));
        }

        let account_id = match (role, account_id) {
            (UserRole::Venue, None) => return Err(AppError::MissingField("account_id".to_string())),
            (UserRole::Venue, Some(id)) => {
                self.accounts
                    .find_by_id(id)
                    .await?
                    .ok_or_else(|| AppError::AccountNotFound(id.to_string()))?;
                Some(id)
            }
            (_, _) => None,
        };

        if self.users.find_by_username(username).await?.is_some() {
            return Err(AppError::AlreadyExists(format!("User {}", username)));
        }

        let password_hash = self.passwords.hash_password(password)?;
        let user = self
            .users
            .create(
                &NewUser {
                    username: username.to_string(),
                    password_hash,
                    role,
                    account_id,
                },
                self.clock.now(),
            )
            .await?;

        self.audit
            .record(
                actor,
                "user.create",
                "user",
                user.id,
                json!({ "username": user.username, "role": user.role.to_string() }),
            )
            .await;
        info!("Created {} user {}", user.role, user.username);
        Ok(UserInfo::from(&user))
    }

    /// Create the first admin if `username` is not taken yet
    ///
    /// Returns `true` when a user was created.
    #[instrument(skip(self, password))]
    pub async fn ensure_admin(&self, username: &str, password: &str) -> AppResult<bool> {
        let username = username.trim();
        if self.users.find_by_username(username).await?.is_some() {
            debug!(username = %username, "Bootstrap admin already present");
            return Ok(false);
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(AppError::Config(format!(
                "bootstrap admin password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        let user = self
            .users
            .create(
                &NewUser {
                    username: username.to_string(),
                    password_hash: self.passwords.hash_password(password)?,
                    role: UserRole::Admin,
                    account_id: None,
                },
                self.clock.now(),
            )
            .await?;
        self.audit
            .record(
                &Actor::system("bootstrap"),
                "user.create",
                "user",
                user.id,
                json!({ "username": user.username, "role": user.role.to_string() }),
            )
            .await;
        info!("Bootstrapped admin user {}", user.username);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    fn admin() -> Actor {
        Actor::user(1, "root", UserRole::Admin)
    }

    #[tokio::test]
    async fn test_login_issues_token_for_role() {
        let fx = Fixture::new().await;
        let engine = fx.engine();
        engine
            .users
            .create_user(&admin(), "arena-east", "open-sesame", UserRole::Venue, Some(fx.account.id))
            .await
            .unwrap();

        let login = engine
            .users
            .login("arena-east", "open-sesame", Some("10.2.2.2".to_string()))
            .await
            .unwrap();
        assert_eq!(login.token_type, "Bearer");
        assert_eq!(login.user.account_id, Some(fx.account.id));
        assert!(login.user.last_login.is_some());

        let claims = fx.jwt().validate_token(&login.token).unwrap();
        assert_eq!(claims.role, UserRole::Venue);
        assert_eq!(claims.account_id, Some(fx.account.id));
    }

    #[tokio::test]
    async fn test_ensure_admin_creates_once() {
        let fx = Fixture::new().await;
        let users = fx.engine().users;

        assert!(users.ensure_admin("root", "first-boot-pass").await.unwrap());
        assert!(!users.ensure_admin("root", "other-password").await.unwrap());

        let login = users.login("root", "first-boot-pass", None).await.unwrap();
        assert_eq!(login.user.role, "admin");
    }

    #[tokio::test]
    async fn test_login_failures_are_indistinguishable() {
        let fx = Fixture::new().await;
        let users = fx.engine().users;
        users
            .create_user(&admin(), "fin-ops", "ledger-review", UserRole::Finance, None)
            .await
            .unwrap();

        assert_eq!(
            users.login("fin-ops", "wrong-password", None).await.unwrap_err(),
            AppError::InvalidCredentials
        );
        assert_eq!(
            users.login("nobody", "ledger-review", None).await.unwrap_err(),
            AppError::InvalidCredentials
        );
    }

    #[tokio::test]
    async fn test_create_user_validation() {
        let fx = Fixture::new().await;
        let users = fx.engine().users;

        assert!(matches!(
            users.create_user(&admin(), "venue-x", "long-enough", UserRole::Venue, None).await,
            Err(AppError::MissingField(_))
        ));
        assert!(matches!(
            users.create_user(&admin(), "fin", "short", UserRole::Finance, None).await,
            Err(AppError::InvalidField { .. })
        ));
        assert_eq!(
            users
                .create_user(
                    &Actor::user(2, "fin", UserRole::Finance),
                    "other",
                    "long-enough",
                    UserRole::Finance,
                    None
                )
                .await
                .unwrap_err(),
            AppError::Forbidden
        );

        users
            .create_user(&admin(), "fin-ops", "long-enough", UserRole::Finance, None)
            .await
            .unwrap();
        assert!(matches!(
            users
                .create_user(&admin(), "fin-ops", "long-enough", UserRole::Finance, None)
                .await,
            Err(AppError::AlreadyExists(_))
        ));
    }
}
