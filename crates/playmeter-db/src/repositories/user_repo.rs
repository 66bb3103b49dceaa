//! User repository implementation
//!
//! Provides PostgreSQL-backed storage for portal users.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use playmeter_core::{
    models::{NewUser, User, UserRole},
    traits::UserRepository,
    AppError, AppResult,
};
use sqlx::PgPool;
use tracing::{debug, error, info, instrument};

use crate::pg_error::is_unique_violation;

const USER_COLUMNS: &str =
    "id, username, password_hash, role, account_id, active, last_login, created_at, updated_at";

/// PostgreSQL implementation of UserRepository
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    /// Create a new user repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    #[instrument(skip(self))]
    async fn find_by_id(&self, id: i64) -> AppResult<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);
        let row = sqlx::query_as::<sqlx::Postgres, UserRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error finding user {}: {}", id, e);
                AppError::Database(format!("Failed to find user: {}", e))
            })?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn find_by_username(&self, username: &str) -> AppResult<Option<User>> {
        debug!("Finding user by username: {}", username);

        let sql = format!("SELECT {} FROM users WHERE username = $1", USER_COLUMNS);
        let row = sqlx::query_as::<sqlx::Postgres, UserRow>(&sql)
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error finding user {}: {}", username, e);
                AppError::Database(format!("Failed to find user: {}", e))
            })?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self, user), fields(username = %user.username))]
    async fn create(&self, user: &NewUser, at: DateTime<Utc>) -> AppResult<User> {
        if user.role == UserRole::Venue && user.account_id.is_none() {
            return Err(AppError::MissingField("account_id".to_string()));
        }

        let sql = format!(
            r#"
            INSERT INTO users (username, password_hash, role, account_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            RETURNING {}
            "#,
            USER_COLUMNS
        );
        let row = sqlx::query_as::<sqlx::Postgres, UserRow>(&sql)
            .bind(&user.username)
            .bind(&user.password_hash)
            .bind(user.role.to_string())
            .bind(user.account_id)
            .bind(at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::AlreadyExists(format!("User {} already exists", user.username))
                } else {
                    error!("Database error creating user: {}", e);
                    AppError::Database(format!("Failed to create user: {}", e))
                }
            })?;

        info!("Created {} user {}", user.role, user.username);
        Ok(row.into())
    }

    #[instrument(skip(self))]
    async fn update_last_login(&self, id: i64, at: DateTime<Utc>) -> AppResult<()> {
        sqlx::query("UPDATE users SET last_login = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error updating last login for {}: {}", id, e);
                AppError::Database(format!("Failed to update last login: {}", e))
            })?;

        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: i64,
    username: String,
    password_hash: String,
    role: String,
    account_id: Option<i64>,
    active: bool,
    last_login: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            username: row.username,
            password_hash: row.password_hash,
            role: UserRole::from_str(&row.role).unwrap_or_default(),
            account_id: row.account_id,
            active: row.active,
            last_login: row.last_login,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
