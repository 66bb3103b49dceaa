//! SQLSTATE-aware mapping of sqlx errors

use playmeter_core::AppError;
use tracing::error;

const UNIQUE_VIOLATION: &str = "23505";
const CHECK_VIOLATION: &str = "23514";
const LOCK_NOT_AVAILABLE: &str = "55P03";

pub(crate) fn sqlstate(e: &sqlx::Error) -> Option<String> {
    e.as_database_error()
        .and_then(|d| d.code())
        .map(|c| c.into_owned())
}

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    sqlstate(e).as_deref() == Some(UNIQUE_VIOLATION)
}

/// Map an error raised inside a ledger unit of work
///
/// `lock_timeout` expiry becomes the retryable `LockTimeout`.
pub(crate) fn ledger_error(e: sqlx::Error, context: &str, wait_ms: u64) -> AppError {
    match sqlstate(&e).as_deref() {
        Some(LOCK_NOT_AVAILABLE) => AppError::LockTimeout { wait_ms },
        Some(CHECK_VIOLATION) => {
            error!("Check constraint rejected {}: {}", context, e);
            AppError::Conflict(format!("{} violates a balance constraint", context))
        }
        _ => {
            error!("Database error during {}: {}", context, e);
            AppError::Database(format!("Failed to {}: {}", context, e))
        }
    }
}
