//! Usage records and the identifiers around an authorization
//!
//! A usage record is written once per successful authorization and never
//! changed afterwards. It is unique on the server-issued session id and,
//! inside the idempotency window, on its business key.

use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AppError;
use crate::AppResult;

/// Length of the random suffix of a session id
pub const SESSION_SUFFIX_LEN: usize = 16;

// ==================== Venue identifier ====================

/// Venue identifier
///
/// Devices send either the prefixed form (`venue_42`, `venue-42`, `V42`) or
/// the bare number (`42`); all normalize to the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VenueId(pub i64);

impl VenueId {
    pub fn parse(raw: &str) -> AppResult<Self> {
        let trimmed = raw.trim();
        let lower = trimmed.to_ascii_lowercase();
        let digits = lower
            .strip_prefix("venue_")
            .or_else(|| lower.strip_prefix("venue-"))
            .or_else(|| lower.strip_prefix('v'))
            .unwrap_or(&lower);

        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(AppError::invalid_field(
                "venue_id",
                format!("unrecognized venue identifier '{}'", trimmed),
            ));
        }

        digits
            .parse::<i64>()
            .ok()
            .filter(|id| *id > 0)
            .map(VenueId)
            .ok_or_else(|| AppError::invalid_field("venue_id", "venue number out of range"))
    }
}

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "venue_{}", self.0)
    }
}

impl FromStr for VenueId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VenueId::parse(s)
    }
}

// ==================== Session identifier ====================

/// Server-generated session identifier: `{accountId}_{epochMillis}_{16 alnum}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

/// Components of a parsed session id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdParts {
    pub account_id: i64,
    pub issued_at_millis: i64,
    pub suffix: String,
}

impl SessionId {
    /// Generate a fresh session id for an account
    pub fn generate(account_id: i64, now: DateTime<Utc>) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SESSION_SUFFIX_LEN)
            .map(char::from)
            .collect();
        SessionId(format!("{}_{}_{}", account_id, now.timestamp_millis(), suffix))
    }

    /// Parse and validate a session id received from a caller
    pub fn parse(raw: &str) -> AppResult<Self> {
        Self::split(raw)?;
        Ok(SessionId(raw.to_string()))
    }

    pub fn parts(&self) -> AppResult<SessionIdParts> {
        Self::split(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn split(raw: &str) -> AppResult<SessionIdParts> {
        let invalid = || AppError::SessionIdFormatInvalid(raw.to_string());

        let mut parts = raw.split('_');
        let (Some(account), Some(millis), Some(suffix), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        let all_digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
        if !all_digits(account) || !all_digits(millis) {
            return Err(invalid());
        }
        if suffix.len() != SESSION_SUFFIX_LEN || !suffix.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(invalid());
        }

        Ok(SessionIdParts {
            account_id: account.parse().map_err(|_| invalid())?,
            issued_at_millis: millis.parse().map_err(|_| invalid())?,
            suffix: suffix.to_string(),
        })
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ==================== Business key ====================

/// Tuple identifying a logically duplicate billing request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusinessKey {
    pub account_id: i64,
    pub catalog_item_id: i64,
    pub venue_id: VenueId,
    pub party_size: i32,
}

impl BusinessKey {
    /// Stable digest used as the indexed idempotency key
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(
            format!(
                "{}|{}|{}|{}",
                self.account_id, self.catalog_item_id, self.venue_id.0, self.party_size
            )
            .as_bytes(),
        );
        hex::encode(hasher.finalize())
    }
}

// ==================== Usage record ====================

/// Everything the ledger needs to persist one authorization
#[derive(Debug, Clone)]
pub struct UsageDraft {
    pub key: BusinessKey,
    pub catalog_item_code: String,
    pub price_per_participant: Decimal,
    pub total_cost: Decimal,
    pub session_id: SessionId,
    pub authorization_token: Uuid,
    /// Timestamp the device signed the request with
    pub client_timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: i64,
    pub session_id: String,
    pub authorization_token: Uuid,
    pub account_id: i64,
    pub catalog_item_id: i64,
    pub catalog_item_code: String,
    pub venue_id: i64,
    pub party_size: i32,
    pub business_key: String,
    pub price_per_participant: Decimal,
    pub total_cost: Decimal,
    /// Balance immediately after the debit, replayed verbatim to retries
    pub balance_after: Decimal,
    pub client_timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn outcome(&self, replayed: bool) -> AuthorizationOutcome {
        AuthorizationOutcome {
            session_id: self.session_id.clone(),
            authorization_token: self.authorization_token,
            total_cost: self.total_cost,
            remaining_balance: self.balance_after,
            replayed,
        }
    }
}

/// Success payload of an authorization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationOutcome {
    pub session_id: String,
    pub authorization_token: Uuid,
    pub total_cost: Decimal,
    pub remaining_balance: Decimal,
    /// True when served from an earlier record under the same business key
    #[serde(skip)]
    pub replayed: bool,
}

/// Result of committing a usage draft
#[derive(Debug, Clone, PartialEq)]
pub enum UsageCommit {
    Created(AuthorizationOutcome),
    Replayed(AuthorizationOutcome),
}

impl UsageCommit {
    pub fn into_outcome(self) -> AuthorizationOutcome {
        match self {
            UsageCommit::Created(outcome) | UsageCommit::Replayed(outcome) => outcome,
        }
    }
}

/// Idempotent replay decision
///
/// Returns the original result when `latest` was created under the same
/// business key less than `window` before `now`.
pub fn replay_within_window(
    latest: Option<&UsageRecord>,
    window: Duration,
    now: DateTime<Utc>,
) -> Option<AuthorizationOutcome> {
    latest
        .filter(|record| now - record.created_at < window)
        .map(|record| record.outcome(true))
}
