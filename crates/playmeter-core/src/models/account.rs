//! Account model
//!
//! A venue operator's prepaid account. The balance only moves through ledger
//! entries; accounts are soft-deactivated, never deleted.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AppError;
use crate::AppResult;

/// Spend-based account classification
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Standard,
    Silver,
    Gold,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Standard => write!(f, "standard"),
            Tier::Silver => write!(f, "silver"),
            Tier::Gold => write!(f, "gold"),
        }
    }
}

impl Tier {
    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "standard" => Some(Tier::Standard),
            "silver" => Some(Tier::Silver),
            "gold" => Some(Tier::Gold),
            _ => None,
        }
    }
}

/// Account entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Unique identifier
    pub id: i64,

    /// Display name of the venue operator
    pub name: String,

    /// Public credential identifier presented by devices
    pub access_key: String,

    /// SHA-256 digest of the secret; doubles as the HMAC signing key
    #[serde(skip_serializing)]
    pub secret_digest: String,

    /// Current balance, never negative
    pub balance: Decimal,

    /// Balance the account was registered with
    pub opening_balance: Decimal,

    pub tier: Tier,

    /// Set by the anomaly detector, cleared only by an administrator
    pub locked: bool,
    pub lock_reason: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,

    /// Soft-deactivation flag
    pub active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl Account {
    /// Reject billing against inactive or locked accounts
    pub fn ensure_billable(&self) -> AppResult<()> {
        if !self.active {
            return Err(AppError::UnknownCredential(self.access_key.clone()));
        }
        if self.locked {
            return Err(AppError::AccountLocked(
                self.lock_reason
                    .clone()
                    .unwrap_or_else(|| "locked".to_string()),
            ));
        }
        Ok(())
    }

    /// Check if the balance covers an amount
    #[inline]
    pub fn can_cover(&self, amount: Decimal) -> bool {
        self.balance >= amount
    }
}

impl Default for Account {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            access_key: String::new(),
            secret_digest: String::new(),
            balance: Decimal::ZERO,
            opening_balance: Decimal::ZERO,
            tier: Tier::Standard,
            locked: false,
            lock_reason: None,
            locked_at: None,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deactivated_at: None,
        }
    }
}

/// Data for registering an account
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub name: String,
    pub access_key: String,
    pub secret_digest: String,
    pub opening_balance: Decimal,
}

/// Lookup view used by the request authenticator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCredential {
    pub account_id: i64,
    pub access_key: String,
    pub secret_digest: String,
}

impl From<&Account> for DeviceCredential {
    fn from(account: &Account) -> Self {
        Self {
            account_id: account.id,
            access_key: account.access_key.clone(),
            secret_digest: account.secret_digest.clone(),
        }
    }
}
