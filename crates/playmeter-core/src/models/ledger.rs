//! Ledger entries
//!
//! Every balance change is one append-only entry carrying before/after
//! snapshots, so `balance_after = balance_before + amount` holds per entry
//! and `balance = opening_balance + Σ amount` holds per account.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AppError;
use crate::AppResult;

/// Kind of balance-affecting event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    /// Debit for an authorized session
    Usage,
    /// Credit from a settled recharge order
    Recharge,
    /// Debit disbursing a completed refund
    Refund,
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryType::Usage => write!(f, "usage"),
            EntryType::Recharge => write!(f, "recharge"),
            EntryType::Refund => write!(f, "refund"),
        }
    }
}

impl EntryType {
    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "usage" => Some(EntryType::Usage),
            "recharge" => Some(EntryType::Recharge),
            "refund" => Some(EntryType::Refund),
            _ => None,
        }
    }

    /// Whether entries of this type decrease the balance
    pub fn is_debit(&self) -> bool {
        matches!(self, EntryType::Usage | EntryType::Refund)
    }
}

/// Ledger entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub account_id: i64,
    pub entry_type: EntryType,
    /// Signed amount, negative for debits
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    /// Session id, recharge order id or refund request id
    pub reference: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A computed balance change, not yet persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceMovement {
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
}

impl BalanceMovement {
    /// Debit `amount` from `balance`, refusing to go negative
    pub fn debit(balance: Decimal, amount: Decimal) -> AppResult<Self> {
        if amount < Decimal::ZERO {
            return Err(AppError::invalid_field("amount", "must not be negative"));
        }
        if balance < amount {
            return Err(AppError::InsufficientBalance {
                required: amount.round_dp(2).to_string(),
                available: balance.round_dp(2).to_string(),
            });
        }
        Ok(Self {
            amount: -amount,
            balance_before: balance,
            balance_after: balance - amount,
        })
    }

    /// Credit `amount` to `balance`
    pub fn credit(balance: Decimal, amount: Decimal) -> AppResult<Self> {
        if amount <= Decimal::ZERO {
            return Err(AppError::invalid_field("amount", "must be positive"));
        }
        Ok(Self {
            amount,
            balance_before: balance,
            balance_after: balance + amount,
        })
    }
}

/// Check `current == opening + Σ entries` and the per-entry snapshot chain
pub fn balance_reconciles(opening: Decimal, entries: &[LedgerEntry], current: Decimal) -> bool {
    let snapshots_hold = entries
        .iter()
        .all(|e| e.balance_after == e.balance_before + e.amount);
    let sum: Decimal = entries.iter().map(|e| e.amount).sum();
    snapshots_hold && opening + sum == current
}
