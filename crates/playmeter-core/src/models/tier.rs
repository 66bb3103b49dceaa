//! Tier classification
//!
//! Each month the trailing month's usage spend decides an account's tier.
//! A change record is unique per (account, period).

use chrono::{DateTime, Datelike, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::account::Tier;
use crate::error::AppError;
use crate::AppResult;

/// Spend thresholds, inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierThresholds {
    pub silver: Decimal,
    pub gold: Decimal,
}

impl TierThresholds {
    pub fn classify(&self, spend: Decimal) -> Tier {
        if spend >= self.gold {
            Tier::Gold
        } else if spend >= self.silver {
            Tier::Silver
        } else {
            Tier::Standard
        }
    }
}

/// Calendar month a classification run covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub year: i32,
    pub month: u32,
}

impl BillingPeriod {
    pub fn new(year: i32, month: u32) -> AppResult<Self> {
        if !(1..=12).contains(&month) {
            return Err(AppError::invalid_field("period", "month must be 01-12"));
        }
        Ok(Self { year, month })
    }

    /// Parse `YYYY-MM`
    pub fn parse(raw: &str) -> AppResult<Self> {
        let invalid = || AppError::invalid_field("period", "expected YYYY-MM");
        let (year, month) = raw.trim().split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        Self::new(year, month)
    }

    /// The calendar month before the one containing `now`
    pub fn previous(now: DateTime<Utc>) -> Self {
        if now.month() == 1 {
            Self {
                year: now.year() - 1,
                month: 12,
            }
        } else {
            Self {
                year: now.year(),
                month: now.month() - 1,
            }
        }
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Inclusive start of the period
    pub fn start(&self) -> AppResult<DateTime<Utc>> {
        Utc.with_ymd_and_hms(self.year, self.month, 1, 0, 0, 0)
            .single()
            .ok_or_else(|| AppError::invalid_field("period", "date out of range"))
    }

    /// Exclusive end of the period
    pub fn end(&self) -> AppResult<DateTime<Utc>> {
        self.next().start()
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Recorded tier change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierChange {
    pub id: i64,
    pub account_id: i64,
    pub period: String,
    pub previous_tier: Tier,
    pub new_tier: Tier,
    pub spend: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTierChange {
    pub account_id: i64,
    pub period: BillingPeriod,
    pub previous_tier: Tier,
    pub new_tier: Tier,
    pub spend: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Summary of one classification run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierRunSummary {
    pub period: String,
    pub evaluated: usize,
    pub changed: usize,
}
