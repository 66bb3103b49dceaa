//! Refund and invoice review state machines
//!
//! Refund: `pending → approved → completed`, invoice: `pending → approved → issued`,
//! both with a terminal `rejected` branch from `pending`. Only reviewer
//! actions move them.

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::AppError;
use crate::AppResult;

// ==================== Refund ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RefundStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Completed,
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefundStatus::Pending => write!(f, "pending"),
            RefundStatus::Approved => write!(f, "approved"),
            RefundStatus::Rejected => write!(f, "rejected"),
            RefundStatus::Completed => write!(f, "completed"),
        }
    }
}

impl RefundStatus {
    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(RefundStatus::Pending),
            "approved" => Some(RefundStatus::Approved),
            "rejected" => Some(RefundStatus::Rejected),
            "completed" => Some(RefundStatus::Completed),
            _ => None,
        }
    }

    pub fn ensure_transition(&self, next: RefundStatus) -> AppResult<()> {
        use RefundStatus::*;
        match (self, next) {
            (Pending, Approved) | (Pending, Rejected) | (Approved, Completed) => Ok(()),
            _ => Err(AppError::InvalidStateTransition {
                entity: "refund_request".to_string(),
                from: self.to_string(),
                to: next.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    pub id: Uuid,
    pub account_id: i64,
    pub requested_amount: Decimal,
    pub approved_amount: Option<Decimal>,
    /// Account balance when the request was filed
    pub balance_snapshot: Decimal,
    pub reason: Option<String>,
    pub status: RefundStatus,
    pub reviewer: Option<String>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewRefundRequest {
    pub id: Uuid,
    pub account_id: i64,
    pub requested_amount: Decimal,
    pub balance_snapshot: Decimal,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Requested refund must be positive and within the balance at request time
pub fn check_refund_amount(requested: Decimal, balance: Decimal) -> AppResult<()> {
    if requested <= Decimal::ZERO {
        return Err(AppError::invalid_field("amount", "must be positive"));
    }
    if requested > balance {
        return Err(AppError::RefundExceedsBalance {
            requested: requested.round_dp(2).to_string(),
            available: balance.round_dp(2).to_string(),
        });
    }
    Ok(())
}

/// Approved amount may be lowered by the reviewer, never raised
pub fn resolve_approved_amount(requested: Decimal, approved: Option<Decimal>) -> AppResult<Decimal> {
    let approved = approved.unwrap_or(requested);
    if approved <= Decimal::ZERO {
        return Err(AppError::invalid_field("approved_amount", "must be positive"));
    }
    if approved > requested {
        return Err(AppError::invalid_field(
            "approved_amount",
            format!("must not exceed the requested amount {}", requested.round_dp(2)),
        ));
    }
    Ok(approved)
}

// ==================== Invoice ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Issued,
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvoiceStatus::Pending => write!(f, "pending"),
            InvoiceStatus::Approved => write!(f, "approved"),
            InvoiceStatus::Rejected => write!(f, "rejected"),
            InvoiceStatus::Issued => write!(f, "issued"),
        }
    }
}

impl InvoiceStatus {
    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(InvoiceStatus::Pending),
            "approved" => Some(InvoiceStatus::Approved),
            "rejected" => Some(InvoiceStatus::Rejected),
            "issued" => Some(InvoiceStatus::Issued),
            _ => None,
        }
    }

    pub fn ensure_transition(&self, next: InvoiceStatus) -> AppResult<()> {
        use InvoiceStatus::*;
        match (self, next) {
            (Pending, Approved) | (Pending, Rejected) | (Approved, Issued) => Ok(()),
            _ => Err(AppError::InvalidStateTransition {
                entity: "invoice_request".to_string(),
                from: self.to_string(),
                to: next.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceRequest {
    pub id: Uuid,
    pub account_id: i64,
    pub amount: Decimal,
    pub balance_snapshot: Decimal,
    /// Legal name printed on the invoice
    pub billing_title: String,
    pub tax_id: Option<String>,
    pub status: InvoiceStatus,
    pub reviewer: Option<String>,
    pub rejection_reason: Option<String>,
    pub invoice_number: Option<String>,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub issued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewInvoiceRequest {
    pub id: Uuid,
    pub account_id: i64,
    pub amount: Decimal,
    pub balance_snapshot: Decimal,
    pub billing_title: String,
    pub tax_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Invoice amount must be positive and within the balance at request time
pub fn check_invoice_amount(amount: Decimal, balance: Decimal) -> AppResult<()> {
    if amount <= Decimal::ZERO {
        return Err(AppError::invalid_field("amount", "must be positive"));
    }
    if amount > balance {
        return Err(AppError::invalid_field(
            "amount",
            format!("exceeds balance {} at request time", balance.round_dp(2)),
        ));
    }
    Ok(())
}

/// Invoice number `INV-{YYYYMM}-{seq}`
pub fn invoice_number(issued_at: DateTime<Utc>, seq: i64) -> String {
    format!(
        "INV-{:04}{:02}-{:06}",
        issued_at.year(),
        issued_at.month(),
        seq
    )
}

/// A reviewer decision applied to a pending or approved request
#[derive(Debug, Clone)]
pub struct ReviewDecision<S> {
    pub from: S,
    pub to: S,
    pub reviewer: String,
    pub approved_amount: Option<Decimal>,
    pub rejection_reason: Option<String>,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_refund_transitions() {
        use RefundStatus::*;
        assert!(Pending.ensure_transition(Approved).is_ok());
        assert!(Pending.ensure_transition(Rejected).is_ok());
        assert!(Approved.ensure_transition(Completed).is_ok());
        assert!(Pending.ensure_transition(Completed).is_err());
        assert!(Rejected.ensure_transition(Approved).is_err());
        assert!(Completed.ensure_transition(Completed).is_err());
    }

    #[test]
    fn test_invoice_transitions() {
        use InvoiceStatus::*;
        assert!(Pending.ensure_transition(Approved).is_ok());
        assert!(Approved.ensure_transition(Issued).is_ok());
        assert!(Approved.ensure_transition(Rejected).is_err());
        assert!(Issued.ensure_transition(Issued).is_err());
    }

    #[test]
    fn test_refund_over_balance_is_rejected() {
        assert_eq!(
            check_refund_amount(dec!(200.00), dec!(50.00)),
            Err(AppError::RefundExceedsBalance {
                requested: "200.00".to_string(),
                available: "50.00".to_string()
            })
        );
        assert!(check_refund_amount(dec!(50.00), dec!(50.00)).is_ok());
        assert!(check_refund_amount(dec!(0), dec!(50.00)).is_err());
    }

    #[test]
    fn test_approved_amount_never_above_requested() {
        assert_eq!(resolve_approved_amount(dec!(40), None).unwrap(), dec!(40));
        assert_eq!(
            resolve_approved_amount(dec!(40), Some(dec!(25))).unwrap(),
            dec!(25)
        );
        assert!(resolve_approved_amount(dec!(40), Some(dec!(41))).is_err());
        assert!(resolve_approved_amount(dec!(40), Some(dec!(0))).is_err());
    }

    #[test]
    fn test_invoice_number_format() {
        let at = Utc.with_ymd_and_hms(2026, 3, 15, 10, 0, 0).unwrap();
        assert_eq!(invoice_number(at, 42), "INV-202603-000042");
    }
}
