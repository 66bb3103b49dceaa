//! Refund and invoice review DTOs

use playmeter_core::models::{InvoiceStatus, RefundStatus};
use rust_decimal::Decimal;
use serde::Deserialize;
use validator::Validate;

/// Refund request from a venue user
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RefundCreateRequest {
    pub amount: Decimal,

    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

/// Refund approval, optionally for less than requested
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefundApproveRequest {
    pub approved_amount: Option<Decimal>,
}

/// Rejection of a refund or invoice request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RejectRequest {
    #[validate(length(min = 1, max = 500, message = "Reason is required"))]
    pub reason: String,
}

/// Invoice request from a venue user
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct InvoiceCreateRequest {
    pub amount: Decimal,

    #[validate(length(min = 1, max = 200, message = "Billing title is required"))]
    pub billing_title: String,

    #[validate(length(max = 64))]
    pub tax_id: Option<String>,
}

/// Filters for the refund review queue
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefundFilterParams {
    pub status: Option<RefundStatus>,
    pub account_id: Option<i64>,
}

/// Filters for the invoice review queue
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceFilterParams {
    pub status: Option<InvoiceStatus>,
    pub account_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_requires_reason() {
        let request = RejectRequest {
            reason: String::new(),
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_filters_parse_lowercase_status() {
        let filters: RefundFilterParams =
            serde_json::from_value(serde_json::json!({"status": "approved"})).unwrap();
        assert_eq!(filters.status, Some(RefundStatus::Approved));
        assert!(filters.account_id.is_none());
    }
}
