//! Recharge and settlement DTOs

use playmeter_core::{AppError, AppResult};
use playmeter_services::Resolution;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Recharge request from a venue user
#[derive(Debug, Clone, Deserialize)]
pub struct RechargeCreateRequest {
    /// Amount to credit once settled (validated by the settlement service)
    pub amount: Decimal,
}

/// Gateway callback confirming an order
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SettlementConfirmRequest {
    pub order_id: Uuid,

    #[validate(length(min = 1, max = 128, message = "Confirmation id is required"))]
    pub confirmation_id: String,
}

/// Gateway callback failing an order
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SettlementFailRequest {
    pub order_id: Uuid,

    #[validate(length(min = 1, max = 500, message = "Reason is required"))]
    pub reason: String,
}

/// Operator outcome for a disputed order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionKind {
    Settled,
    Failed,
}

/// Operator resolution of a disputed order
#[derive(Debug, Clone, Deserialize)]
pub struct ResolveRequest {
    pub outcome: ResolutionKind,
    pub confirmation_id: Option<String>,
    pub reason: Option<String>,
}

impl ResolveRequest {
    /// Settled needs a confirmation id, failed needs a reason
    pub fn to_resolution(&self) -> AppResult<Resolution> {
        let present = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        match self.outcome {
            ResolutionKind::Settled => present(&self.confirmation_id)
                .map(|confirmation_id| Resolution::Settled { confirmation_id })
                .ok_or_else(|| AppError::MissingField("confirmation_id".to_string())),
            ResolutionKind::Failed => present(&self.reason)
                .map(|reason| Resolution::Failed { reason })
                .ok_or_else(|| AppError::MissingField("reason".to_string())),
        }
    }
}

/// Result of a settlement callback
#[derive(Debug, Clone, Serialize)]
pub struct SettlementResponse {
    pub order_id: Uuid,
    /// False when the confirmation was a duplicate
    pub applied: bool,
    pub status: String,
}
