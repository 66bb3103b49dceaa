//! Recharge orders
//!
//! A funding request moves `pending → settled | failed`, exactly once per
//! external confirmation id. Orders whose status cannot be determined after
//! repeated polling become `disputed` until an operator resolves them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::AppError;
use crate::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RechargeStatus {
    #[default]
    Pending,
    Settled,
    Failed,
    Disputed,
}

impl fmt::Display for RechargeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RechargeStatus::Pending => write!(f, "pending"),
            RechargeStatus::Settled => write!(f, "settled"),
            RechargeStatus::Failed => write!(f, "failed"),
            RechargeStatus::Disputed => write!(f, "disputed"),
        }
    }
}

impl RechargeStatus {
    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(RechargeStatus::Pending),
            "settled" => Some(RechargeStatus::Settled),
            "failed" => Some(RechargeStatus::Failed),
            "disputed" => Some(RechargeStatus::Disputed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RechargeStatus::Settled | RechargeStatus::Failed)
    }

    /// Allowed transitions; disputed orders can only be resolved by an operator
    pub fn can_transition_to(&self, next: RechargeStatus) -> bool {
        use RechargeStatus::*;
        matches!(
            (self, next),
            (Pending, Settled) | (Pending, Failed) | (Pending, Disputed) | (Disputed, Settled)
                | (Disputed, Failed)
        )
    }

    pub fn ensure_transition(&self, next: RechargeStatus) -> AppResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(AppError::InvalidStateTransition {
                entity: "recharge_order".to_string(),
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RechargeOrder {
    pub id: Uuid,
    pub account_id: i64,
    pub amount: Decimal,
    pub status: RechargeStatus,
    /// Reference assigned by the settlement gateway
    pub gateway_reference: String,
    pub checkout_url: Option<String>,
    /// External confirmation id, unique across orders once settled
    pub confirmation_id: Option<String>,
    /// Consecutive failed status polls
    pub poll_failures: i32,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// Data for storing a freshly created order
#[derive(Debug, Clone)]
pub struct NewRechargeOrder {
    pub id: Uuid,
    pub account_id: i64,
    pub amount: Decimal,
    pub gateway_reference: String,
    pub checkout_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Order created at the settlement gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub reference: String,
    pub checkout_url: Option<String>,
}

/// Settlement status as reported by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum GatewayStatus {
    Pending,
    Settled { confirmation_id: String },
    Failed { reason: String },
}

/// Outcome of a settlement attempt
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    /// The credit was applied by this call
    Applied(RechargeOrder),
    /// The confirmation id had already been applied to this order
    AlreadySettled(RechargeOrder),
}

impl SettlementOutcome {
    pub fn order(&self) -> &RechargeOrder {
        match self {
            SettlementOutcome::Applied(order) | SettlementOutcome::AlreadySettled(order) => order,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recharge_transitions() {
        use RechargeStatus::*;
        assert!(Pending.can_transition_to(Settled));
        assert!(Pending.can_transition_to(Disputed));
        assert!(Disputed.can_transition_to(Failed));
        assert!(!Settled.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Settled));
        assert!(!Settled.can_transition_to(Settled));
    }

    #[test]
    fn test_ensure_transition_error() {
        let err = RechargeStatus::Failed
            .ensure_transition(RechargeStatus::Settled)
            .unwrap_err();
        assert_eq!(err.error_code(), "invalid_state_transition");
    }

    #[test]
    fn test_gateway_status_wire_format() {
        let status: GatewayStatus =
            serde_json::from_str(r#"{"status":"settled","confirmation_id":"cf_1"}"#).unwrap();
        assert_eq!(
            status,
            GatewayStatus::Settled {
                confirmation_id: "cf_1".to_string()
            }
        );
    }
}
