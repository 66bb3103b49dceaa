//! Settlement reconciler
//!
//! Recharge orders move `pending → settled | failed`. A confirmation credits
//! the account exactly once per confirmation id. Orders left pending past the
//! confirmation timeout are polled at the gateway; when polling itself keeps
//! failing the order becomes `disputed` and waits for an operator.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use playmeter_core::{
    config::SettlementConfig,
    models::{GatewayStatus, NewRechargeOrder, RechargeOrder, RechargeStatus, SettlementOutcome},
    traits::{AccountRepository, Alert, AlertKind, AlertSink, RechargeRepository, SettlementGateway},
    AppError, AppResult, Clock,
};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::audit::{Actor, AuditTrail};
use crate::ledger::BalanceLedger;
use crate::policy_cache::PolicyCache;

/// Orders examined per polling sweep
const POLL_BATCH: i64 = 100;

/// Polling behaviour
#[derive(Debug, Clone, Copy)]
pub struct SettlementSettings {
    pub confirmation_timeout: Duration,
    pub max_poll_failures: i32,
}

impl From<&SettlementConfig> for SettlementSettings {
    fn from(config: &SettlementConfig) -> Self {
        Self {
            confirmation_timeout: Duration::seconds(config.confirmation_timeout_secs),
            max_poll_failures: config.max_poll_failures.max(1),
        }
    }
}

impl Default for SettlementSettings {
    fn default() -> Self {
        Self::from(&SettlementConfig::default())
    }
}

/// Operator decision on a disputed order
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Settled { confirmation_id: String },
    Failed { reason: String },
}

/// Counts from one polling sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub checked: usize,
    pub settled: usize,
    pub failed: usize,
    pub still_pending: usize,
    pub poll_errors: usize,
    pub disputed: usize,
}

pub struct SettlementService {
    gateway: Arc<dyn SettlementGateway>,
    recharges: Arc<dyn RechargeRepository>,
    accounts: Arc<dyn AccountRepository>,
    ledger: Arc<BalanceLedger>,
    alerts: Arc<dyn AlertSink>,
    audit: Arc<AuditTrail>,
    policy: Arc<PolicyCache>,
    clock: Arc<dyn Clock>,
    settings: SettlementSettings,
}

impl SettlementService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<dyn SettlementGateway>,
        recharges: Arc<dyn RechargeRepository>,
        accounts: Arc<dyn AccountRepository>,
        ledger: Arc<BalanceLedger>,
        alerts: Arc<dyn AlertSink>,
        audit: Arc<AuditTrail>,
        policy: Arc<PolicyCache>,
        clock: Arc<dyn Clock>,
        settings: SettlementSettings,
    ) -> Self {
        Self {
            gateway,
            recharges,
            accounts,
            ledger,
            alerts,
            audit,
            policy,
            clock,
            settings,
        }
    }

    /// Start a recharge: create the gateway order, then store it as pending
    ///
    /// The gateway call happens before anything touches the account, so no
    /// ledger lock is held across network I/O.
    #[instrument(skip(self))]
    pub async fn initiate_recharge(&self, account_id: i64, amount: Decimal) -> AppResult<RechargeOrder> {
        if amount <= Decimal::ZERO || amount.scale() > 2 {
            return Err(AppError::invalid_field(
                "amount",
                "must be positive with at most 2 decimal places",
            ));
        }
        let account = self
            .accounts
            .find_by_id(account_id)
            .await?
            .filter(|account| account.active)
            .ok_or_else(|| AppError::AccountNotFound(account_id.to_string()))?;

        let order_id = Uuid::new_v4();
        let gateway_order = self
            .gateway
            .create_pending_order(order_id, account.id, amount)
            .await?;

        let order = self
            .recharges
            .create(&NewRechargeOrder {
                id: order_id,
                account_id: account.id,
                amount,
                gateway_reference: gateway_order.reference,
                checkout_url: gateway_order.checkout_url,
                created_at: self.clock.now(),
            })
            .await?;

        info!("Created recharge order {} for {} on account {}", order.id, amount, account.id);
        Ok(order)
    }

    /// Apply an external confirmation
    ///
    /// Repeating the same confirmation returns `AlreadySettled`; a different
    /// confirmation id for a settled order is a conflict.
    #[instrument(skip(self))]
    pub async fn confirm(&self, order_id: Uuid, confirmation_id: &str) -> AppResult<SettlementOutcome> {
        let confirmation_id = confirmation_id.trim();
        if confirmation_id.is_empty() {
            return Err(AppError::MissingField("confirmation_id".to_string()));
        }

        let policy = self.policy.current().await?;
        let outcome = self
            .ledger
            .settle_recharge(order_id, confirmation_id, self.clock.now(), &policy)
            .await?;

        if let SettlementOutcome::AlreadySettled(order) = &outcome {
            info!("Duplicate confirmation {} for order {}", confirmation_id, order.id);
        }
        Ok(outcome)
    }

    /// Apply an explicit failure signal; repeating it is harmless
    #[instrument(skip(self))]
    pub async fn fail(&self, order_id: Uuid, reason: &str) -> AppResult<RechargeOrder> {
        let order = self.get(order_id).await?;
        if order.status == RechargeStatus::Failed {
            return Ok(order);
        }

        let order = self
            .recharges
            .mark_failed(order_id, reason, self.clock.now())
            .await?;
        warn!("Recharge order {} failed: {}", order.id, reason);
        Ok(order)
    }

    /// Operator resolution of a disputed order
    #[instrument(skip(self, actor), fields(actor = %actor.username))]
    pub async fn resolve_disputed(
        &self,
        actor: &Actor,
        order_id: Uuid,
        resolution: Resolution,
    ) -> AppResult<RechargeOrder> {
        let order = self.get(order_id).await?;
        if order.status != RechargeStatus::Disputed {
            return Err(AppError::InvalidStateTransition {
                entity: "recharge_order".to_string(),
                from: order.status.to_string(),
                to: match resolution {
                    Resolution::Settled { .. } => RechargeStatus::Settled.to_string(),
                    Resolution::Failed { .. } => RechargeStatus::Failed.to_string(),
                },
            });
        }

        let (resolved, details) = match &resolution {
            Resolution::Settled { confirmation_id } => (
                self.confirm(order_id, confirmation_id).await?.order().clone(),
                json!({ "resolution": "settled", "confirmation_id": confirmation_id }),
            ),
            Resolution::Failed { reason } => (
                self.fail(order_id, reason).await?,
                json!({ "resolution": "failed", "reason": reason }),
            ),
        };

        self.audit
            .record(actor, "recharge.resolve", "recharge_order", order_id, details)
            .await;
        Ok(resolved)
    }

    pub async fn get(&self, order_id: Uuid) -> AppResult<RechargeOrder> {
        self.recharges
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Recharge order {}", order_id)))
    }

    pub async fn list_for_account(&self, account_id: i64) -> AppResult<Vec<RechargeOrder>> {
        self.recharges.list_by_account(account_id).await
    }

    pub async fn list_disputed(&self) -> AppResult<Vec<RechargeOrder>> {
        self.recharges.list_by_status(RechargeStatus::Disputed).await
    }

    /// One polling sweep over orders past the confirmation timeout
    #[instrument(skip(self))]
    pub async fn poll_once(&self) -> AppResult<PollSummary> {
        let now = self.clock.now();
        let cutoff = now - self.settings.confirmation_timeout;
        let orders = self.recharges.list_awaiting_poll(cutoff, POLL_BATCH).await?;

        let mut summary = PollSummary {
            checked: orders.len(),
            ..Default::default()
        };
        for order in orders {
            match self.gateway.query_status(&order).await {
                Ok(status) => self.apply_polled_status(&order, status, now, &mut summary).await,
                Err(e) => self.record_poll_error(&order, &e, now, &mut summary).await,
            }
        }

        if summary.checked > 0 {
            info!(
                "Settlement poll: {} checked, {} settled, {} failed, {} pending, {} errors, {} disputed",
                summary.checked,
                summary.settled,
                summary.failed,
                summary.still_pending,
                summary.poll_errors,
                summary.disputed
            );
        }
        Ok(summary)
    }

    async fn apply_polled_status(
        &self,
        order: &RechargeOrder,
        status: GatewayStatus,
        now: DateTime<Utc>,
        summary: &mut PollSummary,
    ) {
        let applied = match status {
            GatewayStatus::Settled { confirmation_id } => self
                .confirm(order.id, &confirmation_id)
                .await
                .map(|_| summary.settled += 1),
            GatewayStatus::Failed { reason } => {
                self.fail(order.id, &reason).await.map(|_| summary.failed += 1)
            }
            GatewayStatus::Pending => {
                summary.still_pending += 1;
                self.recharges.reset_poll_failures(order.id, now).await
            }
        };
        if let Err(e) = applied {
            error!("Failed to apply polled status for order {}: {}", order.id, e);
        }
    }

    async fn record_poll_error(
        &self,
        order: &RechargeOrder,
        cause: &AppError,
        now: DateTime<Utc>,
        summary: &mut PollSummary,
    ) {
        summary.poll_errors += 1;
        warn!("Status poll failed for order {}: {}", order.id, cause);

        let updated = match self.recharges.record_poll_failure(order.id, now).await {
            Ok(updated) => updated,
            Err(e) => {
                error!("Failed to record poll failure for order {}: {}", order.id, e);
                return;
            }
        };
        if updated.poll_failures < self.settings.max_poll_failures {
            return;
        }

        let reason = format!(
            "status unknown after {} failed polls: {}",
            updated.poll_failures, cause
        );
        match self.recharges.mark_disputed(order.id, &reason, now).await {
            Ok(disputed) => {
                summary.disputed += 1;
                self.alerts.raise(&Alert {
                    kind: AlertKind::SettlementDisputed,
                    account_ids: vec![disputed.account_id],
                    source: Some(disputed.gateway_reference.clone()),
                    detail: format!("Recharge order {} disputed: {}", disputed.id, reason),
                    raised_at: now,
                });
                self.audit
                    .record(
                        &Actor::system("settlement-poller"),
                        "recharge.dispute",
                        "recharge_order",
                        disputed.id,
                        json!({ "poll_failures": disputed.poll_failures, "reason": reason }),
                    )
                    .await;
            }
            Err(e) => error!("Failed to mark order {} disputed: {}", order.id, e),
        }
    }
}
