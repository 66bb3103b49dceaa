//! Refund and invoice review
//!
//! Refunds go `pending → approved → completed`, invoices
//! `pending → approved → issued`, both with `rejected` branching from
//! `pending`. Every transition needs a reviewer and is audited. Completing a
//! refund debits the approved amount through the balance ledger.

use std::sync::Arc;

use playmeter_core::{
    models::{
        review::{check_invoice_amount, check_refund_amount, resolve_approved_amount},
        Account, InvoiceRequest, InvoiceStatus, NewInvoiceRequest, NewRefundRequest,
        RefundRequest, RefundStatus, ReviewDecision,
    },
    traits::{AccountRepository, InvoiceRepository, RefundRepository},
    AppError, AppResult, Clock,
};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::audit::{Actor, AuditTrail};
use crate::ledger::BalanceLedger;
use crate::policy_cache::PolicyCache;

pub struct ReviewService {
    accounts: Arc<dyn AccountRepository>,
    refunds: Arc<dyn RefundRepository>,
    invoices: Arc<dyn InvoiceRepository>,
    ledger: Arc<BalanceLedger>,
    audit: Arc<AuditTrail>,
    policy: Arc<PolicyCache>,
    clock: Arc<dyn Clock>,
}

fn ensure_reviewer(actor: &Actor) -> AppResult<()> {
    match actor.role {
        Some(role) if role.can_review() => Ok(()),
        _ => Err(AppError::Forbidden),
    }
}

fn required_reason(reason: &str) -> AppResult<String> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(AppError::MissingField("reason".to_string()));
    }
    Ok(reason.to_string())
}

impl ReviewService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        refunds: Arc<dyn RefundRepository>,
        invoices: Arc<dyn InvoiceRepository>,
        ledger: Arc<BalanceLedger>,
        audit: Arc<AuditTrail>,
        policy: Arc<PolicyCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            accounts,
            refunds,
            invoices,
            ledger,
            audit,
            policy,
            clock,
        }
    }

    async fn active_account(&self, account_id: i64) -> AppResult<Account> {
        self.accounts
            .find_by_id(account_id)
            .await?
            .filter(|account| account.active)
            .ok_or_else(|| AppError::AccountNotFound(account_id.to_string()))
    }

    // ===== Refunds =====

    /// File a refund request capped by the current balance
    #[instrument(skip(self, reason))]
    pub async fn request_refund(
        &self,
        account_id: i64,
        amount: Decimal,
        reason: Option<String>,
    ) -> AppResult<RefundRequest> {
        let account = self.active_account(account_id).await?;
        check_refund_amount(amount, account.balance)?;

        let request = self
            .refunds
            .create(&NewRefundRequest {
                id: Uuid::new_v4(),
                account_id,
                requested_amount: amount,
                balance_snapshot: account.balance,
                reason: reason.filter(|r| !r.trim().is_empty()),
                created_at: self.clock.now(),
            })
            .await?;

        info!("Refund request {} for {} filed by account {}", request.id, amount, account_id);
        Ok(request)
    }

    pub async fn get_refund(&self, id: Uuid) -> AppResult<RefundRequest> {
        self.refunds
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Refund request {}", id)))
    }

    pub async fn list_refunds(
        &self,
        status: Option<RefundStatus>,
        account_id: Option<i64>,
    ) -> AppResult<Vec<RefundRequest>> {
        self.refunds.list(status, account_id).await
    }

    /// Approve, optionally lowering the amount
    #[instrument(skip(self, actor), fields(reviewer = %actor.username))]
    pub async fn approve_refund(
        &self,
        actor: &Actor,
        id: Uuid,
        approved_amount: Option<Decimal>,
    ) -> AppResult<RefundRequest> {
        ensure_reviewer(actor)?;
        let request = self.get_refund(id).await?;
        let approved = resolve_approved_amount(request.requested_amount, approved_amount)?;

        let reviewed = self
            .refunds
            .review(
                id,
                &ReviewDecision {
                    from: RefundStatus::Pending,
                    to: RefundStatus::Approved,
                    reviewer: actor.username.clone(),
                    approved_amount: Some(approved),
                    rejection_reason: None,
                    at: self.clock.now(),
                },
            )
            .await?;

        self.audit
            .record(
                actor,
                "refund.approve",
                "refund_request",
                id,
                json!({ "requested": request.requested_amount, "approved": approved }),
            )
            .await;
        Ok(reviewed)
    }

    #[instrument(skip(self, actor), fields(reviewer = %actor.username))]
    pub async fn reject_refund(&self, actor: &Actor, id: Uuid, reason: &str) -> AppResult<RefundRequest> {
        ensure_reviewer(actor)?;
        let reason = required_reason(reason)?;

        let reviewed = self
            .refunds
            .review(
                id,
                &ReviewDecision {
                    from: RefundStatus::Pending,
                    to: RefundStatus::Rejected,
                    reviewer: actor.username.clone(),
                    approved_amount: None,
                    rejection_reason: Some(reason.clone()),
                    at: self.clock.now(),
                },
            )
            .await?;

        self.audit
            .record(actor, "refund.reject", "refund_request", id, json!({ "reason": reason }))
            .await;
        Ok(reviewed)
    }

    /// Disburse an approved refund: debits the approved amount
    #[instrument(skip(self, actor), fields(reviewer = %actor.username))]
    pub async fn complete_refund(&self, actor: &Actor, id: Uuid) -> AppResult<RefundRequest> {
        ensure_reviewer(actor)?;
        let policy = self.policy.current().await?;
        let completed = self
            .ledger
            .complete_refund(id, &actor.username, self.clock.now(), &policy)
            .await?;

        self.audit
            .record(
                actor,
                "refund.complete",
                "refund_request",
                id,
                json!({ "amount": completed.approved_amount.unwrap_or(completed.requested_amount) }),
            )
            .await;
        Ok(completed)
    }

    // ===== Invoices =====

    #[instrument(skip(self, billing_title, tax_id))]
    pub async fn request_invoice(
        &self,
        account_id: i64,
        amount: Decimal,
        billing_title: &str,
        tax_id: Option<String>,
    ) -> AppResult<InvoiceRequest> {
        let billing_title = billing_title.trim();
        if billing_title.is_empty() {
            return Err(AppError::MissingField("billing_title".to_string()));
        }
        let account = self.active_account(account_id).await?;
        check_invoice_amount(amount, account.balance)?;

        let request = self
            .invoices
            .create(&NewInvoiceRequest {
                id: Uuid::new_v4(),
                account_id,
                amount,
                balance_snapshot: account.balance,
                billing_title: billing_title.to_string(),
                tax_id: tax_id.filter(|t| !t.trim().is_empty()),
                created_at: self.clock.now(),
            })
            .await?;

        info!("Invoice request {} for {} filed by account {}", request.id, amount, account_id);
        Ok(request)
    }

    pub async fn get_invoice(&self, id: Uuid) -> AppResult<InvoiceRequest> {
        self.invoices
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Invoice request {}", id)))
    }

    pub async fn list_invoices(
        &self,
        status: Option<InvoiceStatus>,
        account_id: Option<i64>,
    ) -> AppResult<Vec<InvoiceRequest>> {
        self.invoices.list(status, account_id).await
    }

    #[instrument(skip(self, actor), fields(reviewer = %actor.username))]
    pub async fn approve_invoice(&self, actor: &Actor, id: Uuid) -> AppResult<InvoiceRequest> {
        ensure_reviewer(actor)?;
        let reviewed = self
            .invoices
            .review(
                id,
                &ReviewDecision {
                    from: InvoiceStatus::Pending,
                    to: InvoiceStatus::Approved,
                    reviewer: actor.username.clone(),
                    approved_amount: None,
                    rejection_reason: None,
                    at: self.clock.now(),
                },
            )
            .await?;

        self.audit
            .record(actor, "invoice.approve", "invoice_request", id, json!({ "amount": reviewed.amount }))
            .await;
        Ok(reviewed)
    }

    #[instrument(skip(self, actor), fields(reviewer = %actor.username))]
    pub async fn reject_invoice(&self, actor: &Actor, id: Uuid, reason: &str) -> AppResult<InvoiceRequest> {
        ensure_reviewer(actor)?;
        let reason = required_reason(reason)?;

        let reviewed = self
            .invoices
            .review(
                id,
                &ReviewDecision {
                    from: InvoiceStatus::Pending,
                    to: InvoiceStatus::Rejected,
                    reviewer: actor.username.clone(),
                    approved_amount: None,
                    rejection_reason: Some(reason.clone()),
                    at: self.clock.now(),
                },
            )
            .await?;

        self.audit
            .record(actor, "invoice.reject", "invoice_request", id, json!({ "reason": reason }))
            .await;
        Ok(reviewed)
    }

    /// Assign an invoice number to an approved request
    #[instrument(skip(self, actor), fields(reviewer = %actor.username))]
    pub async fn issue_invoice(&self, actor: &Actor, id: Uuid) -> AppResult<InvoiceRequest> {
        ensure_reviewer(actor)?;
        let issued = self
            .invoices
            .issue(id, &actor.username, self.clock.now())
            .await?;

        self.audit
            .record(
                actor,
                "invoice.issue",
                "invoice_request",
                id,
                json!({ "invoice_number": issued.invoice_number }),
            )
            .await;
        Ok(issued)
    }
}
