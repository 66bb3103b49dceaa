//! Audit trail for reviewer and administrator actions
//!
//! Writes go through the `AuditLog` builder. A failed audit write is logged
//! and swallowed: the action it describes has already happened.

use std::sync::Arc;

use playmeter_core::{
    models::{AuditLog, UserRole},
    traits::{AuditRepository, Pagination},
    AppResult, Clock,
};
use serde_json::Value as JsonValue;
use tracing::error;

/// Who performed an audited action
#[derive(Debug, Clone, PartialEq)]
pub struct Actor {
    pub user_id: Option<i64>,
    pub username: String,
    pub role: Option<UserRole>,
    pub ip_address: Option<String>,
}

impl Actor {
    pub fn user(user_id: i64, username: impl Into<String>, role: UserRole) -> Self {
        Self {
            user_id: Some(user_id),
            username: username.into(),
            role: Some(role),
            ip_address: None,
        }
    }

    /// Background jobs and gateway callbacks
    pub fn system(name: impl Into<String>) -> Self {
        Self {
            user_id: None,
            username: name.into(),
            role: None,
            ip_address: None,
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }
}

pub struct AuditTrail {
    repo: Arc<dyn AuditRepository>,
    clock: Arc<dyn Clock>,
}

impl AuditTrail {
    pub fn new(repo: Arc<dyn AuditRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    pub async fn record(
        &self,
        actor: &Actor,
        action: &str,
        entity_type: &str,
        entity_id: impl ToString,
        details: JsonValue,
    ) {
        let mut builder = AuditLog::builder()
            .username(actor.username.clone())
            .action(action)
            .entity_type(entity_type)
            .entity_id(entity_id.to_string())
            .details(details);
        if let Some(user_id) = actor.user_id {
            builder = builder.user_id(user_id);
        }
        if let Some(ip) = &actor.ip_address {
            builder = builder.ip_address(ip.clone());
        }

        let entry = match builder.build() {
            Ok(entry) => entry,
            Err(e) => {
                error!("Invalid audit entry for {}: {}", action, e);
                return;
            }
        };
        if let Err(e) = self.repo.insert(&entry, self.clock.now()).await {
            error!("Failed to write audit log for {}: {}", action, e);
        }
    }

    pub async fn recent(&self, pagination: &Pagination) -> AppResult<Vec<AuditLog>> {
        self.repo.list(pagination.limit(), pagination.offset()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use playmeter_core::{models::AuditLogData, AppError, ManualClock};
    use playmeter_db::MemoryStore;
    use serde_json::json;

    struct BrokenAuditRepo;

    #[async_trait]
    impl AuditRepository for BrokenAuditRepo {
        async fn insert(&self, _entry: &AuditLogData, _at: DateTime<Utc>) -> AppResult<()> {
            Err(AppError::Database("audit_logs unavailable".to_string()))
        }

        async fn list(&self, _limit: i64, _offset: i64) -> AppResult<Vec<AuditLog>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_record_and_list() {
        let store = Arc::new(MemoryStore::new());
        let trail = AuditTrail::new(store, Arc::new(ManualClock::default()));
        let actor = Actor::user(3, "fin-ops", UserRole::Finance).with_ip("10.1.1.1");

        trail
            .record(&actor, "refund.approve", "refund_request", "r-1", json!({"amount": "25.00"}))
            .await;

        let logs = trail.recent(&Pagination::new(1, 20)).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].username, "fin-ops");
        assert_eq!(logs[0].user_id, Some(3));
        assert_eq!(logs[0].action, "refund.approve");
        assert_eq!(logs[0].ip_address.as_deref(), Some("10.1.1.1"));
    }

    #[tokio::test]
    async fn test_write_failure_is_swallowed() {
        let trail = AuditTrail::new(Arc::new(BrokenAuditRepo), Arc::new(ManualClock::default()));
        trail
            .record(&Actor::system("settlement-poller"), "recharge.dispute", "recharge_order", 1, json!({}))
            .await;
    }
}
