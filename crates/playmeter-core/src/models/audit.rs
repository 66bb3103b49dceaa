//! Audit log model
//!
//! Reviewer and administrator actions are recorded for compliance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: i64,

    /// Acting user ID (if available)
    pub user_id: Option<i64>,

    pub username: String,

    /// Action performed, e.g. `refund.approve`
    pub action: String,

    /// Entity type affected (e.g., "account", "refund_request")
    pub entity_type: String,

    pub entity_id: Option<String>,

    /// Additional details (JSON)
    pub details: Option<JsonValue>,

    pub ip_address: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl AuditLog {
    /// Create a new audit log builder
    pub fn builder() -> AuditLogBuilder {
        AuditLogBuilder::default()
    }
}

/// Builder for creating audit log entries
#[derive(Debug, Default)]
pub struct AuditLogBuilder {
    user_id: Option<i64>,
    username: Option<String>,
    action: Option<String>,
    entity_type: Option<String>,
    entity_id: Option<String>,
    details: Option<JsonValue>,
    ip_address: Option<String>,
}

impl AuditLogBuilder {
    pub fn user_id(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    pub fn entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }

    pub fn ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    /// Build the audit log entry (returns data for insertion, not the final entity)
    pub fn build(self) -> Result<AuditLogData, &'static str> {
        Ok(AuditLogData {
            user_id: self.user_id,
            username: self.username.ok_or("username is required")?,
            action: self.action.ok_or("action is required")?,
            entity_type: self.entity_type.ok_or("entity_type is required")?,
            entity_id: self.entity_id,
            details: self.details,
            ip_address: self.ip_address,
        })
    }
}

/// Data for creating an audit log entry
#[derive(Debug, Clone)]
pub struct AuditLogData {
    pub user_id: Option<i64>,
    pub username: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub details: Option<JsonValue>,
    pub ip_address: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_requires_fields() {
        assert!(AuditLog::builder().username("ops").build().is_err());

        let data = AuditLog::builder()
            .user_id(3)
            .username("ops")
            .action("account.unlock")
            .entity_type("account")
            .entity_id("42")
            .details(json!({"reason": "verified by phone"}))
            .build()
            .unwrap();
        assert_eq!(data.action, "account.unlock");
        assert_eq!(data.entity_id.as_deref(), Some("42"));
    }
}
