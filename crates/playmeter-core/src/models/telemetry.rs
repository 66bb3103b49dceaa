//! Post-game session telemetry
//!
//! One row per usage record; repeat uploads overwrite the payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTelemetry {
    pub session_id: String,
    pub account_id: i64,
    pub payload: JsonValue,
    /// Number of uploads received, including overwritten ones
    pub upload_count: i32,
    pub first_uploaded_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
