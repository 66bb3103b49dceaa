//! Alert sinks

use parking_lot::Mutex;
use playmeter_core::traits::{Alert, AlertSink};
use tracing::warn;

/// Emits alerts as `warn!` events on the `playmeter::alert` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn raise(&self, alert: &Alert) {
        warn!(
            target: "playmeter::alert",
            kind = ?alert.kind,
            accounts = ?alert.account_ids,
            source = alert.source.as_deref().unwrap_or("-"),
            raised_at = %alert.raised_at,
            "{}",
            alert.detail
        );
    }
}

/// Keeps alerts in memory; used by tests and the admin API in dev mode
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

impl AlertSink for MemoryAlertSink {
    fn raise(&self, alert: &Alert) {
        TracingAlertSink.raise(alert);
        self.alerts.lock().push(alert.clone());
    }
}
