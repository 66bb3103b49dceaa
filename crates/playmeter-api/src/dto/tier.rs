//! Tier classification DTOs

use playmeter_core::{models::BillingPeriod, AppResult};
use serde::Deserialize;

/// `?period=YYYY-MM`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeriodParams {
    pub period: Option<String>,
}

impl PeriodParams {
    pub fn parse(&self) -> AppResult<Option<BillingPeriod>> {
        self.period.as_deref().map(BillingPeriod::parse).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playmeter_core::AppError;

    #[test]
    fn test_period_params() {
        let params = PeriodParams {
            period: Some("2026-02".to_string()),
        };
        assert_eq!(params.parse().unwrap(), BillingPeriod::new(2026, 2).ok());

        assert_eq!(PeriodParams::default().parse().unwrap(), None);

        let bad = PeriodParams {
            period: Some("Feb 2026".to_string()),
        };
        assert!(matches!(bad.parse(), Err(AppError::InvalidField { .. })));
    }
}
