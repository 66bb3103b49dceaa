//! Engine policy
//!
//! Windows, limits and thresholds that operators may change at runtime.
//! Components read them through a [`PolicySource`](crate::traits::PolicySource)
//! rather than from constants.

use async_trait::async_trait;
use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::warn;

use crate::config::{AppConfig, BillingConfig, SecurityConfig, TierConfig};
use crate::error::AppError;
use crate::models::{Tier, TierThresholds};
use crate::traits::PolicySource;
use crate::AppResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnginePolicy {
    pub replay_window_secs: i64,
    pub account_requests_per_window: u64,
    pub address_requests_per_window: u64,
    pub rate_window_secs: i64,
    pub silver_requests_per_window: Option<u64>,
    pub gold_requests_per_window: Option<u64>,
    pub failure_threshold: u64,
    pub failure_window_secs: i64,
    pub distinct_account_threshold: u64,
    pub distinct_account_window_secs: i64,
    pub idempotency_window_secs: i64,
    pub account_lock_wait_ms: u64,
    pub tier_thresholds: TierThresholds,
}

impl EnginePolicy {
    pub fn from_sections(
        security: &SecurityConfig,
        billing: &BillingConfig,
        tier: &TierConfig,
    ) -> Self {
        Self {
            replay_window_secs: security.replay_window_secs,
            account_requests_per_window: security.account_requests_per_window,
            address_requests_per_window: security.address_requests_per_window,
            rate_window_secs: security.rate_window_secs,
            silver_requests_per_window: security.silver_requests_per_window,
            gold_requests_per_window: security.gold_requests_per_window,
            failure_threshold: security.failure_threshold,
            failure_window_secs: security.failure_window_secs,
            distinct_account_threshold: security.distinct_account_threshold,
            distinct_account_window_secs: security.distinct_account_window_secs,
            idempotency_window_secs: billing.idempotency_window_secs,
            account_lock_wait_ms: billing.account_lock_wait_ms,
            tier_thresholds: TierThresholds {
                silver: tier.silver_threshold,
                gold: tier.gold_threshold,
            },
        }
    }

    pub fn replay_window(&self) -> Duration {
        Duration::seconds(self.replay_window_secs)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::seconds(self.rate_window_secs)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::seconds(self.failure_window_secs)
    }

    pub fn distinct_account_window(&self) -> Duration {
        Duration::seconds(self.distinct_account_window_secs)
    }

    pub fn idempotency_window(&self) -> Duration {
        Duration::seconds(self.idempotency_window_secs)
    }

    /// Longest window any counter is consulted over
    pub fn longest_window(&self) -> Duration {
        [
            self.replay_window_secs,
            self.rate_window_secs,
            self.failure_window_secs,
            self.distinct_account_window_secs,
            self.idempotency_window_secs,
        ]
        .into_iter()
        .max()
        .map(Duration::seconds)
        .unwrap_or_else(Duration::zero)
    }

    pub fn lock_wait(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.account_lock_wait_ms)
    }

    /// Per-account request limit, with optional tier overrides
    pub fn account_limit_for(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Gold => self
                .gold_requests_per_window
                .unwrap_or(self.account_requests_per_window),
            Tier::Silver => self
                .silver_requests_per_window
                .unwrap_or(self.account_requests_per_window),
            Tier::Standard => self.account_requests_per_window,
        }
    }

    /// Overlay key/value settings such as `security.replay_window_secs = 120`
    ///
    /// Unknown keys are skipped with a warning; malformed values are errors.
    pub fn apply_overrides<'a, I>(&mut self, settings: I) -> AppResult<()>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (key, value) in settings {
            match key {
                "security.replay_window_secs" => self.replay_window_secs = parse(key, value)?,
                "security.account_requests_per_window" => {
                    self.account_requests_per_window = parse(key, value)?
                }
                "security.address_requests_per_window" => {
                    self.address_requests_per_window = parse(key, value)?
                }
                "security.rate_window_secs" => self.rate_window_secs = parse(key, value)?,
                "security.silver_requests_per_window" => {
                    self.silver_requests_per_window = Some(parse(key, value)?)
                }
                "security.gold_requests_per_window" => {
                    self.gold_requests_per_window = Some(parse(key, value)?)
                }
                "security.failure_threshold" => self.failure_threshold = parse(key, value)?,
                "security.failure_window_secs" => self.failure_window_secs = parse(key, value)?,
                "security.distinct_account_threshold" => {
                    self.distinct_account_threshold = parse(key, value)?
                }
                "security.distinct_account_window_secs" => {
                    self.distinct_account_window_secs = parse(key, value)?
                }
                "billing.idempotency_window_secs" => {
                    self.idempotency_window_secs = parse(key, value)?
                }
                "billing.account_lock_wait_ms" => self.account_lock_wait_ms = parse(key, value)?,
                "tier.silver_threshold" => {
                    self.tier_thresholds.silver = parse::<Decimal>(key, value)?
                }
                "tier.gold_threshold" => self.tier_thresholds.gold = parse::<Decimal>(key, value)?,
                other => warn!(key = %other, "Ignoring unknown engine setting"),
            }
        }
        self.validate()
    }

    pub fn validate(&self) -> AppResult<()> {
        let windows = [
            ("replay_window_secs", self.replay_window_secs),
            ("rate_window_secs", self.rate_window_secs),
            ("failure_window_secs", self.failure_window_secs),
            ("distinct_account_window_secs", self.distinct_account_window_secs),
            ("idempotency_window_secs", self.idempotency_window_secs),
        ];
        if let Some((name, _)) = windows.iter().find(|(_, secs)| *secs <= 0) {
            return Err(AppError::Config(format!("{} must be positive", name)));
        }
        if self.account_requests_per_window == 0 || self.address_requests_per_window == 0 {
            return Err(AppError::Config("rate limits must be positive".to_string()));
        }
        if self.tier_thresholds.gold < self.tier_thresholds.silver {
            return Err(AppError::Config(
                "gold threshold must not be below silver threshold".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> AppResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::Config(format!("invalid value '{}' for {}", value, key)))
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self::from_sections(
            &SecurityConfig::default(),
            &BillingConfig::default(),
            &TierConfig::default(),
        )
    }
}

impl From<&AppConfig> for EnginePolicy {
    fn from(config: &AppConfig) -> Self {
        Self::from_sections(&config.security, &config.billing, &config.tier)
    }
}

/// Policy fixed at startup from configuration
#[derive(Debug, Clone)]
pub struct StaticPolicySource {
    policy: EnginePolicy,
}

impl StaticPolicySource {
    pub fn new(policy: EnginePolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl PolicySource for StaticPolicySource {
    async fn load(&self) -> AppResult<EnginePolicy> {
        Ok(self.policy.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults() {
        let policy = EnginePolicy::default();
        assert_eq!(policy.replay_window(), Duration::minutes(5));
        assert_eq!(policy.idempotency_window(), Duration::seconds(30));
        assert_eq!(policy.longest_window(), Duration::minutes(5));
        assert_eq!(policy.account_limit_for(Tier::Gold), 10);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_tier_limits() {
        let policy = EnginePolicy {
            gold_requests_per_window: Some(30),
            ..Default::default()
        };
        assert_eq!(policy.account_limit_for(Tier::Gold), 30);
        assert_eq!(policy.account_limit_for(Tier::Silver), 10);
    }

    #[test]
    fn test_apply_overrides() {
        let mut policy = EnginePolicy::default();
        policy
            .apply_overrides([
                ("security.replay_window_secs", "120"),
                ("tier.gold_threshold", "15000.50"),
                ("unknown.key", "1"),
            ])
            .unwrap();
        assert_eq!(policy.replay_window_secs, 120);
        assert_eq!(policy.tier_thresholds.gold, dec!(15000.50));
    }

    #[test]
    fn test_invalid_override() {
        let mut policy = EnginePolicy::default();
        assert!(policy
            .apply_overrides([("security.rate_window_secs", "soon")])
            .is_err());
        assert!(policy
            .apply_overrides([("security.rate_window_secs", "0")])
            .is_err());
    }

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticPolicySource::new(EnginePolicy::default());
        assert_eq!(source.load().await.unwrap(), EnginePolicy::default());
    }
}
