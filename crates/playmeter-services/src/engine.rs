//! Service wiring
//!
//! [`Engine`] builds every service once from the storage handles, the
//! counter store and the external collaborators. The HTTP layer and the
//! background workers share it behind an `Arc`.

use std::sync::Arc;

use chrono::Duration;
use playmeter_auth::JwtService;
use playmeter_core::{
    config::{BillingConfig, SettlementConfig},
    traits::{AlertSink, CounterStore, PolicySource, SettlementGateway},
    AppConfig, Clock,
};
use playmeter_db::Stores;

use crate::accounts::AccountService;
use crate::anomaly::AnomalyDetector;
use crate::audit::AuditTrail;
use crate::authenticator::RequestAuthenticator;
use crate::authorization::{AuthorizationService, DeviceGate};
use crate::entitlement::EntitlementChecker;
use crate::idempotency::IdempotencyGuard;
use crate::ledger::BalanceLedger;
use crate::policy_cache::PolicyCache;
use crate::rate_limiter::RateLimiter;
use crate::replay_guard::ReplayGuard;
use crate::review::ReviewService;
use crate::settlement::{SettlementService, SettlementSettings};
use crate::telemetry::TelemetryService;
use crate::tier::TierClassifier;
use crate::user_service::UserService;

/// Cache lifetimes and settlement behaviour
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Credential and catalog lookups
    pub lookup_cache_ttl: Duration,
    pub policy_cache_ttl: Duration,
    pub settlement: SettlementSettings,
}

impl EngineSettings {
    pub fn from_sections(billing: &BillingConfig, settlement: &SettlementConfig) -> Self {
        Self {
            lookup_cache_ttl: Duration::seconds(billing.lookup_cache_ttl_secs as i64),
            policy_cache_ttl: Duration::seconds(billing.policy_cache_ttl_secs as i64),
            settlement: SettlementSettings::from(settlement),
        }
    }
}

impl From<&AppConfig> for EngineSettings {
    fn from(config: &AppConfig) -> Self {
        Self::from_sections(&config.billing, &config.settlement)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_sections(&BillingConfig::default(), &SettlementConfig::default())
    }
}

/// External collaborators of the engine
pub struct EngineDeps {
    pub stores: Stores,
    pub counters: Arc<dyn CounterStore>,
    pub policy_source: Arc<dyn PolicySource>,
    pub gateway: Arc<dyn SettlementGateway>,
    pub alerts: Arc<dyn AlertSink>,
    pub jwt: Arc<JwtService>,
    pub clock: Arc<dyn Clock>,
}

/// Every engine service, wired
pub struct Engine {
    pub policy: Arc<PolicyCache>,
    pub gate: Arc<DeviceGate>,
    pub authorization: Arc<AuthorizationService>,
    pub telemetry: Arc<TelemetryService>,
    pub settlement: Arc<SettlementService>,
    pub reviews: Arc<ReviewService>,
    pub tiers: Arc<TierClassifier>,
    pub accounts: Arc<AccountService>,
    pub users: Arc<UserService>,
    pub audit: Arc<AuditTrail>,
    pub clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(deps: EngineDeps, settings: EngineSettings) -> Self {
        let EngineDeps {
            stores,
            counters,
            policy_source,
            gateway,
            alerts,
            jwt,
            clock,
        } = deps;

        let policy = Arc::new(PolicyCache::new(
            policy_source,
            settings.policy_cache_ttl,
            clock.clone(),
        ));
        let audit = Arc::new(AuditTrail::new(stores.audit.clone(), clock.clone()));
        let ledger = Arc::new(BalanceLedger::new(stores.ledger.clone()));

        let authenticator = Arc::new(RequestAuthenticator::new(
            stores.accounts.clone(),
            settings.lookup_cache_ttl,
            clock.clone(),
        ));
        let entitlements = Arc::new(EntitlementChecker::new(
            stores.catalog.clone(),
            stores.entitlements.clone(),
            settings.lookup_cache_ttl,
        ));
        let anomaly = Arc::new(AnomalyDetector::new(
            counters.clone(),
            stores.accounts.clone(),
            alerts.clone(),
        ));

        let gate = Arc::new(DeviceGate::new(
            authenticator.clone(),
            ReplayGuard::new(counters.clone()),
            RateLimiter::new(counters.clone()),
            anomaly,
            stores.accounts.clone(),
            policy.clone(),
            clock.clone(),
        ));

        let authorization = Arc::new(AuthorizationService::new(
            gate.clone(),
            IdempotencyGuard::new(stores.ledger.clone()),
            entitlements.clone(),
            ledger.clone(),
        ));
        let telemetry = Arc::new(TelemetryService::new(
            gate.clone(),
            stores.ledger.clone(),
            stores.telemetry.clone(),
        ));
        let settlement = Arc::new(SettlementService::new(
            gateway,
            stores.recharges.clone(),
            stores.accounts.clone(),
            ledger.clone(),
            alerts,
            audit.clone(),
            policy.clone(),
            clock.clone(),
            settings.settlement,
        ));
        let reviews = Arc::new(ReviewService::new(
            stores.accounts.clone(),
            stores.refunds.clone(),
            stores.invoices.clone(),
            ledger,
            audit.clone(),
            policy.clone(),
            clock.clone(),
        ));
        let tiers = Arc::new(TierClassifier::new(
            stores.ledger.clone(),
            stores.accounts.clone(),
            stores.tiers.clone(),
            policy.clone(),
            audit.clone(),
            clock.clone(),
        ));
        let accounts = Arc::new(AccountService::new(
            stores.accounts.clone(),
            stores.catalog.clone(),
            stores.entitlements.clone(),
            stores.ledger.clone(),
            counters,
            authenticator,
            entitlements,
            audit.clone(),
            clock.clone(),
        ));
        let users = Arc::new(UserService::new(
            stores.users.clone(),
            stores.accounts.clone(),
            jwt,
            audit.clone(),
            clock.clone(),
        ));

        Self {
            policy,
            gate,
            authorization,
            telemetry,
            settlement,
            reviews,
            tiers,
            accounts,
            users,
            audit,
            clock,
        }
    }
}
