//! Shared in-memory fixture for service tests

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use playmeter_auth::{
    signature::{self, CanonicalRequest},
    DeviceHeaders, IssuedCredential, JwtService,
};
use playmeter_cache::MemoryCounterStore;
use playmeter_core::{
    models::{
        Account, AuthorizationOutcome, BusinessKey, CatalogItem, LedgerEntry, NewAccount,
        NewCatalogItem,
    },
    policy::StaticPolicySource,
    traits::{
        AccountRepository, AuditRepository, CatalogRepository, EntitlementRepository,
        LedgerStore, SettlementGateway,
    },
    Clock, EnginePolicy, ManualClock,
};
use playmeter_db::{MemoryStore, Stores};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::alerts::MemoryAlertSink;
use crate::audit::AuditTrail;
use crate::authenticator::RequestAuthenticator;
use crate::engine::{Engine, EngineDeps, EngineSettings};
use crate::gateway::ManualSettlementGateway;
use crate::ledger::BalanceLedger;
use crate::policy_cache::PolicyCache;
use crate::settlement::{SettlementService, SettlementSettings};

pub const TEST_JWT_SECRET: &str = "test-secret-key-for-jwt-testing-12345";

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub counters: Arc<MemoryCounterStore>,
    pub alerts: Arc<MemoryAlertSink>,
    pub clock: Arc<ManualClock>,
    pub account: Account,
    pub credential: IssuedCredential,
    pub item: CatalogItem,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_balance(dec!(100.00)).await
    }

    /// One account holding `balance`, entitled to a 10.00 catalog item
    pub async fn with_balance(balance: Decimal) -> Self {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new());
        let now = clock.now();

        let item = CatalogRepository::create(
            store.as_ref(),
            &NewCatalogItem {
                code: "ZOMBIE_RUSH".to_string(),
                name: "Zombie Rush".to_string(),
                price_per_participant: dec!(10.00),
                min_party_size: 1,
                max_party_size: 8,
            },
            now,
        )
        .await
        .unwrap();

        let (account, credential) = register(&store, &item, "arena-east", balance, now).await;

        Self {
            store,
            counters: Arc::new(MemoryCounterStore::new()),
            alerts: Arc::new(MemoryAlertSink::new()),
            clock,
            account,
            credential,
            item,
        }
    }

    /// Register another entitled account
    pub async fn add_account(&self, name: &str, balance: Decimal) -> (Account, IssuedCredential) {
        register(&self.store, &self.item, name, balance, self.clock.now()).await
    }

    pub async fn reload_account(&self) -> Account {
        AccountRepository::find_by_id(self.store.as_ref(), self.account.id)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn store_entries(&self) -> Vec<LedgerEntry> {
        self.store.entries_for_account(self.account.id).await.unwrap()
    }

    /// Commit a usage draft straight through the store, skipping the gate
    pub async fn commit(&self, key: &BusinessKey, at: DateTime<Utc>) -> AuthorizationOutcome {
        let policy = EnginePolicy::default();
        let draft = BalanceLedger::draft(
            key.account_id,
            &self.item,
            key.venue_id,
            key.party_size,
            at,
            at,
        );
        self.store
            .commit_usage(&draft, policy.idempotency_window(), policy.lock_wait())
            .await
            .unwrap()
            .into_outcome()
    }

    pub fn stores(&self) -> Stores {
        Stores::memory(self.store.clone())
    }

    pub fn authenticator(&self) -> RequestAuthenticator {
        RequestAuthenticator::new(self.store.clone(), Duration::seconds(30), self.clock.clone())
    }

    pub fn jwt(&self) -> JwtService {
        JwtService::new(TEST_JWT_SECRET, 3600)
    }

    pub fn engine(&self) -> Engine {
        Engine::new(
            EngineDeps {
                stores: self.stores(),
                counters: self.counters.clone(),
                policy_source: Arc::new(StaticPolicySource::new(EnginePolicy::default())),
                gateway: Arc::new(ManualSettlementGateway),
                alerts: self.alerts.clone(),
                jwt: Arc::new(self.jwt()),
                clock: self.clock.clone(),
            },
            EngineSettings {
                lookup_cache_ttl: Duration::seconds(30),
                policy_cache_ttl: Duration::seconds(30),
                settlement: SettlementSettings::default(),
            },
        )
    }

    pub fn settlement(&self, gateway: impl SettlementGateway + 'static) -> SettlementService {
        let clock: Arc<dyn Clock> = self.clock.clone();
        let audit = Arc::new(AuditTrail::new(self.store.clone(), clock.clone()));
        let policy = Arc::new(PolicyCache::new(
            Arc::new(StaticPolicySource::new(EnginePolicy::default())),
            Duration::seconds(30),
            clock.clone(),
        ));
        SettlementService::new(
            Arc::new(gateway),
            self.store.clone(),
            self.store.clone(),
            Arc::new(BalanceLedger::new(self.store.clone())),
            self.alerts.clone(),
            audit,
            policy,
            clock,
            SettlementSettings::default(),
        )
    }

    pub async fn audit_actions(&self) -> Vec<String> {
        AuditRepository::list(self.store.as_ref(), 100, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.action)
            .collect()
    }
}

async fn register(
    store: &MemoryStore,
    item: &CatalogItem,
    name: &str,
    balance: Decimal,
    now: DateTime<Utc>,
) -> (Account, IssuedCredential) {
    let credential = IssuedCredential::generate();
    let account = AccountRepository::create(
        store,
        &NewAccount {
            name: name.to_string(),
            access_key: credential.access_key.clone(),
            secret_digest: credential.secret_digest.clone(),
            opening_balance: balance,
        },
        now,
    )
    .await
    .unwrap();
    EntitlementRepository::grant(store, account.id, item.id, None, now)
        .await
        .unwrap();
    (account, credential)
}

/// Device headers signed with `credential` for `method path` at `now`
pub fn signed_headers(
    credential: &IssuedCredential,
    method: &str,
    path: &str,
    now: DateTime<Utc>,
    nonce: &str,
    body: &[u8],
) -> DeviceHeaders {
    let timestamp = now.timestamp();
    let signature = signature::sign(
        &credential.secret_digest,
        &CanonicalRequest {
            method,
            path,
            timestamp,
            nonce,
            body,
        },
    )
    .unwrap();
    DeviceHeaders {
        access_key: credential.access_key.clone(),
        signature,
        timestamp,
        nonce: nonce.to_string(),
        method: method.to_string(),
        path: path.to_string(),
        source_address: "10.0.0.1".to_string(),
    }
}
