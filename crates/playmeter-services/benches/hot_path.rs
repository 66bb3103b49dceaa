//! Benchmarks for the authorization hot path
//!
//! Run with: cargo bench --package playmeter-services
//!
//! Measures request signature verification and a ledger commit against the
//! in-memory store (no database round trips).

use std::sync::Arc;

use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use playmeter_auth::{signature, CanonicalRequest, IssuedCredential};
use playmeter_core::{
    models::{BusinessKey, NewAccount, NewCatalogItem, VenueId},
    traits::{AccountRepository, CatalogRepository, LedgerStore},
    EnginePolicy,
};
use playmeter_db::MemoryStore;
use playmeter_services::ledger::BalanceLedger;
use rust_decimal_macros::dec;
use tokio::runtime::Runtime;

fn bench_signature_verify(c: &mut Criterion) {
    let credential = IssuedCredential::generate();
    let body = br#"{"catalog_item":"ZOMBIE_RUSH","venue_id":"12","party_size":4}"#;
    let request = CanonicalRequest {
        method: "POST",
        path: "/api/v1/authorize",
        timestamp: Utc::now().timestamp(),
        nonce: "bench-nonce",
        body,
    };
    let presented = signature::sign(&credential.secret_digest, &request).unwrap();

    c.bench_function("signature_verify", |b| {
        b.iter(|| {
            signature::verify(
                black_box(&credential.secret_digest),
                black_box(&request),
                black_box(&presented),
            )
            .unwrap()
        });
    });
}

fn bench_business_key_digest(c: &mut Criterion) {
    let key = BusinessKey {
        account_id: 42,
        catalog_item_id: 7,
        venue_id: VenueId(12),
        party_size: 4,
    };

    c.bench_function("business_key_digest", |b| {
        b.iter(|| black_box(&key).digest());
    });
}

/// Distinct business keys, so every commit debits instead of replaying
fn bench_memory_commit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let now = Utc::now();
    let policy = EnginePolicy::default();

    let mut group = c.benchmark_group("memory_ledger_commit");
    for accounts in [1usize, 8].iter() {
        let store = Arc::new(MemoryStore::new());
        let (item, account_ids) = rt.block_on(async {
            let item = CatalogRepository::create(
                store.as_ref(),
                &NewCatalogItem {
                    code: "ZOMBIE_RUSH".to_string(),
                    name: "Zombie Rush".to_string(),
                    price_per_participant: dec!(0.01),
                    min_party_size: 1,
                    max_party_size: 8,
                },
                now,
            )
            .await
            .unwrap();
            let mut ids = Vec::new();
            for n in 0..*accounts {
                let credential = IssuedCredential::generate();
                let account = AccountRepository::create(
                    store.as_ref(),
                    &NewAccount {
                        name: format!("bench-{}", n),
                        access_key: credential.access_key,
                        secret_digest: credential.secret_digest,
                        opening_balance: dec!(100000000.00),
                    },
                    now,
                )
                .await
                .unwrap();
                ids.push(account.id);
            }
            (item, ids)
        });

        let mut venue = 0i64;
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(accounts), accounts, |b, _| {
            b.to_async(&rt).iter(|| {
                venue += 1;
                let account_id = account_ids[venue as usize % account_ids.len()];
                let draft = BalanceLedger::draft(
                    account_id,
                    &item,
                    VenueId(venue),
                    1,
                    now,
                    now + Duration::milliseconds(venue),
                );
                let store = store.clone();
                let window = policy.idempotency_window();
                let lock_wait = policy.lock_wait();
                async move { store.commit_usage(&draft, window, lock_wait).await.unwrap() }
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_signature_verify,
    bench_business_key_digest,
    bench_memory_commit
);
criterion_main!(benches);
