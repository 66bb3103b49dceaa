//! In-process counter store
//!
//! Sliding windows are kept as per-key timestamp logs. Each operation runs
//! while holding the DashMap shard lock for its key, so check-and-record is
//! atomic per key. Valid for single-instance deployments only.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use playmeter_core::{
    traits::{CounterStore, WindowAdmission},
    AppResult,
};
use tracing::debug;

#[derive(Default)]
pub struct MemoryCounterStore {
    logs: DashMap<String, VecDeque<DateTime<Utc>>>,
    members: DashMap<String, HashMap<String, DateTime<Utc>>>,
    markers: DashMap<String, DateTime<Utc>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys across all windows and markers
    pub fn key_count(&self) -> usize {
        self.logs.len() + self.members.len() + self.markers.len()
    }

    /// Drop expired markers and empty windows
    ///
    /// Windows longer than `max_window` are not used by the engine, so any
    /// hit older than that can go.
    pub fn purge_expired(&self, max_window: Duration, now: DateTime<Utc>) -> usize {
        let before = self.key_count();

        self.markers.retain(|_, expires_at| *expires_at > now);
        self.logs.retain(|_, log| {
            prune_log(log, max_window, now);
            !log.is_empty()
        });
        self.members.retain(|_, seen| {
            seen.retain(|_, at| *at > now - max_window);
            !seen.is_empty()
        });

        let removed = before.saturating_sub(self.key_count());
        if removed > 0 {
            debug!("Purged {} expired counter keys", removed);
        }
        removed
    }
}

fn prune_log(log: &mut VecDeque<DateTime<Utc>>, window: Duration, now: DateTime<Utc>) {
    let horizon = now - window;
    while log.front().is_some_and(|t| *t <= horizon) {
        log.pop_front();
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn acquire(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> AppResult<WindowAdmission> {
        let mut log = self.logs.entry(key.to_string()).or_default();
        prune_log(&mut log, window, now);

        if (log.len() as u64) < limit {
            log.push_back(now);
            return Ok(WindowAdmission {
                allowed: true,
                count: log.len() as u64,
                retry_after: Duration::zero(),
            });
        }

        let retry_after = log
            .front()
            .map(|oldest| *oldest + window - now)
            .unwrap_or(window)
            .max(Duration::zero());
        Ok(WindowAdmission {
            allowed: false,
            count: log.len() as u64,
            retry_after,
        })
    }

    async fn record(&self, key: &str, window: Duration, now: DateTime<Utc>) -> AppResult<u64> {
        let mut log = self.logs.entry(key.to_string()).or_default();
        prune_log(&mut log, window, now);
        log.push_back(now);
        Ok(log.len() as u64)
    }

    async fn add_member(
        &self,
        key: &str,
        member: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> AppResult<u64> {
        let mut seen = self.members.entry(key.to_string()).or_default();
        seen.retain(|_, at| *at > now - window);
        seen.insert(member.to_string(), now);
        Ok(seen.len() as u64)
    }

    async fn members(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<String>> {
        let mut members: Vec<String> = self
            .members
            .get(key)
            .map(|seen| {
                seen.iter()
                    .filter(|(_, at)| **at > now - window)
                    .map(|(member, _)| member.clone())
                    .collect()
            })
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn insert_once(&self, key: &str, ttl: Duration, now: DateTime<Utc>) -> AppResult<bool> {
        let mut inserted = false;
        self.markers
            .entry(key.to_string())
            .and_modify(|expires_at| {
                if *expires_at <= now {
                    *expires_at = now + ttl;
                    inserted = true;
                }
            })
            .or_insert_with(|| {
                inserted = true;
                now + ttl
            });
        Ok(inserted)
    }

    async fn remove(&self, key: &str) -> AppResult<()> {
        self.logs.remove(key);
        self.members.remove(key);
        self.markers.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_acquire_limits_within_window() {
        let store = MemoryCounterStore::new();
        let now = Utc::now();
        let window = Duration::seconds(60);

        for i in 0..10 {
            let admission = store
                .acquire("rate:account:1", 10, window, now + Duration::seconds(i))
                .await
                .unwrap();
            assert!(admission.allowed);
        }

        let denied = store
            .acquire("rate:account:1", 10, window, now + Duration::seconds(10))
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.count, 10);
        assert_eq!(denied.retry_after, Duration::seconds(50));

        // The first hit leaves the window after 60s
        let later = store
            .acquire("rate:account:1", 10, window, now + Duration::seconds(60))
            .await
            .unwrap();
        assert!(later.allowed);
    }

    #[tokio::test]
    async fn test_rejected_attempts_are_not_counted() {
        let store = MemoryCounterStore::new();
        let now = Utc::now();
        let window = Duration::seconds(60);

        store.acquire("k", 1, window, now).await.unwrap();
        for _ in 0..5 {
            assert!(!store.acquire("k", 1, window, now).await.unwrap().allowed);
        }
        assert!(
            store
                .acquire("k", 1, window, now + Duration::seconds(60))
                .await
                .unwrap()
                .allowed
        );
    }

    #[tokio::test]
    async fn test_record_counts_trailing_window() {
        let store = MemoryCounterStore::new();
        let now = Utc::now();
        let window = Duration::seconds(300);

        assert_eq!(store.record("f", window, now).await.unwrap(), 1);
        assert_eq!(
            store.record("f", window, now + Duration::seconds(100)).await.unwrap(),
            2
        );
        assert_eq!(
            store.record("f", window, now + Duration::seconds(301)).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_distinct_members() {
        let store = MemoryCounterStore::new();
        let now = Utc::now();
        let window = Duration::seconds(60);

        assert_eq!(store.add_member("ids", "1", window, now).await.unwrap(), 1);
        assert_eq!(store.add_member("ids", "1", window, now).await.unwrap(), 1);
        assert_eq!(store.add_member("ids", "2", window, now).await.unwrap(), 2);
        assert_eq!(
            store
                .add_member("ids", "3", window, now + Duration::seconds(61))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store.members("ids", window, now + Duration::seconds(61)).await.unwrap(),
            vec!["3".to_string()]
        );
    }

    #[tokio::test]
    async fn test_insert_once_until_expiry() {
        let store = MemoryCounterStore::new();
        let now = Utc::now();
        let ttl = Duration::seconds(300);

        assert!(store.insert_once("nonce:pk:a", ttl, now).await.unwrap());
        assert!(!store.insert_once("nonce:pk:a", ttl, now + Duration::seconds(299)).await.unwrap());
        assert!(store.insert_once("nonce:pk:a", ttl, now + Duration::seconds(300)).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_never_exceeds_limit() {
        let store = Arc::new(MemoryCounterStore::new());
        let now = Utc::now();

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .acquire("hot", 10, Duration::seconds(60), now)
                        .await
                        .unwrap()
                        .allowed
                })
            })
            .collect();

        let allowed = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(allowed, 10);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryCounterStore::new();
        let now = Utc::now();
        store.record("old", Duration::seconds(60), now).await.unwrap();
        store
            .insert_once("marker", Duration::seconds(10), now)
            .await
            .unwrap();

        let removed = store.purge_expired(Duration::seconds(60), now + Duration::seconds(120));
        assert_eq!(removed, 2);
    }
}
