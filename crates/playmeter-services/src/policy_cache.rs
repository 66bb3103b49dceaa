//! Cached access to the dynamic engine policy
//!
//! Every request reads the policy, so the snapshot is kept for a short TTL.
//! If the source fails after a snapshot was loaded, the last good snapshot
//! keeps serving and the failure is logged.

use std::sync::Arc;

use chrono::Duration;
use parking_lot::RwLock;
use playmeter_cache::TtlCache;
use playmeter_core::{traits::PolicySource, AppResult, Clock, EnginePolicy};
use tracing::{debug, warn};

const SNAPSHOT: &str = "engine_policy";

pub struct PolicyCache {
    source: Arc<dyn PolicySource>,
    snapshot: TtlCache<&'static str, EnginePolicy>,
    last_good: RwLock<Option<EnginePolicy>>,
    clock: Arc<dyn Clock>,
}

impl PolicyCache {
    pub fn new(source: Arc<dyn PolicySource>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            snapshot: TtlCache::new(ttl),
            last_good: RwLock::new(None),
            clock,
        }
    }

    pub async fn current(&self) -> AppResult<EnginePolicy> {
        let now = self.clock.now();
        if let Some(policy) = self.snapshot.get(&SNAPSHOT, now) {
            return Ok(policy);
        }

        debug!("Policy cache MISS, loading from source");
        match self.source.load().await {
            Ok(policy) => {
                self.snapshot.insert(SNAPSHOT, policy.clone(), now);
                *self.last_good.write() = Some(policy.clone());
                Ok(policy)
            }
            Err(e) => match self.last_good.read().clone() {
                Some(stale) => {
                    warn!(error = %e, "Policy source failed, serving last good snapshot");
                    Ok(stale)
                }
                None => Err(e),
            },
        }
    }

    /// Drop the cached snapshot so the next read hits the source
    pub fn invalidate(&self) {
        self.snapshot.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use playmeter_core::{AppError, ManualClock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        loads: AtomicUsize,
        fail_after: usize,
    }

    #[async_trait]
    impl PolicySource for CountingSource {
        async fn load(&self) -> AppResult<EnginePolicy> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst);
            if n >= self.fail_after {
                return Err(AppError::Database("settings unavailable".to_string()));
            }
            Ok(EnginePolicy {
                replay_window_secs: 100 + n as i64,
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn test_snapshot_cached_for_ttl() {
        let clock = Arc::new(ManualClock::default());
        let source = Arc::new(CountingSource {
            loads: AtomicUsize::new(0),
            fail_after: usize::MAX,
        });
        let cache = PolicyCache::new(source.clone(), Duration::seconds(30), clock.clone());

        assert_eq!(cache.current().await.unwrap().replay_window_secs, 100);
        assert_eq!(cache.current().await.unwrap().replay_window_secs, 100);
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);

        clock.advance(Duration::seconds(31));
        assert_eq!(cache.current().await.unwrap().replay_window_secs, 101);

        cache.invalidate();
        assert_eq!(cache.current().await.unwrap().replay_window_secs, 102);
    }

    #[tokio::test]
    async fn test_stale_snapshot_on_source_failure() {
        let clock = Arc::new(ManualClock::default());
        let source = Arc::new(CountingSource {
            loads: AtomicUsize::new(0),
            fail_after: 1,
        });
        let cache = PolicyCache::new(source, Duration::seconds(30), clock.clone());

        assert_eq!(cache.current().await.unwrap().replay_window_secs, 100);
        clock.advance(Duration::seconds(60));
        assert_eq!(cache.current().await.unwrap().replay_window_secs, 100);
    }

    #[tokio::test]
    async fn test_failure_without_snapshot_propagates() {
        let source = Arc::new(CountingSource {
            loads: AtomicUsize::new(0),
            fail_after: 0,
        });
        let cache = PolicyCache::new(source, Duration::seconds(30), Arc::new(ManualClock::default()));
        assert!(cache.current().await.is_err());
    }
}
