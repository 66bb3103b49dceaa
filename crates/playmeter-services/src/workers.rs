//! Background workers
//!
//! - the settlement poller sweeps unconfirmed recharge orders on a fixed
//!   interval
//! - the tier scheduler sleeps until 00:05 UTC on the 1st and reclassifies
//!   accounts over the month that just closed
//! - the counter purger drops expired keys from the in-process counter store
//!
//! All loops log failures and keep running; the returned handles are
//! aborted on shutdown.

use std::sync::Arc;

use playmeter_cache::MemoryCounterStore;
use playmeter_core::Clock;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::policy_cache::PolicyCache;
use crate::settlement::SettlementService;
use crate::tier::{next_scheduled_run, TierClassifier};

/// Retry delay when the next tier run cannot be computed
const SCHEDULER_RETRY_SECS: u64 = 3600;

pub fn spawn_settlement_poller(service: Arc<SettlementService>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Settlement poller started (every {:?})", every);
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match service.poll_once().await {
                Ok(summary) if summary.checked > 0 => info!(
                    "Settlement sweep: {} checked, {} settled, {} failed, {} pending, {} disputed",
                    summary.checked,
                    summary.settled,
                    summary.failed,
                    summary.still_pending,
                    summary.disputed
                ),
                Ok(_) => {}
                Err(e) => error!("Settlement sweep failed: {}", e),
            }
        }
    })
}

pub fn spawn_tier_scheduler(classifier: Arc<TierClassifier>, clock: Arc<dyn Clock>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = clock.now();
            let wait = match next_scheduled_run(now) {
                Ok(at) => {
                    info!("Next tier run at {}", at);
                    (at - now).to_std().unwrap_or_default()
                }
                Err(e) => {
                    warn!("Cannot schedule tier run: {}", e);
                    Duration::from_secs(SCHEDULER_RETRY_SECS)
                }
            };
            sleep(wait).await;

            match classifier.run_previous_month().await {
                Ok(summary) => info!(
                    "Scheduled tier run {}: {} evaluated, {} changed",
                    summary.period, summary.evaluated, summary.changed
                ),
                Err(e) => error!("Scheduled tier run failed: {}", e),
            }
        }
    })
}

/// Periodically evict expired keys from the in-process counter store
///
/// Hits older than the longest configured window are never read again.
pub fn spawn_counter_purger(
    store: Arc<MemoryCounterStore>,
    policy: Arc<PolicyCache>,
    clock: Arc<dyn Clock>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Counter purger started (every {:?})", every);
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let max_window = match policy.current().await {
                Ok(current) => current.longest_window(),
                Err(e) => {
                    warn!("Counter purge skipped, policy unavailable: {}", e);
                    continue;
                }
            };
            let removed = store.purge_expired(max_window, clock.now());
            if removed > 0 {
                info!(
                    "Counter purge: {} keys removed, {} live",
                    removed,
                    store.key_count()
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    #[tokio::test]
    async fn test_poller_survives_empty_sweeps() {
        let fx = Fixture::new().await;
        let engine = fx.engine();
        let handle = spawn_settlement_poller(engine.settlement.clone(), Duration::from_millis(5));

        sleep(Duration::from_millis(30)).await;
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test]
    async fn test_counter_purger_evicts_stale_keys() {
        use playmeter_core::traits::CounterStore;

        let fx = Fixture::new().await;
        let engine = fx.engine();
        let now = fx.clock.now();
        for i in 0..1000 {
            fx.counters
                .insert_once(&format!("nonce:{}", i), chrono::Duration::seconds(1), now)
                .await
                .unwrap();
            fx.counters
                .record(&format!("fail:{}", i), chrono::Duration::minutes(5), now)
                .await
                .unwrap();
        }
        assert_eq!(fx.counters.key_count(), 2000);

        fx.clock.advance(chrono::Duration::hours(1));
        fx.counters
            .insert_once("nonce:fresh", chrono::Duration::minutes(5), fx.clock.now())
            .await
            .unwrap();

        let handle = spawn_counter_purger(
            fx.counters.clone(),
            engine.policy.clone(),
            fx.clock.clone(),
            Duration::from_millis(5),
        );
        sleep(Duration::from_millis(30)).await;
        handle.abort();

        assert_eq!(fx.counters.key_count(), 1);
    }
}
