//! Expiring counters and lookup caches for Playmeter
//!
//! Implements the `CounterStore` trait from playmeter-core twice:
//!
//! - [`MemoryCounterStore`]: per-key timestamp logs in a DashMap, for
//!   single-instance deployments and tests
//! - [`RedisCounterStore`]: sorted sets plus Lua scripts behind a Redis
//!   ConnectionManager, shared by every instance
//!
//! It also provides [`TtlCache`], a small expiring map used for credential
//! and policy lookups.
//!
//! # Example
//!
//! ```no_run
//! use playmeter_cache::{RedisCache, RedisCounterStore};
//! use playmeter_core::traits::CounterStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = RedisCounterStore::new(RedisCache::new("redis://127.0.0.1:6379").await?);
//!     let admitted = store
//!         .acquire("rate:account:1", 10, chrono::Duration::seconds(60), chrono::Utc::now())
//!         .await?;
//!     println!("allowed: {}", admitted.allowed);
//!     Ok(())
//! }
//! ```

pub mod keys;
pub mod memory;
pub mod redis_store;
pub mod ttl;

use std::sync::Arc;

use playmeter_core::{config::CounterBackend, traits::CounterStore, AppResult};
use tracing::info;

pub use memory::MemoryCounterStore;
pub use redis_store::{RedisCache, RedisCounterStore};
pub use ttl::TtlCache;

/// Counter store selected by configuration
pub enum Counters {
    Memory(Arc<MemoryCounterStore>),
    Redis(Arc<RedisCounterStore>),
}

impl Counters {
    /// Build the configured backend; Redis is only contacted when selected
    pub async fn connect(backend: CounterBackend, redis_url: &str) -> AppResult<Self> {
        match backend {
            CounterBackend::Memory => {
                info!("Using in-process counters (single instance only)");
                Ok(Counters::Memory(Arc::new(MemoryCounterStore::new())))
            }
            CounterBackend::Redis => {
                let cache = RedisCache::new(redis_url).await?;
                cache.ping().await?;
                info!("Using Redis counters at {}", redis_url);
                Ok(Counters::Redis(Arc::new(RedisCounterStore::new(cache))))
            }
        }
    }

    pub fn store(&self) -> Arc<dyn CounterStore> {
        match self {
            Counters::Memory(store) => store.clone(),
            Counters::Redis(store) => store.clone(),
        }
    }

    /// Backend reachability, for health checks
    pub async fn ping(&self) -> AppResult<()> {
        match self {
            Counters::Memory(_) => Ok(()),
            Counters::Redis(store) => store.cache().ping().await,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Counters::Memory(_) => "memory",
            Counters::Redis(_) => "redis",
        }
    }
}
