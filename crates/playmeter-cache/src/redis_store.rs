//! Redis-backed counter store
//!
//! Sliding windows are sorted sets scored by millisecond timestamps. The
//! check-and-record of [`CounterStore::acquire`] runs as one Lua script so
//! concurrent instances never admit more than the limit.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use playmeter_core::{
    error::AppError,
    traits::{CounterStore, WindowAdmission},
    AppResult,
};
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError, Script};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::keys::namespaced;

const ACQUIRE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
if count < limit then
    redis.call('ZADD', KEYS[1], now, ARGV[4])
    redis.call('PEXPIRE', KEYS[1], window)
    return {1, count + 1, 0}
end
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
local retry = 0
if oldest[2] then
    retry = tonumber(oldest[2]) + window - now
end
return {0, count, retry}
"#;

const RECORD_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
redis.call('ZADD', KEYS[1], now, ARGV[3])
redis.call('PEXPIRE', KEYS[1], window)
return redis.call('ZCARD', KEYS[1])
"#;

/// Redis connection with counter operations
///
/// Wraps a ConnectionManager to provide multiplexed access to Redis.
#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    /// Connect to Redis
    ///
    /// # Errors
    ///
    /// Returns `AppError::CacheConnection` if the connection fails
    pub async fn new(url: &str) -> Result<Self, AppError> {
        debug!("Connecting to Redis at {}", url);

        let client = Client::open(url).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            AppError::CacheConnection(format!("Invalid Redis URL: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to establish Redis connection: {}", e);
            AppError::CacheConnection(format!("Connection failed: {}", e))
        })?;

        debug!("Redis connection established successfully");
        Ok(Self { manager })
    }

    /// Ping the Redis server to check connectivity
    pub async fn ping(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!("Redis ping failed: {}", e);
                AppError::Cache(format!("Ping failed: {}", e))
            })?;
        Ok(())
    }

    fn map_redis_error(err: RedisError) -> AppError {
        match err.kind() {
            redis::ErrorKind::IoError => {
                error!("Redis I/O error: {}", err);
                AppError::CacheConnection(format!("I/O error: {}", err))
            }
            redis::ErrorKind::TypeError => {
                warn!("Redis type error: {}", err);
                AppError::Cache(format!("Type mismatch: {}", err))
            }
            _ => {
                error!("Redis error: {}", err);
                AppError::Cache(err.to_string())
            }
        }
    }
}

/// CounterStore implementation shared across engine instances
pub struct RedisCounterStore {
    cache: RedisCache,
    acquire: Script,
    record: Script,
    /// Makes sorted-set members unique across instances and calls
    instance: String,
    sequence: AtomicU64,
}

impl RedisCounterStore {
    pub fn new(cache: RedisCache) -> Self {
        Self {
            cache,
            acquire: Script::new(ACQUIRE_SCRIPT),
            record: Script::new(RECORD_SCRIPT),
            instance: Uuid::new_v4().simple().to_string(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &RedisCache {
        &self.cache
    }

    fn hit_member(&self, now: DateTime<Utc>) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}:{}:{}", now.timestamp_millis(), self.instance, seq)
    }
}

fn window_millis(window: Duration) -> i64 {
    window.num_milliseconds().max(1)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn acquire(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> AppResult<WindowAdmission> {
        let mut conn = self.cache.manager.clone();
        let (allowed, count, retry_ms): (i64, u64, i64) = self
            .acquire
            .key(namespaced(key))
            .arg(now.timestamp_millis())
            .arg(window_millis(window))
            .arg(limit)
            .arg(self.hit_member(now))
            .invoke_async(&mut conn)
            .await
            .map_err(RedisCache::map_redis_error)?;

        Ok(WindowAdmission {
            allowed: allowed == 1,
            count,
            retry_after: Duration::milliseconds(retry_ms.max(0)),
        })
    }

    async fn record(&self, key: &str, window: Duration, now: DateTime<Utc>) -> AppResult<u64> {
        let mut conn = self.cache.manager.clone();
        let count: u64 = self
            .record
            .key(namespaced(key))
            .arg(now.timestamp_millis())
            .arg(window_millis(window))
            .arg(self.hit_member(now))
            .invoke_async(&mut conn)
            .await
            .map_err(RedisCache::map_redis_error)?;
        Ok(count)
    }

    async fn add_member(
        &self,
        key: &str,
        member: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> AppResult<u64> {
        // Re-adding a member refreshes its score, so ZCARD counts distinct members
        let mut conn = self.cache.manager.clone();
        let count: u64 = self
            .record
            .key(namespaced(key))
            .arg(now.timestamp_millis())
            .arg(window_millis(window))
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(RedisCache::map_redis_error)?;
        Ok(count)
    }

    async fn members(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<String>> {
        let mut conn = self.cache.manager.clone();
        let horizon = format!("({}", now.timestamp_millis() - window_millis(window));
        let mut members: Vec<String> = conn
            .zrangebyscore(namespaced(key), horizon, "+inf")
            .await
            .map_err(RedisCache::map_redis_error)?;
        members.sort();
        Ok(members)
    }

    async fn insert_once(&self, key: &str, ttl: Duration, _now: DateTime<Utc>) -> AppResult<bool> {
        let mut conn = self.cache.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(namespaced(key))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(window_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(RedisCache::map_redis_error)?;
        Ok(reply.is_some())
    }

    async fn remove(&self, key: &str) -> AppResult<()> {
        let mut conn = self.cache.manager.clone();
        let _: i64 = conn
            .del(namespaced(key))
            .await
            .map_err(RedisCache::map_redis_error)?;
        Ok(())
    }
}
