//! Small expiring lookup cache
//!
//! Used for credential and policy lookups on the hot path. Entries expire by
//! the caller-supplied clock so tests can drive them with a manual clock.

use std::hash::Hash;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

pub struct TtlCache<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, (V, DateTime<Utc>)>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Fresh value for `key`, if any
    pub fn get(&self, key: &K, now: DateTime<Utc>) -> Option<V> {
        let hit = self
            .entries
            .get(key)
            .filter(|entry| entry.1 > now)
            .map(|entry| entry.0.clone());
        if hit.is_none() {
            self.entries.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        }
        hit
    }

    pub fn insert(&self, key: K, value: V, now: DateTime<Utc>) {
        if self.ttl > Duration::zero() {
            self.entries.insert(key, (value, now + self.ttl));
        }
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
