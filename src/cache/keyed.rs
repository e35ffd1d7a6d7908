//! Keyed variant of [`ExpiringValue`](super::ExpiringValue).
//!
//! One lock guards the whole map; each key carries its own expiry and obeys
//! the same read/write contract as the single-slot cache.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use super::clock::{deadline, Clock, SystemClock};

#[derive(Debug)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Map from key to a value with its own expiry.
#[derive(Debug)]
pub struct KeyedExpiringCache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<K: Eq + Hash, V: Clone> KeyedExpiringCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    /// Look up `key`. Expired entries read as absent.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.value.clone())
    }

    /// Insert or replace `key` with an expiry of `now + ttl`.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let expires_at = deadline(self.clock.now(), ttl);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(key, Entry { value, expires_at });
    }

    /// Insert or replace `key` using the configured TTL.
    pub fn set_default_ttl(&self, key: K, value: V) {
        self.set(key, value, self.ttl);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(key).map(|entry| entry.value)
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        before - entries.len()
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
