//! Single-slot value cache with a time-to-live.
//!
//! Reads after `expires_at` behave as a miss. The stale value is not swept
//! eagerly; it stays in the slot until the next write replaces it. Reads and
//! writes share one `RwLock`, so a reader observes either the whole old entry
//! or the whole new one.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

use super::clock::{deadline, Clock, SystemClock};

/// Default time-to-live, matching the system prompt refresh cadence.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct Slot<V> {
    value: V,
    expires_at: Instant,
}

/// Capacity-one cache whose entry expires after a fixed TTL.
#[derive(Debug)]
pub struct ExpiringValue<V> {
    slot: RwLock<Option<Slot<V>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> ExpiringValue<V> {
    /// Create an empty cache using the system clock.
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    /// Create an empty cache driven by `clock`.
    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            slot: RwLock::new(None),
            ttl,
            clock,
        }
    }

    /// Create a cache already holding `value` for a full TTL.
    pub fn seeded(value: V, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let cache = Self::with_clock(ttl, clock);
        cache.set(value, ttl);
        cache
    }

    /// Return the stored value if it has not expired.
    pub fn get(&self) -> Option<V> {
        let now = self.clock.now();
        let slot = self.slot.read().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some(entry) if now < entry.expires_at => Some(entry.value.clone()),
            Some(_) => {
                debug!("Expiring value is stale");
                None
            }
            None => None,
        }
    }

    /// Replace the value and reset its expiry to `now + ttl`.
    ///
    /// TTLs beyond [`MAX_TTL`](super::MAX_TTL) are capped.
    pub fn set(&self, value: V, ttl: Duration) {
        let expires_at = deadline(self.clock.now(), ttl);
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Slot { value, expires_at });
    }

    /// Replace the value using the cache's configured TTL.
    pub fn set_default_ttl(&self, value: V) {
        self.set(value, self.ttl);
    }

    /// Drop the stored value.
    pub fn clear(&self) {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }

    /// Expiry instant of the live entry, or `None` on a miss.
    pub fn expires_at(&self) -> Option<Instant> {
        let now = self.clock.now();
        let slot = self.slot.read().unwrap_or_else(|e| e.into_inner());
        slot.as_ref()
            .map(|entry| entry.expires_at)
            .filter(|at| now < *at)
    }

    /// Time left before the live entry expires.
    pub fn remaining(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.expires_at().map(|at| at.saturating_duration_since(now))
    }

    /// The TTL applied by [`set_default_ttl`](Self::set_default_ttl).
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
