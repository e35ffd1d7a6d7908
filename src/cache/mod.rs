//! Time-based value caching.
//!
//! [`ExpiringValue`] is the single-slot cache holding the active system
//! prompt. [`KeyedExpiringCache`] applies the same contract per key for
//! deployments that need one prompt per tenant.

pub mod clock;
pub mod expiring;
pub mod keyed;

pub use clock::{Clock, ManualClock, SystemClock, MAX_TTL};
pub use expiring::{ExpiringValue, DEFAULT_TTL};
pub use keyed::KeyedExpiringCache;
