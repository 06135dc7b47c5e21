//! Expiration machinery: the per-entry [`Expiry`] seam, the fixed-mode
//! order queues, and the hierarchical timer wheel.
//!
//! Three expiration modes exist:
//!
//! - **after-write** (TTL): a fixed duration from the last write, indexed
//!   by a write-order FIFO queue;
//! - **after-access** (TTI): a fixed duration from the last read or write,
//!   indexed by an access-order LRU queue;
//! - **variable**: a per-entry deadline computed by a caller-supplied
//!   [`Expiry`], indexed by the [`timer_wheel`].
//!
//! The two fixed modes may be combined (an entry then expires at the
//! earlier of its two deadlines); the variable mode is mutually exclusive
//! with them, so an entry is never scheduled in more than one timer index.
//! Every entry additionally carries its effective deadline inline, which
//! the read path checks without touching any of these structures.

pub mod queues;
pub mod timer_wheel;

use std::time::Duration;

/// Computes per-entry expiration durations.
///
/// `now` is the ticker time as a [`Duration`] since the cache's epoch, and
/// `remaining` is the time the entry currently has left.  Durations of
/// [`Duration::MAX`] (or anything past the representable horizon) mean the
/// entry never expires; [`Duration::ZERO`] expires it immediately.
///
/// The hooks run on the calling thread, outside of any cache lock for
/// reads and under the owning shard's lock for writes — keep them cheap.
pub trait Expiry<K, V>: Send + Sync + 'static {
    /// Duration until expiry for a newly created entry.
    fn expire_after_create(&self, key: &K, value: &V, now: Duration) -> Duration;

    /// Called after a read.  `None` leaves the current deadline unchanged.
    fn expire_after_read(
        &self,
        key: &K,
        value: &V,
        now: Duration,
        remaining: Duration,
    ) -> Option<Duration> {
        let _ = (key, value, now, remaining);
        None
    }

    /// Called after a value update.  `None` leaves the deadline unchanged.
    fn expire_after_update(
        &self,
        key: &K,
        value: &V,
        now: Duration,
        remaining: Duration,
    ) -> Option<Duration> {
        let _ = (key, value, now, remaining);
        None
    }
}
