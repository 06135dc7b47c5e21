//! Removal listener — a callback invoked whenever an entry leaves the cache.
//!
//! Notifications are dispatched from the maintenance pass through the
//! configured [`Executor`](crate::exec::Executor), so a listener runs off
//! the mutating caller's critical path when a real executor is installed.
//! For a single key, notifications are dispatched in the real-time order of
//! the removals; across keys there is no ordering guarantee.
//!
//! A panicking listener is caught and logged; it never fails the mutator
//! call that triggered it and never halts maintenance.
//!
//! # Example
//! ```
//! use cortado::CacheBuilder;
//! use cortado::listener::RemovalCause;
//!
//! let cache: cortado::Cache<u64, u64> = CacheBuilder::new(2)
//!     .removal_listener(|key: &u64, _val, cause| {
//!         println!("removed key={key} cause={cause:?}");
//!     })
//!     .build();
//!
//! cache.insert(1, 10);
//! cache.insert(2, 20);
//! cache.insert(3, 30); // may evict with cause Size
//! cache.invalidate(&1); // Explicit, if still present
//! ```

use std::sync::Arc;

// ---------------------------------------------------------------------------
// RemovalCause
// ---------------------------------------------------------------------------

/// The reason an entry was removed from the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RemovalCause {
    /// Removed by [`Cache::invalidate`], [`Cache::invalidate_all`], a
    /// compute function returning `None`, or a conditional removal.
    ///
    /// [`Cache::invalidate`]: crate::Cache::invalidate
    /// [`Cache::invalidate_all`]: crate::Cache::invalidate_all
    Explicit,
    /// The value was replaced by a write to the same key.
    Replaced,
    /// Reserved: the entry's storage was reclaimed outside of the cache's
    /// own policies.  Never emitted by this implementation.
    Collected,
    /// The entry's fixed or variable expiration deadline passed.
    Expired,
    /// Evicted by the admission policy to keep the cache within its
    /// maximum size or weight.
    Size,
}

impl RemovalCause {
    /// `true` when the entry was removed by the cache itself rather than by
    /// an explicit user action.
    pub fn was_evicted(self) -> bool {
        matches!(
            self,
            RemovalCause::Expired | RemovalCause::Size | RemovalCause::Collected
        )
    }
}

// ---------------------------------------------------------------------------
// RemovalListener trait
// ---------------------------------------------------------------------------

/// A callback invoked each time an entry leaves the map, with the cause.
///
/// Every entry that leaves the map produces exactly one notification.
///
/// **Do not call cache methods from inside the listener** when running with
/// the default inline executor — the callback executes on the maintenance
/// path and re-entering the cache from there can deadlock on internal locks.
pub trait RemovalListener<K, V>: Send + Sync + 'static {
    fn on_removal(&self, key: &K, value: Arc<V>, cause: RemovalCause);
}

/// A [`RemovalListener`] backed by a closure.
///
/// Created via [`CacheBuilder::removal_listener`](crate::CacheBuilder::removal_listener).
pub struct FnListener<F>(pub F);

impl<K, V, F> RemovalListener<K, V> for FnListener<F>
where
    F: Fn(&K, Arc<V>, RemovalCause) + Send + Sync + 'static,
{
    fn on_removal(&self, key: &K, value: Arc<V>, cause: RemovalCause) {
        (self.0)(key, value, cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_causes_are_classified() {
        assert!(RemovalCause::Expired.was_evicted());
        assert!(RemovalCause::Size.was_evicted());
        assert!(RemovalCause::Collected.was_evicted());
        assert!(!RemovalCause::Explicit.was_evicted());
        assert!(!RemovalCause::Replaced.was_evicted());
    }
}
