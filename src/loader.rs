//! Read-through loading — the callback invoked to compute a value for a
//! missing key, and the one re-invoked by refresh-after-write.
//!
//! A loader error on the read-through path propagates to the caller as
//! [`Error::Loader`](crate::Error::Loader) and leaves the map unchanged.
//! The same loader is used by asynchronous refresh, where a failure is
//! logged and the stale value retained instead.

use crate::error::BoxError;

/// Computes the value for a key that is not in the cache.
pub trait CacheLoader<K, V>: Send + Sync + 'static {
    fn load(&self, key: &K) -> Result<V, BoxError>;
}

/// A [`CacheLoader`] backed by a fallible closure.
///
/// Created via [`CacheBuilder::loader`](crate::CacheBuilder::loader).
pub struct FnLoader<F>(pub F);

impl<K, V, F> CacheLoader<K, V> for FnLoader<F>
where
    F: Fn(&K) -> Result<V, BoxError> + Send + Sync + 'static,
{
    #[inline]
    fn load(&self, key: &K) -> Result<V, BoxError> {
        (self.0)(key)
    }
}
