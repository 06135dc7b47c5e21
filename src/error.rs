//! Error types surfaced by the cache.
//!
//! Argument validation failures are reported at the call boundary
//! ([`CacheBuilder::try_build`](crate::CacheBuilder::try_build)).  Loader
//! failures surface only on the read-through path and never corrupt the map.
//! Listener panics are suppressed and logged, so no error variant exists for
//! them.

use thiserror::Error;

/// Boxed error type accepted from user-supplied loaders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by cache construction and the compute / loading paths.
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration value was rejected at build time.
    #[error("invalid cache configuration: {0}")]
    InvalidArgument(&'static str),

    /// `max_weight` was configured without a weigher to produce weights.
    #[error("max_weight requires a weigher")]
    WeigherMissing,

    /// A compute operation re-entered a shard lock already held by the
    /// calling thread.
    ///
    /// Raised when a user function passed to `compute` or `get_with` calls
    /// back into the cache with a key that maps to the same shard.  The map
    /// is left exactly as it was before the outer call.
    #[error("recursive compute on a key colliding with one already being computed")]
    ReentrantCompute,

    /// A user-supplied loader returned an error on the read-through path.
    #[error("cache loader failed")]
    Loader(#[source] BoxError),
}

impl Error {
    /// Returns `true` for the loader-failure variant.
    pub fn is_loader_failure(&self) -> bool {
        matches!(self, Error::Loader(_))
    }
}
