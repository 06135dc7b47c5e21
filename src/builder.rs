use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{Cache, CacheConfig, ExpirationPolicy};
use crate::error::{BoxError, Error};
use crate::exec::{DirectExecutor, Executor, Scheduler};
use crate::expiry::Expiry;
use crate::listener::{FnListener, RemovalListener};
use crate::loader::{CacheLoader, FnLoader};
use crate::time::{duration_to_nanos, SystemTicker, Ticker};
use crate::weigher::{FnWeigher, UnitWeigher, Weigher};

/// Builder for configuring and constructing a [`Cache`].
///
/// # Example
/// ```
/// use cortado::CacheBuilder;
/// use std::time::Duration;
///
/// let cache: cortado::Cache<String, String> = CacheBuilder::new(1_000)
///     .time_to_live(Duration::from_secs(60))
///     .build();
/// ```
pub struct CacheBuilder<K, V> {
    max_capacity: Option<u64>,
    weight_bounded: bool,
    num_shards: usize,
    weigher: Option<Box<dyn Weigher<K, V>>>,
    ttl: Option<Duration>,
    tti: Option<Duration>,
    variable_expiry: Option<Arc<dyn Expiry<K, V>>>,
    refresh_after: Option<Duration>,
    loader: Option<Arc<dyn CacheLoader<K, V>>>,
    listener: Option<Arc<dyn RemovalListener<K, V>>>,
    ticker: Arc<dyn Ticker>,
    executor: Arc<dyn Executor>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl<K: 'static, V: 'static> CacheBuilder<K, V> {
    /// A builder for a cache bounded at `max_capacity` entries (or total
    /// weight, once a [`weigher`](Self::weigher) is set).
    pub fn new(max_capacity: u64) -> Self {
        assert!(max_capacity > 0, "max_capacity must be greater than 0");
        let mut b = Self::unbounded();
        b.max_capacity = Some(max_capacity);
        b
    }

    /// A builder for a cache with no size bound.  Entries only leave by
    /// explicit invalidation or expiration.
    pub fn unbounded() -> Self {
        CacheBuilder {
            max_capacity: None,
            weight_bounded: false,
            num_shards: 64,
            weigher: None,
            ttl: None,
            tti: None,
            variable_expiry: None,
            refresh_after: None,
            loader: None,
            listener: None,
            ticker: Arc::new(SystemTicker::new()),
            executor: Arc::new(DirectExecutor),
            scheduler: None,
        }
    }

    /// Bounds the cache by total entry weight instead of entry count.
    ///
    /// Requires a [`weigher`](Self::weigher); building without one fails.
    pub fn max_weight(mut self, max_weight: u64) -> Self {
        assert!(max_weight > 0, "max_weight must be greater than 0");
        self.max_capacity = Some(max_weight);
        self.weight_bounded = true;
        self
    }

    /// Set the number of internal shards (must be a power of two; default: 64).
    pub fn num_shards(mut self, n: usize) -> Self {
        assert!(
            n > 0 && n.is_power_of_two(),
            "num_shards must be a power of two"
        );
        self.num_shards = n;
        self
    }

    /// Each entry expires `ttl` after it was **written** (or replaced).
    pub fn time_to_live(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Each entry expires `tti` after it was **last accessed**.
    pub fn time_to_idle(mut self, tti: Duration) -> Self {
        self.tti = Some(tti);
        self
    }

    /// Per-entry expiration via an [`Expiry`] implementation.
    ///
    /// Mutually exclusive with [`time_to_live`](Self::time_to_live) and
    /// [`time_to_idle`](Self::time_to_idle).
    pub fn expire_after(mut self, expiry: impl Expiry<K, V>) -> Self {
        self.variable_expiry = Some(Arc::new(expiry));
        self
    }

    /// Entries older than `threshold` (since their last write) are reloaded
    /// asynchronously when read.  Requires a [`loader`](Self::loader).
    pub fn refresh_after_write(mut self, threshold: Duration) -> Self {
        self.refresh_after = Some(threshold);
        self
    }

    /// Read-through loader used by [`Cache::get_or_load`] and refresh.
    pub fn loader<F>(mut self, f: F) -> Self
    where
        F: Fn(&K) -> Result<V, BoxError> + Send + Sync + 'static,
    {
        self.loader = Some(Arc::new(FnLoader(f)));
        self
    }

    /// Read-through loader via the [`CacheLoader`] trait.
    pub fn loader_impl<L: CacheLoader<K, V>>(mut self, l: L) -> Self {
        self.loader = Some(Arc::new(l));
        self
    }

    /// Register a removal listener closure.
    ///
    /// The closure runs on the configured executor each time an entry
    /// leaves the map, with the [`RemovalCause`](crate::listener::RemovalCause).
    /// With the default inline executor, do **not** call cache methods from
    /// within the closure.
    pub fn removal_listener<F>(mut self, f: F) -> Self
    where
        F: Fn(&K, Arc<V>, crate::listener::RemovalCause) + Send + Sync + 'static,
    {
        self.listener = Some(Arc::new(FnListener(f)));
        self
    }

    /// Register a removal listener via the [`RemovalListener`] trait.
    pub fn removal_listener_impl<L: RemovalListener<K, V>>(mut self, l: L) -> Self {
        self.listener = Some(Arc::new(l));
        self
    }

    /// Set a custom entry weigher via closure.
    ///
    /// # Example
    /// ```
    /// use cortado::CacheBuilder;
    ///
    /// let cache: cortado::Cache<String, Vec<u8>> = CacheBuilder::new(4096)
    ///     .weigher(|_k: &String, v: &Vec<u8>| v.len() as u64 + 1)
    ///     .build();
    /// ```
    pub fn weigher<F>(mut self, f: F) -> Self
    where
        F: Fn(&K, &V) -> u64 + Send + Sync + 'static,
    {
        self.weigher = Some(Box::new(FnWeigher(f)));
        self
    }

    /// Set a weigher using any type that implements the [`Weigher`] trait.
    pub fn weigher_impl<W: Weigher<K, V>>(mut self, w: W) -> Self {
        self.weigher = Some(Box::new(w));
        self
    }

    /// Replace the clock.  Mostly useful for deterministic expiration and
    /// refresh tests, via [`ManualTicker`](crate::time::ManualTicker).
    pub fn ticker(mut self, ticker: impl Ticker) -> Self {
        self.ticker = Arc::new(ticker);
        self
    }

    /// Replace the task sink used for removal notifications, refresh loads,
    /// and offloaded maintenance.  Defaults to running tasks inline.
    pub fn executor(mut self, executor: impl Executor) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    /// Install a timer source so expiration fires near its deadline even on
    /// an otherwise idle cache.  Without one, expiration is lazy.
    pub fn scheduler(mut self, scheduler: impl Scheduler) -> Self {
        self.scheduler = Some(Arc::new(scheduler));
        self
    }
}

impl<K, V> CacheBuilder<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Validates the configuration and constructs the cache.
    pub fn try_build(self) -> Result<Cache<K, V>, Error> {
        if self.weight_bounded && self.weigher.is_none() {
            return Err(Error::WeigherMissing);
        }
        if self.variable_expiry.is_some() && (self.ttl.is_some() || self.tti.is_some()) {
            return Err(Error::InvalidArgument(
                "expire_after is mutually exclusive with time_to_live / time_to_idle",
            ));
        }
        if self.ttl.is_some_and(|d| d.is_zero()) {
            return Err(Error::InvalidArgument("time_to_live must be positive"));
        }
        if self.tti.is_some_and(|d| d.is_zero()) {
            return Err(Error::InvalidArgument("time_to_idle must be positive"));
        }
        if let Some(threshold) = self.refresh_after {
            if threshold.is_zero() {
                return Err(Error::InvalidArgument(
                    "refresh_after_write must be positive",
                ));
            }
            if self.loader.is_none() {
                return Err(Error::InvalidArgument(
                    "refresh_after_write requires a loader",
                ));
            }
        }

        let expiration = ExpirationPolicy {
            ttl: self.ttl.map(duration_to_nanos),
            tti: self.tti.map(duration_to_nanos),
            variable: self.variable_expiry,
        };

        Ok(Cache::new(CacheConfig {
            max_weight: self.max_capacity,
            num_shards: self.num_shards,
            weigher: self.weigher.unwrap_or_else(|| Box::new(UnitWeigher)),
            expiration,
            refresh_after: self.refresh_after.map(duration_to_nanos),
            loader: self.loader,
            listener: self.listener,
            ticker: self.ticker,
            executor: self.executor,
            scheduler: self.scheduler,
        }))
    }

    /// Constructs the cache, panicking on an invalid configuration.
    pub fn build(self) -> Cache<K, V> {
        match self.try_build() {
            Ok(cache) => cache,
            Err(e) => panic!("invalid cache configuration: {e}"),
        }
    }
}
