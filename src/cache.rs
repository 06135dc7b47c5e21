use std::borrow::Borrow;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::{AHashSet, RandomState};
use parking_lot::Mutex;

use crate::buffer::read::{ReadOp, StripedReadBuffer};
use crate::buffer::write::{WriteBuffer, WriteOp};
use crate::error::{BoxError, Error};
use crate::exec::{Executor, Scheduler};
use crate::expiry::queues::ExpirationQueue;
use crate::expiry::timer_wheel::TimerWheel;
use crate::expiry::Expiry;
use crate::listener::{RemovalCause, RemovalListener};
use crate::loader::CacheLoader;
use crate::metrics::stats::{CacheStats, StatsCounter};
use crate::policy::TinyLfuPolicy;
use crate::store::sharded::{
    EntryStamps, IfAbsent, PutIfAbsent, ReadOutcome, ShardedStore, StoreEntry,
};
use crate::time::{saturating_deadline, Ticker, NEVER};
use crate::weigher::Weigher;

/// How many times one maintenance call re-runs its pass to absorb work
/// that arrived while it was draining.
const MAX_DRAIN_PASSES: usize = 4;

/// Cap on expirations reaped per pass, so an inline drain stays bounded.
const EXPIRE_BATCH: usize = 512;

// ---------------------------------------------------------------------------
// Drain status
// ---------------------------------------------------------------------------

const IDLE: u8 = 0;
const REQUIRED: u8 = 1;
const PROCESSING: u8 = 2;
const PROCESSING_TO_REQUIRED: u8 = 3;

/// The maintenance state machine, packed into one atomic word.
///
/// `Idle → Required → Processing → Idle`, with the absorbing retry state
/// `ProcessingToRequired` for work that arrives mid-drain.  Exactly one
/// thread holds the drain at a time; the transition into `Processing` only
/// happens under the maintenance lock.
struct DrainStatus(AtomicU8);

impl DrainStatus {
    fn new() -> Self {
        DrainStatus(AtomicU8::new(IDLE))
    }

    /// Records that maintenance is needed.  Returns `true` when the caller
    /// should submit a drain task (no current pass will pick the work up).
    fn request(&self) -> bool {
        loop {
            match self.0.load(Ordering::Acquire) {
                IDLE => {
                    if self
                        .0
                        .compare_exchange(IDLE, REQUIRED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return true;
                    }
                }
                REQUIRED => return true,
                PROCESSING => {
                    if self
                        .0
                        .compare_exchange(
                            PROCESSING,
                            PROCESSING_TO_REQUIRED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return false;
                    }
                }
                _ => return false, // PROCESSING_TO_REQUIRED already absorbs it
            }
        }
    }

    fn begin(&self) {
        self.0.store(PROCESSING, Ordering::Release);
    }

    /// Ends a pass.  `false` means more work arrived mid-drain and the
    /// caller should run another pass.
    fn finish(&self) -> bool {
        self.0
            .compare_exchange(PROCESSING, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn leave_required(&self) {
        self.0.store(REQUIRED, Ordering::Release);
    }

    fn is_required(&self) -> bool {
        matches!(
            self.0.load(Ordering::Acquire),
            REQUIRED | PROCESSING_TO_REQUIRED
        )
    }
}

// ---------------------------------------------------------------------------
// Expiration configuration & indexes
// ---------------------------------------------------------------------------

/// The active expiration modes, fixed at construction.
pub(crate) struct ExpirationPolicy<K, V> {
    /// Fixed expire-after-write duration, in nanos.
    pub(crate) ttl: Option<u64>,
    /// Fixed expire-after-access duration, in nanos.
    pub(crate) tti: Option<u64>,
    /// Per-entry variable expiry; mutually exclusive with the fixed modes.
    pub(crate) variable: Option<Arc<dyn Expiry<K, V>>>,
}

impl<K: 'static, V: 'static> ExpirationPolicy<K, V> {
    fn is_active(&self) -> bool {
        self.ttl.is_some() || self.tti.is_some() || self.variable.is_some()
    }

    /// Deadline for an entry written at `now`, observing the previous entry
    /// for the variable mode's create/update distinction.
    fn deadline_for_write(
        &self,
        key: &K,
        value: &V,
        now: u64,
        prev: Option<&StoreEntry<V>>,
    ) -> u64 {
        if let Some(expiry) = &self.variable {
            let now_d = Duration::from_nanos(now);
            let live_prev = prev.filter(|p| !p.is_expired(now));
            return match live_prev {
                Some(p) => {
                    let remaining = Duration::from_nanos(p.deadline().saturating_sub(now));
                    match expiry.expire_after_update(key, value, now_d, remaining) {
                        Some(d) => deadline_after(now, d),
                        None => p.deadline(),
                    }
                }
                None => deadline_after(now, expiry.expire_after_create(key, value, now_d)),
            };
        }

        let mut deadline = NEVER;
        if let Some(ttl) = self.ttl {
            deadline = deadline.min(saturating_deadline(now, ttl));
        }
        if let Some(tti) = self.tti {
            deadline = deadline.min(saturating_deadline(now, tti));
        }
        deadline
    }
}

/// Absolute deadline for a duration starting at `now`; durations at or
/// past the representable horizon mean "never".
fn deadline_after(now: u64, d: Duration) -> u64 {
    let nanos = d.as_nanos();
    if nanos >= NEVER as u128 {
        NEVER
    } else {
        saturating_deadline(now, nanos as u64)
    }
}

/// The drain-private timer structures, chosen by the active modes.
///
/// Fixed modes index entries in deadline-ordered queues (write-order FIFO
/// and/or access-order LRU); the variable mode uses the timer wheel.  An
/// entry never sits in both a fixed queue and the wheel.
enum ExpirationIndex<K> {
    Inactive,
    Fixed {
        ttl: Option<u64>,
        tti: Option<u64>,
        write_queue: Option<ExpirationQueue<K>>,
        access_queue: Option<ExpirationQueue<K>>,
    },
    Wheel(TimerWheel<K>),
}

impl<K: Hash + Eq + Clone> ExpirationIndex<K> {
    fn new<V>(config: &ExpirationPolicy<K, V>, now: u64) -> Self {
        if config.variable.is_some() {
            ExpirationIndex::Wheel(TimerWheel::new(now))
        } else if config.ttl.is_some() || config.tti.is_some() {
            ExpirationIndex::Fixed {
                ttl: config.ttl,
                tti: config.tti,
                write_queue: config.ttl.map(|_| ExpirationQueue::new()),
                access_queue: config.tti.map(|_| ExpirationQueue::new()),
            }
        } else {
            ExpirationIndex::Inactive
        }
    }

    /// Indexes an entry written at `at` with effective deadline `expires_at`.
    fn on_write(&mut self, key: K, at: u64, expires_at: u64) {
        match self {
            ExpirationIndex::Inactive => {}
            ExpirationIndex::Fixed {
                ttl,
                tti,
                write_queue,
                access_queue,
            } => {
                if let (Some(ttl), Some(q)) = (*ttl, write_queue.as_mut()) {
                    q.schedule(key.clone(), saturating_deadline(at, ttl));
                }
                if let (Some(tti), Some(q)) = (*tti, access_queue.as_mut()) {
                    q.schedule(key, saturating_deadline(at, tti));
                }
            }
            ExpirationIndex::Wheel(wheel) => {
                if expires_at == NEVER {
                    wheel.cancel(&key);
                } else {
                    wheel.schedule(key, expires_at);
                }
            }
        }
    }

    /// Re-indexes an entry after a read moved its deadline.
    fn on_read(&mut self, key: K, at: u64, expires_at: u64) {
        match self {
            ExpirationIndex::Inactive => {}
            ExpirationIndex::Fixed {
                tti, access_queue, ..
            } => {
                if let (Some(tti), Some(q)) = (*tti, access_queue.as_mut()) {
                    q.schedule(key, saturating_deadline(at, tti));
                }
            }
            ExpirationIndex::Wheel(wheel) => {
                if expires_at == NEVER {
                    wheel.cancel(&key);
                } else {
                    wheel.schedule(key, expires_at);
                }
            }
        }
    }

    fn remove(&mut self, key: &K) {
        match self {
            ExpirationIndex::Inactive => {}
            ExpirationIndex::Fixed {
                write_queue,
                access_queue,
                ..
            } => {
                if let Some(q) = write_queue.as_mut() {
                    q.remove(key);
                }
                if let Some(q) = access_queue.as_mut() {
                    q.remove(key);
                }
            }
            ExpirationIndex::Wheel(wheel) => {
                wheel.cancel(key);
            }
        }
    }

    /// Collects up to `limit` keys whose indexed deadline is ≤ `now`.
    ///
    /// The caller re-validates each against the entry's live deadline
    /// before removal; vetoed keys come back through [`restore`](Self::restore).
    fn expire(&mut self, now: u64, limit: usize, out: &mut Vec<K>) {
        match self {
            ExpirationIndex::Inactive => {}
            ExpirationIndex::Fixed {
                write_queue,
                access_queue,
                ..
            } => {
                let mut budget = limit;
                if let Some(q) = write_queue.as_mut() {
                    budget -= q.expire_into(now, budget, out);
                }
                if let Some(q) = access_queue.as_mut() {
                    q.expire_into(now, budget, out);
                }
            }
            ExpirationIndex::Wheel(wheel) => {
                wheel.advance(now, out);
            }
        }
    }

    /// Puts back a key whose removal was vetoed because its live deadline
    /// had moved past what the index believed.
    ///
    /// Every active fixed queue is re-scheduled from its own component
    /// deadline — the pop may have come from either queue, and the one the
    /// key was popped from would otherwise lose track of it for good.
    fn restore(&mut self, key: K, stamps: &EntryStamps) {
        match self {
            ExpirationIndex::Inactive => {}
            ExpirationIndex::Fixed {
                ttl,
                tti,
                write_queue,
                access_queue,
            } => {
                if let (Some(ttl), Some(q)) = (*ttl, write_queue.as_mut()) {
                    q.schedule(key.clone(), saturating_deadline(stamps.written_at, ttl));
                }
                if let (Some(tti), Some(q)) = (*tti, access_queue.as_mut()) {
                    q.schedule(key, saturating_deadline(stamps.accessed_at, tti));
                }
            }
            ExpirationIndex::Wheel(wheel) => {
                if stamps.deadline != NEVER {
                    wheel.schedule(key, stamps.deadline);
                }
            }
        }
    }

    /// Earliest indexed deadline, for arming the scheduler.
    fn next_deadline(&self) -> Option<u64> {
        match self {
            ExpirationIndex::Inactive => None,
            ExpirationIndex::Fixed {
                write_queue,
                access_queue,
                ..
            } => {
                let w = write_queue.as_ref().and_then(|q| q.next_deadline());
                let a = access_queue.as_ref().and_then(|q| q.next_deadline());
                match (w, a) {
                    (Some(w), Some(a)) => Some(w.min(a)),
                    (w, a) => w.or(a),
                }
            }
            ExpirationIndex::Wheel(wheel) => wheel.next_deadline(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cache interior
// ---------------------------------------------------------------------------

/// Shared interior of a [`Cache`].
pub(crate) struct Inner<K, V> {
    pub(crate) store: ShardedStore<K, V>,
    /// `None` for an unbounded cache.
    policy: Option<Mutex<TinyLfuPolicy<K>>>,
    build_hasher: RandomState,
    weigher: Box<dyn Weigher<K, V>>,
    expiration: ExpirationPolicy<K, V>,
    /// Timer structures; locked only by the maintenance pass.
    index: Mutex<ExpirationIndex<K>>,
    ticker: Arc<dyn Ticker>,
    executor: Arc<dyn Executor>,
    scheduler: Option<Arc<dyn Scheduler>>,
    loader: Option<Arc<dyn CacheLoader<K, V>>>,
    /// Refresh-after-write threshold, in nanos.
    refresh_after: Option<u64>,
    /// Keys with a refresh in flight; coalesces concurrent triggers.
    refreshing: Mutex<AHashSet<K>>,
    listener: Option<Arc<dyn RemovalListener<K, V>>>,
    read_buffer: StripedReadBuffer<K>,
    write_buffer: WriteBuffer<K>,
    drain_status: DrainStatus,
    maintenance_lock: Mutex<()>,
    /// Deadline of the currently armed scheduler wakeup; `NEVER` when none.
    armed_at: AtomicU64,
    stats: StatsCounter,
}

/// Construction parameters handed over by the builder.
pub(crate) struct CacheConfig<K, V> {
    pub max_weight: Option<u64>,
    pub num_shards: usize,
    pub weigher: Box<dyn Weigher<K, V>>,
    pub expiration: ExpirationPolicy<K, V>,
    pub refresh_after: Option<u64>,
    pub loader: Option<Arc<dyn CacheLoader<K, V>>>,
    pub listener: Option<Arc<dyn RemovalListener<K, V>>>,
    pub ticker: Arc<dyn Ticker>,
    pub executor: Arc<dyn Executor>,
    pub scheduler: Option<Arc<dyn Scheduler>>,
}

impl<K, V> Inner<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn new(config: CacheConfig<K, V>) -> Self {
        let build_hasher = RandomState::new();
        let now = config.ticker.now_nanos();
        let policy = config
            .max_weight
            .map(|max| Mutex::new(TinyLfuPolicy::new(max, build_hasher.clone())));
        let index = Mutex::new(ExpirationIndex::new(&config.expiration, now));
        Inner {
            store: ShardedStore::new(config.num_shards, build_hasher.clone()),
            policy,
            build_hasher,
            weigher: config.weigher,
            expiration: config.expiration,
            index,
            ticker: config.ticker,
            executor: config.executor,
            scheduler: config.scheduler,
            loader: config.loader,
            refresh_after: config.refresh_after,
            refreshing: Mutex::new(AHashSet::new()),
            listener: config.listener,
            read_buffer: StripedReadBuffer::new(),
            write_buffer: WriteBuffer::new(),
            drain_status: DrainStatus::new(),
            maintenance_lock: Mutex::new(()),
            armed_at: AtomicU64::new(NEVER),
            stats: StatsCounter::new(),
        }
    }

    #[inline]
    fn now(&self) -> u64 {
        self.ticker.now_nanos()
    }

    /// Whether reads must be recorded at all — an unbounded cache with no
    /// expiration or refresh has nothing to learn from them.
    #[inline]
    fn wants_read_events(&self) -> bool {
        self.policy.is_some() || self.expiration.is_active() || self.refresh_after.is_some()
    }

    /// Builds the store entry for a write, consulting the weigher and the
    /// expiration configuration.
    fn make_entry(
        &self,
        key: &K,
        value: V,
        now: u64,
        prev: Option<&StoreEntry<V>>,
    ) -> StoreEntry<V> {
        let weight = self.weigher.weigh(key, &value).max(1);
        let deadline = self.expiration.deadline_for_write(key, &value, now, prev);
        StoreEntry::new(value, weight, now, deadline)
    }

    // -----------------------------------------------------------------------
    // Notification dispatch
    // -----------------------------------------------------------------------

    /// Completes an entry's teardown: records eviction statistics and
    /// submits the removal notification to the executor.
    ///
    /// A panicking listener is caught and logged; it never propagates.
    fn notify(&self, key: K, mut entry: StoreEntry<V>, cause: RemovalCause) {
        if cause.was_evicted() {
            self.stats.record_eviction(entry.weight);
        }
        entry.kill();
        let Some(listener) = &self.listener else {
            return;
        };
        let listener = Arc::clone(listener);
        let value = entry.value;
        self.executor.execute(Box::new(move || {
            let outcome =
                catch_unwind(AssertUnwindSafe(|| listener.on_removal(&key, value, cause)));
            if outcome.is_err() {
                tracing::warn!(?cause, "removal listener panicked; notification suppressed");
            }
        }));
    }

    // -----------------------------------------------------------------------
    // Drain scheduling
    // -----------------------------------------------------------------------

    /// Called after every write-buffer enqueue.
    fn after_write(self: &Arc<Self>, op: WriteOp<K>) {
        self.write_buffer.push(op);
        self.schedule_drain();
        if self.write_buffer.is_under_pressure() {
            // The executor is falling behind; the writer pays for the drain.
            self.try_run_pending();
        }
    }

    /// Called after every read that recorded (or failed to record) an event.
    fn after_read(self: &Arc<Self>, op: ReadOp<K>) {
        let offered = self.read_buffer.offer(op);
        if !offered || self.drain_status.is_required() {
            self.schedule_drain();
        }
    }

    /// Submits a drain task unless one is already pending or running.
    fn schedule_drain(self: &Arc<Self>) {
        if self.drain_status.request() {
            let inner = Arc::clone(self);
            self.executor
                .execute(Box::new(move || inner.try_run_pending()));
        }
    }

    /// Runs maintenance if the drain is free; otherwise the current owner
    /// absorbs the request via the status machine.
    fn try_run_pending(self: &Arc<Self>) {
        let Some(guard) = self.maintenance_lock.try_lock() else {
            return;
        };
        self.run_maintenance();
        drop(guard);
    }

    /// Runs maintenance, waiting for the drain if another thread holds it.
    fn run_pending(self: &Arc<Self>) {
        let guard = self.maintenance_lock.lock();
        self.run_maintenance();
        drop(guard);
    }

    /// Body of a maintenance call; the maintenance lock must be held.
    fn run_maintenance(self: &Arc<Self>) {
        for _ in 0..MAX_DRAIN_PASSES {
            self.drain_status.begin();
            self.drain_pass();
            if self.drain_status.finish() {
                self.arm_wakeup();
                return;
            }
        }
        // Still behind after the retry budget: leave the status so the next
        // operation schedules a fresh task.
        self.drain_status.leave_required();
        self.arm_wakeup();
    }

    // -----------------------------------------------------------------------
    // The drain
    // -----------------------------------------------------------------------

    /// One maintenance pass, in the canonical order: reads, writes,
    /// expiration, capacity.  Notifications are dispatched after the policy
    /// and timer locks are released.
    fn drain_pass(&self) {
        let mut reads = Vec::new();
        self.read_buffer.drain(&mut reads);
        let mut writes = Vec::new();
        self.write_buffer.drain(&mut writes);
        tracing::trace!(reads = reads.len(), writes = writes.len(), "drain pass");

        let now = self.now();
        let mut removals: Vec<(K, StoreEntry<V>, RemovalCause)> = Vec::new();

        {
            let mut policy = self.policy.as_ref().map(|m| m.lock());
            let mut index = self.index.lock();

            // 1. Accesses: sketch, eviction order, access-expiration order.
            for op in reads {
                if let Some(p) = policy.as_deref_mut() {
                    p.on_access(&op.key, op.hash);
                }
                if self.expiration.tti.is_some() || self.expiration.variable.is_some() {
                    let deadline = self.store.deadline_of(&op.key).unwrap_or(NEVER);
                    index.on_read(op.key, op.at, deadline);
                }
            }

            // 2. Writes: weights, eviction order, expiration indexing.
            let mut victims: Vec<K> = Vec::new();
            for op in writes {
                match op {
                    WriteOp::Add {
                        key,
                        weight,
                        at,
                        expires_at,
                    } => {
                        index.on_write(key.clone(), at, expires_at);
                        if let Some(p) = policy.as_deref_mut() {
                            victims.extend(p.on_insert(key, weight));
                        }
                    }
                    WriteOp::Update {
                        key,
                        new_weight,
                        at,
                        expires_at,
                    } => {
                        index.on_write(key.clone(), at, expires_at);
                        if let Some(p) = policy.as_deref_mut() {
                            victims.extend(p.on_update(&key, new_weight));
                        }
                    }
                    WriteOp::Remove { key } => {
                        index.remove(&key);
                        if let Some(p) = policy.as_deref_mut() {
                            p.on_remove(&key);
                        }
                    }
                    WriteOp::Reschedule {
                        key,
                        at,
                        expires_at,
                    } => {
                        index.on_read(key, at, expires_at);
                    }
                }
            }

            // 3. Expiration: reap everything the indexes say is due, with an
            //    atomic re-check of each entry's live deadline.
            let mut due: Vec<K> = Vec::new();
            index.expire(now, EXPIRE_BATCH, &mut due);
            for key in due {
                match self.store.remove_if(&key, |e| e.is_expired(now)) {
                    Some((k, entry)) => {
                        if let Some(p) = policy.as_deref_mut() {
                            p.on_remove(&k);
                        }
                        removals.push((k, entry, RemovalCause::Expired));
                    }
                    None => {
                        // A concurrent read or write pushed the deadline out.
                        if let Some(stamps) = self.store.stamps_of(&key) {
                            index.restore(key, &stamps);
                        }
                    }
                }
            }

            // 4. Capacity: the policy already untracked its victims.
            for key in victims {
                index.remove(&key);
                if let Some((k, entry)) = self.store.remove_entry(&key) {
                    removals.push((k, entry, RemovalCause::Size));
                }
            }
        }

        for (key, entry, cause) in removals {
            self.notify(key, entry, cause);
        }
    }

    /// Arms a single-shot scheduler wakeup at the next expiration deadline,
    /// unless an earlier wakeup is already armed.
    fn arm_wakeup(self: &Arc<Self>) {
        let Some(scheduler) = &self.scheduler else {
            return;
        };
        let Some(next) = self.index.lock().next_deadline() else {
            return;
        };
        let now = self.now();
        let armed = self.armed_at.load(Ordering::Acquire);
        if armed > now && armed <= next {
            return; // the pending wakeup already covers this deadline
        }
        self.armed_at.store(next, Ordering::Release);

        let delay = Duration::from_nanos(next.saturating_sub(now).max(1));
        let weak: Weak<Inner<K, V>> = Arc::downgrade(self);
        scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.armed_at.store(NEVER, Ordering::Release);
                    inner.drain_status.request();
                    inner.run_pending();
                }
            }),
        );
    }

    // -----------------------------------------------------------------------
    // Refresh coordination
    // -----------------------------------------------------------------------

    #[inline]
    fn is_refresh_due(&self, written_at: u64, now: u64) -> bool {
        match self.refresh_after {
            Some(threshold) => {
                self.loader.is_some() && now.saturating_sub(written_at) >= threshold
            }
            None => false,
        }
    }

    /// Launches at most one asynchronous reload for `key`.
    ///
    /// The observed value pins the entry generation: the refreshed value is
    /// installed only if the entry still holds `observed` when the load
    /// finishes; otherwise it is discarded.  A failed load is logged and
    /// the stale value retained.  Callers never block here.
    fn try_refresh(self: &Arc<Self>, key: K, observed: Arc<V>) {
        let Some(loader) = self.loader.as_ref().map(Arc::clone) else {
            return;
        };
        {
            let mut in_flight = self.refreshing.lock();
            if !in_flight.insert(key.clone()) {
                return; // coalesced with the refresh already running
            }
        }

        let weak: Weak<Inner<K, V>> = Arc::downgrade(self);
        self.executor.execute(Box::new(move || {
            // Releases the in-flight slot even if the loader panics.
            let mut slot = RefreshSlot {
                weak: weak.clone(),
                key: Some(key.clone()),
            };

            let Some(inner) = weak.upgrade() else {
                return;
            };
            let started = inner.now();
            match loader.load(&key) {
                Ok(new_value) => {
                    let now = inner.now();
                    inner.stats.record_load_success(now.saturating_sub(started));
                    let mut meta = (1u64, NEVER);
                    let old = inner.store.replace_if_same(&key, now, &observed, |prev| {
                        let e = inner.make_entry(&key, new_value, now, Some(prev));
                        meta = (e.weight, e.deadline());
                        e
                    });
                    if let Some(old) = old {
                        inner.notify(key.clone(), old, RemovalCause::Replaced);
                        inner.after_write(WriteOp::Update {
                            key: key.clone(),
                            new_weight: meta.0,
                            at: now,
                            expires_at: meta.1,
                        });
                    }
                }
                Err(err) => {
                    let now = inner.now();
                    inner.stats.record_load_failure(now.saturating_sub(started));
                    tracing::warn!(error = %err, "refresh load failed; keeping stale value");
                }
            }
            drop(inner);
            slot.release();
        }));
    }
}

/// Drop guard that frees a key's refresh slot.
struct RefreshSlot<K: Hash + Eq, V> {
    weak: Weak<Inner<K, V>>,
    key: Option<K>,
}

impl<K: Hash + Eq, V> RefreshSlot<K, V> {
    fn release(&mut self) {
        if let (Some(inner), Some(key)) = (self.weak.upgrade(), self.key.take()) {
            inner.refreshing.lock().remove(&key);
        }
    }
}

impl<K: Hash + Eq, V> Drop for RefreshSlot<K, V> {
    fn drop(&mut self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// Cache handle
// ---------------------------------------------------------------------------

/// A concurrent in-memory cache with W-TinyLFU admission, fixed and
/// variable expiration, read-through loading, and refresh-after-write.
///
/// Handles are cheap to clone and share one interior.
///
/// # Example
/// ```
/// use cortado::CacheBuilder;
///
/// let cache: cortado::Cache<String, String> = CacheBuilder::new(100).build();
/// cache.insert("hello".to_string(), "world".to_string());
/// assert_eq!(
///     cache.get("hello"),
///     Some(std::sync::Arc::new("world".to_string()))
/// );
/// ```
pub struct Cache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Cache {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub(crate) fn new(config: CacheConfig<K, V>) -> Self {
        Cache {
            inner: Arc::new(Inner::new(config)),
        }
    }

    /// Returns a [`CacheBuilder`] bounding the cache at `max_capacity`.
    pub fn builder(max_capacity: u64) -> crate::CacheBuilder<K, V> {
        crate::CacheBuilder::new(max_capacity)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Returns the value for `key` if a live mapping exists.
    ///
    /// Accepts any borrowed form of the key with compatible hash and
    /// equality.  A mapping whose deadline has passed reads as absent, is
    /// reaped inline, and produces an `Expired` notification.
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let inner = &self.inner;
        let now = inner.now();
        let outcome = inner.store.get_read(
            key,
            now,
            inner.wants_read_events(),
            inner.expiration.ttl,
            inner.expiration.tti,
        );

        match outcome {
            ReadOutcome::Miss => {
                inner.stats.record_miss();
                None
            }
            ReadOutcome::Expired { key, value: _ } => {
                inner.stats.record_miss();
                if let Some((k, entry)) = inner.store.remove_if::<K>(&key, |e| e.is_expired(now)) {
                    inner.notify(k, entry, RemovalCause::Expired);
                    inner.after_write(WriteOp::Remove { key });
                }
                None
            }
            ReadOutcome::Hit {
                key: recorded,
                value,
                written_at,
                expires_at,
            } => {
                inner.stats.record_hit();
                if let Some(k) = recorded {
                    // Variable expiry may move the deadline on read.
                    if let Some(expiry) = &inner.expiration.variable {
                        let remaining =
                            Duration::from_nanos(expires_at.saturating_sub(now));
                        if let Some(d) = expiry.expire_after_read(
                            &k,
                            &value,
                            Duration::from_nanos(now),
                            remaining,
                        ) {
                            let deadline = deadline_after(now, d);
                            inner.store.set_deadline::<K>(&k, deadline);
                            inner.after_write(WriteOp::Reschedule {
                                key: k.clone(),
                                at: now,
                                expires_at: deadline,
                            });
                        }
                    }

                    if inner.is_refresh_due(written_at, now) {
                        inner.try_refresh(k.clone(), Arc::clone(&value));
                    }

                    let hash = inner.build_hasher.hash_one(&k);
                    inner.after_read(ReadOp {
                        key: k,
                        hash,
                        at: now,
                    });
                }
                Some(value)
            }
        }
    }

    /// `true` when a live mapping for `key` exists.  Does not record the
    /// access and does not affect recency, frequency, or idle timers.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = self.inner.now();
        self.inner.store.contains_key(key, now)
    }

    /// `true` when any live entry maps to `value`.  Linear scan.
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        let now = self.inner.now();
        self.inner.store.contains_value(value, now)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Inserts `value` for `key`, returning the replaced value if a mapping
    /// existed.  The replaced entry produces a `Replaced` notification (or
    /// `Expired`, when it had already passed its deadline).
    pub fn insert(&self, key: K, value: V) -> Option<Arc<V>> {
        let inner = &self.inner;
        let now = inner.now();
        let mut meta = (1u64, NEVER);
        let old = inner.store.insert(key.clone(), |prev| {
            let entry = inner.make_entry(&key, value, now, prev);
            meta = (entry.weight, entry.deadline());
            entry
        });

        match old {
            Some(old) => {
                let was_live = !old.is_expired(now);
                let previous = was_live.then(|| Arc::clone(&old.value));
                let cause = if was_live {
                    RemovalCause::Replaced
                } else {
                    RemovalCause::Expired
                };
                inner.notify(key.clone(), old, cause);
                inner.after_write(WriteOp::Update {
                    key,
                    new_weight: meta.0,
                    at: now,
                    expires_at: meta.1,
                });
                previous
            }
            None => {
                inner.after_write(WriteOp::Add {
                    key,
                    weight: meta.0,
                    at: now,
                    expires_at: meta.1,
                });
                None
            }
        }
    }

    /// Inserts every pair from `entries`.
    pub fn insert_all(&self, entries: impl IntoIterator<Item = (K, V)>) {
        for (k, v) in entries {
            self.insert(k, v);
        }
    }

    /// Installs `value` only when no live mapping exists.  Returns the
    /// existing value otherwise.
    pub fn insert_if_absent(&self, key: K, value: V) -> Option<Arc<V>> {
        let inner = &self.inner;
        let now = inner.now();
        let mut meta = (1u64, NEVER);
        let outcome = inner.store.insert_if_absent(key.clone(), now, || {
            let entry = inner.make_entry(&key, value, now, None);
            meta = (entry.weight, entry.deadline());
            entry
        });
        match outcome {
            PutIfAbsent::Existing(v) => Some(v),
            PutIfAbsent::Inserted { expired } => {
                if let Some(old) = expired {
                    inner.notify(key.clone(), old, RemovalCause::Expired);
                }
                inner.after_write(WriteOp::Add {
                    key,
                    weight: meta.0,
                    at: now,
                    expires_at: meta.1,
                });
                None
            }
        }
    }

    /// Replaces the value of an existing live mapping, returning the
    /// previous value.  Absent (or expired) keys are left untouched.
    pub fn replace(&self, key: &K, value: V) -> Option<Arc<V>> {
        let inner = &self.inner;
        let now = inner.now();
        let mut meta = (1u64, NEVER);
        let old = inner.store.replace(key, now, |prev| {
            let entry = inner.make_entry(key, value, now, Some(prev));
            meta = (entry.weight, entry.deadline());
            entry
        })?;
        let previous = Arc::clone(&old.value);
        inner.notify(key.clone(), old, RemovalCause::Replaced);
        inner.after_write(WriteOp::Update {
            key: key.clone(),
            new_weight: meta.0,
            at: now,
            expires_at: meta.1,
        });
        Some(previous)
    }

    /// Replaces the value only when the current one equals `expected`.
    pub fn compare_replace(&self, key: &K, expected: &V, value: V) -> bool
    where
        V: PartialEq,
    {
        let inner = &self.inner;
        let now = inner.now();
        let mut meta = (1u64, NEVER);
        let old = inner.store.compare_replace(key, now, expected, |prev| {
            let entry = inner.make_entry(key, value, now, Some(prev));
            meta = (entry.weight, entry.deadline());
            entry
        });
        let Some(old) = old else {
            return false;
        };
        inner.notify(key.clone(), old, RemovalCause::Replaced);
        inner.after_write(WriteOp::Update {
            key: key.clone(),
            new_weight: meta.0,
            at: now,
            expires_at: meta.1,
        });
        true
    }

    // -----------------------------------------------------------------------
    // Removal
    // -----------------------------------------------------------------------

    /// Removes the mapping for `key`, returning its value.
    ///
    /// Invalidation is idempotent: removing an absent key is a no-op.
    pub fn invalidate<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let inner = &self.inner;
        let now = inner.now();
        let (k, entry) = inner.store.remove_entry(key)?;
        let value = Arc::clone(&entry.value);
        let cause = if entry.is_expired(now) {
            RemovalCause::Expired
        } else {
            RemovalCause::Explicit
        };
        inner.notify(k.clone(), entry, cause);
        inner.after_write(WriteOp::Remove { key: k });
        if cause == RemovalCause::Explicit {
            Some(value)
        } else {
            None
        }
    }

    /// Removes the mapping only when its value equals `expected`.
    pub fn compare_invalidate<Q>(&self, key: &Q, expected: &V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        let inner = &self.inner;
        let now = inner.now();
        let Some((k, entry)) = inner.store.compare_remove(key, now, expected) else {
            return false;
        };
        inner.notify(k.clone(), entry, RemovalCause::Explicit);
        inner.after_write(WriteOp::Remove { key: k });
        true
    }

    /// Removes the mappings for every key in `keys`.
    pub fn invalidate_many<'a, Q>(&self, keys: impl IntoIterator<Item = &'a Q>)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized + 'a,
    {
        for key in keys {
            self.invalidate(key);
        }
    }

    /// Removes every entry, notifying each with cause `Explicit`.
    ///
    /// Concurrent writes may land before or after the sweep; each entry
    /// still produces exactly one notification.
    pub fn invalidate_all(&self) {
        let inner = &self.inner;
        let entries = inner.store.drain_all();

        // The backlog refers to discarded entries; drop it and rebuild the
        // drain-side structures from scratch.
        let mut discard_writes = Vec::new();
        inner.write_buffer.drain(&mut discard_writes);
        drop(discard_writes);
        let mut discard_reads = Vec::new();
        inner.read_buffer.drain(&mut discard_reads);
        drop(discard_reads);

        if let Some(policy) = &inner.policy {
            let mut policy = policy.lock();
            let max = policy.max_weight();
            *policy = TinyLfuPolicy::new(max, inner.build_hasher.clone());
        }
        *inner.index.lock() = ExpirationIndex::new(&inner.expiration, inner.now());

        for (k, entry) in entries {
            inner.notify(k, entry, RemovalCause::Explicit);
        }
    }

    // -----------------------------------------------------------------------
    // Compute operations
    // -----------------------------------------------------------------------

    /// Returns the value for `key`, computing and caching it with `init`
    /// on a miss.
    ///
    /// `init` runs at most once per absent key at a time, under the owning
    /// shard's lock: concurrent callers of the same key serialize and the
    /// losers observe the winner's value.  `init` **must not** mutate this
    /// cache; calling a compute operation on a key of the same shard fails
    /// with [`Error::ReentrantCompute`] and the map is left unchanged.
    pub fn get_with<F>(&self, key: K, init: F) -> Result<Arc<V>, Error>
    where
        F: FnOnce(&K) -> V,
    {
        self.try_get_with(key, |k| Ok(init(k)))
    }

    /// Fallible form of [`get_with`](Self::get_with): an `Err` from `init`
    /// propagates as [`Error::Loader`] and nothing is cached.
    pub fn try_get_with<F>(&self, key: K, init: F) -> Result<Arc<V>, Error>
    where
        F: FnOnce(&K) -> Result<V, BoxError>,
    {
        if self.inner.store.is_held_by_current_thread(&key) {
            return Err(Error::ReentrantCompute);
        }
        if let Some(v) = self.get(&key) {
            return Ok(v);
        }

        let inner = &self.inner;
        let now = inner.now();
        let mut meta = (1u64, NEVER);
        let mut load_nanos = 0u64;
        let outcome = inner.store.compute_if_absent(
            &key,
            now,
            |k| {
                let started = inner.now();
                let loaded = init(k).map_err(Error::Loader);
                load_nanos = inner.now().saturating_sub(started);
                loaded
            },
            |v| {
                let entry = inner.make_entry(&key, v, now, None);
                meta = (entry.weight, entry.deadline());
                entry
            },
        );

        match outcome {
            Ok(IfAbsent::Present(v)) => Ok(v),
            Ok(IfAbsent::Inserted { value, expired }) => {
                inner.stats.record_load_success(load_nanos);
                if let Some(old) = expired {
                    inner.notify(key.clone(), old, RemovalCause::Expired);
                }
                inner.after_write(WriteOp::Add {
                    key,
                    weight: meta.0,
                    at: now,
                    expires_at: meta.1,
                });
                Ok(value)
            }
            Err(err) => {
                if err.is_loader_failure() {
                    inner.stats.record_load_failure(load_nanos);
                }
                Err(err)
            }
        }
    }

    /// Returns the value for `key`, loading it through the configured
    /// loader on a miss (read-through).
    pub fn get_or_load(&self, key: K) -> Result<Arc<V>, Error> {
        let Some(loader) = self.inner.loader.as_ref().map(Arc::clone) else {
            return Err(Error::InvalidArgument("get_or_load requires a loader"));
        };
        self.try_get_with(key, |k| loader.load(k))
    }

    /// Atomically remaps the value for `key`.
    ///
    /// `remap` observes the current value (absent reads as `None`) and
    /// returns the new one; `None` removes the mapping.  The returned value
    /// is what the mapping holds immediately afterwards.  The same
    /// reentrancy rule as [`get_with`](Self::get_with) applies.
    pub fn compute<F>(&self, key: K, remap: F) -> Result<Option<Arc<V>>, Error>
    where
        F: FnOnce(Option<Arc<V>>) -> Option<V>,
    {
        let inner = &self.inner;
        let now = inner.now();
        let mut meta = (1u64, NEVER);
        let computed = inner.store.compute(
            &key,
            now,
            |visible| remap(visible.map(Arc::clone)),
            |v, prev| {
                let entry = inner.make_entry(&key, v, now, prev);
                meta = (entry.weight, entry.deadline());
                entry
            },
        )?;
        Ok(self.apply_computed(key, now, meta, computed))
    }

    /// Atomically remaps the value for `key` only when a live mapping
    /// exists.  Absent keys are left untouched and yield `None`.
    pub fn compute_if_present<F>(&self, key: K, remap: F) -> Result<Option<Arc<V>>, Error>
    where
        F: FnOnce(Arc<V>) -> Option<V>,
    {
        self.compute(key, |visible| visible.and_then(remap))
    }

    /// Atomically merges `value` into the mapping for `key`: an absent key
    /// takes `value` directly, a present one takes `merge(current, value)`
    /// (`None` removes the mapping).
    pub fn merge<F>(&self, key: K, value: V, merge: F) -> Result<Option<Arc<V>>, Error>
    where
        F: FnOnce(Arc<V>, V) -> Option<V>,
    {
        self.compute(key, |visible| match visible {
            None => Some(value),
            Some(current) => merge(current, value),
        })
    }

    /// Turns a compute result into write events and notifications.
    fn apply_computed(
        &self,
        key: K,
        now: u64,
        meta: (u64, u64),
        computed: crate::store::sharded::Computed<V>,
    ) -> Option<Arc<V>> {
        let inner = &self.inner;
        let crate::store::sharded::Computed { old, new } = computed;
        match (old, &new) {
            (None, None) => {}
            (None, Some(_)) => {
                inner.after_write(WriteOp::Add {
                    key,
                    weight: meta.0,
                    at: now,
                    expires_at: meta.1,
                });
            }
            (Some(old), Some(_)) => {
                let cause = if old.is_expired(now) {
                    RemovalCause::Expired
                } else {
                    RemovalCause::Replaced
                };
                inner.notify(key.clone(), old, cause);
                inner.after_write(WriteOp::Update {
                    key,
                    new_weight: meta.0,
                    at: now,
                    expires_at: meta.1,
                });
            }
            (Some(old), None) => {
                let cause = if old.is_expired(now) {
                    RemovalCause::Expired
                } else {
                    RemovalCause::Explicit
                };
                inner.notify(key.clone(), old, cause);
                inner.after_write(WriteOp::Remove { key });
            }
        }
        new
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    /// A weakly consistent iterator over live entries.
    ///
    /// The iterator observes each shard at one instant at or after its
    /// creation, never fails under concurrent mutation, and visits each
    /// key at most once.  Entries expose [`EntryView::set_value`], which
    /// writes through to the cache.
    pub fn iter(&self) -> Iter<K, V> {
        Iter {
            cache: self.clone(),
            shard: 0,
            batch: Vec::new().into_iter(),
        }
    }

    /// A weakly consistent iterator over live keys.
    pub fn keys(&self) -> impl Iterator<Item = K> {
        self.iter().map(EntryView::into_key)
    }

    /// A weakly consistent iterator over live values.
    pub fn values(&self) -> impl Iterator<Item = Arc<V>> {
        self.iter().map(|e| Arc::clone(e.value()))
    }

    // -----------------------------------------------------------------------
    // Introspection & maintenance
    // -----------------------------------------------------------------------

    /// Number of entries in the table, including any whose expiration has
    /// not been collected yet.
    pub fn entry_count(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    /// Total weight currently tracked by the eviction policy.
    ///
    /// The figure is maintained by the drain, so it trails recent writes;
    /// it is exact after [`clean_up`](Self::clean_up).  Unbounded caches
    /// report 0.
    pub fn weighted_size(&self) -> u64 {
        self.inner
            .policy
            .as_ref()
            .map(|p| p.lock().current_weight())
            .unwrap_or(0)
    }

    /// A snapshot of the accumulated statistics.
    pub fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot()
    }

    /// Runs a full maintenance cycle: applies all buffered reads and
    /// writes, reaps expired entries, and enforces the capacity bound.
    ///
    /// Blocks until the drain quiesces.
    pub fn clean_up(&self) {
        let inner = &self.inner;
        loop {
            inner.drain_status.request();
            inner.run_pending();
            // A pass is bounded; loop until the backlog is really gone.
            let index_pending = inner
                .index
                .lock()
                .next_deadline()
                .is_some_and(|d| d <= inner.now());
            if inner.write_buffer.is_empty() && !index_pending {
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// One entry observed by [`Cache::iter`].
///
/// The view holds the key and the value as they were at the snapshot, plus
/// a handle to the cache so mutations write through.
pub struct EntryView<K, V> {
    key: K,
    value: Arc<V>,
    cache: Cache<K, V>,
}

impl<K, V> EntryView<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &Arc<V> {
        &self.value
    }

    pub fn into_key(self) -> K {
        self.key
    }

    /// Replaces this entry's value in the cache (write-through).
    ///
    /// Equivalent to `cache.insert(key.clone(), value)`: the mapping is
    /// (re-)installed even if the entry was removed after the snapshot.
    pub fn set_value(&self, value: V) -> Option<Arc<V>> {
        self.cache.insert(self.key.clone(), value)
    }
}

/// Weakly consistent entry iterator; see [`Cache::iter`].
pub struct Iter<K, V> {
    cache: Cache<K, V>,
    shard: usize,
    batch: std::vec::IntoIter<(K, Arc<V>)>,
}

impl<K, V> Iterator for Iter<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    type Item = EntryView<K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((key, value)) = self.batch.next() {
                return Some(EntryView {
                    key,
                    value,
                    cache: self.cache.clone(),
                });
            }
            let store = &self.cache.inner.store;
            if self.shard >= store.num_shards() {
                return None;
            }
            let now = self.cache.inner.now();
            self.batch = store.shard_snapshot(self.shard, now).into_iter();
            self.shard += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_status_round_trip() {
        let s = DrainStatus::new();
        assert!(s.request(), "idle → required should ask for a task");
        assert!(s.request(), "required → required still wants a task");

        s.begin();
        assert!(!s.request(), "processing absorbs the request");
        assert!(!s.finish(), "absorbed request forces another pass");

        s.begin();
        assert!(s.finish(), "clean pass returns to idle");
        assert!(!s.is_required());
    }

    #[test]
    fn drain_status_leave_required_reschedules() {
        let s = DrainStatus::new();
        s.begin();
        s.leave_required();
        assert!(s.is_required());
        assert!(s.request(), "leftover work must get a new task");
    }

    #[test]
    fn fixed_index_expires_by_earliest_deadline() {
        let config: ExpirationPolicy<u64, u64> = ExpirationPolicy {
            ttl: Some(100),
            tti: Some(40),
            variable: None,
        };
        let mut index = ExpirationIndex::new(&config, 0);
        index.on_write(1, 0, 40);

        let mut due = Vec::new();
        index.expire(39, usize::MAX, &mut due);
        assert!(due.is_empty());
        index.expire(45, usize::MAX, &mut due);
        assert_eq!(due, vec![1], "idle deadline fires first");
    }

    #[test]
    fn fixed_index_read_extends_idle_deadline() {
        let config: ExpirationPolicy<u64, u64> = ExpirationPolicy {
            ttl: None,
            tti: Some(40),
            variable: None,
        };
        let mut index = ExpirationIndex::new(&config, 0);
        index.on_write(1, 0, 40);
        index.on_read(1, 30, 70);

        let mut due = Vec::new();
        index.expire(45, usize::MAX, &mut due);
        assert!(due.is_empty(), "touched entry must not expire at t=45");
        index.expire(71, usize::MAX, &mut due);
        assert_eq!(due, vec![1]);
    }

    #[test]
    fn restore_reindexes_every_fixed_queue() {
        let config: ExpirationPolicy<u64, u64> = ExpirationPolicy {
            ttl: Some(50),
            tti: Some(100),
            variable: None,
        };
        let mut index = ExpirationIndex::new(&config, 0);
        index.on_write(1, 0, 50);

        // The write deadline comes due first and the key is popped from the
        // write queue; the removal is then vetoed (a racing write moved the
        // live deadline).
        let mut due = Vec::new();
        index.expire(60, usize::MAX, &mut due);
        assert_eq!(due, vec![1]);

        index.restore(
            1,
            &EntryStamps {
                written_at: 55,
                accessed_at: 55,
                deadline: 105,
            },
        );

        // Both queues must still track the key: the write queue fires again
        // at the recomputed write deadline...
        due.clear();
        index.expire(110, usize::MAX, &mut due);
        assert_eq!(due, vec![1], "write queue lost the restored key");

        // ...and the access queue fires at its own component deadline.
        due.clear();
        index.expire(160, usize::MAX, &mut due);
        assert_eq!(due, vec![1], "access queue lost the restored key");
    }

    #[test]
    fn next_deadline_spans_both_queues() {
        let config: ExpirationPolicy<u64, u64> = ExpirationPolicy {
            ttl: Some(100),
            tti: Some(40),
            variable: None,
        };
        let mut index = ExpirationIndex::new(&config, 0);
        index.on_write(1, 0, 40);
        index.on_write(2, 10, 50);
        assert_eq!(index.next_deadline(), Some(40));
    }
}
