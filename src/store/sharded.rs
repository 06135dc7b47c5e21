use std::borrow::Borrow;
use std::cell::RefCell;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::{AHashMap, RandomState};
use parking_lot::RwLock;

use crate::error::Error;
use crate::time::saturating_deadline;

/// Source of unique store identities, for the reentrancy guard.
static STORE_IDS: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// `(store id, shard index)` pairs whose locks the current thread holds
    /// for an in-progress compute.  A compute that would re-enter one of
    /// these fails instead of deadlocking.
    static HELD_SHARDS: RefCell<Vec<(u64, usize)>> = const { RefCell::new(Vec::new()) };
}

// ---------------------------------------------------------------------------
// Entry lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle of a stored entry.
///
/// `Live` entries are reachable through the table.  `Retired` entries have
/// been removed from the table but still await policy bookkeeping and the
/// removal notification.  `Dead` entries are fully torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EntryState {
    Live,
    Retired,
    Dead,
}

/// A single entry in the store.
///
/// The expiration deadline lives in an atomic so the read path can check
/// and refresh it under the shard's **read** lock; `u64::MAX` means the
/// entry never expires.
pub(crate) struct StoreEntry<V> {
    pub value: Arc<V>,
    pub weight: u64,
    /// Ticker time of the last value write.
    pub written_at: u64,
    /// Ticker time of the last read or write.
    pub accessed_at: AtomicU64,
    /// Absolute effective deadline; the minimum over all active modes.
    pub expires_at: AtomicU64,
    state: EntryState,
}

impl<V> StoreEntry<V> {
    pub fn new(value: V, weight: u64, now: u64, expires_at: u64) -> Self {
        StoreEntry {
            value: Arc::new(value),
            weight,
            written_at: now,
            accessed_at: AtomicU64::new(now),
            expires_at: AtomicU64::new(expires_at),
            state: EntryState::Live,
        }
    }

    #[inline]
    pub fn deadline(&self) -> u64 {
        self.expires_at.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_expired(&self, now: u64) -> bool {
        self.deadline() <= now
    }

    /// Marks the entry as removed from the table.
    pub fn retire(&mut self) {
        debug_assert_eq!(self.state, EntryState::Live);
        self.state = EntryState::Retired;
    }

    /// Marks the entry as fully torn down, just before its notification is
    /// dispatched.
    pub fn kill(&mut self) {
        debug_assert_eq!(self.state, EntryState::Retired);
        self.state = EntryState::Dead;
    }

    #[cfg(test)]
    pub fn state(&self) -> EntryState {
        self.state
    }
}

// ---------------------------------------------------------------------------
// Operation results
// ---------------------------------------------------------------------------

/// Point-in-time copy of an entry's clocks, for re-indexing expiration.
pub(crate) struct EntryStamps {
    pub written_at: u64,
    pub accessed_at: u64,
    /// Effective deadline at snapshot time.
    pub deadline: u64,
}

/// What a recording read found.
pub(crate) enum ReadOutcome<K, V> {
    Hit {
        /// Cloned key, present when the caller asked for it (to feed the
        /// read buffer).
        key: Option<K>,
        value: Arc<V>,
        written_at: u64,
        /// Deadline observed at read time, before any inline refresh.
        expires_at: u64,
    },
    /// The mapping exists but its deadline has passed; the caller decides
    /// whether to reap it.
    Expired { key: K, value: Arc<V> },
    Miss,
}

/// Result of [`ShardedStore::insert_if_absent`].
pub(crate) enum PutIfAbsent<V> {
    /// A live mapping already existed.
    Existing(Arc<V>),
    Inserted {
        /// An expired mapping that the insert displaced, if any.
        expired: Option<StoreEntry<V>>,
    },
}

/// Result of [`ShardedStore::compute_if_absent`].
pub(crate) enum IfAbsent<V> {
    Present(Arc<V>),
    Inserted {
        value: Arc<V>,
        expired: Option<StoreEntry<V>>,
    },
}

/// Result of [`ShardedStore::compute`].
pub(crate) struct Computed<V> {
    /// The entry removed or replaced by the computation, if any.
    pub old: Option<StoreEntry<V>>,
    /// The value mapped after the computation, if any.
    pub new: Option<Arc<V>>,
}

// ---------------------------------------------------------------------------
// Reentrancy guard
// ---------------------------------------------------------------------------

/// RAII registration of a shard lock held across a user compute function.
struct ComputeGuard {
    token: (u64, usize),
}

impl ComputeGuard {
    /// Registers `(store, shard)`; fails if the current thread already
    /// holds that shard for another compute.
    fn enter(token: (u64, usize)) -> Result<Self, Error> {
        HELD_SHARDS.with(|held| {
            let mut held = held.borrow_mut();
            if held.contains(&token) {
                return Err(Error::ReentrantCompute);
            }
            held.push(token);
            Ok(ComputeGuard { token })
        })
    }
}

impl Drop for ComputeGuard {
    fn drop(&mut self) {
        HELD_SHARDS.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|t| *t == self.token) {
                held.swap_remove(pos);
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Shard
// ---------------------------------------------------------------------------

/// Cache-line alignment prevents false sharing between shard locks.
#[repr(align(64))]
struct Shard<K, V> {
    map: RwLock<AHashMap<K, StoreEntry<V>>>,
}

// ---------------------------------------------------------------------------
// ShardedStore
// ---------------------------------------------------------------------------

/// A thread-safe key-value table backed by `N` independently-locked shards.
///
/// Reads take a shard's shared lock, writes its exclusive lock; operations
/// on different shards never contend.  Compute operations additionally run
/// a user function under the exclusive lock, guarded against reentrancy.
pub(crate) struct ShardedStore<K, V> {
    shards: Box<[Shard<K, V>]>,
    /// Always `shards.len() - 1`; shards.len() is a power of two.
    shard_mask: usize,
    /// Shared with the cache layer so sketch hashes agree with shard hashes.
    build_hasher: RandomState,
    id: u64,
}

impl<K, V> ShardedStore<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn new(num_shards: usize, build_hasher: RandomState) -> Self {
        assert!(num_shards.is_power_of_two());
        let shards = (0..num_shards)
            .map(|_| Shard {
                map: RwLock::new(AHashMap::new()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        ShardedStore {
            shards,
            shard_mask: num_shards - 1,
            build_hasher,
            id: STORE_IDS.fetch_add(1, Ordering::Relaxed),
        }
    }

    #[inline]
    fn shard_index<Q>(&self, key: &Q) -> usize
    where
        Q: Hash + ?Sized,
    {
        let h = self.build_hasher.hash_one(key);
        // High bits give better avalanche from ahash.
        ((h >> 32) as usize) & self.shard_mask
    }

    /// `true` when the current thread holds `key`'s shard for an
    /// in-progress compute.  Checked at the call boundary so a reentrant
    /// operation fails before touching any lock.
    pub fn is_held_by_current_thread<Q>(&self, key: &Q) -> bool
    where
        Q: Hash + ?Sized,
    {
        let token = (self.id, self.shard_index(key));
        HELD_SHARDS.with(|held| held.borrow().contains(&token))
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Looks up `key`, recording the access on a hit.
    ///
    /// On a live hit the entry's access time is bumped and, when a fixed
    /// time-to-idle is active, its effective deadline is refreshed inline
    /// (`ttl`/`tti` are the fixed durations in nanos).  The caller handles
    /// the `Expired` case: the mapping is left in place here.
    pub fn get_read<Q>(
        &self,
        key: &Q,
        now: u64,
        want_key: bool,
        ttl: Option<u64>,
        tti: Option<u64>,
    ) -> ReadOutcome<K, V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.shard_index(key);
        let shard = self.shards[idx].map.read();
        let Some((k, entry)) = shard.get_key_value(key) else {
            return ReadOutcome::Miss;
        };

        let observed = entry.deadline();
        if observed <= now {
            return ReadOutcome::Expired {
                key: k.clone(),
                value: Arc::clone(&entry.value),
            };
        }

        entry.accessed_at.store(now, Ordering::Relaxed);
        if let Some(tti) = tti {
            let mut deadline = saturating_deadline(now, tti);
            if let Some(ttl) = ttl {
                deadline = deadline.min(saturating_deadline(entry.written_at, ttl));
            }
            entry.expires_at.store(deadline, Ordering::Release);
        }

        ReadOutcome::Hit {
            key: want_key.then(|| k.clone()),
            value: Arc::clone(&entry.value),
            written_at: entry.written_at,
            expires_at: observed,
        }
    }

    /// Returns the live value for `key` without recording the access.
    pub fn peek<Q>(&self, key: &Q, now: u64) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.shard_index(key);
        self.shards[idx]
            .map
            .read()
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| Arc::clone(&e.value))
    }

    pub fn contains_key<Q>(&self, key: &Q, now: u64) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.peek(key, now).is_some()
    }

    /// Full scan for `value` among live entries.
    pub fn contains_value(&self, value: &V, now: u64) -> bool
    where
        V: PartialEq,
    {
        self.shards.iter().any(|shard| {
            shard
                .map
                .read()
                .values()
                .any(|e| !e.is_expired(now) && *e.value == *value)
        })
    }

    /// Overwrites the deadline of an existing entry (variable expiry after
    /// a read).  No-op when the key is absent.
    pub fn set_deadline<Q>(&self, key: &Q, deadline: u64)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.shard_index(key);
        if let Some(entry) = self.shards[idx].map.read().get(key) {
            entry.expires_at.store(deadline, Ordering::Release);
        }
    }

    /// Current deadline of an entry, if present.
    pub fn deadline_of<Q>(&self, key: &Q) -> Option<u64>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.shard_index(key);
        self.shards[idx].map.read().get(key).map(|e| e.deadline())
    }

    /// The timestamps an expiration index needs to re-derive its component
    /// deadlines for an entry, if present.
    pub fn stamps_of<Q>(&self, key: &Q) -> Option<EntryStamps>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.shard_index(key);
        self.shards[idx].map.read().get(key).map(|e| EntryStamps {
            written_at: e.written_at,
            accessed_at: e.accessed_at.load(Ordering::Relaxed),
            deadline: e.deadline(),
        })
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Installs an entry built by `make`, which observes the previous entry
    /// (live or expired) so it can derive weights and deadlines.
    ///
    /// Returns the displaced entry, already retired.
    pub fn insert(
        &self,
        key: K,
        make: impl FnOnce(Option<&StoreEntry<V>>) -> StoreEntry<V>,
    ) -> Option<StoreEntry<V>> {
        use std::collections::hash_map::Entry;

        let idx = self.shard_index(&key);
        let mut shard = self.shards[idx].map.write();
        match shard.entry(key) {
            Entry::Occupied(mut o) => {
                let entry = make(Some(o.get()));
                let mut old = o.insert(entry);
                old.retire();
                Some(old)
            }
            Entry::Vacant(v) => {
                v.insert(make(None));
                None
            }
        }
    }

    /// Installs `make()` only when no live mapping exists.
    ///
    /// An expired mapping counts as absent; it is displaced and returned.
    pub fn insert_if_absent(
        &self,
        key: K,
        now: u64,
        make: impl FnOnce() -> StoreEntry<V>,
    ) -> PutIfAbsent<V> {
        use std::collections::hash_map::Entry;

        let idx = self.shard_index(&key);
        let mut shard = self.shards[idx].map.write();
        match shard.entry(key) {
            Entry::Occupied(mut o) => {
                if !o.get().is_expired(now) {
                    return PutIfAbsent::Existing(Arc::clone(&o.get().value));
                }
                let mut old = o.insert(make());
                old.retire();
                PutIfAbsent::Inserted { expired: Some(old) }
            }
            Entry::Vacant(v) => {
                v.insert(make());
                PutIfAbsent::Inserted { expired: None }
            }
        }
    }

    /// Replaces the value of a live mapping.  Absent or expired → `None`.
    pub fn replace<Q>(
        &self,
        key: &Q,
        now: u64,
        make: impl FnOnce(&StoreEntry<V>) -> StoreEntry<V>,
    ) -> Option<StoreEntry<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.shard_index(key);
        let mut shard = self.shards[idx].map.write();
        let entry = shard.get_mut(key)?;
        if entry.is_expired(now) {
            return None;
        }
        let new = make(&*entry);
        let mut old = std::mem::replace(entry, new);
        old.retire();
        Some(old)
    }

    /// Replaces the value only when the current one equals `expected`.
    pub fn compare_replace<Q>(
        &self,
        key: &Q,
        now: u64,
        expected: &V,
        make: impl FnOnce(&StoreEntry<V>) -> StoreEntry<V>,
    ) -> Option<StoreEntry<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        let idx = self.shard_index(key);
        let mut shard = self.shards[idx].map.write();
        let entry = shard.get_mut(key)?;
        if entry.is_expired(now) || *entry.value != *expected {
            return None;
        }
        let new = make(&*entry);
        let mut old = std::mem::replace(entry, new);
        old.retire();
        Some(old)
    }

    /// Replaces the value only when it is still the exact `current`
    /// allocation observed earlier (pointer identity).  Used by refresh to
    /// discard results that lost a race with an intervening write.
    pub fn replace_if_same<Q>(
        &self,
        key: &Q,
        now: u64,
        current: &Arc<V>,
        make: impl FnOnce(&StoreEntry<V>) -> StoreEntry<V>,
    ) -> Option<StoreEntry<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.shard_index(key);
        let mut shard = self.shards[idx].map.write();
        let entry = shard.get_mut(key)?;
        if entry.is_expired(now) || !Arc::ptr_eq(&entry.value, current) {
            return None;
        }
        let new = make(&*entry);
        let mut old = std::mem::replace(entry, new);
        old.retire();
        Some(old)
    }

    /// Removes the mapping unconditionally, returning the owned key and the
    /// retired entry.
    pub fn remove_entry<Q>(&self, key: &Q) -> Option<(K, StoreEntry<V>)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.shard_index(key);
        let mut shard = self.shards[idx].map.write();
        let (k, mut entry) = shard.remove_entry(key)?;
        entry.retire();
        Some((k, entry))
    }

    /// Removes the mapping only when its live value equals `expected`.
    pub fn compare_remove<Q>(&self, key: &Q, now: u64, expected: &V) -> Option<(K, StoreEntry<V>)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        let idx = self.shard_index(key);
        let mut shard = self.shards[idx].map.write();
        let matches = shard
            .get(key)
            .is_some_and(|e| !e.is_expired(now) && *e.value == *expected);
        if !matches {
            return None;
        }
        let (k, mut entry) = shard.remove_entry(key)?;
        entry.retire();
        Some((k, entry))
    }

    /// Removes the mapping only when `pred` approves the current entry —
    /// the atomic check-then-remove used by expiration reaping.
    pub fn remove_if<Q>(
        &self,
        key: &Q,
        pred: impl FnOnce(&StoreEntry<V>) -> bool,
    ) -> Option<(K, StoreEntry<V>)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.shard_index(key);
        let mut shard = self.shards[idx].map.write();
        if !shard.get(key).is_some_and(|e| pred(e)) {
            return None;
        }
        let (k, mut entry) = shard.remove_entry(key)?;
        entry.retire();
        Some((k, entry))
    }

    // -----------------------------------------------------------------------
    // Compute operations
    // -----------------------------------------------------------------------

    /// Atomic read-modify-write.
    ///
    /// `remap` observes the live value (an expired mapping reads as absent)
    /// and decides the new state: `Some(v)` installs `make(v, prev)`,
    /// `None` removes the mapping.  The whole exchange happens under the
    /// shard's exclusive lock, so `remap` must not call back into this
    /// cache — same-shard reentrancy is detected and rejected with
    /// [`Error::ReentrantCompute`] before `remap` runs.
    pub fn compute<F, G>(&self, key: &K, now: u64, remap: F, make: G) -> Result<Computed<V>, Error>
    where
        F: FnOnce(Option<&Arc<V>>) -> Option<V>,
        G: FnOnce(V, Option<&StoreEntry<V>>) -> StoreEntry<V>,
    {
        use std::collections::hash_map::Entry;

        let idx = self.shard_index(key);
        let _guard = ComputeGuard::enter((self.id, idx))?;
        let mut shard = self.shards[idx].map.write();

        let visible = shard
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| Arc::clone(&e.value));
        let was_visible = visible.is_some();

        match remap(visible.as_ref()) {
            Some(v) => match shard.entry(key.clone()) {
                Entry::Occupied(mut o) => {
                    let entry = make(v, Some(o.get()));
                    let new = Arc::clone(&entry.value);
                    let mut old = o.insert(entry);
                    old.retire();
                    Ok(Computed {
                        old: Some(old),
                        new: Some(new),
                    })
                }
                Entry::Vacant(vac) => {
                    let entry = make(v, None);
                    let new = Arc::clone(&entry.value);
                    vac.insert(entry);
                    Ok(Computed {
                        old: None,
                        new: Some(new),
                    })
                }
            },
            None if was_visible => {
                let old = shard.remove_entry(key).map(|(_, mut e)| {
                    e.retire();
                    e
                });
                Ok(Computed { old, new: None })
            }
            None => Ok(Computed {
                old: None,
                new: None,
            }),
        }
    }

    /// Atomically installs `make(init(key)?)` when no live mapping exists.
    ///
    /// `init` runs under the shard's exclusive lock; concurrent callers of
    /// the same key serialize here and the losers observe the winner's
    /// value.  Reentrancy is rejected as for [`compute`](Self::compute).
    pub fn compute_if_absent<F, G>(
        &self,
        key: &K,
        now: u64,
        init: F,
        make: G,
    ) -> Result<IfAbsent<V>, Error>
    where
        F: FnOnce(&K) -> Result<V, Error>,
        G: FnOnce(V) -> StoreEntry<V>,
    {
        let idx = self.shard_index(key);
        let _guard = ComputeGuard::enter((self.id, idx))?;
        let mut shard = self.shards[idx].map.write();

        if let Some(e) = shard.get(key) {
            if !e.is_expired(now) {
                return Ok(IfAbsent::Present(Arc::clone(&e.value)));
            }
        }

        let entry = make(init(key)?);
        let value = Arc::clone(&entry.value);
        let expired = shard.insert(key.clone(), entry).map(|mut old| {
            old.retire();
            old
        });
        Ok(IfAbsent::Inserted { value, expired })
    }

    // -----------------------------------------------------------------------
    // Bulk access
    // -----------------------------------------------------------------------

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Clones the live entries of one shard — the unit of weak consistency
    /// for iteration.
    pub fn shard_snapshot(&self, shard: usize, now: u64) -> Vec<(K, Arc<V>)> {
        self.shards[shard]
            .map
            .read()
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, e)| (k.clone(), Arc::clone(&e.value)))
            .collect()
    }

    /// Empties every shard, returning the retired entries.
    pub fn drain_all(&self) -> Vec<(K, StoreEntry<V>)> {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            let drained = std::mem::take(&mut *shard.map.write());
            for (k, mut entry) in drained {
                entry.retire();
                out.push((k, entry));
            }
        }
        out
    }

    /// Total number of entries across all shards, including any whose
    /// expiration has not been collected yet.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.map.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.map.read().is_empty())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
