//! Hierarchical timer wheel for variable (per-entry) expiry.
//!
//! ## Geometry
//!
//! Five levels of buckets, each spanning a power-of-two number of nanos
//! just above a human-scale unit:
//!
//! | Level | Buckets | Bucket span        | Level range |
//! |-------|---------|--------------------|-------------|
//! | 0     | 64      | 2^30 ns ≈ 1.07 s   | ~68 s       |
//! | 1     | 64      | 2^36 ns ≈ 68.7 s   | ~73 min     |
//! | 2     | 32      | 2^42 ns ≈ 73.1 min | ~39 h       |
//! | 3     | 4       | 2^48 ns ≈ 3.27 d   | ~13 d       |
//! | 4     | 1       | catch-all          | unbounded   |
//!
//! `schedule` places an entry in the finest level whose range still covers
//! its delay.  `advance` walks each level's buckets that fell behind the
//! clock: level-0 occupants whose deadline has passed are expired, and
//! everything else **cascades** down into the finer level appropriate for
//! its remaining delay, exactly like sand falling through narrower sieves.
//!
//! ## Staleness
//!
//! The side index (`AHashMap<K, u64>`) holds each key's canonical deadline.
//! Rescheduling only updates the index; the superseded wheel slot is left
//! in place and discarded when `advance` reaches it and notices the stored
//! deadline no longer matches.  Cancellation works the same way.  This
//! keeps both operations O(1) at the cost of tolerating dead slots.

use std::hash::Hash;

use ahash::AHashMap;

/// Bucket span in nanoseconds for each level.
const SPANS: [u64; 5] = [
    1 << 30, // ~1.07 s
    1 << 36, // ~68.7 s
    1 << 42, // ~73.1 min
    1 << 48, // ~3.27 day
    (1 << 48) * 4, // catch-all
];

/// Buckets per level.  Powers of two so tick & (count-1) selects a bucket.
const BUCKET_COUNTS: [usize; 5] = [64, 64, 32, 4, 1];

const LEVELS: usize = 5;

/// Schedules and detects expired entries with per-entry deadlines.
///
/// All times are nanoseconds since the cache ticker's epoch.  The wheel is
/// owned by the maintenance pass; nothing here is thread-safe.
pub struct TimerWheel<K> {
    /// `buckets[level][slot]` → `(key, deadline)` pairs.
    buckets: [Vec<Vec<(K, u64)>>; LEVELS],
    /// Clock position of the last `advance`.
    nanos: u64,
    /// Canonical deadline per scheduled key; the arbiter for stale slots.
    index: AHashMap<K, u64>,
}

impl<K: Hash + Eq + Clone> TimerWheel<K> {
    /// Creates a wheel anchored at `start_nanos`.
    pub fn new(start_nanos: u64) -> Self {
        TimerWheel {
            buckets: std::array::from_fn(|level| {
                (0..BUCKET_COUNTS[level]).map(|_| Vec::new()).collect()
            }),
            nanos: start_nanos,
            index: AHashMap::new(),
        }
    }

    /// `(level, slot)` for a deadline `delay` nanos away.
    fn slot_for(&self, deadline: u64) -> (usize, usize) {
        let delay = deadline.saturating_sub(self.nanos);
        for level in 0..LEVELS {
            let range = SPANS[level].saturating_mul(BUCKET_COUNTS[level] as u64);
            if delay < range {
                let slot = (deadline / SPANS[level]) as usize & (BUCKET_COUNTS[level] - 1);
                return (level, slot);
            }
        }
        (LEVELS - 1, 0)
    }

    fn insert_slot(&mut self, key: K, deadline: u64) {
        let (level, slot) = self.slot_for(deadline);
        self.buckets[level][slot].push((key, deadline));
    }

    /// Schedules `key` to expire at `deadline`.
    ///
    /// An existing schedule for the key is superseded; its old wheel slot
    /// becomes stale and is discarded lazily.
    pub fn schedule(&mut self, key: K, deadline: u64) {
        self.index.insert(key.clone(), deadline);
        self.insert_slot(key, deadline);
    }

    /// Cancels the schedule for `key`, if any.
    pub fn cancel(&mut self, key: &K) -> bool {
        self.index.remove(key).is_some()
    }

    /// Moves the wheel to `now`, appending expired keys to `out`.
    ///
    /// Buckets the clock has passed are emptied: live occupants whose
    /// deadline has been reached are expired; the rest cascade into finer
    /// levels; stale occupants are dropped.
    pub fn advance(&mut self, now: u64, out: &mut Vec<K>) {
        for level in 0..LEVELS {
            let span = SPANS[level];
            let prev_tick = self.nanos / span;
            let now_tick = now / span;
            if now_tick <= prev_tick {
                // This level hasn't ticked, so no coarser one has either.
                break;
            }

            // One full revolution visits every bucket; never walk further.
            let ticks = (now_tick - prev_tick).min(BUCKET_COUNTS[level] as u64);
            for tick in 1..=ticks {
                let slot = ((prev_tick + tick) as usize) & (BUCKET_COUNTS[level] - 1);
                let occupants = std::mem::take(&mut self.buckets[level][slot]);
                for (key, deadline) in occupants {
                    if self.index.get(&key) != Some(&deadline) {
                        continue; // superseded or cancelled
                    }
                    if deadline <= now {
                        self.index.remove(&key);
                        out.push(key);
                    } else {
                        // Not due yet: this bucket's span was coarser than
                        // the remaining delay.  Re-sieve at a finer level.
                        self.insert_slot(key, deadline);
                    }
                }
            }
        }
        self.nanos = now;
    }

    /// Earliest canonical deadline, if anything is scheduled.
    ///
    /// Linear in the number of scheduled keys; called once per maintenance
    /// pass and only when a scheduler is configured.
    pub fn next_deadline(&self) -> Option<u64> {
        self.index.values().copied().min()
    }

    /// Number of scheduled keys (O(1)).
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
