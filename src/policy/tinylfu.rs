use std::hash::Hash;

use ahash::{AHashMap, RandomState};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::sketch::{Doorkeeper, FrequencySketch};

// ---------------------------------------------------------------------------
// Sentinel layout
//
// The first six slots of `nodes` are permanent HEAD/TAIL sentinels — one
// pair for each region.  Real entries start at index 6.  Sentinels always
// have `key = None` and are never evicted or looked up via the index.
// ---------------------------------------------------------------------------
const WINDOW_HEAD: usize = 0;
const WINDOW_TAIL: usize = 1;
const PROBATION_HEAD: usize = 2;
const PROBATION_TAIL: usize = 3;
const PROTECTED_HEAD: usize = 4;
const PROTECTED_TAIL: usize = 5;
const NULL: usize = usize::MAX;
const SENTINEL_COUNT: usize = 6;

/// Candidates with an estimate below this never win a random tie-break.
const ADMIT_HASHDOS_THRESHOLD: u8 = 6;

/// Which region a tracked entry currently belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Region {
    Window,
    Probation,
    Protected,
}

/// A single node in the entry arena.
struct PolicyNode<K> {
    /// `None` only for sentinel slots.
    key: Option<K>,
    /// Precomputed hash of the key, kept so eviction can consult the
    /// sketch without rehashing.
    key_hash: u64,
    weight: u64,
    prev: usize,
    next: usize,
    region: Region,
}

// ---------------------------------------------------------------------------
// W-TinyLFU eviction policy
// ---------------------------------------------------------------------------

/// Segmented-LRU eviction order with TinyLFU admission.
///
/// The capacity is partitioned into three regions:
///
/// | Region        | Share            | Role |
/// |---------------|------------------|------|
/// | **Window**    | 1 % of capacity  | Every new entry lands here first |
/// | **Probation** | ~20 % of main    | Entries awaiting frequency proof; the victim pool |
/// | **Protected** | ~80 % of main    | Entries with demonstrated recency and frequency |
///
/// New entries enter at the window MRU.  Window overflow ages the window
/// LRU into the main segment, where it either takes free room in probation
/// or competes against the probation-tail victim under the admission
/// filter: the arrival wins only if its count-min estimate is strictly
/// greater; otherwise the incumbent is kept, except for a rare (1/128)
/// random admission of warm candidates that defeats hash-flooding attacks
/// on the sketch.  Probation hits promote to protected; protected overflow
/// demotes back to probation.
///
/// All methods are called from the maintenance pass only — the structure
/// needs `Send`, never `Sync`.
pub struct TinyLfuPolicy<K> {
    sketch: FrequencySketch,
    doorkeeper: Doorkeeper,
    /// Hasher shared with the cache layer, so sketch lookups agree with
    /// read-buffer hashes.
    build_hasher: RandomState,
    /// Tie-break source for the admission filter; drain-private.
    rng: SmallRng,

    /// Central node arena — sentinels and real entries both live here.
    nodes: Vec<PolicyNode<K>>,
    /// Maps `K → arena index` for O(1) access.
    index: AHashMap<K, usize>,
    /// Recycled arena slots.
    free_list: Vec<usize>,

    window_weight: u64,
    probation_weight: u64,
    protected_weight: u64,

    max_total: u64,
    /// ~1 % of `max_total`; minimum 1.
    max_window: u64,
    /// ~80 % of main (= `max_total − max_window`); minimum 1.
    max_protected: u64,
}

impl<K: Hash + Eq + Clone + Send> TinyLfuPolicy<K> {
    /// Creates a policy bounding total weight at `max_weight`, hashing keys
    /// with `hasher`.
    pub fn new(max_weight: u64, hasher: RandomState) -> Self {
        let max_total = max_weight.max(1);

        let max_window = (max_total / 100).max(1);
        let max_main = max_total - max_window;
        let max_protected = (max_main * 4 / 5).max(1);

        let sketch_capacity = max_total.min(1 << 24) as usize;

        let mut nodes: Vec<PolicyNode<K>> = Vec::with_capacity(SENTINEL_COUNT + 16);
        let sentinel_regions = [
            Region::Window,    // 0 = WINDOW_HEAD
            Region::Window,    // 1 = WINDOW_TAIL
            Region::Probation, // 2 = PROBATION_HEAD
            Region::Probation, // 3 = PROBATION_TAIL
            Region::Protected, // 4 = PROTECTED_HEAD
            Region::Protected, // 5 = PROTECTED_TAIL
        ];
        for region in sentinel_regions {
            nodes.push(PolicyNode {
                key: None,
                key_hash: 0,
                weight: 0,
                prev: NULL,
                next: NULL,
                region,
            });
        }
        nodes[WINDOW_HEAD].next = WINDOW_TAIL;
        nodes[WINDOW_TAIL].prev = WINDOW_HEAD;
        nodes[PROBATION_HEAD].next = PROBATION_TAIL;
        nodes[PROBATION_TAIL].prev = PROBATION_HEAD;
        nodes[PROTECTED_HEAD].next = PROTECTED_TAIL;
        nodes[PROTECTED_TAIL].prev = PROTECTED_HEAD;

        TinyLfuPolicy {
            sketch: FrequencySketch::new(sketch_capacity),
            doorkeeper: Doorkeeper::new(sketch_capacity),
            build_hasher: hasher,
            rng: SmallRng::seed_from_u64(0x5851_F42D_4C95_7F2D ^ max_total),
            nodes,
            index: AHashMap::new(),
            free_list: Vec::new(),
            window_weight: 0,
            probation_weight: 0,
            protected_weight: 0,
            max_total,
            max_window,
            max_protected,
        }
    }

    #[inline]
    fn hash_key(&self, key: &K) -> u64 {
        self.build_hasher.hash_one(key)
    }

    // -----------------------------------------------------------------------
    // Linked-list helpers (operate on the arena by index)
    // -----------------------------------------------------------------------

    /// Inserts node `idx` immediately after sentinel `head` (MRU position).
    #[inline]
    fn link_after(&mut self, head: usize, idx: usize) {
        let old_first = self.nodes[head].next;
        self.nodes[idx].prev = head;
        self.nodes[idx].next = old_first;
        self.nodes[head].next = idx;
        self.nodes[old_first].prev = idx;
    }

    /// Removes node `idx` from its current position.
    #[inline]
    fn unlink(&mut self, idx: usize) {
        let prev = self.nodes[idx].prev;
        let next = self.nodes[idx].next;
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
        self.nodes[idx].prev = NULL;
        self.nodes[idx].next = NULL;
    }

    // -----------------------------------------------------------------------
    // Node lifecycle
    // -----------------------------------------------------------------------

    fn alloc_node(&mut self, key: K, key_hash: u64, weight: u64, region: Region) -> usize {
        if let Some(idx) = self.free_list.pop() {
            let n = &mut self.nodes[idx];
            n.key = Some(key);
            n.key_hash = key_hash;
            n.weight = weight;
            n.prev = NULL;
            n.next = NULL;
            n.region = region;
            idx
        } else {
            let idx = self.nodes.len();
            self.nodes.push(PolicyNode {
                key: Some(key),
                key_hash,
                weight,
                prev: NULL,
                next: NULL,
                region,
            });
            idx
        }
    }

    /// Tears down a node that is **already unlinked**, returning its key.
    fn evict_detached(&mut self, idx: usize) -> Option<K> {
        let key = self.nodes[idx].key.take()?;
        self.index.remove(&key);
        self.free_list.push(idx);
        Some(key)
    }

    /// Tears down a node that is **still linked** in one of the regions.
    fn evict_linked(&mut self, idx: usize) -> Option<K> {
        let w = self.nodes[idx].weight;
        let region = self.nodes[idx].region;
        *self.region_weight_mut(region) -= w;
        self.unlink(idx);
        self.evict_detached(idx)
    }

    // -----------------------------------------------------------------------
    // Region accounting
    // -----------------------------------------------------------------------

    /// Mutable weight counter for `region`.
    #[inline]
    fn region_weight_mut(&mut self, region: Region) -> &mut u64 {
        match region {
            Region::Window => &mut self.window_weight,
            Region::Probation => &mut self.probation_weight,
            Region::Protected => &mut self.protected_weight,
        }
    }

    /// HEAD sentinel of `region`.
    #[inline]
    fn head_of(region: Region) -> usize {
        match region {
            Region::Window => WINDOW_HEAD,
            Region::Probation => PROBATION_HEAD,
            Region::Protected => PROTECTED_HEAD,
        }
    }

    /// Moves `idx` to the MRU position of the region it is already in.
    fn refresh_recency(&mut self, idx: usize) {
        let head = Self::head_of(self.nodes[idx].region);
        self.unlink(idx);
        self.link_after(head, idx);
    }

    /// Replaces the weight of `idx`, keeping its region total in step, and
    /// refreshes its recency.
    fn reweigh(&mut self, idx: usize, weight: u64) {
        let old = self.nodes[idx].weight;
        self.nodes[idx].weight = weight;
        let region = self.nodes[idx].region;
        let total = self.region_weight_mut(region);
        *total = *total - old + weight;
        self.refresh_recency(idx);
    }

    // -----------------------------------------------------------------------
    // Frequency accounting
    // -----------------------------------------------------------------------

    /// Feeds one access of `h` through the doorkeeper into the sketch.
    ///
    /// First sighting: doorkeeper only.  Later sightings: sketch increment.
    /// When the sketch ages, the doorkeeper is cleared in the same step so
    /// "seen before" never outlives the halved counters.
    #[inline]
    pub fn record_access(&mut self, h: u64) {
        if self.doorkeeper.insert(h) && self.sketch.increment(h) {
            self.doorkeeper.clear();
        }
    }

    /// Estimated frequency of the key stored at `idx`.
    #[inline]
    fn node_frequency(&self, idx: usize) -> u8 {
        self.sketch.frequency(self.nodes[idx].key_hash)
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Decides whether the aged-out window candidate displaces the
    /// probation-tail victim.
    ///
    /// Strictly greater estimate wins.  On a tie the incumbent is kept,
    /// except that a warm candidate (estimate ≥ 6) is admitted with
    /// probability 1/128 — without this, an attacker who engineers sketch
    /// collisions could pin a working set in place forever.
    fn admit(&mut self, candidate: usize, victim: usize) -> bool {
        let candidate_freq = self.node_frequency(candidate);
        let victim_freq = self.node_frequency(victim);
        if candidate_freq > victim_freq {
            true
        } else if candidate_freq >= ADMIT_HASHDOS_THRESHOLD {
            (self.rng.gen::<u32>() & 127) == 0
        } else {
            false
        }
    }

    // -----------------------------------------------------------------------
    // Promotion / demotion
    // -----------------------------------------------------------------------

    /// Detaches `idx` from its region and re-links it at the MRU of `to`,
    /// keeping both weight totals in step.
    fn move_between(&mut self, idx: usize, to: Region) {
        let w = self.nodes[idx].weight;
        let from = self.nodes[idx].region;
        *self.region_weight_mut(from) -= w;
        self.unlink(idx);
        self.link_after(Self::head_of(to), idx);
        self.nodes[idx].region = to;
        *self.region_weight_mut(to) += w;
    }

    /// Moves `idx` from probation to the protected MRU, demoting protected
    /// LRU entries back to probation while protected overflows.
    fn promote_to_protected(&mut self, idx: usize) {
        debug_assert_eq!(self.nodes[idx].region, Region::Probation);
        self.move_between(idx, Region::Protected);

        while self.protected_weight > self.max_protected {
            let demote = self.nodes[PROTECTED_TAIL].prev;
            if demote == PROTECTED_HEAD {
                break;
            }
            self.move_between(demote, Region::Probation);
        }
    }

    // -----------------------------------------------------------------------
    // Maintenance entry points
    // -----------------------------------------------------------------------

    /// Applies one recorded read: sketch update plus recency reordering.
    ///
    /// - Window hit → window MRU.
    /// - Probation hit → promoted to protected MRU.
    /// - Protected hit → protected MRU.
    pub fn on_access(&mut self, key: &K, hash: u64) {
        self.record_access(hash);

        if let Some(&idx) = self.index.get(key) {
            if self.nodes[idx].region == Region::Probation {
                self.promote_to_protected(idx);
            } else {
                self.refresh_recency(idx);
            }
        }
    }

    /// Tracks a newly inserted entry at the window MRU and cascades any
    /// overflow through the admission filter.
    ///
    /// Returns the keys that must be removed from the backing store.  If
    /// the key is already tracked (a racing re-insert) it is re-weighed and
    /// refreshed in place instead.
    pub fn on_insert(&mut self, key: K, weight: u64) -> Vec<K> {
        let h = self.hash_key(&key);
        // Writes count as accesses for admission purposes.
        self.record_access(h);

        if let Some(&idx) = self.index.get(&key) {
            self.nodes[idx].key_hash = h;
            self.reweigh(idx, weight);
            return self.rebalance();
        }

        let idx = self.alloc_node(key.clone(), h, weight, Region::Window);
        self.index.insert(key, idx);
        self.link_after(WINDOW_HEAD, idx);
        self.window_weight += weight;

        self.rebalance()
    }

    /// Re-weighs an existing entry after its value was replaced.
    ///
    /// An update for a key the policy has not seen yet (its insert event is
    /// still in flight behind this one) is treated as an insert, so the
    /// entry cannot escape tracking.
    pub fn on_update(&mut self, key: &K, new_weight: u64) -> Vec<K> {
        let Some(&idx) = self.index.get(key) else {
            return self.on_insert(key.clone(), new_weight);
        };
        let h = self.hash_key(key);
        self.record_access(h);
        self.reweigh(idx, new_weight);
        self.rebalance()
    }

    /// Stops tracking an entry that left the map for any non-size reason.
    pub fn on_remove(&mut self, key: &K) {
        if let Some(idx) = self.index.get(key).copied() {
            self.evict_linked(idx);
        }
    }

    /// Cascades window overflow into the main segment, evicting as the
    /// admission filter dictates.
    fn rebalance(&mut self) -> Vec<K> {
        let mut evicted = Vec::new();

        while self.window_weight > self.max_window {
            let cand = self.nodes[WINDOW_TAIL].prev;
            if cand == WINDOW_HEAD {
                break;
            }

            let cand_weight = self.nodes[cand].weight;
            self.unlink(cand);
            self.window_weight -= cand_weight;
            self.nodes[cand].region = Region::Probation;

            let main_weight = self.probation_weight + self.protected_weight;
            let max_main = self.max_total - self.max_window;

            if main_weight + cand_weight <= max_main {
                self.link_after(PROBATION_HEAD, cand);
                self.probation_weight += cand_weight;
                continue;
            }

            let victim = self.nodes[PROBATION_TAIL].prev;
            if victim == PROBATION_HEAD {
                // Probation empty; admit unconditionally.
                self.link_after(PROBATION_HEAD, cand);
                self.probation_weight += cand_weight;
            } else if self.admit(cand, victim) {
                let vw = self.nodes[victim].weight;
                self.unlink(victim);
                self.probation_weight -= vw;
                if let Some(k) = self.evict_detached(victim) {
                    evicted.push(k);
                }
                self.link_after(PROBATION_HEAD, cand);
                self.probation_weight += cand_weight;
            } else if let Some(k) = self.evict_detached(cand) {
                evicted.push(k);
            }
        }

        evicted
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn current_weight(&self) -> u64 {
        self.window_weight + self.probation_weight + self.protected_weight
    }

    pub fn max_weight(&self) -> u64 {
        self.max_total
    }

    #[cfg(test)]
    pub(crate) fn is_tracked(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    #[cfg(test)]
    fn region_of(&self, key: &K) -> Option<Region> {
        self.index.get(key).map(|&idx| self.nodes[idx].region)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
