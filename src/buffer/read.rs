//! Striped lossy read buffer.
//!
//! Cache hits are recorded here instead of touching the policy or
//! expiration locks on the hot read path.  A maintenance pass drains the
//! buffer and applies the recorded accesses to the frequency sketch, the
//! eviction order, and the access-expiration order.
//!
//! ## Design
//!
//! The buffer has `NUM_STRIPES` independent bounded queues.  Each calling
//! thread is permanently assigned one stripe via a thread-local index so
//! threads avoid colliding on the same queue head.
//!
//! When a stripe is full, the offer is **silently dropped** and the caller
//! is told to request a maintenance pass.  Reads must never block: losing
//! the occasional access event only makes the recency/frequency view of
//! the policy slightly stale, which it already is by construction.

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Number of independent stripes.  Must be a power of two.
const NUM_STRIPES: usize = 4;
const STRIPE_MASK: usize = NUM_STRIPES - 1;

/// Capacity of each stripe.
const STRIPE_CAPACITY: usize = 64;

/// Global counter used to assign a stable stripe to each thread.
static STRIPE_COUNTER: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// The stripe index for the current thread.  Assigned once on first use.
    static THREAD_STRIPE: usize =
        STRIPE_COUNTER.fetch_add(1, Ordering::Relaxed) & STRIPE_MASK;
}

/// One recorded cache hit.
pub struct ReadOp<K> {
    pub key: K,
    /// Hash of `key` under the cache's shared hasher, precomputed so the
    /// drain can feed the sketch without rehashing.
    pub hash: u64,
    /// Ticker time of the access, in nanos.
    pub at: u64,
}

/// A lossy, striped, lock-free buffer of [`ReadOp`]s.
pub struct StripedReadBuffer<K> {
    stripes: Box<[ArrayQueue<ReadOp<K>>]>,
}

impl<K> StripedReadBuffer<K> {
    pub fn new() -> Self {
        let stripes = (0..NUM_STRIPES)
            .map(|_| ArrayQueue::new(STRIPE_CAPACITY))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        StripedReadBuffer { stripes }
    }

    /// Offers a read event to the current thread's stripe.
    ///
    /// Returns `false` when the stripe was full and the event was dropped;
    /// the caller should then request a maintenance pass.
    #[inline]
    pub fn offer(&self, op: ReadOp<K>) -> bool {
        let stripe = THREAD_STRIPE.with(|s| *s);
        self.stripes[stripe].push(op).is_ok()
    }

    /// Returns `true` if any stripe has reached its capacity.
    #[inline]
    pub fn is_saturated(&self) -> bool {
        self.stripes.iter().any(|s| s.is_full())
    }

    /// Drains all recorded events from every stripe into `out`.
    ///
    /// Called from the maintenance pass while it owns the drain.
    pub fn drain(&self, out: &mut Vec<ReadOp<K>>) {
        for stripe in self.stripes.iter() {
            while let Some(op) = stripe.pop() {
                out.push(op);
            }
        }
    }
}

impl<K> Default for StripedReadBuffer<K> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
