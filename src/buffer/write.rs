//! Unbounded MPSC write buffer backed by a lock-free `SegQueue`.
//!
//! Write operations are enqueued here so the hot write path never blocks on
//! the policy or expiration locks.  A maintenance pass drains the queue and
//! applies all pending operations under a single lock acquisition.
//!
//! Unlike the read buffer, write events are **never dropped** — they drive
//! capacity and expiration accounting.  Back-pressure is signalled through
//! drain scheduling: every producer requests a maintenance pass after
//! enqueuing, and the pass that wins the drain applies the whole backlog.

use crossbeam_queue::SegQueue;

/// Queue depth at which producers should treat the buffer as under
/// pressure and prefer running the maintenance pass themselves.
pub const WRITE_BUFFER_PRESSURE: usize = 128;

/// Operations deferred for policy and expiration maintenance.
pub enum WriteOp<K> {
    Add {
        key: K,
        weight: u64,
        /// Ticker time of the write, in nanos.
        at: u64,
        /// Absolute effective deadline; `NEVER` when the entry is eternal.
        expires_at: u64,
    },
    Update {
        key: K,
        new_weight: u64,
        at: u64,
        expires_at: u64,
    },
    Remove {
        key: K,
    },
    /// An existing entry's deadline moved without a value write (a read
    /// under time-to-idle or variable expiry).  Does not change the entry's
    /// weight or its position in the eviction order.
    Reschedule {
        key: K,
        at: u64,
        expires_at: u64,
    },
}

impl<K> WriteOp<K> {
    pub fn key(&self) -> &K {
        match self {
            WriteOp::Add { key, .. }
            | WriteOp::Update { key, .. }
            | WriteOp::Remove { key }
            | WriteOp::Reschedule { key, .. } => key,
        }
    }
}

/// Unbounded MPSC write buffer.
///
/// Multiple producer threads may call [`push`] concurrently.  A single
/// consumer (the thread that owns the current maintenance pass) drains the
/// queue via [`drain`].
///
/// [`push`]: WriteBuffer::push
/// [`drain`]: WriteBuffer::drain
pub struct WriteBuffer<K> {
    queue: SegQueue<WriteOp<K>>,
}

impl<K: Send> WriteBuffer<K> {
    pub fn new() -> Self {
        WriteBuffer {
            queue: SegQueue::new(),
        }
    }

    /// Enqueues `op`.  Never fails and never blocks.
    #[inline]
    pub fn push(&self, op: WriteOp<K>) {
        self.queue.push(op);
    }

    /// Returns `true` when the backlog is deep enough that the producer
    /// should prefer draining inline over deferring.
    #[inline]
    pub fn is_under_pressure(&self) -> bool {
        self.queue.len() >= WRITE_BUFFER_PRESSURE
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drains all pending operations into `out`.
    ///
    /// Called exclusively from the maintenance pass.
    pub fn drain(&self, out: &mut Vec<WriteOp<K>>) {
        while let Some(op) = self.queue.pop() {
            out.push(op);
        }
    }
}

impl<K: Send> Default for WriteBuffer<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_drain_preserve_all_ops() {
        let buf: WriteBuffer<u64> = WriteBuffer::new();
        for i in 0..300u64 {
            buf.push(WriteOp::Add {
                key: i,
                weight: 1,
                at: 0,
                expires_at: u64::MAX,
            });
        }
        assert!(buf.is_under_pressure());

        let mut out = Vec::new();
        buf.drain(&mut out);
        assert_eq!(out.len(), 300, "write ops must never be dropped");
        assert!(buf.is_empty());
    }

    #[test]
    fn single_producer_order_is_fifo() {
        let buf: WriteBuffer<u64> = WriteBuffer::new();
        buf.push(WriteOp::Add { key: 1, weight: 1, at: 0, expires_at: u64::MAX });
        buf.push(WriteOp::Remove { key: 1 });

        let mut out = Vec::new();
        buf.drain(&mut out);
        assert!(matches!(out[0], WriteOp::Add { .. }));
        assert!(matches!(out[1], WriteOp::Remove { .. }));
    }
}
