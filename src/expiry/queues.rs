//! Fixed-mode expiration queues.
//!
//! A cache with `expire_after_write` keeps a **write-order FIFO**: entries
//! are appended on write, so deadlines (`write time + ttl`) increase from
//! head to tail and expiration only ever inspects the head.  A cache with
//! `expire_after_access` keeps an **access-order LRU** of the same shape,
//! where reads move the entry back to the tail with a fresh deadline.
//!
//! Nodes live in an index-arena doubly-linked list (`Vec` + free list, no
//! raw pointers) with an `AHashMap` from key to slot.  The structure is
//! owned by the maintenance pass; nothing here is thread-safe.

use std::hash::Hash;

use ahash::AHashMap;

const HEAD: usize = 0; // oldest end
const TAIL: usize = 1; // youngest end
const NULL: usize = usize::MAX;

struct QueueNode<K> {
    /// `None` only for the HEAD and TAIL sentinels.
    key: Option<K>,
    deadline: u64,
    prev: usize,
    next: usize,
}

/// A deadline-ordered queue over an index arena.
pub struct ExpirationQueue<K> {
    nodes: Vec<QueueNode<K>>,
    index: AHashMap<K, usize>,
    free_list: Vec<usize>,
}

impl<K: Hash + Eq + Clone> ExpirationQueue<K> {
    pub fn new() -> Self {
        let mut nodes = Vec::with_capacity(16);
        nodes.push(QueueNode {
            key: None,
            deadline: 0,
            prev: NULL,
            next: TAIL,
        });
        nodes.push(QueueNode {
            key: None,
            deadline: 0,
            prev: HEAD,
            next: NULL,
        });
        ExpirationQueue {
            nodes,
            index: AHashMap::new(),
            free_list: Vec::new(),
        }
    }

    fn link_before_tail(&mut self, idx: usize) {
        let old_last = self.nodes[TAIL].prev;
        self.nodes[idx].prev = old_last;
        self.nodes[idx].next = TAIL;
        self.nodes[old_last].next = idx;
        self.nodes[TAIL].prev = idx;
    }

    fn unlink(&mut self, idx: usize) {
        let prev = self.nodes[idx].prev;
        let next = self.nodes[idx].next;
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
        self.nodes[idx].prev = NULL;
        self.nodes[idx].next = NULL;
    }

    /// Schedules `key` to expire at `deadline`, moving it to the tail.
    ///
    /// Re-scheduling an already queued key refreshes both its deadline and
    /// its position, which is exactly the access-order behavior.
    pub fn schedule(&mut self, key: K, deadline: u64) {
        if let Some(&idx) = self.index.get(&key) {
            self.nodes[idx].deadline = deadline;
            self.unlink(idx);
            self.link_before_tail(idx);
            return;
        }
        let idx = if let Some(idx) = self.free_list.pop() {
            let n = &mut self.nodes[idx];
            n.key = Some(key.clone());
            n.deadline = deadline;
            n.prev = NULL;
            n.next = NULL;
            idx
        } else {
            let idx = self.nodes.len();
            self.nodes.push(QueueNode {
                key: Some(key.clone()),
                deadline,
                prev: NULL,
                next: NULL,
            });
            idx
        };
        self.index.insert(key, idx);
        self.link_before_tail(idx);
    }

    /// Drops `key` from the queue.  Returns `false` if it was not queued.
    pub fn remove(&mut self, key: &K) -> bool {
        let Some(idx) = self.index.remove(key) else {
            return false;
        };
        self.unlink(idx);
        self.nodes[idx].key = None;
        self.free_list.push(idx);
        true
    }

    /// Pops up to `limit` keys with `deadline ≤ now` from the head.
    ///
    /// Returns the number popped.  Stops at the first unexpired entry —
    /// deadlines are (near-)monotonic from head to tail by construction.
    pub fn expire_into(&mut self, now: u64, limit: usize, out: &mut Vec<K>) -> usize {
        let mut popped = 0usize;
        while popped < limit {
            let idx = self.nodes[HEAD].next;
            if idx == TAIL || self.nodes[idx].deadline > now {
                break;
            }
            self.unlink(idx);
            let Some(key) = self.nodes[idx].key.take() else {
                break; // sentinel; queue is corrupt only if this fires
            };
            self.index.remove(&key);
            self.free_list.push(idx);
            out.push(key);
            popped += 1;
        }
        popped
    }

    /// Deadline of the oldest queued entry, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        let idx = self.nodes[HEAD].next;
        if idx == TAIL {
            None
        } else {
            Some(self.nodes[idx].deadline)
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl<K: Hash + Eq + Clone> Default for ExpirationQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_deadline_order() {
        let mut q: ExpirationQueue<u64> = ExpirationQueue::new();
        q.schedule(1, 10);
        q.schedule(2, 20);
        q.schedule(3, 30);

        let mut out = Vec::new();
        q.expire_into(25, usize::MAX, &mut out);
        assert_eq!(out, vec![1, 2]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn reschedule_moves_to_tail() {
        let mut q: ExpirationQueue<u64> = ExpirationQueue::new();
        q.schedule(1, 10);
        q.schedule(2, 20);
        q.schedule(1, 30); // touched: moves behind 2

        let mut out = Vec::new();
        q.expire_into(20, usize::MAX, &mut out);
        assert_eq!(out, vec![2], "touched key must not expire at its old deadline");

        out.clear();
        q.expire_into(30, usize::MAX, &mut out);
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn remove_prevents_expiry() {
        let mut q: ExpirationQueue<u64> = ExpirationQueue::new();
        q.schedule(7, 10);
        assert!(q.remove(&7));
        assert!(!q.remove(&7));

        let mut out = Vec::new();
        q.expire_into(100, usize::MAX, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn limit_bounds_work_per_pass() {
        let mut q: ExpirationQueue<u64> = ExpirationQueue::new();
        for i in 0..10u64 {
            q.schedule(i, i);
        }
        let mut out = Vec::new();
        let popped = q.expire_into(100, 4, &mut out);
        assert_eq!(popped, 4);
        assert_eq!(q.len(), 6);
        assert_eq!(q.next_deadline(), Some(4));
    }

    #[test]
    fn slots_are_recycled() {
        let mut q: ExpirationQueue<u64> = ExpirationQueue::new();
        for round in 0..5u64 {
            for i in 0..100u64 {
                q.schedule(round * 1000 + i, i);
            }
            let mut out = Vec::new();
            q.expire_into(u64::MAX - 1, usize::MAX, &mut out);
            assert_eq!(out.len(), 100);
        }
        // 2 sentinels + at most one generation of real nodes.
        assert!(q.nodes.len() <= 102, "arena grew: {}", q.nodes.len());
    }
}
