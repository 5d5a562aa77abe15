//! Bounded FIFO that drops its oldest element instead of blocking.
//!
//! The producer side never waits: when the ring is full, the element at the
//! tail (oldest) is displaced and an advisory `drops` counter is bumped.
//! Between one producer and one consumer the observable order is FIFO; drops
//! only ever remove from the tail, never from the middle.

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// Single-producer single-consumer overwrite-on-full ring.
///
/// Backed by [`ArrayQueue`], whose head/tail indices already carry
/// release/acquire ordering; `force_push` displaces the oldest element when
/// full. SPSC use is a convention of this crate, not enforced by the type.
pub struct SpscOverwrite<T> {
    q: ArrayQueue<T>,
    drops: AtomicU64,
}

impl<T> SpscOverwrite<T> {
    pub fn new(capacity: usize) -> Self {
        SpscOverwrite {
            q: ArrayQueue::new(capacity),
            drops: AtomicU64::new(0),
        }
    }

    /// Push, displacing the oldest element if the ring is full. Never blocks.
    pub fn push_overwrite(&self, item: T) {
        if self.q.force_push(item).is_some() {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Pop one element, oldest first.
    pub fn pop(&self) -> Option<T> {
        self.q.pop()
    }

    /// Pop up to `max_n` elements, applying `f` to each. Returns the count.
    pub fn drain<F: FnMut(T)>(&self, max_n: usize, mut f: F) -> usize {
        let mut n = 0;
        while n < max_n {
            match self.q.pop() {
                Some(v) => {
                    f(v);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Total elements displaced before the consumer could see them.
    /// Advisory: relaxed ordering, strictly non-decreasing.
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.q.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_when_not_full() {
        let r = SpscOverwrite::new(8);
        for i in 0..5 {
            r.push_overwrite(i);
        }
        for i in 0..5 {
            assert_eq!(r.pop(), Some(i));
        }
        assert_eq!(r.pop(), None);
        assert_eq!(r.drops(), 0);
    }

    #[test]
    fn overflow_drops_oldest() {
        let r = SpscOverwrite::new(4);
        for i in 0..10 {
            r.push_overwrite(i);
        }
        // 10 pushes into capacity 4: the six oldest were displaced.
        assert_eq!(r.drops(), 6);
        assert_eq!(r.pop(), Some(6));
        assert_eq!(r.pop(), Some(7));
        assert_eq!(r.pop(), Some(8));
        assert_eq!(r.pop(), Some(9));
        assert_eq!(r.pop(), None);
    }

    #[test]
    fn drops_equals_pushes_minus_available() {
        let r = SpscOverwrite::new(16);
        let total = 1000u64;
        let mut seen = 0u64;
        for i in 0..total {
            r.push_overwrite(i);
            if i % 3 == 0 {
                if r.pop().is_some() {
                    seen += 1;
                }
            }
        }
        seen += r.drain(usize::MAX, |_| ()) as u64;
        assert_eq!(r.drops(), total - seen);
    }

    #[test]
    fn drain_is_bounded() {
        let r = SpscOverwrite::new(32);
        for i in 0..20 {
            r.push_overwrite(i);
        }
        let mut got = Vec::new();
        let n = r.drain(8, |v| got.push(v));
        assert_eq!(n, 8);
        assert_eq!(got, (0..8).collect::<Vec<_>>());
        assert_eq!(r.len(), 12);
    }
}
