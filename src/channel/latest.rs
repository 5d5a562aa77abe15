//! Single-slot "latest wins" mailbox.
//!
//! One producer publishes whole-value snapshots; any number of readers copy
//! the most recent one out. Readers never hold references into the slot and
//! never see a torn value. The contract is "any reader sees a consistent
//! snapshot", not "the very latest": a reader racing a store may return the
//! previous publication.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// Seqlock-style latest-value slot for `Copy` payloads.
///
/// The sequence counter is even between publications and odd while a store
/// is in flight; zero means "never stored". Readers retry until they observe
/// the same even sequence on both sides of the copy. Writers acquire the
/// odd state before touching the slot, so the occasional second producer
/// (the controller's reset path) serializes instead of tearing the value.
pub struct LatestValue<T> {
    seq: AtomicU64,
    slot: UnsafeCell<MaybeUninit<T>>,
}

// Readers only ever copy T out; the seqlock protocol guarantees the copy is
// a fully published value.
unsafe impl<T: Copy + Send> Send for LatestValue<T> {}
unsafe impl<T: Copy + Send> Sync for LatestValue<T> {}

impl<T: Copy> LatestValue<T> {
    pub const fn new() -> Self {
        LatestValue {
            seq: AtomicU64::new(0),
            slot: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Publish a new value.
    pub fn store(&self, v: T) {
        // Acquire the write-in-flight (odd) state.
        let s = loop {
            let s = self.seq.load(Ordering::Relaxed);
            if s & 1 == 0
                && self
                    .seq
                    .compare_exchange_weak(
                        s,
                        s.wrapping_add(1),
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                break s;
            }
            std::hint::spin_loop();
        };

        fence(Ordering::Release);
        unsafe { std::ptr::write_volatile(self.slot.get(), MaybeUninit::new(v)) };
        self.seq.store(s.wrapping_add(2), Ordering::Release);
    }

    /// Copy out the most recent publication, or `None` if nothing was ever
    /// stored.
    pub fn load(&self) -> Option<T> {
        loop {
            let s1 = self.seq.load(Ordering::Acquire);
            if s1 == 0 {
                return None;
            }
            if s1 & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let v = unsafe { std::ptr::read_volatile(self.slot.get()) };
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == s1 {
                // Sequence unchanged across the copy: v is a whole value.
                return Some(unsafe { v.assume_init() });
            }
        }
    }

    /// Like [`load`](Self::load) but substitutes `T::default()` when empty.
    pub fn load_or_default(&self) -> T
    where
        T: Default,
    {
        self.load().unwrap_or_default()
    }

    /// Number of completed publications.
    pub fn publications(&self) -> u64 {
        self.seq.load(Ordering::Acquire) / 2
    }
}

impl<T: Copy> Default for LatestValue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn empty_until_first_store() {
        let lv: LatestValue<u32> = LatestValue::new();
        assert_eq!(lv.load(), None);
        assert_eq!(lv.publications(), 0);
        lv.store(7);
        assert_eq!(lv.load(), Some(7));
        assert_eq!(lv.publications(), 1);
    }

    #[test]
    fn latest_wins() {
        let lv = LatestValue::new();
        for i in 0..100u32 {
            lv.store(i);
        }
        assert_eq!(lv.load(), Some(99));
        assert_eq!(lv.publications(), 100);
    }

    #[test]
    fn default_substitution() {
        let lv: LatestValue<[i16; 4]> = LatestValue::new();
        assert_eq!(lv.load_or_default(), [0; 4]);
    }

    #[test]
    fn readers_never_see_torn_values() {
        // Producer publishes pairs that must stay internally consistent.
        #[derive(Clone, Copy)]
        struct Pair {
            a: u64,
            b: u64,
        }

        let lv = Arc::new(LatestValue::new());
        lv.store(Pair { a: 0, b: !0 });

        let writer = {
            let lv = Arc::clone(&lv);
            thread::spawn(move || {
                for i in 1..=50_000u64 {
                    lv.store(Pair { a: i, b: !i });
                }
            })
        };

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let lv = Arc::clone(&lv);
                thread::spawn(move || {
                    for _ in 0..50_000 {
                        let p = lv.load().unwrap();
                        assert_eq!(p.b, !p.a);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
