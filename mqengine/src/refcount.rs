//! Reference counts that gate object teardown.
//!
//! [`UseCount`] is the plain counter carried by sessions, producers, client
//! states and transactions. [`ConsumerCounts`] packs a consumer's use count
//! and its outstanding-acknowledgement count into one atomic word so that
//! the two halves always change together:
//!
//! ```text
//!  63            32 31     30          29             0
//! +----------------+-------+-----------+---------------+
//! |   use count    | FREED | DESTROYED |  ack count    |
//! +----------------+-------+-----------+---------------+
//! ```
//!
//! A consumer is freed by whichever decrement first observes both counts
//! at zero with the destroy-completed bit set; that decrement also sets
//! `FREED`, so the free happens exactly once.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Release {
    /// Other references remain
    Held,
    /// This was the last reference, the caller performs teardown
    Last,
    /// The count was already zero
    Underflow,
}

#[derive(Debug)]
pub struct UseCount(AtomicU32);

impl UseCount {
    #[inline]
    pub const fn new(n: u32) -> Self {
        UseCount(AtomicU32::new(n))
    }

    /// Take a reference unless the count has already dropped to zero
    #[inline]
    pub fn acquire(&self) -> bool {
        self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| if c == 0 { None } else { Some(c + 1) }).is_ok()
    }

    #[inline]
    pub fn release(&self) -> Release {
        match self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1)) {
            Ok(1) => Release::Last,
            Ok(_) => Release::Held,
            Err(_) => Release::Underflow,
        }
    }

    /// Re-arm a count that has reached zero
    #[inline]
    pub fn revive(&self, n: u32) -> bool {
        self.0.compare_exchange(0, n, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    #[inline]
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

const USE_SHIFT: u32 = 32;
const USE_ONE: u64 = 1 << USE_SHIFT;
const ACK_MASK: u64 = (1 << 30) - 1;
const DESTROY_COMPLETED: u64 = 1 << 30;
const FREED: u64 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountsSnapshot {
    pub uses: u32,
    pub acks: u32,
    pub destroy_completed: bool,
    pub freed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum AckRelease {
    Held,
    /// Last outstanding acknowledgement of a destroyed consumer, the caller frees it
    Free,
    Underflow,
}

#[derive(Debug)]
pub struct ConsumerCounts(AtomicU64);

impl ConsumerCounts {
    #[inline]
    pub fn new(uses: u32) -> Self {
        ConsumerCounts(AtomicU64::new((uses as u64) << USE_SHIFT))
    }

    #[inline]
    fn freeable(v: u64) -> bool {
        v >> USE_SHIFT == 0 && v & ACK_MASK == 0 && v & DESTROY_COMPLETED != 0 && v & FREED == 0
    }

    #[inline]
    pub fn snapshot(&self) -> CountsSnapshot {
        let v = self.0.load(Ordering::SeqCst);
        CountsSnapshot {
            uses: (v >> USE_SHIFT) as u32,
            acks: (v & ACK_MASK) as u32,
            destroy_completed: v & DESTROY_COMPLETED != 0,
            freed: v & FREED != 0,
        }
    }

    #[inline]
    pub fn acquire_use(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                if v >> USE_SHIFT == 0 {
                    None
                } else {
                    Some(v + USE_ONE)
                }
            })
            .is_ok()
    }

    /// `Last` hands teardown to the caller, who must follow it with
    /// [`ConsumerCounts::mark_destroy_completed`]
    #[inline]
    pub fn release_use(&self) -> Release {
        match self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            if v >> USE_SHIFT == 0 {
                None
            } else {
                Some(v - USE_ONE)
            }
        }) {
            Ok(prev) if prev >> USE_SHIFT == 1 => Release::Last,
            Ok(_) => Release::Held,
            Err(_) => Release::Underflow,
        }
    }

    #[inline]
    pub fn inc_ack(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub fn release_ack(&self) -> AckRelease {
        let res = self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            if v & ACK_MASK == 0 {
                return None;
            }
            let next = v - 1;
            Some(if Self::freeable(next) { next | FREED } else { next })
        });
        match res {
            Ok(prev) => {
                if Self::freeable(prev - 1) {
                    AckRelease::Free
                } else {
                    AckRelease::Held
                }
            }
            Err(_) => AckRelease::Underflow,
        }
    }

    /// Returns `Ok(true)` when nothing else holds the consumer and the caller frees it
    /// now, `Err(())` if destroy was already marked complete.
    #[inline]
    #[allow(clippy::result_unit_err)]
    pub fn mark_destroy_completed(&self) -> std::result::Result<bool, ()> {
        let res = self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            if v & DESTROY_COMPLETED != 0 {
                return None;
            }
            let next = v | DESTROY_COMPLETED;
            Some(if Self::freeable(next) { next | FREED } else { next })
        });
        match res {
            Ok(prev) => Ok(Self::freeable(prev | DESTROY_COMPLETED)),
            Err(_) => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_use_count_basic() {
        let c = UseCount::new(1);
        assert!(c.acquire());
        assert_eq!(c.release(), Release::Held);
        assert_eq!(c.release(), Release::Last);
        assert!(!c.acquire());
        assert_eq!(c.release(), Release::Underflow);
        assert!(c.revive(1));
        assert!(!c.revive(1));
        assert_eq!(c.get(), 1);
    }

    #[test]
    fn test_use_count_concurrent_single_teardown() {
        let count = Arc::new(UseCount::new(1));
        let teardowns = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for t in 0..8u64 {
            let count = count.clone();
            let teardowns = teardowns.clone();
            handles.push(std::thread::spawn(move || {
                let mut seed = t.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let mut held = 0u32;
                for _ in 0..5000 {
                    seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    if held == 0 || (seed >> 33) % 2 == 0 {
                        assert!(count.acquire());
                        held += 1;
                    } else {
                        if count.release() == Release::Last {
                            teardowns.fetch_add(1, Ordering::SeqCst);
                        }
                        held -= 1;
                    }
                }
                for _ in 0..held {
                    if count.release() == Release::Last {
                        teardowns.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(teardowns.load(Ordering::SeqCst), 0);
        assert_eq!(count.release(), Release::Last);
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn test_consumer_counts_wait_for_acks() {
        let c = ConsumerCounts::new(1);
        c.inc_ack();
        c.inc_ack();
        assert_eq!(c.release_use(), Release::Last);
        assert_eq!(c.mark_destroy_completed(), Ok(false));
        let s = c.snapshot();
        assert_eq!((s.uses, s.acks, s.destroy_completed, s.freed), (0, 2, true, false));

        assert_eq!(c.release_ack(), AckRelease::Held);
        assert!(!c.snapshot().freed);
        assert_eq!(c.release_ack(), AckRelease::Free);
        assert!(c.snapshot().freed);
        assert_eq!(c.release_ack(), AckRelease::Underflow);
    }

    #[test]
    fn test_consumer_counts_ack_before_destroy_completed() {
        let c = ConsumerCounts::new(1);
        c.inc_ack();
        assert_eq!(c.release_use(), Release::Last);
        // teardown still running: the last ack must not free
        assert_eq!(c.release_ack(), AckRelease::Held);
        assert!(!c.snapshot().freed);
        assert_eq!(c.mark_destroy_completed(), Ok(true));
        assert!(c.snapshot().freed);
        assert_eq!(c.mark_destroy_completed(), Err(()));
    }

    #[test]
    fn test_consumer_counts_acquire_after_last_use() {
        let c = ConsumerCounts::new(1);
        assert!(c.acquire_use());
        assert_eq!(c.release_use(), Release::Held);
        assert_eq!(c.release_use(), Release::Last);
        assert!(!c.acquire_use());
        assert_eq!(c.release_use(), Release::Underflow);
    }

    #[test]
    fn test_consumer_counts_concurrent_free_once() {
        for _ in 0..50 {
            let c = Arc::new(ConsumerCounts::new(1));
            for _ in 0..64 {
                c.inc_ack();
            }
            let frees = Arc::new(AtomicUsize::new(0));
            let mut handles = Vec::new();
            for _ in 0..4 {
                let c = c.clone();
                let frees = frees.clone();
                handles.push(std::thread::spawn(move || {
                    for _ in 0..16 {
                        if c.release_ack() == AckRelease::Free {
                            frees.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }));
            }
            assert_eq!(c.release_use(), Release::Last);
            if c.mark_destroy_completed() == Ok(true) {
                frees.fetch_add(1, Ordering::SeqCst);
            }
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(frees.load(Ordering::SeqCst), 1);
        }
    }
}
