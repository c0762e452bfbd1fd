//! Lock-free multi-producer/multi-consumer queues for cross-thread handoff.
//!
//! Two variants share the same publication discipline (a per-slot flag
//! stored with release ordering by the producer and observed with acquire
//! ordering by the consumer, so the payload write is visible before the
//! flag):
//!
//! - [`Bounded`]: a fixed-capacity ring with per-slot sequence counters.
//!   `push` hands the value back when the ring is full; `pop` returns `None`
//!   on empty. Used as a reactor task queue where a full queue is a loud,
//!   reportable condition.
//! - [`Unbounded`]: a linked chain of fixed-size chunks. `push` never fails
//!   (it grows by chunk allocation); a chunk is reclaimed only after every
//!   slot in it has been written and read and the last handle referencing
//!   it is gone — the per-chunk reference count is the `Arc` strong count,
//!   so touching a reclaimed chunk is impossible by construction.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam_utils::CachePadded;

struct SeqSlot<T> {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded MPMC ring. Capacity is rounded up to a power of two.
pub struct Bounded<T> {
    slots: Box<[SeqSlot<T>]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for Bounded<T> {}
unsafe impl<T: Send> Sync for Bounded<T> {}

impl<T> Bounded<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity)
            .map(|i| SeqSlot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Push a value, returning it back when the queue is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[tail & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let lag = seq.wrapping_sub(tail) as isize;
            if lag == 0 {
                // Slot is free for this lap; claim it.
                match self.tail.compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(value) };
                        slot.seq.store(tail.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(t) => tail = t,
                }
            } else if lag < 0 {
                // Previous-lap value still unread: full.
                return Err(value);
            } else {
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Pop a value, returning `None` on empty without blocking.
    pub fn pop(&self) -> Option<T> {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[head & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let lag = seq.wrapping_sub(head.wrapping_add(1)) as isize;
            if lag == 0 {
                match self.head.compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        // Free the slot for the producer one lap ahead.
                        slot.seq
                            .store(head.wrapping_add(self.slots.len()), Ordering::Release);
                        return Some(value);
                    }
                    Err(h) => head = h,
                }
            } else if lag < 0 {
                return None;
            } else {
                head = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Whether the queue looks empty right now. Used by reactor loops for
    /// the wakeup handshake, where the check must observe any push that
    /// completed before the pusher examined the notify flag.
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::SeqCst);
        let tail = self.tail.load(Ordering::SeqCst);
        head == tail
    }
}

impl<T> Drop for Bounded<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

const CHUNK_CAP: usize = 64;

struct ChunkSlot<T> {
    ready: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

struct Chunk<T> {
    slots: Box<[ChunkSlot<T>]>,
    /// Claims by producers; only the first `CHUNK_CAP` claims land in this
    /// chunk, and the counter is monotone for the chunk's whole lifetime so
    /// a late claim through a stale handle harmlessly overflows.
    claim_w: AtomicUsize,
    /// Claims by consumers, same monotonicity argument.
    claim_r: AtomicUsize,
    next: ArcSwapOption<Chunk<T>>,
}

unsafe impl<T: Send> Send for Chunk<T> {}
unsafe impl<T: Send> Sync for Chunk<T> {}

impl<T> Chunk<T> {
    fn new() -> Self {
        let slots = (0..CHUNK_CAP)
            .map(|_| ChunkSlot {
                ready: AtomicBool::new(false),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            claim_w: AtomicUsize::new(0),
            claim_r: AtomicUsize::new(0),
            next: ArcSwapOption::const_empty(),
        }
    }
}

impl<T> Drop for Chunk<T> {
    fn drop(&mut self) {
        // Drop values that were published but never consumed.
        let r = self.claim_r.load(Ordering::Acquire).min(CHUNK_CAP);
        let w = self.claim_w.load(Ordering::Acquire).min(CHUNK_CAP);
        for i in r..w {
            let slot = &self.slots[i];
            if slot.ready.load(Ordering::Acquire) {
                unsafe {
                    (*slot.value.get()).assume_init_drop();
                }
            }
        }
    }
}

/// Unbounded chunked MPMC queue.
pub struct Unbounded<T> {
    head: ArcSwap<Chunk<T>>,
    tail: ArcSwap<Chunk<T>>,
}

impl<T: Send> Unbounded<T> {
    pub fn new() -> Self {
        let first = Arc::new(Chunk::new());
        Self {
            head: ArcSwap::from(first.clone()),
            tail: ArcSwap::from(first),
        }
    }

    /// Push a value; grows by chunk allocation, never fails.
    pub fn push(&self, value: T) {
        loop {
            let chunk = self.tail.load_full();
            let pos = chunk.claim_w.fetch_add(1, Ordering::AcqRel);
            if pos < CHUNK_CAP {
                let slot = &chunk.slots[pos];
                unsafe { (*slot.value.get()).write(value) };
                slot.ready.store(true, Ordering::Release);
                return;
            }
            if pos == CHUNK_CAP {
                // Exactly one producer overflows first and links the
                // successor; everyone else retries once it is published.
                let fresh = Arc::new(Chunk::new());
                chunk.next.store(Some(fresh.clone()));
                self.tail.store(fresh);
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Pop a value, returning `None` on empty without blocking.
    pub fn pop(&self) -> Option<T> {
        loop {
            let chunk = self.head.load_full();
            loop {
                let r = chunk.claim_r.load(Ordering::Acquire);
                if r >= CHUNK_CAP {
                    break;
                }
                let w = chunk.claim_w.load(Ordering::Acquire).min(CHUNK_CAP);
                if r >= w {
                    return None;
                }
                if chunk
                    .claim_r
                    .compare_exchange_weak(r, r + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let slot = &chunk.slots[r];
                    // The producer claimed this slot before we saw the claim
                    // counter; wait out the narrow publish window.
                    while !slot.ready.load(Ordering::Acquire) {
                        std::hint::spin_loop();
                    }
                    return Some(unsafe { (*slot.value.get()).assume_init_read() });
                }
            }
            // Chunk fully claimed for reading; move to the successor. The
            // swap drops the queue's reference, and the chunk is freed once
            // the last outstanding handle goes away.
            match chunk.next.load_full() {
                Some(next) => {
                    let prev = self.head.compare_and_swap(&chunk, next);
                    let _ = prev;
                }
                None => return None,
            }
        }
    }

    /// Whether the queue looks empty right now (same handshake role as
    /// [`Bounded::is_empty`]).
    pub fn is_empty(&self) -> bool {
        std::sync::atomic::fence(Ordering::SeqCst);
        let chunk = self.head.load_full();
        let r = chunk.claim_r.load(Ordering::SeqCst);
        if r < CHUNK_CAP {
            let w = chunk.claim_w.load(Ordering::SeqCst).min(CHUNK_CAP);
            return r >= w;
        }
        match chunk.next.load_full() {
            Some(next) => {
                let r = next.claim_r.load(Ordering::SeqCst);
                let w = next.claim_w.load(Ordering::SeqCst).min(CHUNK_CAP);
                r >= w
            }
            None => true,
        }
    }
}

impl<T: Send> Default for Unbounded<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::thread;

    #[test]
    fn bounded_fifo_single_thread() {
        let q = Bounded::new(4);
        assert_eq!(q.capacity(), 4);
        for i in 0..4 {
            assert!(q.push(i).is_ok());
        }
        assert_eq!(q.push(99), Err(99));
        for i in 0..4 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn bounded_wraps_across_laps() {
        let q = Bounded::new(2);
        for lap in 0..10 {
            assert!(q.push(lap * 2).is_ok());
            assert!(q.push(lap * 2 + 1).is_ok());
            assert_eq!(q.pop(), Some(lap * 2));
            assert_eq!(q.pop(), Some(lap * 2 + 1));
        }
    }

    #[test]
    fn unbounded_grows_across_chunks() {
        let q = Unbounded::new();
        let n = CHUNK_CAP * 3 + 7;
        for i in 0..n {
            q.push(i);
        }
        for i in 0..n {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn unbounded_drops_unconsumed_values() {
        static LIVE: AtomicU64 = AtomicU64::new(0);
        struct Counted;
        impl Counted {
            fn new() -> Self {
                LIVE.fetch_add(1, Ordering::SeqCst);
                Counted
            }
        }
        impl Drop for Counted {
            fn drop(&mut self) {
                LIVE.fetch_sub(1, Ordering::SeqCst);
            }
        }

        let q = Unbounded::new();
        for _ in 0..(CHUNK_CAP + 5) {
            q.push(Counted::new());
        }
        drop(q.pop());
        drop(q.pop());
        assert_eq!(LIVE.load(Ordering::SeqCst), (CHUNK_CAP + 3) as u64);
        drop(q);
        assert_eq!(LIVE.load(Ordering::SeqCst), 0);
    }

    fn hammer<Q: Sync>(queue: &Q, push: impl Fn(&Q, u64) -> bool + Sync, pop: impl Fn(&Q) -> Option<u64> + Sync) {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: u64 = 10_000;

        let popped_sum = AtomicU64::new(0);
        let popped_count = AtomicU64::new(0);

        thread::scope(|s| {
            for p in 0..PRODUCERS as u64 {
                let push = &push;
                s.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let value = p * PER_PRODUCER + i;
                        while !push(queue, value) {
                            thread::yield_now();
                        }
                    }
                });
            }
            for _ in 0..CONSUMERS {
                let pop = &pop;
                let popped_sum = &popped_sum;
                let popped_count = &popped_count;
                s.spawn(move || {
                    let total = PRODUCERS as u64 * PER_PRODUCER;
                    loop {
                        if popped_count.load(Ordering::SeqCst) >= total {
                            break;
                        }
                        match pop(queue) {
                            Some(v) => {
                                popped_sum.fetch_add(v, Ordering::SeqCst);
                                popped_count.fetch_add(1, Ordering::SeqCst);
                            }
                            None => thread::yield_now(),
                        }
                    }
                });
            }
        });

        let total = PRODUCERS as u64 * PER_PRODUCER;
        let expected: u64 = (0..total).sum();
        assert_eq!(popped_count.load(Ordering::SeqCst), total);
        assert_eq!(popped_sum.load(Ordering::SeqCst), expected);
    }

    #[test]
    fn bounded_concurrent_sum_preserved() {
        let q = Bounded::new(64);
        hammer(&q, |q, v| q.push(v).is_ok(), |q| q.pop());
    }

    #[test]
    fn unbounded_concurrent_sum_preserved() {
        let q = Unbounded::new();
        hammer(
            &q,
            |q, v| {
                q.push(v);
                true
            },
            |q| q.pop(),
        );
    }
}
