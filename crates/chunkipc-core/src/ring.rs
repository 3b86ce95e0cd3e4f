//! Bounded ring buffer of 32-bit indices
//!
//! Fixed power-of-two capacity `N`. Push writes at `head` and advances it,
//! pop reads at `tail` and advances it. One slot is always left empty so
//! that full (`head + 1 == tail`) and empty (`head == tail`) differ, which
//! means at most `N - 1` items are stored.
//!
//! # Concurrency
//!
//! [`BoundedRing`] is single-producer/single-consumer: the producer is the
//! only writer of `head`, the consumer the only writer of `tail`. The slot
//! write is published by the release store of `head`; the consumer
//! acquire-loads `head` before reading the slot. Pop is symmetric on `tail`.
//!
//! [`LockedRing`] wraps a ring with a [`RobustSpinlock`] for queues with
//! several producers or consumers.
//!
//! All fields are atomics so the ring can live in shared memory. An
//! all-zero ring is a valid empty ring.

use crate::owner_id::OwnerId;
use crate::spinlock::RobustSpinlock;
use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

#[repr(C, align(64))]
struct Cursor {
    value: AtomicU32,
}

impl Cursor {
    const fn new() -> Self {
        Self {
            value: AtomicU32::new(0),
        }
    }
}

/// Single-producer/single-consumer bounded ring of `u32` items
#[repr(C)]
pub struct BoundedRing<const N: usize> {
    head: Cursor,
    tail: Cursor,
    unread: Cursor,
    slots: [AtomicU32; N],
}

impl<const N: usize> BoundedRing<N> {
    const MASK: u32 = {
        assert!(N.is_power_of_two() && N >= 2 && N <= (1 << 31));
        (N - 1) as u32
    };

    pub fn new() -> Self {
        let _ = Self::MASK;
        Self {
            head: Cursor::new(),
            tail: Cursor::new(),
            unread: Cursor::new(),
            slots: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    #[inline]
    fn next(i: u32) -> u32 {
        i.wrapping_add(1) & Self::MASK
    }

    /// Number of slots, including the reserved one
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Largest number of items the ring holds at once
    pub const fn max_len(&self) -> usize {
        N - 1
    }

    /// Push an item. Returns false if the ring is full.
    #[inline]
    pub fn try_push(&self, item: u32) -> bool {
        let head = self.head.value.load(Ordering::Relaxed) & Self::MASK;
        let next = Self::next(head);
        if next == self.tail.value.load(Ordering::Acquire) & Self::MASK {
            return false;
        }
        self.slots[head as usize].store(item, Ordering::Relaxed);
        // Counted before publishing so the consumer never sees the item
        // ahead of the count.
        self.unread.value.fetch_add(1, Ordering::AcqRel);
        self.head.value.store(next, Ordering::Release);
        true
    }

    /// Pop an item. Returns None if the ring is empty.
    #[inline]
    pub fn try_pop(&self) -> Option<u32> {
        let tail = self.tail.value.load(Ordering::Relaxed) & Self::MASK;
        if tail == self.head.value.load(Ordering::Acquire) & Self::MASK {
            return None;
        }
        let item = self.slots[tail as usize].load(Ordering::Relaxed);
        // Uncounted before the slot is handed back, so the count never
        // exceeds N - 1.
        self.unread.value.fetch_sub(1, Ordering::AcqRel);
        self.tail.value.store(Self::next(tail), Ordering::Release);
        Some(item)
    }

    /// Push, retrying up to `spin_count` more times while the ring is full
    pub fn push_spin(&self, item: u32, spin_count: usize) -> bool {
        let backoff = Backoff::new();
        for _ in 0..=spin_count {
            if self.try_push(item) {
                return true;
            }
            backoff.spin();
        }
        false
    }

    /// Pop, retrying up to `spin_count` more times while the ring is empty
    pub fn pop_spin(&self, spin_count: usize) -> Option<u32> {
        let backoff = Backoff::new();
        for _ in 0..=spin_count {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            backoff.spin();
        }
        None
    }

    /// Push, spinning and then yielding the CPU until `timeout` elapses
    pub fn push_timeout(&self, item: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            if self.try_push(item) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            backoff.snooze();
        }
    }

    /// Pop, spinning and then yielding the CPU until `timeout` elapses
    pub fn pop_timeout(&self, timeout: Duration) -> Option<u32> {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if Instant::now() >= deadline {
                return None;
            }
            backoff.snooze();
        }
    }

    /// Approximate number of items, from the unread counter
    pub fn size(&self) -> usize {
        (self.unread.value.load(Ordering::Acquire) as usize).min(N - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.tail.value.load(Ordering::Acquire) & Self::MASK
            == self.head.value.load(Ordering::Acquire) & Self::MASK
    }

    pub fn is_not_full(&self) -> bool {
        Self::next(self.head.value.load(Ordering::Acquire) & Self::MASK)
            != self.tail.value.load(Ordering::Acquire) & Self::MASK
    }

    /// Pop and discard everything. Returns the number of items dropped.
    pub fn drain(&self) -> usize {
        let mut n = 0;
        while self.try_pop().is_some() {
            n += 1;
            if n > N {
                // A corrupted head/tail pair cannot make this loop forever.
                break;
            }
        }
        n
    }

    /// Reset to empty. Only valid while no one else touches the ring.
    pub fn reset(&self) {
        self.head.value.store(0, Ordering::Relaxed);
        self.tail.value.store(0, Ordering::Relaxed);
        self.unread.value.store(0, Ordering::Release);
    }
}

impl<const N: usize> Default for BoundedRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded ring serialized by a robust spinlock, for many producers and
/// consumers
#[repr(C)]
pub struct LockedRing<const N: usize> {
    lock: RobustSpinlock,
    ring: BoundedRing<N>,
}

impl<const N: usize> LockedRing<N> {
    pub fn new() -> Self {
        Self {
            lock: RobustSpinlock::new(),
            ring: BoundedRing::new(),
        }
    }

    /// Push under the lock. False if the lock was not taken in time or the
    /// ring is full.
    pub fn push(&self, owner: OwnerId, item: u32, timeout: Duration) -> bool {
        match self.lock.guard(owner, timeout) {
            Some(_guard) => self.ring.try_push(item),
            None => false,
        }
    }

    /// Pop under the lock. None if the lock was not taken in time or the
    /// ring is empty.
    pub fn pop(&self, owner: OwnerId, timeout: Duration) -> Option<u32> {
        let _guard = self.lock.guard(owner, timeout)?;
        self.ring.try_pop()
    }

    /// Remove every occurrence of `item`, keeping the order of the rest
    pub fn remove(&self, owner: OwnerId, item: u32, timeout: Duration) -> Option<usize> {
        let _guard = self.lock.guard(owner, timeout)?;
        let len = self.ring.size();
        let mut removed = 0;
        for _ in 0..len {
            match self.ring.try_pop() {
                Some(v) if v == item => removed += 1,
                Some(v) => {
                    self.ring.try_push(v);
                }
                None => break,
            }
        }
        Some(removed)
    }

    pub fn size(&self) -> usize {
        self.ring.size()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn max_len(&self) -> usize {
        self.ring.max_len()
    }

    pub fn lock(&self) -> &RobustSpinlock {
        &self.lock
    }
}

impl<const N: usize> Default for LockedRing<N> {
    fn default() -> Self {
        Self::new()
    }
}
