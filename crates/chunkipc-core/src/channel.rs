//! Channels between one client and one scheduler
//!
//! A channel is an `in` ring (client to scheduler), an `out` ring
//! (scheduler to client) and an overflow queue for responses the `out` ring
//! could not take. The overflow queue is a linked list threaded through the
//! `next` field of the queued chunks and is only touched by the serving
//! scheduler.
//!
//! Lifecycle: `Free -> Owned -> InUse -> Owned ... -> MarkedForRelease ->
//! Free`. A channel marked for release is only torn down once no scheduler
//! holds a reference to it.

use crate::chunk::{ChunkIndex, ChunkStore, LINK_TERMINATOR};
use crate::config::CHANNEL_SLOTS;
use crate::owner_id::{AtomicOwnerId, OwnerId};
use crate::ring::BoundedRing;
use std::sync::atomic::{AtomicU32, Ordering};

/// Channel number within a segment
pub type ChannelNumber = u32;

// Values of `to_be_released`
const RELEASE_MARKED: u32 = 1;
const TEARING_DOWN: u32 = 2;

/// Where a channel is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// In a scheduler's free queue
    Free,
    /// Held by a client, no request in flight on the server
    Owned,
    /// A scheduler holds at least one reference
    InUse,
    /// Waiting for the server references to drop to zero
    MarkedForRelease,
}

/// What a teardown threw away
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Discarded {
    pub in_queue: usize,
    pub out_queue: usize,
    pub overflow: usize,
}

impl Discarded {
    pub fn total(&self) -> usize {
        self.in_queue + self.out_queue + self.overflow
    }
}

#[repr(C)]
pub struct Channel {
    in_ring: BoundedRing<CHANNEL_SLOTS>,
    out_ring: BoundedRing<CHANNEL_SLOTS>,
    overflow_front: AtomicU32,
    overflow_back: AtomicU32,
    overflow_len: AtomicU32,
    server_refs: AtomicU32,
    to_be_released: AtomicU32,
    client_number: AtomicU32,
    scheduler_number: AtomicU32,
    owner: AtomicOwnerId,
}

impl Channel {
    pub fn new() -> Self {
        Self {
            in_ring: BoundedRing::new(),
            out_ring: BoundedRing::new(),
            overflow_front: AtomicU32::new(LINK_TERMINATOR),
            overflow_back: AtomicU32::new(LINK_TERMINATOR),
            overflow_len: AtomicU32::new(0),
            server_refs: AtomicU32::new(0),
            to_be_released: AtomicU32::new(0),
            client_number: AtomicU32::new(0),
            scheduler_number: AtomicU32::new(0),
            owner: AtomicOwnerId::new(OwnerId::NONE),
        }
    }

    /// Requests from the client
    pub fn in_queue(&self) -> &BoundedRing<CHANNEL_SLOTS> {
        &self.in_ring
    }

    /// Responses to the client
    pub fn out_queue(&self) -> &BoundedRing<CHANNEL_SLOTS> {
        &self.out_ring
    }

    pub fn owner(&self) -> OwnerId {
        self.owner.load()
    }

    pub fn client_number(&self) -> u32 {
        self.client_number.load(Ordering::Acquire)
    }

    pub fn scheduler_number(&self) -> u32 {
        self.scheduler_number.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ChannelState {
        if self.owner().is_none() {
            ChannelState::Free
        } else if self.is_to_be_released() {
            ChannelState::MarkedForRelease
        } else if self.server_refs() > 0 {
            ChannelState::InUse
        } else {
            ChannelState::Owned
        }
    }

    /// Free -> Owned. Called by the client that popped this channel's
    /// number from the scheduler's free queue; nobody else touches the
    /// channel until its poll bit is set.
    pub fn claim(&self, owner: OwnerId, client_number: u32, scheduler: u32) {
        self.in_ring.reset();
        self.out_ring.reset();
        self.overflow_front.store(LINK_TERMINATOR, Ordering::Relaxed);
        self.overflow_back.store(LINK_TERMINATOR, Ordering::Relaxed);
        self.overflow_len.store(0, Ordering::Relaxed);
        self.server_refs.store(0, Ordering::Relaxed);
        self.to_be_released.store(0, Ordering::Relaxed);
        self.client_number.store(client_number, Ordering::Relaxed);
        self.scheduler_number.store(scheduler, Ordering::Relaxed);
        self.owner.store(owner);
    }

    pub fn server_refs(&self) -> u32 {
        self.server_refs.load(Ordering::Acquire)
    }

    /// Take a server reference. Returns the new count.
    pub fn add_server_ref(&self) -> u32 {
        self.server_refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop a server reference. Returns the new count; never goes below 0.
    pub fn release_server_ref(&self) -> u32 {
        match self
            .server_refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(prev) => prev - 1,
            Err(_) => 0,
        }
    }

    /// Request release. True if this call set the mark.
    pub fn mark_for_release(&self) -> bool {
        self.to_be_released
            .compare_exchange(0, RELEASE_MARKED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_to_be_released(&self) -> bool {
        self.to_be_released.load(Ordering::Acquire) != 0
    }

    /// No scheduler holds a reference
    pub fn is_tranquil(&self) -> bool {
        self.server_refs() == 0
    }

    /// Marked for release and tranquil, so teardown may run
    pub fn is_ready_for_release(&self) -> bool {
        self.to_be_released.load(Ordering::Acquire) == RELEASE_MARKED
            && self.is_tranquil()
            && !self.owner().is_none()
    }

    /// Claim the teardown of a channel that is ready for release. Of all
    /// the parties racing to release the channel exactly one gets true.
    pub fn begin_teardown(&self) -> bool {
        if self.owner().is_none()
            || self
                .to_be_released
                .compare_exchange(RELEASE_MARKED, TEARING_DOWN, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return false;
        }
        if !self.is_tranquil() {
            self.to_be_released.store(RELEASE_MARKED, Ordering::Release);
            return false;
        }
        true
    }

    pub fn overflow_len(&self) -> usize {
        self.overflow_len.load(Ordering::Acquire) as usize
    }

    /// Append a response to the overflow queue
    pub fn push_overflow(&self, store: &ChunkStore<'_>, index: ChunkIndex) -> crate::Result<()> {
        store.get(index)?.set_next(LINK_TERMINATOR);
        if self.overflow_len.load(Ordering::Relaxed) == 0 {
            self.overflow_front.store(index, Ordering::Relaxed);
        } else {
            let back = self.overflow_back.load(Ordering::Relaxed);
            store.get(back)?.set_next(index);
        }
        self.overflow_back.store(index, Ordering::Relaxed);
        self.overflow_len.fetch_add(1, Ordering::Release);
        Ok(())
    }

    fn pop_overflow(&self, store: &ChunkStore<'_>) -> Option<ChunkIndex> {
        if self.overflow_len.load(Ordering::Relaxed) == 0 {
            return None;
        }
        let front = self.overflow_front.load(Ordering::Relaxed);
        let next = store.get(front).map_or(LINK_TERMINATOR, |c| c.next());
        self.overflow_front.store(next, Ordering::Relaxed);
        if self.overflow_len.fetch_sub(1, Ordering::Release) == 1 {
            self.overflow_back.store(LINK_TERMINATOR, Ordering::Relaxed);
        }
        Some(front)
    }

    /// Push a response, falling back to the overflow queue when the `out`
    /// ring is full or older responses are still queued. Returns false if
    /// the response went to the overflow queue.
    pub fn push_response(&self, store: &ChunkStore<'_>, index: ChunkIndex) -> crate::Result<bool> {
        self.drain_overflow(store);
        if self.overflow_len() == 0 && self.out_ring.try_push(index) {
            return Ok(true);
        }
        self.push_overflow(store, index)?;
        Ok(false)
    }

    /// Move queued overflow into the `out` ring while it has room, oldest
    /// first. Returns how many were moved.
    pub fn drain_overflow(&self, store: &ChunkStore<'_>) -> usize {
        let mut moved = 0;
        while self.overflow_len() > 0 && self.out_ring.is_not_full() {
            match self.pop_overflow(store) {
                Some(index) => {
                    // Only the serving scheduler pushes to `out`, so the
                    // room checked above is still there.
                    self.out_ring.try_push(index);
                    moved += 1;
                }
                None => break,
            }
        }
        moved
    }

    /// Discard everything queued on the channel and return it to `Free`.
    /// Chunk indices are dropped, not released: reclamation goes through
    /// the owner's resource map.
    pub fn teardown(&self) -> Discarded {
        let discarded = Discarded {
            in_queue: self.in_ring.drain(),
            out_queue: self.out_ring.drain(),
            overflow: self.overflow_len.swap(0, Ordering::AcqRel) as usize,
        };
        self.overflow_front.store(LINK_TERMINATOR, Ordering::Relaxed);
        self.overflow_back.store(LINK_TERMINATOR, Ordering::Relaxed);
        self.to_be_released.store(0, Ordering::Release);
        self.owner.store(OwnerId::NONE);
        discarded
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use proptest::prelude::*;

    fn chunks(n: usize) -> Vec<Chunk> {
        (0..n).map(|_| Chunk::new()).collect()
    }

    #[test]
    fn test_lifecycle_states() {
        let ch = Box::new(Channel::new());
        assert_eq!(ch.state(), ChannelState::Free);
        ch.claim(OwnerId::new(5), 0, 0);
        assert_eq!(ch.state(), ChannelState::Owned);
        assert_eq!(ch.add_server_ref(), 1);
        assert_eq!(ch.state(), ChannelState::InUse);
        assert!(ch.mark_for_release());
        assert!(!ch.mark_for_release());
        assert_eq!(ch.state(), ChannelState::MarkedForRelease);
        assert!(!ch.is_ready_for_release());
        assert_eq!(ch.release_server_ref(), 0);
        assert!(ch.is_ready_for_release());
        ch.teardown();
        assert_eq!(ch.state(), ChannelState::Free);
    }

    #[test]
    fn test_teardown_has_one_winner() {
        let ch = Box::new(Channel::new());
        assert!(!ch.begin_teardown());
        ch.claim(OwnerId::new(5), 0, 0);
        assert!(!ch.begin_teardown());
        ch.add_server_ref();
        ch.mark_for_release();
        assert!(!ch.begin_teardown());
        assert!(ch.is_to_be_released());
        ch.release_server_ref();

        assert!(ch.begin_teardown());
        assert!(!ch.begin_teardown());
        assert!(!ch.is_ready_for_release());
        assert!(!ch.mark_for_release());
        assert_eq!(ch.state(), ChannelState::MarkedForRelease);
        ch.teardown();
        assert_eq!(ch.state(), ChannelState::Free);
        assert!(!ch.begin_teardown());
    }

    #[test]
    fn test_release_ref_does_not_underflow() {
        let ch = Box::new(Channel::new());
        assert_eq!(ch.release_server_ref(), 0);
        assert_eq!(ch.server_refs(), 0);
    }

    #[test]
    fn test_overflow_preserves_order() {
        let store_chunks = chunks(300);
        let store = ChunkStore::new(&store_chunks);
        let ch = Box::new(Channel::new());
        ch.claim(OwnerId::new(5), 0, 0);

        for i in 0..CHANNEL_SLOTS as u32 - 1 {
            assert!(ch.push_response(&store, i).unwrap());
        }
        assert!(!ch.push_response(&store, 255).unwrap());
        assert!(!ch.push_response(&store, 256).unwrap());
        assert_eq!(ch.overflow_len(), 2);

        assert_eq!(ch.out_queue().try_pop(), Some(0));
        assert_eq!(ch.drain_overflow(&store), 1);
        assert_eq!(ch.overflow_len(), 1);

        let mut seen = Vec::new();
        while let Some(v) = ch.out_queue().try_pop() {
            seen.push(v);
            ch.drain_overflow(&store);
        }
        assert_eq!(seen, (1..=256).collect::<Vec<_>>());
    }

    #[test]
    fn test_teardown_discards_queues() {
        let store_chunks = chunks(8);
        let store = ChunkStore::new(&store_chunks);
        let ch = Box::new(Channel::new());
        ch.claim(OwnerId::new(9), 1, 0);
        ch.in_queue().try_push(1);
        ch.in_queue().try_push(2);
        ch.out_queue().try_push(3);
        ch.push_overflow(&store, 4).unwrap();
        ch.mark_for_release();

        let d = ch.teardown();
        assert_eq!(d, Discarded { in_queue: 2, out_queue: 1, overflow: 1 });
        assert_eq!(d.total(), 4);
        assert!(ch.in_queue().is_empty());
        assert_eq!(ch.overflow_len(), 0);
        assert!(!ch.is_to_be_released());
    }

    #[derive(Debug, Clone)]
    enum RefEvent {
        Add,
        Release,
        Mark,
        TryFree,
    }

    proptest! {
        #[test]
        fn prop_never_free_with_references(events in proptest::collection::vec(
            prop_oneof![Just(RefEvent::Add), Just(RefEvent::Release), Just(RefEvent::Mark), Just(RefEvent::TryFree)],
            0..200,
        )) {
            let ch = Box::new(Channel::new());
            ch.claim(OwnerId::new(3), 0, 0);
            let mut refs = 0u32;
            for event in events {
                if ch.state() == ChannelState::Free {
                    break;
                }
                match event {
                    RefEvent::Add => refs = ch.add_server_ref(),
                    RefEvent::Release => refs = ch.release_server_ref(),
                    RefEvent::Mark => {
                        ch.mark_for_release();
                    }
                    RefEvent::TryFree => {
                        if ch.is_ready_for_release() {
                            ch.teardown();
                        }
                    }
                }
                if ch.state() == ChannelState::Free {
                    prop_assert_eq!(refs, 0);
                    prop_assert_eq!(ch.server_refs(), 0);
                }
            }
        }
    }
}
