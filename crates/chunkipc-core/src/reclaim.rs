//! Channel teardown and client slot reclamation
//!
//! Shared by the scheduler (normal release and clean-up sweeps), by a
//! closing client when no scheduler is running, and by the monitor when it
//! finishes the clean-up of a dead client itself.

use crate::channel::{ChannelNumber, Discarded};
use crate::owner_id::OwnerId;
use crate::segment::Segment;
use crate::{Error, Result, TimeoutKind};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lock timeout for the queues touched during reclamation
pub(crate) const RECLAIM_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// Result of tearing down one channel
#[derive(Debug, Clone, Copy)]
pub struct TornDown {
    pub client_number: u32,
    pub discarded: Discarded,
    /// Channels the client still holds
    pub channels_left: u32,
}

/// Tear down `channel` and return its number to the serving scheduler's
/// free queue. The channel must be marked for release and tranquil.
///
/// Scheduler, closing client and monitor may all try to release the same
/// channel; only the one that wins [`Channel::begin_teardown`] does the
/// work, the others get `Ok(None)`.
///
/// [`Channel::begin_teardown`]: crate::channel::Channel::begin_teardown
pub fn tear_down_channel(segment: &Segment, lock_owner: OwnerId, channel: ChannelNumber) -> Result<Option<TornDown>> {
    let ch = segment.channel(channel)?;
    let client_number = ch.client_number();
    let scheduler_number = segment.scheduler_of(channel);
    let scheduler = segment.scheduler_interface(scheduler_number)?;
    let interface = segment.client_interface(client_number)?;
    let map = segment.resource_map(client_number)?;
    if !ch.begin_teardown() {
        return Ok(None);
    }

    // The count drops before the map flag so that a slot with no flags
    // left also has nothing allocated
    let channels_left = interface.decrement_allocated_channels();
    map.clear_channel_flag(scheduler_number, channel);
    // Off the poll mask before the number can be handed out again.
    scheduler.clear_channel_mask_bit(channel);
    let discarded = ch.teardown();
    if !scheduler.push_free_channel(lock_owner, channel, RECLAIM_LOCK_TIMEOUT) {
        warn!(channel, scheduler = scheduler_number, "free channel queue locked, channel lost");
        return Err(Error::Timeout(TimeoutKind::Spinlock));
    }
    debug!(
        channel,
        client = client_number,
        discarded = discarded.total(),
        channels_left,
        "channel released"
    );
    Ok(Some(TornDown {
        client_number,
        discarded,
        channels_left,
    }))
}

/// Release everything a client slot still holds and return the slot's
/// number to the free queue. Only one caller wins the slot; the others
/// get `Ok(false)`.
pub fn reclaim_client_slot(segment: &Segment, lock_owner: OwnerId, client_number: u32) -> Result<bool> {
    let interface = segment.client_interface(client_number)?;
    if interface.owner().is_none() || !interface.try_claim_reclaim() {
        return Ok(false);
    }
    let was_marked = interface.is_marked_for_clean_up();
    let dead = interface.owner();
    let map = segment.resource_map(client_number)?;

    let chunks = segment
        .shared_pool()
        .release_clients_chunks(lock_owner, &map, RECLAIM_LOCK_TIMEOUT)?;
    map.clear();
    interface.close();
    if !segment
        .common()
        .release_client_number(lock_owner, client_number, RECLAIM_LOCK_TIMEOUT)
    {
        return Err(Error::Timeout(TimeoutKind::Spinlock));
    }
    if was_marked {
        let left = segment.common().decrement_client_interfaces_to_clean_up();
        info!(
            segment = segment.name(),
            client = client_number,
            owner = %dead,
            chunks,
            to_clean_up = left,
            "client slot reclaimed"
        );
    } else {
        debug!(segment = segment.name(), client = client_number, chunks, "client slot closed");
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    fn segment() -> Segment {
        Segment::create_local("chunkipc_RECLAIM_1", SegmentConfig::new().chunks(128).schedulers(2).channels(8).clients(4))
            .unwrap()
    }

    /// Bind a client slot to `owner` and hand it channel 3
    fn bind(segment: &Segment, owner: OwnerId) -> u32 {
        let n = segment.common().acquire_client_number(owner, RECLAIM_LOCK_TIMEOUT).unwrap();
        let interface = segment.client_interface(n).unwrap();
        interface.open(owner, 42);
        let scheduler = segment.scheduler_interface(1).unwrap();
        assert_eq!(scheduler.pop_free_channel(owner, RECLAIM_LOCK_TIMEOUT), Some(1));
        assert_eq!(scheduler.pop_free_channel(owner, RECLAIM_LOCK_TIMEOUT), Some(3));
        // 1 回到队尾
        scheduler.push_free_channel(owner, 1, RECLAIM_LOCK_TIMEOUT);
        segment.channel(3).unwrap().claim(owner, n, 1);
        segment.resource_map(n).unwrap().set_channel_flag(1, 3);
        interface.increment_allocated_channels();
        scheduler.set_channel_mask_bit(3);
        n
    }

    #[test]
    fn test_tear_down_returns_channel() {
        let segment = segment();
        let owner = OwnerId::new(7);
        let n = bind(&segment, owner);
        let ch = segment.channel(3).unwrap();
        ch.in_queue().try_push(5);
        ch.mark_for_release();

        let torn = tear_down_channel(&segment, OwnerId::ANONYMOUS, 3).unwrap().unwrap();
        assert_eq!(torn.client_number, n);
        assert_eq!(torn.discarded.in_queue, 1);
        assert_eq!(torn.channels_left, 0);
        assert!(!segment.resource_map(n).unwrap().owns_channel(3));
        let scheduler = segment.scheduler_interface(1).unwrap();
        assert_eq!(scheduler.channel_mask_word(0) & (1 << 3), 0);
        assert_eq!(scheduler.free_channel_count(), 4);
        assert!(tear_down_channel(&segment, OwnerId::ANONYMOUS, 3).unwrap().is_none());
        assert_eq!(scheduler.free_channel_count(), 4);
    }

    #[test]
    fn test_unmarked_channel_is_not_torn_down() {
        let segment = segment();
        let n = bind(&segment, OwnerId::new(7));
        assert!(tear_down_channel(&segment, OwnerId::ANONYMOUS, 3).unwrap().is_none());
        assert!(segment.resource_map(n).unwrap().owns_channel(3));
        assert_eq!(segment.client_interface(n).unwrap().allocated_channels(), 1);
        assert_eq!(segment.scheduler_interface(1).unwrap().free_channel_count(), 3);
    }

    #[test]
    fn test_concurrent_tear_down_frees_channel_once() {
        let segment = segment();
        let owner = OwnerId::new(7);
        let n = bind(&segment, owner);
        let scheduler = segment.scheduler_interface(1).unwrap();
        let interface = segment.client_interface(n).unwrap();
        for _ in 0..200 {
            let ch = segment.channel(3).unwrap();
            ch.mark_for_release();
            let barrier = Barrier::new(3);
            let winners = AtomicUsize::new(0);
            thread::scope(|s| {
                for _ in 0..3 {
                    s.spawn(|| {
                        barrier.wait();
                        if tear_down_channel(&segment, OwnerId::ANONYMOUS, 3).unwrap().is_some() {
                            winners.fetch_add(1, Ordering::Relaxed);
                        }
                    });
                }
            });
            assert_eq!(winners.load(Ordering::Relaxed), 1);
            assert_eq!(scheduler.free_channel_count(), 4);
            assert_eq!(interface.allocated_channels(), 0);

            // Hand channel 3 back to the same slot for the next round
            let mut popped = Vec::new();
            while let Some(c) = scheduler.pop_free_channel(owner, RECLAIM_LOCK_TIMEOUT) {
                popped.push(c);
            }
            popped.sort_unstable();
            assert_eq!(popped, vec![1, 3, 5, 7]);
            for c in [1, 5, 7] {
                scheduler.push_free_channel(owner, c, RECLAIM_LOCK_TIMEOUT);
            }
            ch.claim(owner, n, 1);
            segment.resource_map(n).unwrap().set_channel_flag(1, 3);
            interface.increment_allocated_channels();
            scheduler.set_channel_mask_bit(3);
        }
    }

    #[test]
    fn test_reclaim_slot_once() {
        let segment = segment();
        let owner = OwnerId::new(7);
        let n = bind(&segment, owner);
        let map = segment.resource_map(n).unwrap();
        segment
            .shared_pool()
            .acquire_linked_counted(owner, Some(&map), 5, RECLAIM_LOCK_TIMEOUT)
            .unwrap();
        let interface = segment.client_interface(n).unwrap();
        segment.common().increment_client_interfaces_to_clean_up();
        interface.owner_slot().mark_for_clean_up();

        assert!(reclaim_client_slot(&segment, OwnerId::ANONYMOUS, n).unwrap());
        assert!(!reclaim_client_slot(&segment, OwnerId::ANONYMOUS, n).unwrap());
        assert_eq!(segment.shared_pool().len(), 128);
        assert!(map.is_empty());
        assert!(interface.owner().is_none());
        assert_eq!(segment.common().client_interfaces_to_clean_up(), 0);
        assert_eq!(segment.common().free_client_numbers(), 4);
    }
}
