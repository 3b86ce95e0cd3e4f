//! Client side of a database segment

use crate::channel::ChannelNumber;
use crate::chunk::{ChunkIndex, LINK_TERMINATOR};
use crate::interface::{ClientInterface, DatabaseState};
use crate::owner_id::OwnerId;
use crate::reclaim::{reclaim_client_slot, tear_down_channel, RECLAIM_LOCK_TIMEOUT};
use crate::resource_map::ResourceMap;
use crate::segment::Segment;
use crate::{Error, Result, TimeoutKind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long dropping an unclosed client waits for its channels
const DROP_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A client bound to one client slot of a segment
///
/// Acquire channels from schedulers, push requests to a channel's `in`
/// ring and pop responses from its `out` ring. Every chunk and channel the
/// client holds is recorded in its resource map, so the monitor can
/// reclaim them if the process dies.
pub struct Client {
    segment: Arc<Segment>,
    owner: OwnerId,
    number: u32,
    lock_timeout: Duration,
    closed: bool,
}

impl Client {
    /// Take a client slot in `segment` for `owner`
    pub fn open(segment: Arc<Segment>, owner: OwnerId) -> Result<Self> {
        if owner.is_none() || owner.is_clean_up() {
            warn!(segment = segment.name(), %owner, "refusing client owner id");
            return Err(Error::RegistrationRefused(format!("invalid client owner id {}", owner)));
        }
        if segment.database_state() != DatabaseState::Normal {
            return Err(Error::DatabaseTerminated);
        }

        // Allocate client slot
        let number = segment
            .common()
            .acquire_client_number(owner, RECLAIM_LOCK_TIMEOUT)
            .ok_or(Error::NoFreeClientSlot)?;
        let interface = segment.client_interface(number)?;
        segment.resource_map(number)?.clear();
        interface.open(owner, std::process::id());

        debug!(segment = segment.name(), client = number, %owner, "client opened");
        Ok(Self {
            segment,
            owner,
            number,
            lock_timeout: RECLAIM_LOCK_TIMEOUT,
            closed: false,
        })
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Client slot number
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    fn interface(&self) -> Result<&ClientInterface> {
        self.segment.client_interface(self.number)
    }

    pub fn resource_map(&self) -> Result<ResourceMap<'_>> {
        self.segment.resource_map(self.number)
    }

    /// Fails once the slot is marked for clean-up, taken over by another
    /// owner, or the database is gone
    fn check_usable(&self) -> Result<&ClientInterface> {
        let interface = self.interface()?;
        let current = interface.owner();
        if current.is_clean_up() {
            return Err(Error::MarkedForCleanUp(self.owner));
        }
        if current != self.owner {
            warn!(client = self.number, expected = %self.owner, actual = %current, "client slot owner changed");
            return Err(Error::OwnerMismatch {
                expected: self.owner,
                actual: current,
            });
        }
        if self.segment.database_state() != DatabaseState::Normal {
            return Err(Error::DatabaseTerminated);
        }
        Ok(interface)
    }

    fn check_channel(&self, channel: ChannelNumber) -> Result<()> {
        let ch = self.segment.channel(channel)?;
        if ch.owner() != self.owner || ch.client_number() != self.number || !self.resource_map()?.owns_channel(channel) {
            warn!(client = self.number, channel, "channel not owned by client");
            return Err(Error::NotOwner { kind: "channel", index: channel });
        }
        Ok(())
    }

    /// Take a free channel served by `scheduler`
    pub fn acquire_channel(&self, scheduler: u32) -> Result<ChannelNumber> {
        let interface = self.check_usable()?;
        let scheduler_interface = self.segment.scheduler_interface(scheduler)?;
        let channel = scheduler_interface
            .pop_free_channel(self.owner, self.lock_timeout)
            .ok_or(Error::NoFreeChannel { scheduler })?;

        // Free -> Owned, then make it visible to the scheduler
        self.segment.channel(channel)?.claim(self.owner, self.number, scheduler);
        self.resource_map()?.set_channel_flag(scheduler, channel);
        interface.increment_allocated_channels();
        scheduler_interface.set_channel_mask_bit(channel);

        debug!(client = self.number, channel, scheduler, "channel acquired");
        Ok(channel)
    }

    /// Ask for `channel` to be released. The serving scheduler tears it
    /// down once it holds no reference.
    pub fn release_channel(&self, channel: ChannelNumber) -> Result<()> {
        self.check_channel(channel)?;
        let ch = self.segment.channel(channel)?;
        ch.mark_for_release();
        self.segment
            .scheduler_interface(self.segment.scheduler_of(channel))?
            .notifier()
            .notify();
        Ok(())
    }

    pub fn owns_channel(&self, channel: ChannelNumber) -> bool {
        self.resource_map().map(|m| m.owns_channel(channel)).unwrap_or(false)
    }

    /// Channels still allocated to this client
    pub fn allocated_channels(&self) -> u32 {
        self.interface().map(|i| i.allocated_channels()).unwrap_or(0)
    }

    /// Acquire a chain long enough for `size` bytes from the shared pool
    pub fn acquire_linked(&self, size: usize, timeout: Duration) -> Result<ChunkIndex> {
        self.check_usable()?;
        let map = self.resource_map()?;
        self.segment
            .shared_pool()
            .acquire_linked(self.owner, Some(&map), size, timeout)
    }

    /// Acquire a chain of `count` chunks from the shared pool
    pub fn acquire_linked_counted(&self, count: usize, timeout: Duration) -> Result<ChunkIndex> {
        self.check_usable()?;
        let map = self.resource_map()?;
        self.segment
            .shared_pool()
            .acquire_linked_counted(self.owner, Some(&map), count, timeout)
    }

    /// Return a chain this client owns. An empty chain is a no-op.
    pub fn release_linked(&self, head: ChunkIndex) -> Result<usize> {
        if head == LINK_TERMINATOR {
            return Ok(0);
        }
        let map = self.resource_map()?;
        if !map.owns_chunk(head) {
            warn!(client = self.number, chunk = head, "releasing chunk not owned by client");
            return Err(Error::NotOwner { kind: "chunk", index: head });
        }
        self.segment
            .shared_pool()
            .release_linked(self.owner, Some(&map), head, self.lock_timeout)
    }

    pub fn write_message(&self, head: ChunkIndex, bytes: &[u8]) -> Result<()> {
        self.segment.chunks().write_message(head, bytes)
    }

    pub fn read_message(&self, head: ChunkIndex) -> Result<Vec<u8>> {
        self.segment.chunks().read_message(head)
    }

    fn notify_scheduler_of(&self, channel: ChannelNumber) -> Result<bool> {
        Ok(self
            .segment
            .scheduler_interface(self.segment.scheduler_of(channel))?
            .notifier()
            .notify())
    }

    fn check_chunk(&self, head: ChunkIndex) -> Result<()> {
        if !self.resource_map()?.owns_chunk(head) {
            warn!(client = self.number, chunk = head, "pushing chunk not owned by client");
            return Err(Error::NotOwner { kind: "chunk", index: head });
        }
        Ok(())
    }

    /// Push a request, waiting up to `timeout` for room in the `in` ring
    pub fn push(&self, channel: ChannelNumber, head: ChunkIndex, timeout: Duration) -> Result<()> {
        self.check_usable()?;
        self.check_channel(channel)?;
        self.check_chunk(head)?;
        let ch = self.segment.channel(channel)?;
        if !ch.in_queue().push_timeout(head, timeout) {
            return Err(Error::Timeout(TimeoutKind::Channel));
        }
        self.notify_scheduler_of(channel)?;
        Ok(())
    }

    /// Push a request without waiting
    pub fn try_push(&self, channel: ChannelNumber, head: ChunkIndex) -> Result<()> {
        self.check_usable()?;
        self.check_channel(channel)?;
        self.check_chunk(head)?;
        if !self.segment.channel(channel)?.in_queue().try_push(head) {
            return Err(Error::WouldBlock);
        }
        self.notify_scheduler_of(channel)?;
        Ok(())
    }

    /// Pop a response without waiting
    pub fn try_pop(&self, channel: ChannelNumber) -> Result<Option<ChunkIndex>> {
        self.check_usable()?;
        self.check_channel(channel)?;
        let ch = self.segment.channel(channel)?;
        let popped = ch.out_queue().try_pop();
        if popped.is_some() && ch.overflow_len() > 0 {
            // Room for the overflow queue
            self.notify_scheduler_of(channel)?;
        }
        Ok(popped)
    }

    /// Pop a response, waiting up to `timeout`
    pub fn pop(&self, channel: ChannelNumber, timeout: Duration) -> Result<ChunkIndex> {
        let deadline = Instant::now() + timeout;
        let ch = self.segment.channel(channel)?;
        let interface = self.interface()?;
        loop {
            if let Some(head) = self.try_pop(channel)? {
                return Ok(head);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(TimeoutKind::Channel));
            }
            interface.notifier().wait_until(deadline - now, || {
                !ch.out_queue().is_empty()
                    || self.segment.database_state() != DatabaseState::Normal
                    || interface.is_marked_for_clean_up()
            });
        }
    }

    /// Block until a response or a wake-up arrives on any channel
    pub fn wait_for_work(&self, timeout: Duration) -> Result<()> {
        let interface = self.check_usable()?;
        let map = self.resource_map()?;
        let has_work = || {
            map.owned_channels().any(|c| {
                self.segment
                    .channel(c)
                    .map(|ch| !ch.out_queue().is_empty())
                    .unwrap_or(false)
            }) || self.segment.database_state() != DatabaseState::Normal
        };
        if interface.notifier().wait_until(timeout, has_work) {
            self.check_usable()?;
            Ok(())
        } else {
            Err(Error::Timeout(TimeoutKind::WaitForWork))
        }
    }

    /// Release every channel and chunk and give the slot back. Waits up to
    /// `timeout` for the schedulers to let go of the channels.
    pub fn close(&mut self, timeout: Duration) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let interface = self.interface()?;
        if interface.owner() != self.owner {
            // Reclaimed by someone else
            self.closed = true;
            return Ok(());
        }
        let map = self.resource_map()?;
        for channel in map.owned_channels() {
            match self.release_channel(channel) {
                // Torn down meanwhile
                Ok(()) | Err(Error::NotOwner { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let deadline = Instant::now() + timeout;
        while interface.allocated_channels() > 0 {
            if self.segment.common().active_schedulers() == 0 {
                // Nobody else will tear them down
                for channel in map.owned_channels() {
                    if self.segment.channel(channel)?.is_ready_for_release() {
                        tear_down_channel(&self.segment, self.owner, channel)?;
                    }
                }
                if interface.allocated_channels() == 0 {
                    break;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    client = self.number,
                    channels = interface.allocated_channels(),
                    "channels still held at close"
                );
                return Err(Error::Timeout(TimeoutKind::Channel));
            }
            interface
                .notifier()
                .wait_until((deadline - now).min(Duration::from_millis(10)), || {
                    interface.allocated_channels() == 0
                });
        }

        reclaim_client_slot(&self.segment, self.owner, self.number)?;
        self.closed = true;
        debug!(segment = self.segment.name(), client = self.number, "client closed");
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = self.close(DROP_CLOSE_TIMEOUT) {
            warn!(client = self.number, error = %e, "client close on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentConfig;

    fn segment() -> Arc<Segment> {
        Arc::new(
            Segment::create_local(
                "chunkipc_CLIENT_1",
                SegmentConfig::new().chunks(64).schedulers(2).channels(8).clients(2),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_open_takes_slot() {
        let segment = segment();
        let a = Client::open(Arc::clone(&segment), OwnerId::new(5)).unwrap();
        let b = Client::open(Arc::clone(&segment), OwnerId::new(6)).unwrap();
        assert_ne!(a.number(), b.number());
        assert!(matches!(
            Client::open(Arc::clone(&segment), OwnerId::new(7)),
            Err(Error::NoFreeClientSlot)
        ));
        drop(a);
        assert_eq!(segment.common().free_client_numbers(), 1);
    }

    #[test]
    fn test_invalid_owner_is_refused() {
        let segment = segment();
        assert!(Client::open(Arc::clone(&segment), OwnerId::NONE).is_err());
        assert!(Client::open(segment, OwnerId::new(5).with_clean_up()).is_err());
    }

    #[test]
    fn test_acquire_channel_sets_bits() {
        let segment = segment();
        let client = Client::open(Arc::clone(&segment), OwnerId::new(5)).unwrap();
        let ch = client.acquire_channel(1).unwrap();
        assert_eq!(ch, 1);
        assert!(client.owns_channel(ch));
        assert_eq!(client.allocated_channels(), 1);
        let scheduler = segment.scheduler_interface(1).unwrap();
        assert_ne!(scheduler.channel_mask_word(0) & (1 << ch), 0);
        assert_eq!(segment.channel(ch).unwrap().owner(), OwnerId::new(5));
    }

    #[test]
    fn test_no_free_channel() {
        let segment = segment();
        let client = Client::open(Arc::clone(&segment), OwnerId::new(5)).unwrap();
        for _ in 0..4 {
            client.acquire_channel(0).unwrap();
        }
        assert!(matches!(client.acquire_channel(0), Err(Error::NoFreeChannel { scheduler: 0 })));
    }

    #[test]
    fn test_foreign_channel_is_refused() {
        let segment = segment();
        let a = Client::open(Arc::clone(&segment), OwnerId::new(5)).unwrap();
        let b = Client::open(Arc::clone(&segment), OwnerId::new(6)).unwrap();
        let ch = a.acquire_channel(0).unwrap();
        let head = b.acquire_linked(10, Duration::ZERO).unwrap();
        assert!(matches!(b.try_push(ch, head), Err(Error::NotOwner { .. })));
        assert!(matches!(a.release_linked(head), Err(Error::NotOwner { .. })));
    }

    #[test]
    fn test_push_of_unowned_chunk_is_refused() {
        let segment = segment();
        let a = Client::open(Arc::clone(&segment), OwnerId::new(5)).unwrap();
        let b = Client::open(Arc::clone(&segment), OwnerId::new(6)).unwrap();
        let ch = a.acquire_channel(0).unwrap();
        assert_eq!(a.acquire_linked(1, Duration::ZERO).unwrap(), 0);

        // Chunk 40 is still in the free pool
        assert!(matches!(a.try_push(ch, 40), Err(Error::NotOwner { kind: "chunk", index: 40 })));
        assert!(matches!(
            a.push(ch, 40, Duration::ZERO),
            Err(Error::NotOwner { kind: "chunk", index: 40 })
        ));
        // Held by another client
        let foreign = b.acquire_linked(1, Duration::ZERO).unwrap();
        assert!(matches!(a.try_push(ch, foreign), Err(Error::NotOwner { .. })));
        assert!(matches!(a.push(ch, foreign, Duration::ZERO), Err(Error::NotOwner { .. })));
        assert!(matches!(a.try_push(ch, LINK_TERMINATOR), Err(Error::NotOwner { .. })));

        assert!(segment.channel(ch).unwrap().in_queue().is_empty());
        assert_eq!(segment.shared_pool().len(), 62);
    }

    #[test]
    fn test_try_push_would_block() {
        let segment = segment();
        let client = Client::open(Arc::clone(&segment), OwnerId::new(5)).unwrap();
        let ch = client.acquire_channel(0).unwrap();
        let head = client.acquire_linked(1, Duration::ZERO).unwrap();
        for _ in 0..255 {
            client.try_push(ch, head).unwrap();
        }
        assert!(matches!(client.try_push(ch, head), Err(Error::WouldBlock)));
        assert!(matches!(
            client.pop(ch, Duration::from_millis(5)),
            Err(Error::Timeout(TimeoutKind::Channel))
        ));
    }

    #[test]
    fn test_chunks_are_tracked() {
        let segment = segment();
        let client = Client::open(Arc::clone(&segment), OwnerId::new(5)).unwrap();
        let head = client.acquire_linked_counted(3, Duration::ZERO).unwrap();
        assert_eq!(client.resource_map().unwrap().count_owned_chunks(), 3);
        client.write_message(head, b"hello").unwrap();
        assert_eq!(client.read_message(head).unwrap(), b"hello");
        assert_eq!(client.release_linked(head).unwrap(), 3);
        assert_eq!(client.release_linked(LINK_TERMINATOR).unwrap(), 0);
        assert!(client.resource_map().unwrap().is_empty());
    }

    #[test]
    fn test_close_without_schedulers_releases_everything() {
        let segment = segment();
        let mut client = Client::open(Arc::clone(&segment), OwnerId::new(5)).unwrap();
        client.acquire_channel(0).unwrap();
        client.acquire_channel(1).unwrap();
        client.acquire_linked_counted(4, Duration::ZERO).unwrap();
        client.close(Duration::from_millis(100)).unwrap();

        assert_eq!(segment.shared_pool().len(), 64);
        assert_eq!(segment.common().free_client_numbers(), 2);
        assert_eq!(segment.scheduler_interface(0).unwrap().free_channel_count(), 4);
        assert_eq!(segment.scheduler_interface(1).unwrap().free_channel_count(), 4);
        // 重复关闭无副作用
        client.close(Duration::ZERO).unwrap();
    }

    #[test]
    fn test_close_races_monitor_teardown() {
        let segment = Arc::new(
            Segment::create_local(
                "chunkipc_CLIENT_1",
                SegmentConfig::new().chunks(64).schedulers(1).channels(4).clients(2),
            )
            .unwrap(),
        );
        for _ in 0..100 {
            let mut client = Client::open(Arc::clone(&segment), OwnerId::new(5)).unwrap();
            let ch = client.acquire_channel(0).unwrap();
            client.acquire_linked_counted(2, Duration::ZERO).unwrap();
            segment.channel(ch).unwrap().mark_for_release();

            let barrier = std::sync::Barrier::new(2);
            std::thread::scope(|s| {
                let closing = &mut client;
                let barrier = &barrier;
                let segment = &segment;
                s.spawn(move || {
                    barrier.wait();
                    closing.close(Duration::from_secs(1)).unwrap();
                });
                s.spawn(move || {
                    barrier.wait();
                    tear_down_channel(segment, OwnerId::ANONYMOUS, ch).unwrap();
                });
            });

            assert!(segment.channel(ch).unwrap().owner().is_none());
            assert_eq!(segment.scheduler_interface(0).unwrap().free_channel_count(), 4);
            assert_eq!(segment.common().free_client_numbers(), 2);
            assert_eq!(segment.shared_pool().len(), 64);
        }
    }

    #[test]
    fn test_marked_client_is_refused() {
        let segment = segment();
        let client = Client::open(Arc::clone(&segment), OwnerId::new(5)).unwrap();
        segment
            .client_interface(client.number())
            .unwrap()
            .owner_slot()
            .mark_for_clean_up();
        assert!(matches!(client.acquire_channel(0), Err(Error::MarkedForCleanUp(_))));
        assert!(matches!(
            client.acquire_linked(1, Duration::ZERO),
            Err(Error::MarkedForCleanUp(_))
        ));
    }

    #[test]
    fn test_database_crash_surfaces() {
        let segment = segment();
        let client = Client::open(Arc::clone(&segment), OwnerId::new(5)).unwrap();
        let ch = client.acquire_channel(0).unwrap();
        segment.common().set_database_state(DatabaseState::TerminatedUnexpectedly);
        assert!(matches!(client.pop(ch, Duration::from_millis(5)), Err(Error::DatabaseTerminated)));
        assert!(matches!(
            Client::open(Arc::clone(&segment), OwnerId::new(6)),
            Err(Error::DatabaseTerminated)
        ));
    }
}
