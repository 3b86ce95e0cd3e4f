//! Scheduler side of a database segment
//!
//! A scheduler owns the channels whose numbers map to it and serves them
//! round-robin: each poll resumes the scan after the channel served last.
//! Channels marked for release are torn down as soon as they are
//! tranquil, and while any client slot awaits clean-up every poll first
//! sweeps all of the scheduler's channels for such channels.

use crate::channel::ChannelNumber;
use crate::chunk::ChunkIndex;
use crate::chunk_pool::PrivatePool;
use crate::interface::SchedulerInterface;
use crate::owner_id::OwnerId;
use crate::reclaim::{reclaim_client_slot, tear_down_channel};
use crate::segment::Segment;
use crate::{Error, Result, TimeoutKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Longest a waiting scheduler sleeps between checks for work
pub const WAKE_LATENCY: Duration = Duration::from_micros(100);

/// A request popped from a channel's `in` ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub channel: ChannelNumber,
    pub head: ChunkIndex,
}

/// What happened to a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Pushed to the `out` ring
    Delivered,
    /// Queued on the overflow queue
    Overflowed,
    /// The client is gone; its chunks are reclaimed with its slot
    Discarded,
}

/// Serves the channels of one scheduler number
pub struct Scheduler {
    segment: Arc<Segment>,
    number: u32,
    owner: OwnerId,
    next_channel: u32,
}

impl Scheduler {
    /// Attach to scheduler `number`. Only one scheduler may be attached to a
    /// number at a time.
    pub fn attach(segment: Arc<Segment>, number: u32) -> Result<Self> {
        let interface = segment.scheduler_interface(number)?;
        if interface.set_active(true) {
            warn!(segment = segment.name(), scheduler = number, "scheduler already attached");
            return Err(Error::RegistrationRefused(format!("scheduler {} already attached", number)));
        }
        let owner = match interface.owner() {
            owner if owner.is_none() => OwnerId::ANONYMOUS,
            owner => owner,
        };
        segment.common().increment_active_schedulers();
        debug!(segment = segment.name(), scheduler = number, %owner, "scheduler attached");
        Ok(Self {
            segment,
            number,
            owner,
            next_channel: number,
        })
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    fn interface(&self) -> Result<&SchedulerInterface> {
        self.segment.scheduler_interface(self.number)
    }

    /// Full passes over the poll mask so far
    pub fn scan_counter(&self) -> u64 {
        self.interface().map(|i| i.scan_counter()).unwrap_or(0)
    }

    fn is_polled(&self, interface: &SchedulerInterface, channel: ChannelNumber) -> bool {
        interface.channel_mask_word((channel >> 6) as usize) & (1 << (channel & 63)) != 0
    }

    /// Channel numbers currently on the poll mask
    fn polled_channels(&self) -> Result<Vec<ChannelNumber>> {
        let interface = self.interface()?;
        Ok((0..self.segment.config().channels as u32)
            .filter(|&c| self.is_polled(interface, c))
            .collect())
    }

    /// Next request to serve, if any. Takes a server reference on the
    /// channel; drop it with [`Scheduler::release_reference`] once the
    /// response is out.
    pub fn poll(&mut self) -> Result<Option<Request>> {
        let segment = Arc::clone(&self.segment);
        let interface = segment.scheduler_interface(self.number)?;
        interface.notifier().acknowledge();
        if segment.common().client_interfaces_to_clean_up() > 0 {
            self.sweep()?;
        }

        let channels = segment.config().channels as u32;
        let store = segment.chunks();
        for step in 0..channels {
            let channel = (self.next_channel + step) % channels;
            if !self.is_polled(interface, channel) {
                continue;
            }
            let ch = segment.channel(channel)?;
            if ch.is_to_be_released() {
                if ch.is_ready_for_release() {
                    self.release_channel_now(channel)?;
                }
                continue;
            }

            // Older responses go out before new work is taken
            if ch.overflow_len() > 0 && ch.drain_overflow(&store) > 0 {
                segment
                    .client_interface(ch.client_number())?
                    .notifier()
                    .notify();
            }

            if let Some(head) = ch.in_queue().try_pop() {
                ch.add_server_ref();
                self.next_channel = (channel + 1) % channels;
                trace!(scheduler = self.number, channel, head, "request popped");
                return Ok(Some(Request { channel, head }));
            }
        }
        interface.increment_scan_counter();
        Ok(None)
    }

    /// Release every polled channel that is marked and tranquil
    pub fn sweep(&self) -> Result<usize> {
        let mut released = 0;
        for channel in self.polled_channels()? {
            if self.segment.channel(channel)?.is_ready_for_release() && self.release_channel_now(channel)? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Send a response chain to the client on `channel`. The chain's chunks
    /// become the client's.
    pub fn respond(&self, channel: ChannelNumber, head: ChunkIndex) -> Result<Delivery> {
        let ch = self.segment.channel(channel)?;
        if ch.owner().is_none() {
            return Err(Error::NotOwner { kind: "channel", index: channel });
        }
        let client_number = ch.client_number();
        let client = self.segment.client_interface(client_number)?;
        let map = self.segment.resource_map(client_number)?;
        let store = self.segment.chunks();
        for index in store.chain(head) {
            map.set_chunk_flag(index?);
        }

        if client.is_marked_for_clean_up() {
            debug!(scheduler = self.number, channel, head, "response to dead client discarded");
            return Ok(Delivery::Discarded);
        }
        let delivery = if ch.push_response(&store, head)? {
            Delivery::Delivered
        } else {
            trace!(scheduler = self.number, channel, overflow = ch.overflow_len(), "response overflowed");
            Delivery::Overflowed
        };
        client.notifier().notify();
        Ok(delivery)
    }

    /// Drop the server reference taken by [`Scheduler::poll`]. A channel
    /// marked for release is torn down when the last reference goes.
    pub fn release_reference(&self, channel: ChannelNumber) -> Result<u32> {
        let ch = self.segment.channel(channel)?;
        let refs = ch.release_server_ref();
        if refs == 0 && ch.is_ready_for_release() {
            self.release_channel_now(channel)?;
        }
        Ok(refs)
    }

    /// Return a request chain the scheduler is done with to the shared pool
    pub fn release_request(&self, channel: ChannelNumber, head: ChunkIndex) -> Result<usize> {
        let client_number = self.segment.channel(channel)?.client_number();
        let map = self.segment.resource_map(client_number)?;
        self.segment
            .shared_pool()
            .release_linked(self.owner, Some(&map), head, Duration::from_millis(100))
    }

    /// This scheduler's private chunk pool
    pub fn private_pool(&self) -> Result<PrivatePool<'_>> {
        let interface = self.interface()?;
        Ok(PrivatePool::new(
            &interface.private_pool,
            self.segment.shared_pool(),
            self.owner,
            self.segment.config(),
        ))
    }

    fn has_work(&self) -> bool {
        let Ok(channels) = self.polled_channels() else {
            return false;
        };
        channels.into_iter().any(|c| match self.segment.channel(c) {
            Ok(ch) => !ch.in_queue().is_empty() || ch.is_ready_for_release(),
            Err(_) => false,
        })
    }

    /// Sleep until a client pushes, the monitor asks for a clean-up sweep,
    /// or `timeout` elapses. A push is noticed within [`WAKE_LATENCY`].
    pub fn wait_for_work(&self, timeout: Duration) -> Result<()> {
        let notifier = self.interface()?.notifier();
        if notifier.wait_until_with_latency(timeout, WAKE_LATENCY, || self.has_work()) {
            Ok(())
        } else {
            Err(Error::Timeout(TimeoutKind::WaitForWork))
        }
    }

    /// Tear `channel` down now and, if it was the last channel of a client
    /// awaiting clean-up, reclaim the client slot. False if someone else
    /// got to the channel first.
    fn release_channel_now(&self, channel: ChannelNumber) -> Result<bool> {
        let Some(torn) = tear_down_channel(&self.segment, self.owner, channel)? else {
            return Ok(false);
        };
        let client = self.segment.client_interface(torn.client_number)?;
        if client.is_marked_for_clean_up() {
            info!(
                segment = self.segment.name(),
                scheduler = self.number,
                channel,
                client = torn.client_number,
                discarded = torn.discarded.total(),
                "released channel of dead client"
            );
            if torn.channels_left == 0 {
                reclaim_client_slot(&self.segment, self.owner, torn.client_number)?;
            }
        } else {
            // A closing client waits for its channels
            client.notifier().notify();
        }
        Ok(true)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Ok(pool) = self.private_pool() {
            if let Err(e) = pool.return_all() {
                warn!(scheduler = self.number, error = %e, "private pool not returned");
            }
        }
        if let Ok(interface) = self.interface() {
            interface.set_active(false);
        }
        self.segment.common().decrement_active_schedulers();
        debug!(segment = self.segment.name(), scheduler = self.number, "scheduler detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::config::SegmentConfig;
    use std::time::Instant;

    fn segment() -> Arc<Segment> {
        Arc::new(
            Segment::create_local(
                "chunkipc_SCHED_1",
                SegmentConfig::new().chunks(128).schedulers(1).channels(8).clients(4),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_attach_once() {
        let segment = segment();
        let s = Scheduler::attach(Arc::clone(&segment), 0).unwrap();
        assert_eq!(segment.common().active_schedulers(), 1);
        assert!(Scheduler::attach(Arc::clone(&segment), 0).is_err());
        assert!(Scheduler::attach(Arc::clone(&segment), 1).is_err());
        drop(s);
        assert_eq!(segment.common().active_schedulers(), 0);
        assert!(Scheduler::attach(segment, 0).is_ok());
    }

    #[test]
    fn test_request_response() {
        let segment = segment();
        let client = Client::open(Arc::clone(&segment), OwnerId::new(5)).unwrap();
        let mut scheduler = Scheduler::attach(Arc::clone(&segment), 0).unwrap();
        let ch = client.acquire_channel(0).unwrap();
        let head = client.acquire_linked(100, Duration::ZERO).unwrap();
        client.write_message(head, b"ping").unwrap();
        client.push(ch, head, Duration::from_millis(10)).unwrap();

        let request = scheduler.poll().unwrap().unwrap();
        assert_eq!(request, Request { channel: ch, head });
        assert_eq!(segment.channel(ch).unwrap().server_refs(), 1);
        assert_eq!(client.read_message(request.head).unwrap(), b"ping");

        let pool = scheduler.private_pool().unwrap();
        let reply = pool.acquire_linked(4, Duration::ZERO).unwrap();
        segment.chunks().write_message(reply, b"pong").unwrap();
        assert_eq!(scheduler.respond(ch, reply).unwrap(), Delivery::Delivered);
        scheduler.release_request(ch, request.head).unwrap();
        assert_eq!(scheduler.release_reference(ch).unwrap(), 0);

        let got = client.pop(ch, Duration::from_millis(10)).unwrap();
        assert_eq!(client.read_message(got).unwrap(), b"pong");
        assert!(client.resource_map().unwrap().owns_chunk(reply));
        assert!(!client.resource_map().unwrap().owns_chunk(head));
        client.release_linked(got).unwrap();
    }

    #[test]
    fn test_round_robin() {
        let segment = segment();
        let client = Client::open(Arc::clone(&segment), OwnerId::new(5)).unwrap();
        let mut scheduler = Scheduler::attach(Arc::clone(&segment), 0).unwrap();
        let a = client.acquire_channel(0).unwrap();
        let b = client.acquire_channel(0).unwrap();
        let heads: Vec<ChunkIndex> = (0..3)
            .map(|_| client.acquire_linked_counted(1, Duration::ZERO).unwrap())
            .collect();
        for &head in &heads[..2] {
            client.try_push(a, head).unwrap();
        }
        client.try_push(b, heads[2]).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| scheduler.poll().unwrap())
            .map(|r| (r.channel, r.head))
            .collect();
        assert_eq!(order, vec![(a, heads[0]), (b, heads[2]), (a, heads[1])]);
        for (channel, head) in order {
            assert_eq!(scheduler.release_request(channel, head).unwrap(), 1);
            scheduler.release_reference(channel).unwrap();
        }
        assert!(client.resource_map().unwrap().is_empty());
        assert_eq!(segment.shared_pool().len(), 128);
    }

    #[test]
    fn test_release_request_refuses_unowned_chain() {
        let segment = segment();
        let client = Client::open(Arc::clone(&segment), OwnerId::new(5)).unwrap();
        let other = Client::open(Arc::clone(&segment), OwnerId::new(6)).unwrap();
        let mut scheduler = Scheduler::attach(Arc::clone(&segment), 0).unwrap();
        let ch = client.acquire_channel(0).unwrap();
        assert_eq!(client.acquire_linked_counted(1, Duration::ZERO).unwrap(), 0);
        let foreign = other.acquire_linked_counted(1, Duration::ZERO).unwrap();

        // A misbehaving client writes to its ring directly
        let ring = segment.channel(ch).unwrap().in_queue();
        assert!(ring.try_push(40));
        assert!(ring.try_push(foreign));

        let request = scheduler.poll().unwrap().unwrap();
        assert_eq!(request.head, 40);
        assert!(matches!(
            scheduler.release_request(ch, request.head),
            Err(Error::NotOwner { kind: "chunk", index: 40 })
        ));
        let request = scheduler.poll().unwrap().unwrap();
        assert!(matches!(
            scheduler.release_request(ch, request.head),
            Err(Error::NotOwner { .. })
        ));
        assert!(other.resource_map().unwrap().owns_chunk(foreign));
        assert_eq!(segment.shared_pool().len(), 126);
        scheduler.release_reference(ch).unwrap();
        scheduler.release_reference(ch).unwrap();

        let mut free = Vec::new();
        segment
            .shared_pool()
            .pop_batch(OwnerId::ANONYMOUS, 128, &mut free, Duration::from_millis(10))
            .unwrap();
        assert_eq!(free.len(), 126);
        assert_eq!(free.iter().filter(|&&i| i == 40).count(), 1);
    }

    #[test]
    fn test_scan_counter_counts_idle_passes() {
        let segment = segment();
        let mut scheduler = Scheduler::attach(Arc::clone(&segment), 0).unwrap();
        assert_eq!(scheduler.poll().unwrap(), None);
        assert_eq!(scheduler.poll().unwrap(), None);
        assert_eq!(scheduler.scan_counter(), 2);
    }

    #[test]
    fn test_marked_channel_waits_for_tranquility() {
        let segment = segment();
        let client = Client::open(Arc::clone(&segment), OwnerId::new(5)).unwrap();
        let mut scheduler = Scheduler::attach(Arc::clone(&segment), 0).unwrap();
        let ch = client.acquire_channel(0).unwrap();
        let head = client.acquire_linked_counted(1, Duration::ZERO).unwrap();
        client.try_push(ch, head).unwrap();
        scheduler.poll().unwrap().unwrap();

        client.release_channel(ch).unwrap();
        assert_eq!(scheduler.poll().unwrap(), None);
        assert!(client.owns_channel(ch));
        assert_eq!(scheduler.release_reference(ch).unwrap(), 0);
        assert!(!client.owns_channel(ch));
        assert_eq!(client.allocated_channels(), 0);
    }

    #[test]
    fn test_wait_for_work_times_out() {
        let segment = segment();
        let scheduler = Scheduler::attach(Arc::clone(&segment), 0).unwrap();
        let start = Instant::now();
        assert!(matches!(
            scheduler.wait_for_work(Duration::from_millis(20)),
            Err(Error::Timeout(TimeoutKind::WaitForWork))
        ));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_for_work_wakes_on_push() {
        let segment = segment();
        let client = Client::open(Arc::clone(&segment), OwnerId::new(5)).unwrap();
        let scheduler = Scheduler::attach(Arc::clone(&segment), 0).unwrap();
        let ch = client.acquire_channel(0).unwrap();
        let head = client.acquire_linked_counted(1, Duration::ZERO).unwrap();
        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(10));
                client.try_push(ch, head).unwrap();
            });
            let start = Instant::now();
            scheduler.wait_for_work(Duration::from_secs(5)).unwrap();
            assert!(start.elapsed() < Duration::from_secs(1));
        });
    }

    #[test]
    fn test_drop_returns_private_pool() {
        let segment = segment();
        let scheduler = Scheduler::attach(Arc::clone(&segment), 0).unwrap();
        scheduler.private_pool().unwrap().refill(64).unwrap();
        assert_eq!(segment.shared_pool().len(), 64);
        drop(scheduler);
        assert_eq!(segment.shared_pool().len(), 128);
    }
}
