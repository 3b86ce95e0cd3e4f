//! Client and scheduler interface records
//!
//! One [`ClientInterface`] per client slot and one [`SchedulerInterface`]
//! per scheduler live in the segment, plus a single
//! [`CommonClientInterface`] shared by all clients of a database.

use crate::event::{Event, MAX_SLEEP};
use crate::owner_id::{AtomicOwnerId, OwnerId};
use crate::resource_map::CHANNEL_WORDS;
use crate::ring::{BoundedRing, LockedRing};
use crate::config::PRIVATE_POOL_SLOTS;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Ring slots of a scheduler's free channel queue; holds every channel
pub const FREE_CHANNEL_SLOTS: usize = 512;

/// Ring slots of the free client number queue; holds every client slot
pub const FREE_CLIENT_SLOTS: usize = 512;

/// Wake-up flag plus event
///
/// A waiter raises the flag, re-checks for work and then blocks on the
/// event. A notifier only sets the event while the flag is raised, so a
/// busy peer costs one load per notification.
#[repr(C)]
pub struct Notifier {
    waiting: AtomicU32,
    event: Event,
}

impl Notifier {
    pub const fn new() -> Self {
        Self {
            waiting: AtomicU32::new(0),
            event: Event::new(),
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst) != 0
    }

    /// Wake the peer if it is waiting. Returns true if the event was set.
    pub fn notify(&self) -> bool {
        // Orders the caller's queue write before the flag load.
        fence(Ordering::SeqCst);
        if self.is_waiting() {
            self.event.set();
            true
        } else {
            false
        }
    }

    /// Set the event whether or not the peer is waiting
    pub fn force_notify(&self) {
        self.event.set();
    }

    /// Consume a pending notification. True if there was one.
    pub fn acknowledge(&self) -> bool {
        self.event.wait(Duration::ZERO)
    }

    /// True if a forced notification is still pending
    pub fn is_pending(&self) -> bool {
        self.event.is_set()
    }

    /// Wait until `ready` holds, a notification arrives or `timeout`
    /// elapses. Returns the final value of `ready`, or true if woken.
    /// A notification is seen up to [`MAX_SLEEP`] late.
    pub fn wait_until(&self, timeout: Duration, ready: impl FnMut() -> bool) -> bool {
        self.wait_until_with_latency(timeout, MAX_SLEEP, ready)
    }

    /// [`Notifier::wait_until`] with the event's sleep slice capped at
    /// `latency`
    pub fn wait_until_with_latency(
        &self,
        timeout: Duration,
        latency: Duration,
        mut ready: impl FnMut() -> bool,
    ) -> bool {
        if ready() {
            return true;
        }
        self.waiting.store(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        if ready() {
            self.waiting.store(0, Ordering::SeqCst);
            return true;
        }
        let woken = self.event.wait_with_latency(timeout, latency);
        self.waiting.store(0, Ordering::SeqCst);
        woken || ready()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Per client slot record
#[repr(C)]
pub struct ClientInterface {
    owner: AtomicOwnerId,
    pid: AtomicU32,
    allocated_channels: AtomicU32,
    /// Set by whoever reclaims the slot after a crash
    reclaim_claimed: AtomicU32,
    notifier: Notifier,
    /// Channel part of the resource map
    pub(crate) channel_words: [AtomicU64; CHANNEL_WORDS],
}

impl ClientInterface {
    pub fn owner(&self) -> OwnerId {
        self.owner.load()
    }

    pub(crate) fn owner_slot(&self) -> &AtomicOwnerId {
        &self.owner
    }

    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    /// Bind the slot to a new client
    pub(crate) fn open(&self, owner: OwnerId, pid: u32) {
        self.pid.store(pid, Ordering::Relaxed);
        self.allocated_channels.store(0, Ordering::Relaxed);
        self.reclaim_claimed.store(0, Ordering::Relaxed);
        self.owner.store(owner);
    }

    /// Unbind the slot
    pub(crate) fn close(&self) {
        self.pid.store(0, Ordering::Relaxed);
        self.owner.store(OwnerId::NONE);
    }

    pub fn is_marked_for_clean_up(&self) -> bool {
        self.owner.is_marked_for_clean_up()
    }

    pub fn allocated_channels(&self) -> u32 {
        self.allocated_channels.load(Ordering::Acquire)
    }

    pub(crate) fn increment_allocated_channels(&self) -> u32 {
        self.allocated_channels.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the channels left; never goes below 0
    pub(crate) fn decrement_allocated_channels(&self) -> u32 {
        match self
            .allocated_channels
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(prev) => prev - 1,
            Err(_) => 0,
        }
    }

    /// Claim the right to reclaim this slot. Only one caller wins.
    pub(crate) fn try_claim_reclaim(&self) -> bool {
        self.reclaim_claimed
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }
}

/// Per scheduler record
#[repr(C)]
pub struct SchedulerInterface {
    owner: AtomicOwnerId,
    active: AtomicU32,
    free_channels: LockedRing<FREE_CHANNEL_SLOTS>,
    /// Only the scheduler thread touches its private pool
    pub(crate) private_pool: BoundedRing<PRIVATE_POOL_SLOTS>,
    channel_mask: [AtomicU64; CHANNEL_WORDS],
    scan_counter: AtomicU64,
    notifier: Notifier,
}

impl SchedulerInterface {
    pub fn owner(&self) -> OwnerId {
        self.owner.load()
    }

    pub(crate) fn set_owner(&self, owner: OwnerId) {
        self.owner.store(owner);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) != 0
    }

    pub(crate) fn set_active(&self, active: bool) -> bool {
        self.active.swap(active as u32, Ordering::AcqRel) != 0
    }

    /// Return a channel number to the free queue
    pub fn push_free_channel(&self, owner: OwnerId, channel: u32, timeout: Duration) -> bool {
        self.free_channels.push(owner, channel, timeout)
    }

    /// Take a channel number from the free queue
    pub fn pop_free_channel(&self, owner: OwnerId, timeout: Duration) -> Option<u32> {
        self.free_channels.pop(owner, timeout)
    }

    pub fn free_channel_count(&self) -> usize {
        self.free_channels.size()
    }

    pub(crate) fn free_channels(&self) -> &LockedRing<FREE_CHANNEL_SLOTS> {
        &self.free_channels
    }

    pub fn set_channel_mask_bit(&self, channel: u32) {
        if let Some(word) = self.channel_mask.get((channel >> 6) as usize) {
            word.fetch_or(1 << (channel & 63), Ordering::AcqRel);
        }
    }

    pub fn clear_channel_mask_bit(&self, channel: u32) {
        if let Some(word) = self.channel_mask.get((channel >> 6) as usize) {
            word.fetch_and(!(1 << (channel & 63)), Ordering::AcqRel);
        }
    }

    pub fn channel_mask_word(&self, word: usize) -> u64 {
        self.channel_mask
            .get(word)
            .map_or(0, |w| w.load(Ordering::Acquire))
    }

    pub fn scan_counter(&self) -> u64 {
        self.scan_counter.load(Ordering::Relaxed)
    }

    pub(crate) fn increment_scan_counter(&self) -> u64 {
        self.scan_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn private_pool_len(&self) -> usize {
        self.private_pool.size()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Wake the scheduler so it runs a clean-up sweep. Returns true if it
    /// picked the signal up within `timeout`.
    pub fn notify_for_clean_up(&self, timeout: Duration) -> bool {
        self.notifier.force_notify();
        let deadline = Instant::now() + timeout;
        loop {
            if !self.notifier.is_pending() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }
}

/// State of the database process as seen by its clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DatabaseState {
    Normal = 0,
    TerminatedUnexpectedly = 1,
}

impl DatabaseState {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => DatabaseState::Normal,
            _ => DatabaseState::TerminatedUnexpectedly,
        }
    }
}

/// Record shared by all clients of a segment
#[repr(C)]
pub struct CommonClientInterface {
    client_numbers: LockedRing<FREE_CLIENT_SLOTS>,
    to_clean_up: AtomicU32,
    database_state: AtomicU32,
    active_schedulers: AtomicU32,
}

impl CommonClientInterface {
    pub fn acquire_client_number(&self, owner: OwnerId, timeout: Duration) -> Option<u32> {
        self.client_numbers.pop(owner, timeout)
    }

    pub fn release_client_number(&self, owner: OwnerId, number: u32, timeout: Duration) -> bool {
        self.client_numbers.push(owner, number, timeout)
    }

    pub fn free_client_numbers(&self) -> usize {
        self.client_numbers.size()
    }

    pub(crate) fn client_numbers(&self) -> &LockedRing<FREE_CLIENT_SLOTS> {
        &self.client_numbers
    }

    pub fn client_interfaces_to_clean_up(&self) -> u32 {
        self.to_clean_up.load(Ordering::Acquire)
    }

    pub(crate) fn increment_client_interfaces_to_clean_up(&self) -> u32 {
        self.to_clean_up.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn decrement_client_interfaces_to_clean_up(&self) -> u32 {
        match self
            .to_clean_up
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(prev) => prev - 1,
            Err(_) => 0,
        }
    }

    pub fn database_state(&self) -> DatabaseState {
        DatabaseState::from_u32(self.database_state.load(Ordering::Acquire))
    }

    pub fn set_database_state(&self, state: DatabaseState) {
        self.database_state.store(state as u32, Ordering::Release);
    }

    pub fn active_schedulers(&self) -> u32 {
        self.active_schedulers.load(Ordering::Acquire)
    }

    pub(crate) fn increment_active_schedulers(&self) -> u32 {
        self.active_schedulers.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn decrement_active_schedulers(&self) -> u32 {
        match self
            .active_schedulers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(prev) => prev - 1,
            Err(_) => 0,
        }
    }
}
