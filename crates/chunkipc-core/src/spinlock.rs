//! Owner-tagged robust spinlock
//!
//! The lock word is 0 when unlocked and holds the holder's owner id when
//! locked. A third party that knows an owner is dead can clear a lock tagged
//! with that owner without touching locks held by live owners.

use crate::owner_id::OwnerId;
use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const UNLOCKED: u64 = 0;

/// Spinlock living in shared memory
#[repr(C)]
pub struct RobustSpinlock {
    word: AtomicU64,
}

impl RobustSpinlock {
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(UNLOCKED),
        }
    }

    fn tag(owner: OwnerId) -> u64 {
        // An untagged lock would look unlocked, so NONE locks as ANONYMOUS.
        owner.id().max(OwnerId::ANONYMOUS.id())
    }

    /// Try to take the lock once
    pub fn try_lock(&self, owner: OwnerId) -> bool {
        self.word
            .compare_exchange(UNLOCKED, Self::tag(owner), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Spin until the lock is taken, yielding the thread once spinning gets long
    pub fn lock(&self, owner: OwnerId) {
        let backoff = Backoff::new();
        while !self.try_lock(owner) {
            while self.word.load(Ordering::Relaxed) != UNLOCKED {
                backoff.snooze();
            }
        }
    }

    /// Spin until the lock is taken or `timeout` elapses
    pub fn lock_timeout(&self, owner: OwnerId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            if self.try_lock(owner) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            backoff.snooze();
            if backoff.is_completed() {
                std::thread::yield_now();
            }
        }
    }

    /// Release the lock if `owner` holds it
    pub fn unlock(&self, owner: OwnerId) -> bool {
        self.word
            .compare_exchange(Self::tag(owner), UNLOCKED, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    /// Clear the lock if it is held by `dead`. Only called by the monitor
    /// once `dead` is confirmed to have exited.
    pub fn force_unlock_if_owned_by(&self, dead: OwnerId) -> bool {
        if dead.is_none() {
            return false;
        }
        self.word
            .compare_exchange(dead.id(), UNLOCKED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Current holder, if any
    pub fn holder(&self) -> Option<OwnerId> {
        match self.word.load(Ordering::Acquire) {
            UNLOCKED => None,
            id => Some(OwnerId::new(id)),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.holder().is_some()
    }

    /// Take the lock and return a guard that releases it on drop
    pub fn guard(&self, owner: OwnerId, timeout: Duration) -> Option<SpinlockGuard<'_>> {
        if self.lock_timeout(owner, timeout) {
            Some(SpinlockGuard { lock: self, owner })
        } else {
            None
        }
    }
}

impl Default for RobustSpinlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped holder of a [`RobustSpinlock`]
pub struct SpinlockGuard<'a> {
    lock: &'a RobustSpinlock,
    owner: OwnerId,
}

impl SpinlockGuard<'_> {
    pub fn owner(&self) -> OwnerId {
        self.owner
    }
}

impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock(self.owner);
    }
}
