//! Owner ids of registered processes
//!
//! An owner id identifies one registered process. The top bit is the
//! clean-up flag, set once by the monitor when the process is confirmed
//! dead. The remaining bits are the id proper.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const CLEAN_UP_BIT: u64 = 1 << 63;
const ID_MASK: u64 = !CLEAN_UP_BIT;

/// Identifier of a registered process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct OwnerId(u64);

impl OwnerId {
    /// No owner. Free resources carry this id.
    pub const NONE: OwnerId = OwnerId(0);
    /// Lock holders that do not take part in crash recovery
    pub const ANONYMOUS: OwnerId = OwnerId(1);
    /// First id the monitor hands out
    pub const FIRST_ISSUED: u64 = 2;

    pub const fn new(id: u64) -> Self {
        Self(id & ID_MASK)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The id without the clean-up flag
    pub const fn id(self) -> u64 {
        self.0 & ID_MASK
    }

    pub const fn is_none(self) -> bool {
        self.id() == 0
    }

    pub const fn is_clean_up(self) -> bool {
        self.0 & CLEAN_UP_BIT != 0
    }

    /// Same id with the clean-up flag set
    pub const fn with_clean_up(self) -> Self {
        Self(self.0 | CLEAN_UP_BIT)
    }

    /// Same id with the clean-up flag cleared
    pub const fn without_clean_up(self) -> Self {
        Self(self.0 & ID_MASK)
    }

    /// True if both refer to the same process, ignoring the clean-up flag
    pub const fn same_owner(self, other: OwnerId) -> bool {
        self.id() == other.id()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean_up() {
            write!(f, "{}(clean-up)", self.id())
        } else {
            write!(f, "{}", self.id())
        }
    }
}

/// Owner id stored in shared memory
#[repr(transparent)]
pub struct AtomicOwnerId(AtomicU64);

impl AtomicOwnerId {
    pub const fn new(oid: OwnerId) -> Self {
        Self(AtomicU64::new(oid.raw()))
    }

    pub fn load(&self) -> OwnerId {
        OwnerId::from_raw(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, oid: OwnerId) {
        self.0.store(oid.raw(), Ordering::Release);
    }

    /// Set the clean-up flag. Returns true if this call set it.
    pub fn mark_for_clean_up(&self) -> bool {
        self.0.fetch_or(CLEAN_UP_BIT, Ordering::SeqCst) & CLEAN_UP_BIT == 0
    }

    pub fn is_marked_for_clean_up(&self) -> bool {
        self.load().is_clean_up()
    }
}

impl Default for AtomicOwnerId {
    fn default() -> Self {
        Self::new(OwnerId::NONE)
    }
}
