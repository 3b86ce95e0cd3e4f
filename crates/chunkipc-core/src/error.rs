//! Error types for chunkipc

use crate::owner_id::OwnerId;
use std::fmt;
use thiserror::Error;

/// What a timed-out operation was waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Waiting for the monitor to hand out an owner id
    Registration,
    /// Waiting for the monitor to acknowledge an unregistration
    Unregistration,
    /// Waiting for the global monitor lock or the in/out records
    Rendezvous,
    /// Waiting for a robust spinlock
    Spinlock,
    /// Waiting for a notification on a client or scheduler interface
    WaitForWork,
    /// Waiting for the shared chunk pool to supply enough chunks
    ChunkAcquisition,
    /// Waiting for a channel queue to accept or yield an item
    Channel,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeoutKind::Registration => "registration",
            TimeoutKind::Unregistration => "unregistration",
            TimeoutKind::Rendezvous => "monitor rendezvous",
            TimeoutKind::Spinlock => "spinlock",
            TimeoutKind::WaitForWork => "wait for work",
            TimeoutKind::ChunkAcquisition => "chunk acquisition",
            TimeoutKind::Channel => "channel",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("bad segment: {0}")]
    BadSegment(String),

    #[error("{kind} index {index} out of range")]
    IndexOutOfRange { kind: &'static str, index: u32 },

    #[error("owner id mismatch: expected {expected}, got {actual}")]
    OwnerMismatch { expected: OwnerId, actual: OwnerId },

    #[error("owner {0} is marked for clean up")]
    MarkedForCleanUp(OwnerId),

    #[error("{kind} {index} is not owned by this client")]
    NotOwner { kind: &'static str, index: u32 },

    #[error("chunk pool exhausted: requested {requested}, available {available}")]
    ChunkPoolExhausted { requested: usize, available: usize },

    #[error("no free channel on scheduler {scheduler}")]
    NoFreeChannel { scheduler: u32 },

    #[error("no free client slot")]
    NoFreeClientSlot,

    #[error("operation would block")]
    WouldBlock,

    #[error("timed out: {0}")]
    Timeout(TimeoutKind),

    #[error("registration refused: {0}")]
    RegistrationRefused(String),

    #[error("database terminated unexpectedly")]
    DatabaseTerminated,

    #[error("malformed chunk chain: {0}")]
    BadChain(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
