//! chunkipc - Shared-memory chunk channels between clients and database schedulers
//!
//! A database process creates a [`Segment`]: an arena of fixed-size chunks
//! plus the channels, client slots and scheduler interfaces that index into
//! it. Clients send chunk chains over channels with a [`Client`], schedulers
//! answer them with a [`Scheduler`], and a [`Monitor`] reclaims whatever a
//! crashed peer left behind.

pub mod channel;
pub mod chunk;
pub mod chunk_pool;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod interface;
pub mod memory;
pub mod monitor;
pub mod owner_id;
pub mod reclaim;
pub mod resource_map;
pub mod ring;
pub mod scheduler;
pub mod segment;
pub mod shm;
pub mod spinlock;

pub use channel::{Channel, ChannelNumber, ChannelState};
pub use chunk::{ChunkIndex, CHUNK_PAYLOAD, LINK_TERMINATOR};
pub use client::Client;
pub use config::{MonitorConfig, SegmentConfig, CHUNK_SIZE};
pub use error::{Error, Result, TimeoutKind};
pub use interface::DatabaseState;
pub use monitor::{Monitor, MonitorLink, ProcessKind};
pub use owner_id::OwnerId;
pub use scheduler::{Delivery, Request, Scheduler};
pub use segment::{database_segment_name, Segment};
