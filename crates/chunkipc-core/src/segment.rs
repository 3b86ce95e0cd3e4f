//! Database segment layout
//!
//! A segment is one flat region holding every shared structure of a
//! database: a header, the common client interface, the shared chunk pool,
//! client and scheduler interfaces, per-client chunk bitmaps, channels and
//! the chunk store. Records are reached through typed, bounds-checked
//! accessors computed from the header's configuration, never through raw
//! pointers kept by callers.

use crate::channel::Channel;
use crate::chunk::{Chunk, ChunkIndex, ChunkStore};
use crate::chunk_pool::{SharedChunkPool, SharedPoolHeader};
use crate::config::SegmentConfig;
use crate::interface::{ClientInterface, CommonClientInterface, DatabaseState, SchedulerInterface};
use crate::memory::{SegmentMemory, ALIGN};
use crate::owner_id::{AtomicOwnerId, OwnerId};
use crate::resource_map::{chunk_words, ResourceMap};
use crate::{Error, Result};
use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

const MAGIC: u32 = 0x4348_4B49; // "CHKI"
const VERSION: u32 = 1;

/// Prefix of every database segment name
pub const SEGMENT_PREFIX: &str = "chunkipc";

/// Lock timeout used while initializing a segment nobody else sees yet
const INIT_TIMEOUT: Duration = Duration::from_secs(1);

#[repr(C, align(64))]
struct SegmentHeader {
    magic: AtomicU32,
    version: AtomicU32,
    initialized: AtomicU32,
    database_pid: AtomicU32,
    chunks: AtomicU32,
    schedulers: AtomicU32,
    channels: AtomicU32,
    clients: AtomicU32,
    private_pool_refill_batch: AtomicU32,
    private_pool_high_water: AtomicU32,
    private_pool_trim_to: AtomicU32,
    small_chain_threshold: AtomicU32,
    database_owner: AtomicOwnerId,
    total_size: AtomicU64,
}

impl SegmentHeader {
    fn store_config(&self, config: &SegmentConfig) {
        self.chunks.store(config.chunks as u32, Ordering::Relaxed);
        self.schedulers.store(config.schedulers as u32, Ordering::Relaxed);
        self.channels.store(config.channels as u32, Ordering::Relaxed);
        self.clients.store(config.clients as u32, Ordering::Relaxed);
        self.private_pool_refill_batch
            .store(config.private_pool_refill_batch as u32, Ordering::Relaxed);
        self.private_pool_high_water
            .store(config.private_pool_high_water as u32, Ordering::Relaxed);
        self.private_pool_trim_to
            .store(config.private_pool_trim_to as u32, Ordering::Relaxed);
        self.small_chain_threshold
            .store(config.small_chain_threshold as u32, Ordering::Relaxed);
    }

    fn load_config(&self) -> SegmentConfig {
        SegmentConfig {
            chunks: self.chunks.load(Ordering::Acquire) as usize,
            schedulers: self.schedulers.load(Ordering::Acquire) as usize,
            channels: self.channels.load(Ordering::Acquire) as usize,
            clients: self.clients.load(Ordering::Acquire) as usize,
            private_pool_refill_batch: self.private_pool_refill_batch.load(Ordering::Acquire) as usize,
            private_pool_high_water: self.private_pool_high_water.load(Ordering::Acquire) as usize,
            private_pool_trim_to: self.private_pool_trim_to.load(Ordering::Acquire) as usize,
            small_chain_threshold: self.small_chain_threshold.load(Ordering::Acquire) as usize,
        }
    }
}

/// Byte offsets of every region, derived from a configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentLayout {
    common: usize,
    pool_header: usize,
    pool_stack: usize,
    client_interfaces: usize,
    chunk_bitmaps: usize,
    scheduler_interfaces: usize,
    channels: usize,
    chunks: usize,
    total: usize,
}

fn align_up(offset: usize, align: usize) -> usize {
    offset.next_multiple_of(align.max(ALIGN))
}

impl SegmentLayout {
    pub fn new(config: &SegmentConfig) -> Self {
        let mut offset = size_of::<SegmentHeader>();
        let mut place = |size: usize, align: usize| {
            let at = align_up(offset, align);
            offset = at + size;
            at
        };
        let common = place(size_of::<CommonClientInterface>(), align_of::<CommonClientInterface>());
        let pool_header = place(size_of::<SharedPoolHeader>(), align_of::<SharedPoolHeader>());
        let pool_stack = place(size_of::<AtomicU32>() * config.chunks, align_of::<AtomicU32>());
        let client_interfaces = place(
            size_of::<ClientInterface>() * config.clients,
            align_of::<ClientInterface>(),
        );
        let chunk_bitmaps = place(
            size_of::<AtomicU64>() * chunk_words(config.chunks) * config.clients,
            align_of::<AtomicU64>(),
        );
        let scheduler_interfaces = place(
            size_of::<SchedulerInterface>() * config.schedulers,
            align_of::<SchedulerInterface>(),
        );
        let channels = place(size_of::<Channel>() * config.channels, align_of::<Channel>());
        let chunks = place(size_of::<Chunk>() * config.chunks, align_of::<Chunk>());
        let total = align_up(offset, ALIGN);
        Self {
            common,
            pool_header,
            pool_stack,
            client_interfaces,
            chunk_bitmaps,
            scheduler_interfaces,
            channels,
            chunks,
            total,
        }
    }

    /// Bytes needed for the whole segment
    pub fn total_size(&self) -> usize {
        self.total
    }
}

/// Database segment handle
pub struct Segment {
    memory: SegmentMemory,
    layout: SegmentLayout,
    config: SegmentConfig,
    name: String,
}

impl Segment {
    /// Create and initialize a named shared memory segment. The handle owns
    /// the name and removes it when dropped.
    pub fn create(name: &str, config: SegmentConfig) -> Result<Self> {
        config.validate()?;
        let layout = SegmentLayout::new(&config);
        let memory = SegmentMemory::create_shared(&shm_os_id(name), layout.total_size())?;
        let segment = Self {
            memory,
            layout,
            config,
            name: name.to_string(),
        };
        segment.initialize()?;
        debug!(segment = name, size = segment.layout.total_size(), "created segment");
        Ok(segment)
    }

    /// Create and initialize a segment in process-local memory
    pub fn create_local(name: &str, config: SegmentConfig) -> Result<Self> {
        config.validate()?;
        let layout = SegmentLayout::new(&config);
        let memory = SegmentMemory::local(layout.total_size());
        let segment = Self {
            memory,
            layout,
            config,
            name: name.to_string(),
        };
        segment.initialize()?;
        Ok(segment)
    }

    /// Open a segment created by another process
    pub fn open(name: &str) -> Result<Self> {
        let memory = SegmentMemory::open_shared(&shm_os_id(name))?;
        Self::from_memory(name, memory)
    }

    /// Validate an existing segment's header and wrap it
    pub fn from_memory(name: &str, memory: SegmentMemory) -> Result<Self> {
        if memory.size() < size_of::<SegmentHeader>() {
            return Err(bad_segment(name, format!("{} bytes is too small", memory.size())));
        }
        let header = unsafe { &*(memory.as_ptr() as *const SegmentHeader) };
        let magic = header.magic.load(Ordering::Acquire);
        if magic != MAGIC {
            return Err(bad_segment(name, format!("invalid magic number {:#x}", magic)));
        }
        let version = header.version.load(Ordering::Acquire);
        if version != VERSION {
            return Err(bad_segment(
                name,
                format!("version mismatch: expected {}, got {}", VERSION, version),
            ));
        }
        if header.initialized.load(Ordering::Acquire) == 0 {
            return Err(bad_segment(name, "not initialized".to_string()));
        }

        let config = header.load_config();
        config
            .validate()
            .map_err(|e| bad_segment(name, format!("stored configuration: {}", e)))?;
        let layout = SegmentLayout::new(&config);
        if memory.size() < layout.total_size() {
            return Err(bad_segment(
                name,
                format!("{} bytes, layout needs {}", memory.size(), layout.total_size()),
            ));
        }

        Ok(Self {
            memory,
            layout,
            config,
            name: name.to_string(),
        })
    }

    fn initialize(&self) -> Result<()> {
        let header = self.header();
        header.magic.store(MAGIC, Ordering::Relaxed);
        header.version.store(VERSION, Ordering::Relaxed);
        header.store_config(&self.config);
        header
            .total_size
            .store(self.layout.total_size() as u64, Ordering::Relaxed);

        for chunk in self.chunk_slice() {
            chunk.reset();
        }
        self.shared_pool().fill();

        let common = self.common();
        for n in 0..self.config.clients as u32 {
            if !common.release_client_number(OwnerId::ANONYMOUS, n, INIT_TIMEOUT) {
                return Err(Error::InvalidConfig("client number queue too small".to_string()));
            }
        }
        for n in 0..self.config.channels as u32 {
            let scheduler = self.scheduler_interface(n % self.config.schedulers as u32)?;
            if !scheduler.push_free_channel(OwnerId::ANONYMOUS, n, INIT_TIMEOUT) {
                return Err(Error::InvalidConfig("free channel queue too small".to_string()));
            }
        }
        common.set_database_state(DatabaseState::Normal);

        header.initialized.store(1, Ordering::Release);
        Ok(())
    }

    fn at<T>(&self, offset: usize) -> &T {
        // SAFETY: offsets come from the layout, which is validated against
        // the mapping size, and every region is aligned for its type.
        unsafe { &*(self.memory.as_ptr().add(offset) as *const T) }
    }

    fn slice_at<T>(&self, offset: usize, len: usize) -> &[T] {
        // SAFETY: as for `at`.
        unsafe { std::slice::from_raw_parts(self.memory.as_ptr().add(offset) as *const T, len) }
    }

    fn header(&self) -> &SegmentHeader {
        self.at(0)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    pub fn is_shared(&self) -> bool {
        self.memory.is_shared()
    }

    /// Leave the shared memory in place when this handle is dropped
    pub fn disown(&mut self) {
        self.memory.disown();
    }

    pub fn database_owner(&self) -> OwnerId {
        self.header().database_owner.load()
    }

    pub fn database_pid(&self) -> u32 {
        self.header().database_pid.load(Ordering::Acquire)
    }

    /// Record the database process that serves this segment
    pub fn set_database_owner(&self, owner: OwnerId, pid: u32) {
        self.header().database_pid.store(pid, Ordering::Relaxed);
        self.header().database_owner.store(owner);
        for n in 0..self.config.schedulers as u32 {
            if let Ok(s) = self.scheduler_interface(n) {
                s.set_owner(owner);
            }
        }
    }

    pub fn common(&self) -> &CommonClientInterface {
        self.at(self.layout.common)
    }

    pub fn database_state(&self) -> DatabaseState {
        self.common().database_state()
    }

    pub fn shared_pool(&self) -> SharedChunkPool<'_> {
        SharedChunkPool::new(
            self.at(self.layout.pool_header),
            self.slice_at(self.layout.pool_stack, self.config.chunks),
            self.chunks(),
        )
    }

    fn chunk_slice(&self) -> &[Chunk] {
        self.slice_at(self.layout.chunks, self.config.chunks)
    }

    pub fn chunks(&self) -> ChunkStore<'_> {
        ChunkStore::new(self.chunk_slice())
    }

    pub fn chunk(&self, index: ChunkIndex) -> Result<&Chunk> {
        self.chunks().get(index)
    }

    pub fn client_interface(&self, client: u32) -> Result<&ClientInterface> {
        self.slice_at::<ClientInterface>(self.layout.client_interfaces, self.config.clients)
            .get(client as usize)
            .ok_or(Error::IndexOutOfRange { kind: "client", index: client })
    }

    pub fn scheduler_interface(&self, scheduler: u32) -> Result<&SchedulerInterface> {
        self.slice_at::<SchedulerInterface>(self.layout.scheduler_interfaces, self.config.schedulers)
            .get(scheduler as usize)
            .ok_or(Error::IndexOutOfRange { kind: "scheduler", index: scheduler })
    }

    pub fn channel(&self, channel: u32) -> Result<&Channel> {
        self.slice_at::<Channel>(self.layout.channels, self.config.channels)
            .get(channel as usize)
            .ok_or(Error::IndexOutOfRange { kind: "channel", index: channel })
    }

    /// Scheduler serving `channel`
    pub fn scheduler_of(&self, channel: u32) -> u32 {
        channel % self.config.schedulers as u32
    }

    /// Resource map of one client slot
    pub fn resource_map(&self, client: u32) -> Result<ResourceMap<'_>> {
        let interface = self.client_interface(client)?;
        let words = chunk_words(self.config.chunks);
        let bitmaps = self.slice_at::<AtomicU64>(self.layout.chunk_bitmaps, words * self.config.clients);
        let start = client as usize * words;
        Ok(ResourceMap::new(
            &interface.channel_words,
            &bitmaps[start..start + words],
            self.config.chunks as u32,
            self.config.channels as u32,
            self.config.schedulers as u32,
        ))
    }

    /// Client slots currently bound to `owner`, ignoring the clean-up flag
    pub fn client_slots_of(&self, owner: OwnerId) -> Vec<u32> {
        (0..self.config.clients as u32)
            .filter(|&n| {
                self.client_interface(n)
                    .map(|c| !c.owner().is_none() && c.owner().same_owner(owner))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Clear every robust spinlock in the segment held by `dead`
    pub fn force_unlock_owned_by(&self, dead: OwnerId) -> usize {
        let mut cleared = 0;
        if self.shared_pool().lock().force_unlock_if_owned_by(dead) {
            cleared += 1;
        }
        if self.common().client_numbers().lock().force_unlock_if_owned_by(dead) {
            cleared += 1;
        }
        for n in 0..self.config.schedulers as u32 {
            if let Ok(s) = self.scheduler_interface(n) {
                if s.free_channels().lock().force_unlock_if_owned_by(dead) {
                    cleared += 1;
                }
            }
        }
        if cleared > 0 {
            warn!(segment = %self.name, owner = %dead, cleared, "force-cleared spinlocks of dead owner");
        }
        cleared
    }
}

fn bad_segment(name: &str, reason: String) -> Error {
    warn!(segment = name, %reason, "refusing segment");
    Error::BadSegment(format!("{}: {}", name, reason))
}

/// Shared memory object name of a segment
fn shm_os_id(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    }
}

/// Name of the segment for `database`, instance `sequence`
pub fn database_segment_name(database: &str, sequence: u64) -> String {
    format!("{}_{}_{}", SEGMENT_PREFIX, database.to_uppercase(), sequence)
}

/// Database name embedded in a segment name of the form
/// `<prefix>_<DATABASE>_<sequence>`
pub fn segment_name_to_database_name(segment_name: &str) -> Option<&str> {
    let rest = segment_name
        .trim_start_matches('/')
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_prefix('_')?;
    let end = rest.rfind('_')?;
    let database = &rest[..end];
    if database.is_empty() {
        None
    } else {
        Some(database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SegmentConfig {
        SegmentConfig::new().chunks(256).schedulers(2).channels(8).clients(4)
    }

    #[test]
    fn test_layout_regions_do_not_overlap() {
        let layout = SegmentLayout::new(&small());
        let starts = [
            layout.common,
            layout.pool_header,
            layout.pool_stack,
            layout.client_interfaces,
            layout.chunk_bitmaps,
            layout.scheduler_interfaces,
            layout.channels,
            layout.chunks,
            layout.total,
        ];
        assert!(starts.windows(2).all(|w| w[0] < w[1]));
        assert!(starts.iter().all(|s| s % ALIGN == 0));
        assert!(layout.total >= layout.chunks + 256 * 4096);
    }

    #[test]
    fn test_initialized_pools() {
        let segment = Segment::create_local("chunkipc_TEST_1", small()).unwrap();
        assert_eq!(segment.shared_pool().len(), 256);
        assert_eq!(segment.common().free_client_numbers(), 4);
        assert_eq!(segment.scheduler_interface(0).unwrap().free_channel_count(), 4);
        assert_eq!(segment.scheduler_interface(1).unwrap().free_channel_count(), 4);
        assert_eq!(segment.database_state(), DatabaseState::Normal);
        assert_eq!(segment.scheduler_of(5), 1);
    }

    #[test]
    fn test_accessors_are_bounds_checked() {
        let segment = Segment::create_local("chunkipc_TEST_1", small()).unwrap();
        assert!(matches!(
            segment.channel(8),
            Err(Error::IndexOutOfRange { kind: "channel", index: 8 })
        ));
        assert!(segment.client_interface(4).is_err());
        assert!(segment.scheduler_interface(2).is_err());
        assert!(segment.chunk(256).is_err());
        assert!(segment.resource_map(3).is_ok());
    }

    #[test]
    fn test_resource_maps_are_disjoint() {
        let segment = Segment::create_local("chunkipc_TEST_1", small()).unwrap();
        let a = segment.resource_map(0).unwrap();
        let b = segment.resource_map(1).unwrap();
        a.set_chunk_flag(255);
        assert!(!b.owns_chunk(255));
        assert_eq!(a.count_owned_chunks(), 1);
    }

    #[test]
    fn test_uninitialized_memory_is_refused() {
        let memory = SegmentMemory::local(SegmentLayout::new(&small()).total_size());
        assert!(matches!(
            Segment::from_memory("chunkipc_X_1", memory),
            Err(Error::BadSegment(_))
        ));
    }

    #[test]
    fn test_force_unlock_clears_only_dead_owner() {
        let segment = Segment::create_local("chunkipc_TEST_1", small()).unwrap();
        let dead = OwnerId::new(9);
        let live = OwnerId::new(10);
        assert!(segment.shared_pool().lock().try_lock(dead));
        assert!(segment.scheduler_interface(1).unwrap().free_channels().lock().try_lock(live));
        assert_eq!(segment.force_unlock_owned_by(dead), 1);
        assert!(!segment.shared_pool().lock().is_locked());
        assert!(segment.scheduler_interface(1).unwrap().free_channels().lock().is_locked());
    }

    #[test]
    fn test_segment_name_to_database_name() {
        assert_eq!(segment_name_to_database_name("chunkipc_ORDERS_3"), Some("ORDERS"));
        assert_eq!(segment_name_to_database_name("/chunkipc_MY_DB_12"), Some("MY_DB"));
        assert_eq!(database_segment_name("orders", 3), "chunkipc_ORDERS_3");
        assert_eq!(segment_name_to_database_name("other_ORDERS_3"), None);
        assert_eq!(segment_name_to_database_name("chunkipc__3"), None);
    }
}
