//! Chunk pools
//!
//! Free chunks live either in the shared pool, a stack of chunk indices in
//! the segment guarded by a robust spinlock, or in a scheduler's private
//! pool, a ring only its scheduler thread touches. Chains are linked on
//! acquisition through each chunk's `link` field.

use crate::chunk::{chunks_for_size, ChunkIndex, ChunkStore, LINK_TERMINATOR};
use crate::config::{SegmentConfig, PRIVATE_POOL_SLOTS};
use crate::error::TimeoutKind;
use crate::owner_id::OwnerId;
use crate::resource_map::ResourceMap;
use crate::ring::BoundedRing;
use crate::spinlock::RobustSpinlock;
use crate::{Error, Result};
use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

#[repr(C, align(64))]
pub struct SharedPoolHeader {
    lock: RobustSpinlock,
    len: AtomicU32,
}

/// Free chunk stack shared by every process attached to a segment
#[derive(Clone, Copy)]
pub struct SharedChunkPool<'a> {
    header: &'a SharedPoolHeader,
    stack: &'a [AtomicU32],
    chunks: ChunkStore<'a>,
}

impl<'a> SharedChunkPool<'a> {
    pub(crate) fn new(header: &'a SharedPoolHeader, stack: &'a [AtomicU32], chunks: ChunkStore<'a>) -> Self {
        Self { header, stack, chunks }
    }

    /// Put every chunk in the pool so that pops yield 0, 1, 2, ...
    pub(crate) fn fill(&self) {
        let n = self.stack.len();
        for (slot, index) in self.stack.iter().zip((0..n as u32).rev()) {
            slot.store(index, Ordering::Relaxed);
            if let Ok(chunk) = self.chunks.get(index) {
                chunk.set_in_shared_pool(true);
            }
        }
        self.header.len.store(n as u32, Ordering::Release);
    }

    /// Free chunks, read without the lock
    pub fn len(&self) -> usize {
        self.header.len.load(Ordering::Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.stack.len()
    }

    pub fn lock(&self) -> &'a RobustSpinlock {
        &self.header.lock
    }

    fn lock_or_timeout(&self, owner: OwnerId, deadline: Instant) -> Result<crate::spinlock::SpinlockGuard<'a>> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        self.header
            .lock
            .guard(owner, timeout)
            .ok_or(Error::Timeout(TimeoutKind::Spinlock))
    }

    /// Pop up to `max` indices into `out`. Caller holds the lock.
    fn pop_locked(&self, max: usize, out: &mut Vec<ChunkIndex>) -> usize {
        let len = self.header.len.load(Ordering::Relaxed) as usize;
        let n = max.min(len);
        for i in 0..n {
            let index = self.stack[len - 1 - i].load(Ordering::Relaxed);
            if let Ok(chunk) = self.chunks.get(index) {
                chunk.set_in_shared_pool(false);
            }
            out.push(index);
        }
        self.header.len.store((len - n) as u32, Ordering::Release);
        n
    }

    /// Reset and push indices back. Caller holds the lock. Nothing changes
    /// unless every index can go in.
    fn push_locked(&self, indices: &[ChunkIndex]) -> Result<()> {
        let len = self.header.len.load(Ordering::Relaxed) as usize;
        if len + indices.len() > self.stack.len() {
            warn!(len, returned = indices.len(), "shared chunk pool overflow, chunk released twice");
            return Err(Error::BadChain(format!(
                "returning {} chunks to a pool holding {} of {}",
                indices.len(),
                len,
                self.stack.len()
            )));
        }
        let chunks = indices
            .iter()
            .map(|&index| self.chunks.get(index))
            .collect::<Result<Vec<_>>>()?;
        for (n, chunk) in chunks.iter().enumerate() {
            if chunk.in_shared_pool() {
                for marked in &chunks[..n] {
                    marked.set_in_shared_pool(false);
                }
                warn!(chunk = indices[n], "chunk released twice");
                return Err(Error::BadChain(format!("chunk {} is already free", indices[n])));
            }
            chunk.set_in_shared_pool(true);
        }
        for (i, (&index, chunk)) in indices.iter().zip(&chunks).enumerate() {
            chunk.reset();
            self.stack[len + i].store(index, Ordering::Relaxed);
        }
        self.header.len.store((len + indices.len()) as u32, Ordering::Release);
        Ok(())
    }

    /// Take up to `max` chunks without linking them
    pub fn pop_batch(&self, owner: OwnerId, max: usize, out: &mut Vec<ChunkIndex>, timeout: Duration) -> Result<usize> {
        let _guard = self.lock_or_timeout(owner, Instant::now() + timeout)?;
        Ok(self.pop_locked(max, out))
    }

    /// Return unlinked chunks
    pub fn push_batch(&self, owner: OwnerId, indices: &[ChunkIndex], timeout: Duration) -> Result<()> {
        for &index in indices {
            self.chunks.get(index)?;
        }
        let _guard = self.lock_or_timeout(owner, Instant::now() + timeout)?;
        self.push_locked(indices)
    }

    /// Acquire a chain of `count` linked chunks, marking each in `map`.
    /// Waits up to `timeout` for the pool to hold enough chunks.
    pub fn acquire_linked_counted(
        &self,
        owner: OwnerId,
        map: Option<&ResourceMap<'_>>,
        count: usize,
        timeout: Duration,
    ) -> Result<ChunkIndex> {
        if count == 0 {
            return Ok(LINK_TERMINATOR);
        }
        if count > self.capacity() {
            return Err(Error::ChunkPoolExhausted {
                requested: count,
                available: self.capacity(),
            });
        }

        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        let mut indices = Vec::with_capacity(count);
        loop {
            {
                let _guard = self.lock_or_timeout(owner, deadline)?;
                if self.header.len.load(Ordering::Relaxed) as usize >= count {
                    self.pop_locked(count, &mut indices);
                    if let Some(map) = map {
                        for &index in &indices {
                            map.set_chunk_flag(index);
                        }
                    }
                    break;
                }
            }
            if Instant::now() >= deadline {
                return Err(if timeout.is_zero() {
                    Error::ChunkPoolExhausted {
                        requested: count,
                        available: self.len(),
                    }
                } else {
                    Error::Timeout(TimeoutKind::ChunkAcquisition)
                });
            }
            if backoff.is_completed() {
                std::thread::sleep(Duration::from_micros(100));
            } else {
                backoff.snooze();
            }
        }

        link_chain(&self.chunks, &indices)?;
        trace!(head = indices[0], count, "acquired chain from shared pool");
        Ok(indices[0])
    }

    /// Acquire a chain long enough for `size` payload bytes
    pub fn acquire_linked(
        &self,
        owner: OwnerId,
        map: Option<&ResourceMap<'_>>,
        size: usize,
        timeout: Duration,
    ) -> Result<ChunkIndex> {
        self.acquire_linked_counted(owner, map, chunks_for_size(size), timeout)
    }

    /// Return every chunk of the chain at `head` and clear them in `map`.
    /// With a map, every chunk of the chain must be flagged in it or nothing
    /// is released. Releasing an empty chain is a no-op.
    pub fn release_linked(
        &self,
        owner: OwnerId,
        map: Option<&ResourceMap<'_>>,
        head: ChunkIndex,
        timeout: Duration,
    ) -> Result<usize> {
        if head == LINK_TERMINATOR {
            return Ok(0);
        }
        let indices = self.chunks.collect_chain(head)?;
        if let Some(map) = map {
            claim_chunks(map, &indices)?;
        }
        let pushed = self
            .lock_or_timeout(owner, Instant::now() + timeout)
            .and_then(|_guard| self.push_locked(&indices));
        if let Err(e) = pushed {
            if let Some(map) = map {
                for &index in &indices {
                    map.set_chunk_flag(index);
                }
            }
            return Err(e);
        }
        Ok(indices.len())
    }

    /// Return every chunk flagged in a client's resource map, whatever
    /// chains they were part of
    pub fn release_clients_chunks(&self, owner: OwnerId, map: &ResourceMap<'_>, timeout: Duration) -> Result<usize> {
        let indices: Vec<ChunkIndex> = map.owned_chunks().collect();
        let _guard = self.lock_or_timeout(owner, Instant::now() + timeout)?;
        self.push_locked(&indices)?;
        for &index in &indices {
            map.clear_chunk_flag(index);
        }
        Ok(indices.len())
    }
}

/// Clear the flag of every chunk in `map`, all or none
fn claim_chunks(map: &ResourceMap<'_>, indices: &[ChunkIndex]) -> Result<()> {
    for (n, &index) in indices.iter().enumerate() {
        if !map.clear_chunk_flag(index) {
            for &claimed in &indices[..n] {
                map.set_chunk_flag(claimed);
            }
            warn!(chunk = index, "released chain holds a chunk the owner does not hold");
            return Err(Error::NotOwner { kind: "chunk", index });
        }
    }
    Ok(())
}

fn link_chain(chunks: &ChunkStore<'_>, indices: &[ChunkIndex]) -> Result<()> {
    for pair in indices.windows(2) {
        chunks.get(pair[0])?.set_link(pair[1]);
    }
    if let Some(&last) = indices.last() {
        chunks.get(last)?.set_link(LINK_TERMINATOR);
    }
    Ok(())
}

/// A scheduler's private pool in front of the shared pool
///
/// Small chains are served here first; the pool refills from the shared
/// pool in batches when it runs low and trims back above its high-water
/// mark.
pub struct PrivatePool<'a> {
    ring: &'a BoundedRing<PRIVATE_POOL_SLOTS>,
    shared: SharedChunkPool<'a>,
    owner: OwnerId,
    refill_batch: usize,
    high_water: usize,
    trim_to: usize,
    small_chain_threshold: usize,
    lock_timeout: Duration,
}

impl<'a> PrivatePool<'a> {
    pub fn new(
        ring: &'a BoundedRing<PRIVATE_POOL_SLOTS>,
        shared: SharedChunkPool<'a>,
        owner: OwnerId,
        config: &SegmentConfig,
    ) -> Self {
        Self {
            ring,
            shared,
            owner,
            refill_batch: config.private_pool_refill_batch,
            high_water: config.private_pool_high_water,
            trim_to: config.private_pool_trim_to,
            small_chain_threshold: config.small_chain_threshold,
            lock_timeout: Duration::from_millis(100),
        }
    }

    pub fn len(&self) -> usize {
        self.ring.size()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Move up to `n` chunks from the shared pool. Returns how many moved.
    pub fn refill(&self, n: usize) -> Result<usize> {
        let room = self.ring.max_len() - self.len();
        let mut batch = Vec::with_capacity(n.min(room));
        self.shared.pop_batch(self.owner, n.min(room), &mut batch, self.lock_timeout)?;
        for &index in &batch {
            self.ring.try_push(index);
        }
        Ok(batch.len())
    }

    /// Move chunks back to the shared pool until `trim_to` remain
    pub fn trim(&self) -> Result<usize> {
        let excess = self.len().saturating_sub(self.trim_to);
        let batch: Vec<ChunkIndex> = (0..excess).filter_map(|_| self.ring.try_pop()).collect();
        if let Err(e) = self.shared.push_batch(self.owner, &batch, self.lock_timeout) {
            for &index in &batch {
                self.ring.try_push(index);
            }
            return Err(e);
        }
        Ok(batch.len())
    }

    /// Give every chunk back to the shared pool
    pub fn return_all(&self) -> Result<usize> {
        let batch: Vec<ChunkIndex> = std::iter::from_fn(|| self.ring.try_pop()).collect();
        if let Err(e) = self.shared.push_batch(self.owner, &batch, self.lock_timeout) {
            for &index in &batch {
                self.ring.try_push(index);
            }
            return Err(e);
        }
        Ok(batch.len())
    }

    /// Acquire a chain of `count` chunks for the scheduler. Small chains
    /// come from the private pool, refilled on demand; the shared pool
    /// serves the rest.
    pub fn acquire_linked_counted(&self, count: usize, timeout: Duration) -> Result<ChunkIndex> {
        if count == 0 {
            return Ok(LINK_TERMINATOR);
        }
        if count < self.small_chain_threshold {
            if self.len() < count {
                self.refill(self.refill_batch.max(count))?;
            }
            if self.len() >= count {
                let indices: Vec<ChunkIndex> = (0..count).filter_map(|_| self.ring.try_pop()).collect();
                link_chain(&self.shared.chunks, &indices)?;
                return Ok(indices[0]);
            }
        }
        self.shared
            .acquire_linked_counted(self.owner, None, count, timeout)
    }

    pub fn acquire_linked(&self, size: usize, timeout: Duration) -> Result<ChunkIndex> {
        self.acquire_linked_counted(chunks_for_size(size), timeout)
    }

    /// Return a chain to the private pool, trimming it if it grew past the
    /// high-water mark. A chain the ring has no room for goes to the shared
    /// pool whole; if that fails the chain is left as it was.
    pub fn release_linked(&self, head: ChunkIndex) -> Result<usize> {
        if head == LINK_TERMINATOR {
            return Ok(0);
        }
        let indices = self.shared.chunks.collect_chain(head)?;
        if indices.len() > self.ring.max_len() - self.len() {
            self.shared.push_batch(self.owner, &indices, self.lock_timeout)?;
            return Ok(indices.len());
        }
        // Only this pool's scheduler pushes to the ring, so the room found
        // above is still there
        for &index in &indices {
            self.shared.chunks.get(index)?.reset();
            self.ring.try_push(index);
        }
        if self.len() > self.high_water {
            self.trim()?;
        }
        Ok(indices.len())
    }
}
