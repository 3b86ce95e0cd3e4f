//! Backing memory of a segment

use crate::shm::SharedMemory;
use crate::Result;
use std::sync::atomic::AtomicU64;

/// Alignment of the segment base; the largest alignment of any record
pub const ALIGN: usize = 64;

/// Where a segment's bytes live
pub enum SegmentMemory {
    /// Named shared memory, visible to other processes
    Shared(SharedMemory),
    /// Process-local memory for single-process use and tests
    Local(LocalMemory),
}

/// Heap memory whose usable part starts on a cache line
pub struct LocalMemory {
    words: Box<[AtomicU64]>,
    offset: usize,
    size: usize,
}

impl SegmentMemory {
    /// Create zero-filled named shared memory
    pub fn create_shared(name: &str, size: usize) -> Result<Self> {
        Ok(SegmentMemory::Shared(SharedMemory::create(name, size)?))
    }

    pub fn open_shared(name: &str) -> Result<Self> {
        Ok(SegmentMemory::Shared(SharedMemory::open(name)?))
    }

    /// Allocate zero-filled local memory aligned to `ALIGN`
    pub fn local(size: usize) -> Self {
        let words: Box<[AtomicU64]> = (0..size.div_ceil(8) + ALIGN / 8)
            .map(|_| AtomicU64::new(0))
            .collect();
        let addr = words.as_ptr() as usize;
        let offset = addr.next_multiple_of(ALIGN) - addr;
        SegmentMemory::Local(LocalMemory {
            words,
            offset,
            size,
        })
    }

    pub fn size(&self) -> usize {
        match self {
            SegmentMemory::Shared(shm) => shm.size(),
            SegmentMemory::Local(local) => local.size,
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, SegmentMemory::Shared(_))
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            SegmentMemory::Shared(shm) => Some(shm.name()),
            SegmentMemory::Local(_) => None,
        }
    }

    /// Base address. All structures placed here are made of atomics, so
    /// shared references into the region may be mutated concurrently.
    pub fn as_ptr(&self) -> *const u8 {
        match self {
            SegmentMemory::Shared(shm) => shm.as_ptr(),
            // SAFETY: offset < ALIGN and the allocation has ALIGN spare bytes
            SegmentMemory::Local(local) => unsafe {
                (local.words.as_ptr() as *const u8).add(local.offset)
            },
        }
    }

    /// Leave the shared memory name in place when this handle is dropped
    pub fn disown(&mut self) {
        if let SegmentMemory::Shared(shm) = self {
            shm.disown();
        }
    }
}
