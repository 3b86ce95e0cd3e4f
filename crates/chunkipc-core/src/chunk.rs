//! Chunk store
//!
//! A chunk is a fixed-size slot: a small header followed by payload bytes.
//! Messages longer than one payload are spread over a chain of chunks linked
//! through the header's `link` field and terminated by [`LINK_TERMINATOR`].

use crate::config::CHUNK_SIZE;
use crate::{Error, Result};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Index of a chunk in the chunk store
pub type ChunkIndex = u32;

/// Ends a chain of linked chunks
pub const LINK_TERMINATOR: ChunkIndex = u32::MAX;

/// Bytes reserved for the chunk header
pub const CHUNK_HEADER_SIZE: usize = 32;

/// Payload bytes per chunk
pub const CHUNK_PAYLOAD: usize = CHUNK_SIZE - CHUNK_HEADER_SIZE;

/// Set while the chunk sits in the shared pool
const FLAG_IN_SHARED_POOL: u32 = 1;

#[repr(C)]
pub struct ChunkHeader {
    /// Next chunk of the same message
    link: AtomicU32,
    /// Next message in a channel's overflow queue
    next: AtomicU32,
    /// Total message size, recorded in the head chunk
    message_size: AtomicU32,
    flags: AtomicU32,
    user_data: AtomicU64,
    _reserved: AtomicU64,
}

#[repr(C, align(64))]
pub struct Chunk {
    header: ChunkHeader,
    payload: UnsafeCell<[u8; CHUNK_PAYLOAD]>,
}

// SAFETY: header fields are atomics. The payload is only written by the
// process holding the chunk, and handing a chunk index over a ring publishes
// the writes with release/acquire ordering.
unsafe impl Sync for Chunk {}

const _: () = assert!(std::mem::size_of::<ChunkHeader>() == CHUNK_HEADER_SIZE);
const _: () = assert!(std::mem::size_of::<Chunk>() == CHUNK_SIZE);

impl Chunk {
    /// Unlinked, empty chunk
    pub fn new() -> Self {
        Self {
            header: ChunkHeader {
                link: AtomicU32::new(LINK_TERMINATOR),
                next: AtomicU32::new(LINK_TERMINATOR),
                message_size: AtomicU32::new(0),
                flags: AtomicU32::new(0),
                user_data: AtomicU64::new(0),
                _reserved: AtomicU64::new(0),
            },
            payload: UnsafeCell::new([0; CHUNK_PAYLOAD]),
        }
    }

    pub fn link(&self) -> ChunkIndex {
        self.header.link.load(Ordering::Acquire)
    }

    pub fn set_link(&self, index: ChunkIndex) {
        self.header.link.store(index, Ordering::Release);
    }

    pub fn next(&self) -> ChunkIndex {
        self.header.next.load(Ordering::Acquire)
    }

    pub fn set_next(&self, index: ChunkIndex) {
        self.header.next.store(index, Ordering::Release);
    }

    pub fn message_size(&self) -> u32 {
        self.header.message_size.load(Ordering::Acquire)
    }

    pub fn set_message_size(&self, size: u32) {
        self.header.message_size.store(size, Ordering::Release);
    }

    pub fn user_data(&self) -> u64 {
        self.header.user_data.load(Ordering::Acquire)
    }

    pub fn set_user_data(&self, data: u64) {
        self.header.user_data.store(data, Ordering::Release);
    }

    /// Whether the chunk is currently in the shared pool
    pub fn in_shared_pool(&self) -> bool {
        self.header.flags.load(Ordering::Acquire) & FLAG_IN_SHARED_POOL != 0
    }

    pub(crate) fn set_in_shared_pool(&self, pooled: bool) {
        if pooled {
            self.header.flags.fetch_or(FLAG_IN_SHARED_POOL, Ordering::AcqRel);
        } else {
            self.header.flags.fetch_and(!FLAG_IN_SHARED_POOL, Ordering::AcqRel);
        }
    }

    /// Back to the state of [`Chunk::new`], keeping the shared pool mark
    pub fn reset(&self) {
        self.header.link.store(LINK_TERMINATOR, Ordering::Relaxed);
        self.header.next.store(LINK_TERMINATOR, Ordering::Relaxed);
        self.header.message_size.store(0, Ordering::Relaxed);
        self.header.flags.fetch_and(FLAG_IN_SHARED_POOL, Ordering::Relaxed);
        self.header.user_data.store(0, Ordering::Release);
    }

    fn payload_ptr(&self) -> *mut u8 {
        self.payload.get() as *mut u8
    }

    /// Copy `bytes` into the payload at `offset`
    pub fn write_payload(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        if offset + bytes.len() > CHUNK_PAYLOAD {
            return Err(Error::BadChain(format!(
                "{} bytes at offset {} exceed chunk payload",
                bytes.len(),
                offset
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.payload_ptr().add(offset), bytes.len());
        }
        Ok(())
    }

    /// Copy payload bytes starting at `offset` into `out`
    pub fn read_payload(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        if offset + out.len() > CHUNK_PAYLOAD {
            return Err(Error::BadChain(format!(
                "{} bytes at offset {} exceed chunk payload",
                out.len(),
                offset
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(self.payload_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of chunks needed for a message of `size` bytes
pub fn chunks_for_size(size: usize) -> usize {
    size.div_ceil(CHUNK_PAYLOAD).max(1)
}

/// View over the chunk array of a segment
#[derive(Clone, Copy)]
pub struct ChunkStore<'a> {
    chunks: &'a [Chunk],
}

impl<'a> ChunkStore<'a> {
    pub(crate) fn new(chunks: &'a [Chunk]) -> Self {
        Self { chunks }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Validated access to one chunk
    pub fn get(&self, index: ChunkIndex) -> Result<&'a Chunk> {
        self.chunks
            .get(index as usize)
            .ok_or(Error::IndexOutOfRange { kind: "chunk", index })
    }

    /// Iterate the chain starting at `head`
    pub fn chain(&self, head: ChunkIndex) -> ChainIter<'a> {
        ChainIter {
            store: *self,
            current: head,
            remaining: self.chunks.len(),
        }
    }

    /// Chunk indices of the chain starting at `head`. Fails on an index out
    /// of range or a chain longer than the store, which means it loops.
    pub fn collect_chain(&self, head: ChunkIndex) -> Result<Vec<ChunkIndex>> {
        self.chain(head).collect()
    }

    /// Scatter `bytes` over the chain at `head` and record the size in the
    /// head chunk
    pub fn write_message(&self, head: ChunkIndex, bytes: &[u8]) -> Result<()> {
        let size = u32::try_from(bytes.len())
            .map_err(|_| Error::BadChain(format!("message of {} bytes too large", bytes.len())))?;
        let mut pieces = bytes.chunks(CHUNK_PAYLOAD);
        let mut written = 0;
        for index in self.chain(head) {
            let index = index?;
            match pieces.next() {
                Some(piece) => {
                    self.get(index)?.write_payload(0, piece)?;
                    written += piece.len();
                }
                None => break,
            }
        }
        if written < bytes.len() {
            return Err(Error::BadChain(format!(
                "chain at {} holds {} of {} bytes",
                head,
                written,
                bytes.len()
            )));
        }
        self.get(head)?.set_message_size(size);
        Ok(())
    }

    /// Gather the message stored in the chain at `head`. The recorded size
    /// comes from whoever wrote the chain and is checked against the chain
    /// length before anything is allocated.
    pub fn read_message(&self, head: ChunkIndex) -> Result<Vec<u8>> {
        let size = self.get(head)?.message_size() as usize;
        let chain = self.collect_chain(head)?;
        let capacity = chain.len() * CHUNK_PAYLOAD;
        if size > capacity {
            return Err(Error::BadChain(format!(
                "chain at {} holds {} bytes, message claims {}",
                head, capacity, size
            )));
        }
        let mut out = vec![0u8; size];
        for (&index, piece) in chain.iter().zip(out.chunks_mut(CHUNK_PAYLOAD)) {
            self.get(index)?.read_payload(0, piece)?;
        }
        Ok(out)
    }
}

/// Walks a chain of linked chunks, bounded by the store size
pub struct ChainIter<'a> {
    store: ChunkStore<'a>,
    current: ChunkIndex,
    remaining: usize,
}

impl Iterator for ChainIter<'_> {
    type Item = Result<ChunkIndex>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current == LINK_TERMINATOR {
            return None;
        }
        if self.remaining == 0 {
            self.current = LINK_TERMINATOR;
            return Some(Err(Error::BadChain("chain loops".to_string())));
        }
        self.remaining -= 1;
        let index = self.current;
        match self.store.get(index) {
            Ok(chunk) => {
                self.current = chunk.link();
                Some(Ok(index))
            }
            Err(e) => {
                self.current = LINK_TERMINATOR;
                Some(Err(e))
            }
        }
    }
}
