//! Per-client bitmaps of owned chunks and channels
//!
//! Each bitmap is split into 64-bit words. Enumeration repeatedly extracts
//! the lowest set bit of each non-zero word, so crash recovery walks only
//! what a client owns, not the whole chunk store.

use crate::chunk::ChunkIndex;
use crate::config::MAX_CHANNELS;
use std::sync::atomic::{AtomicU64, Ordering};

/// Channel bitmap words per client
pub const CHANNEL_WORDS: usize = MAX_CHANNELS / 64;

/// Chunk bitmap words needed for `chunks` chunks
pub const fn chunk_words(chunks: usize) -> usize {
    chunks.div_ceil(64)
}

#[inline]
fn split(index: u32) -> (usize, u64) {
    ((index >> 6) as usize, 1u64 << (index & 63))
}

/// View over one client's resource bitmaps in a segment
#[derive(Clone, Copy)]
pub struct ResourceMap<'a> {
    channel_words: &'a [AtomicU64; CHANNEL_WORDS],
    chunk_words: &'a [AtomicU64],
    chunks: u32,
    channels: u32,
    schedulers: u32,
}

impl<'a> ResourceMap<'a> {
    pub(crate) fn new(
        channel_words: &'a [AtomicU64; CHANNEL_WORDS],
        chunk_words: &'a [AtomicU64],
        chunks: u32,
        channels: u32,
        schedulers: u32,
    ) -> Self {
        Self {
            channel_words,
            chunk_words,
            chunks,
            channels,
            schedulers,
        }
    }

    /// Mark a chunk owned. False if out of range or already set.
    pub fn set_chunk_flag(&self, index: ChunkIndex) -> bool {
        if index >= self.chunks {
            return false;
        }
        let (w, bit) = split(index);
        self.chunk_words[w].fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    /// Clear a chunk's flag. False if out of range or not set.
    pub fn clear_chunk_flag(&self, index: ChunkIndex) -> bool {
        if index >= self.chunks {
            return false;
        }
        let (w, bit) = split(index);
        self.chunk_words[w].fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    pub fn owns_chunk(&self, index: ChunkIndex) -> bool {
        if index >= self.chunks {
            return false;
        }
        let (w, bit) = split(index);
        self.chunk_words[w].load(Ordering::Acquire) & bit != 0
    }

    /// Whether `channel` is served by `scheduler`
    pub fn channel_belongs_to(&self, scheduler: u32, channel: u32) -> bool {
        channel < self.channels && scheduler < self.schedulers && channel % self.schedulers == scheduler
    }

    /// Mark a channel owned. False if the pair is invalid or already set.
    pub fn set_channel_flag(&self, scheduler: u32, channel: u32) -> bool {
        if !self.channel_belongs_to(scheduler, channel) {
            return false;
        }
        let (w, bit) = split(channel);
        self.channel_words[w].fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    /// Clear a channel's flag. False if the pair is invalid or not set.
    pub fn clear_channel_flag(&self, scheduler: u32, channel: u32) -> bool {
        if !self.channel_belongs_to(scheduler, channel) {
            return false;
        }
        let (w, bit) = split(channel);
        self.channel_words[w].fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    pub fn owns_channel(&self, channel: u32) -> bool {
        if channel >= self.channels {
            return false;
        }
        let (w, bit) = split(channel);
        self.channel_words[w].load(Ordering::Acquire) & bit != 0
    }

    /// Owned channels in word `word` (channels `64 * word ..`)
    pub fn owned_channels_mask(&self, word: usize) -> u64 {
        self.channel_words
            .get(word)
            .map_or(0, |w| w.load(Ordering::Acquire))
    }

    /// Owned chunks in word `word` (chunks `64 * word ..`)
    pub fn owned_chunks_mask(&self, word: usize) -> u64 {
        self.chunk_words
            .get(word)
            .map_or(0, |w| w.load(Ordering::Acquire))
    }

    pub fn owned_channels(&self) -> BitScan<'a> {
        BitScan::new(self.channel_words)
    }

    pub fn owned_chunks(&self) -> BitScan<'a> {
        BitScan::new(self.chunk_words)
    }

    pub fn count_owned_chunks(&self) -> usize {
        self.chunk_words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    pub fn count_owned_channels(&self) -> usize {
        self.channel_words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.count_owned_chunks() == 0 && self.count_owned_channels() == 0
    }

    /// Drop every flag. Used once a client slot is reclaimed.
    pub fn clear(&self) {
        for w in self.channel_words.iter().chain(self.chunk_words) {
            w.store(0, Ordering::Release);
        }
    }
}

/// Enumerates set bits word by word, lowest first
pub struct BitScan<'a> {
    words: &'a [AtomicU64],
    word: usize,
    mask: u64,
}

impl<'a> BitScan<'a> {
    fn new(words: &'a [AtomicU64]) -> Self {
        let mask = words.first().map_or(0, |w| w.load(Ordering::Acquire));
        Self {
            words,
            word: 0,
            mask,
        }
    }
}

impl Iterator for BitScan<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        while self.mask == 0 {
            self.word += 1;
            self.mask = self.words.get(self.word)?.load(Ordering::Acquire);
        }
        let bit = self.mask.trailing_zeros();
        self.mask &= self.mask - 1;
        Some(((self.word as u32) << 6) + bit)
    }
}
