//! Chunk planning
//!
//! A chunk is a contiguous `[offset, offset + limit)` range of one entity's
//! source records, handed to exactly one worker process.

use std::fmt;

/// Identity of a chunk for retry accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkKey {
    pub offset: u64,
    pub limit: u64,
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.offset, self.limit)
    }
}

/// Range of records of one entity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Chunk {
    pub entity: String,
    pub offset: u64,
    pub limit: u64,
}

impl Chunk {
    #[inline]
    #[must_use]
    pub fn new(entity: impl Into<String>, offset: u64, limit: u64) -> Self {
        Self {
            entity: entity.into(),
            offset,
            limit,
        }
    }

    #[inline]
    #[must_use]
    pub fn key(&self) -> ChunkKey {
        ChunkKey {
            offset: self.offset,
            limit: self.limit,
        }
    }

    /// First offset past this chunk
    #[inline]
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.limit
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}, {})", self.entity, self.offset, self.end())
    }
}

/// Hands out chunks in strictly increasing offset order
#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    entity: String,
    next_offset: u64,
    total: u64,
    max_per_chunk: u64,
}

impl ChunkPlanner {
    /// Plan `[start_offset, total)` in chunks of at most `max_per_chunk`
    ///
    /// A zero `max_per_chunk` is treated as one record per chunk.
    #[must_use]
    pub fn new(entity: impl Into<String>, start_offset: u64, total: u64, max_per_chunk: u64) -> Self {
        Self {
            entity: entity.into(),
            next_offset: start_offset,
            total,
            max_per_chunk: max_per_chunk.max(1),
        }
    }

    /// Whether any range is left to dispatch
    #[inline]
    #[must_use]
    pub fn has_remaining(&self) -> bool {
        self.next_offset < self.total
    }

    #[inline]
    #[must_use]
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Records not yet dispatched
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.next_offset)
    }
}

impl Iterator for ChunkPlanner {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if !self.has_remaining() {
            return None;
        }
        let limit = self.max_per_chunk.min(self.total - self.next_offset);
        let chunk = Chunk::new(self.entity.clone(), self.next_offset, limit);
        self.next_offset += limit;
        Some(chunk)
    }
}
