//! Half-open, DWORD-aligned address ranges.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Probe granularity in bytes.
pub const WORD: u64 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("range {start:#x}-{end:#x} is empty")]
    Empty { start: u64, end: u64 },

    #[error("range {start:#x}-{end:#x} is not 4-byte aligned")]
    Unaligned { start: u64, end: u64 },

    #[error("chunk size {0:#x} must be a non-zero multiple of 4")]
    ChunkSize(u64),
}

/// `[start, end)` in bytes from the start of the BAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
}

impl AddressRange {
    pub fn new(start: u64, end: u64) -> Result<Self, RangeError> {
        if start >= end {
            return Err(RangeError::Empty { start, end });
        }
        if start % WORD != 0 || end % WORD != 0 {
            return Err(RangeError::Unaligned { start, end });
        }
        Ok(Self { start, end })
    }

    /// The single DWORD at `offset`, which must be aligned.
    pub fn word(offset: u64) -> Self {
        Self {
            start: offset,
            end: offset + WORD,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn words(&self) -> u64 {
        self.len() / WORD
    }

    pub fn is_word(&self) -> bool {
        self.words() == 1
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end
    }

    pub fn contains_range(&self, other: &AddressRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// Split into a lower and an upper half. The lower half gets
    /// `words / 2` words, so an odd range leaves the extra word on top.
    /// Returns `None` for a single word.
    pub fn split(&self) -> Option<(AddressRange, AddressRange)> {
        let words = self.words();
        if words < 2 {
            return None;
        }
        let mid = self.start + (words / 2) * WORD;
        Some((
            AddressRange {
                start: self.start,
                end: mid,
            },
            AddressRange {
                start: mid,
                end: self.end,
            },
        ))
    }

    /// Consecutive chunks of `chunk_size` bytes in ascending order; the last
    /// one is short when the range is not a multiple of the chunk size.
    pub fn chunks(&self, chunk_size: u64) -> Result<Vec<AddressRange>, RangeError> {
        if chunk_size == 0 || chunk_size % WORD != 0 {
            return Err(RangeError::ChunkSize(chunk_size));
        }
        let mut chunks = Vec::with_capacity(self.len().div_ceil(chunk_size) as usize);
        let mut start = self.start;
        while start < self.end {
            let end = start.saturating_add(chunk_size).min(self.end);
            chunks.push(AddressRange { start, end });
            start = end;
        }
        Ok(chunks)
    }

    /// Every aligned offset in the range, ascending.
    pub fn offsets(&self) -> impl Iterator<Item = u64> {
        (self.start..self.end).step_by(WORD as usize)
    }
}

/// Offset formatter for log fields, e.g. `0x008040`.
#[derive(Debug, Clone, Copy)]
pub struct Hex(pub u64);

impl fmt::Display for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#08x}", self.0)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#08x}-{:#08x}", self.start, self.end)
    }
}
