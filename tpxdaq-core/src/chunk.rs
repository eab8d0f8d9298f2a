//! Scan chunk descriptors.
//!
//! Every readout burst appends one [`ScanChunk`] describing which raw words
//! it delivered and which scan parameter was active at the time. The table
//! is written by the acquisition layer and only read by the decoder.

use crate::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Descriptor of one readout burst in the raw word stream.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ScanChunk {
    /// Index of the first raw word (inclusive).
    pub index_start: u32,
    /// Index one past the last raw word (exclusive).
    pub index_stop: u32,
    /// Number of raw words in the burst.
    pub data_length: u32,
    /// Wall-clock start of the readout interval (seconds since the epoch).
    pub timestamp_start: f64,
    /// Wall-clock end of the readout interval (seconds since the epoch).
    pub timestamp_stop: f64,
    /// Scan parameter id active during the burst.
    pub scan_param_id: u32,
    /// Readout status flags (0 = no error).
    pub error: u32,
    /// Trigger value recorded with the burst.
    pub trigger: f64,
}

impl ScanChunk {
    /// Creates a descriptor for `[index_start, index_stop)`.
    #[must_use]
    pub fn new(index_start: u32, index_stop: u32, scan_param_id: u32) -> Self {
        Self {
            index_start,
            index_stop,
            data_length: index_stop.saturating_sub(index_start),
            scan_param_id,
            ..Self::default()
        }
    }

    /// Sets the wall-clock interval of the burst.
    #[must_use]
    pub fn with_interval(mut self, start: f64, stop: f64) -> Self {
        self.timestamp_start = start;
        self.timestamp_stop = stop;
        self
    }

    /// Sets the status flags of the burst.
    #[must_use]
    pub fn with_error(mut self, error: u32) -> Self {
        self.error = error;
        self
    }

    /// Number of raw words covered by the descriptor.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index_stop.saturating_sub(self.index_start) as usize
    }

    /// Returns true if the descriptor covers no words.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index_stop <= self.index_start
    }

    /// Whether the raw word at `index` belongs to this burst.
    #[inline]
    #[must_use]
    pub fn contains(&self, index: u64) -> bool {
        u64::from(self.index_start) <= index && index < u64::from(self.index_stop)
    }
}

/// Ordered, non-overlapping table of scan chunk descriptors.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ChunkTable {
    chunks: Vec<ScanChunk>,
}

impl ChunkTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from descriptors, validating their order.
    ///
    /// # Errors
    /// Returns an error if any descriptor is inverted or overlaps its predecessor.
    pub fn from_chunks(chunks: impl IntoIterator<Item = ScanChunk>) -> Result<Self> {
        let mut table = Self::new();
        for chunk in chunks {
            table.push(chunk)?;
        }
        Ok(table)
    }

    /// Appends a descriptor.
    ///
    /// # Errors
    /// Returns an error if the descriptor is inverted or starts before the
    /// previous descriptor ended.
    pub fn push(&mut self, chunk: ScanChunk) -> Result<()> {
        if chunk.index_start > chunk.index_stop {
            return Err(Error::InvertedChunk {
                start: chunk.index_start,
                stop: chunk.index_stop,
            });
        }
        if let Some(last) = self.chunks.last() {
            if chunk.index_start < last.index_stop {
                return Err(Error::OverlappingChunk {
                    start: chunk.index_start,
                    previous_stop: last.index_stop,
                });
            }
        }
        self.chunks.push(chunk);
        Ok(())
    }

    /// Finds the descriptor whose range contains `index`.
    ///
    /// Binary search on the start offsets, then a containment check (there
    /// may be gaps between descriptors).
    #[must_use]
    pub fn find(&self, index: u64) -> Option<&ScanChunk> {
        let pos = self
            .chunks
            .partition_point(|c| u64::from(c.index_start) <= index);
        let candidate = self.chunks.get(pos.checked_sub(1)?)?;
        candidate.contains(index).then_some(candidate)
    }

    /// Index one past the last word covered by the table.
    #[must_use]
    pub fn end_offset(&self) -> u32 {
        self.chunks.last().map_or(0, |c| c.index_stop)
    }

    /// Number of descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Returns true if the table has no descriptors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Descriptors in stream order.
    #[must_use]
    pub fn as_slice(&self) -> &[ScanChunk] {
        &self.chunks
    }

    /// Iterates over the descriptors in stream order.
    pub fn iter(&self) -> impl Iterator<Item = &ScanChunk> {
        self.chunks.iter()
    }
}
