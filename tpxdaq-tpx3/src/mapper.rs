//! Scan chunk mapping and chunk-wise stream decoding.
//!
//! Hits are tagged with the scan parameter id and start time of the readout
//! burst that delivered them. A stream can be decoded in one pass, one
//! descriptor at a time, or in parallel:
//!
//! 1. **Phase 1 (Sequential)**: walk the descriptors, propagating the
//!    per-link timer state from each chunk to the next
//! 2. **Phase 2 (Parallel)**: decode every chunk from its inherited state
//!
//! All three produce the same hit sequence.

use crate::decoder::{DecodeStats, DecodedChunk, Decoder, DecoderState};
use rayon::prelude::*;
use tpxdaq_core::{ChunkTable, HitRecord, ScanChunk};

/// Assigns scan chunk tags to hits by stream index.
#[derive(Debug, Clone, Copy)]
pub struct ChunkMapper<'a> {
    table: &'a ChunkTable,
}

impl<'a> ChunkMapper<'a> {
    /// Creates a mapper over a descriptor table.
    #[must_use]
    pub fn new(table: &'a ChunkTable) -> Self {
        Self { table }
    }

    /// Tags one hit; returns false if no descriptor contains it.
    pub fn tag(&self, hit: &mut HitRecord) -> bool {
        match self.table.find(hit.stream_index) {
            Some(chunk) => {
                apply_tag(hit, chunk);
                true
            }
            None => false,
        }
    }

    /// Tags all hits; returns the number left untagged.
    pub fn tag_all(&self, hits: &mut [HitRecord]) -> usize {
        hits.iter_mut()
            .map(|hit| self.tag(hit))
            .filter(|tagged| !tagged)
            .count()
    }
}

#[inline]
fn apply_tag(hit: &mut HitRecord, chunk: &ScanChunk) {
    hit.scan_param_id = chunk.scan_param_id;
    hit.chunk_start_time = chunk.timestamp_start;
}

/// Tags every hit with one descriptor, regardless of stream index.
pub fn tag_hits(hits: &mut [HitRecord], chunk: &ScanChunk) {
    for hit in hits {
        apply_tag(hit, chunk);
    }
}

/// Result of decoding a whole stream.
#[derive(Debug, Clone, Default)]
pub struct StreamDecode {
    /// Tagged hits ordered by stream index.
    pub hits: Vec<HitRecord>,
    /// Accumulated counters.
    pub stats: DecodeStats,
    /// State after the last word.
    pub state: DecoderState,
    /// Words past the end of the descriptor table, left undecoded.
    pub trailing_words: usize,
}

/// Raw words covered by `chunk`, clamped to the available data.
#[must_use]
pub fn chunk_words<'w>(words: &'w [u32], chunk: &ScanChunk) -> &'w [u32] {
    let start = (chunk.index_start as usize).min(words.len());
    let stop = (chunk.index_stop as usize).clamp(start, words.len());
    if stop < chunk.index_stop as usize {
        log::warn!(
            "chunk [{}, {}) extends past the {} available words",
            chunk.index_start,
            chunk.index_stop,
            words.len()
        );
    }
    &words[start..stop]
}

// Words the table does not reach.
fn trailing_words(words: &[u32], table: &ChunkTable) -> usize {
    let trailing = words.len().saturating_sub(table.end_offset() as usize);
    if trailing > 0 {
        log::warn!(
            "chunk table ends at word {} of {}, {} trailing word(s) not decoded",
            table.end_offset(),
            words.len(),
            trailing
        );
    }
    trailing
}

/// Decodes and tags one descriptor's range of the stream.
#[must_use]
pub fn decode_chunk(
    decoder: &Decoder<'_>,
    words: &[u32],
    chunk: &ScanChunk,
    state: &DecoderState,
) -> (DecodedChunk, DecoderState) {
    let data = chunk_words(words, chunk);
    let (mut decoded, next) = decoder.decode(data, u64::from(chunk.index_start), state);
    tag_hits(&mut decoded.hits, chunk);
    (decoded, next)
}

/// Decodes the whole stream in one pass, then tags hits through the table.
#[must_use]
pub fn decode_stream(decoder: &Decoder<'_>, words: &[u32], table: &ChunkTable) -> StreamDecode {
    let (mut decoded, state) = decoder.decode(words, 0, &DecoderState::new());
    decoded.stats.unmatched_hits = ChunkMapper::new(table).tag_all(&mut decoded.hits);
    if decoded.stats.unmatched_hits > 0 {
        log::warn!(
            "{} hit(s) outside every scan chunk",
            decoded.stats.unmatched_hits
        );
    }
    StreamDecode {
        hits: decoded.hits,
        stats: decoded.stats,
        state,
        trailing_words: 0,
    }
}

/// Decodes one descriptor at a time, threading the state sequentially.
#[must_use]
pub fn decode_chunks(decoder: &Decoder<'_>, words: &[u32], table: &ChunkTable) -> StreamDecode {
    let mut out = StreamDecode::default();
    for chunk in table.iter() {
        let (decoded, next) = decode_chunk(decoder, words, chunk, &out.state);
        out.hits.extend(decoded.hits);
        out.stats += decoded.stats;
        out.state = next;
    }
    out.trailing_words = trailing_words(words, table);
    out
}

/// Decodes descriptors in parallel.
///
/// A sequential pass computes the state each chunk starts from; chunks are
/// then decoded independently with rayon and concatenated in table order.
#[must_use]
pub fn decode_chunks_parallel(
    decoder: &Decoder<'_>,
    words: &[u32],
    table: &ChunkTable,
) -> StreamDecode {
    // Phase 1: initial state of every chunk
    let mut initial_states = Vec::with_capacity(table.len());
    let mut state = DecoderState::new();
    for chunk in table.iter() {
        let next = decoder.advance_state(
            chunk_words(words, chunk),
            u64::from(chunk.index_start),
            &state,
        );
        initial_states.push(state);
        state = next;
    }

    // Phase 2: independent chunk decodes
    let decoded: Vec<DecodedChunk> = table
        .as_slice()
        .par_iter()
        .zip(initial_states.par_iter())
        .map(|(chunk, initial)| decode_chunk(decoder, words, chunk, initial).0)
        .collect();

    let total_hits = decoded.iter().map(|c| c.hits.len()).sum();
    let mut out = StreamDecode {
        hits: Vec::with_capacity(total_hits),
        stats: DecodeStats::default(),
        state,
        trailing_words: trailing_words(words, table),
    };
    for chunk in decoded {
        out.hits.extend(chunk.hits);
        out.stats += chunk.stats;
    }
    out
}
