//! Chunk decoder: raw words in, tagged-ready hit records out.
//!
//! Decoding a chunk runs link demux, pairing, header dispatch and timestamp
//! reconciliation. The only state that survives a chunk is the last timer
//! broadcast of each kind per link, carried explicitly in [`DecoderState`].

use crate::packet::{HeaderClass, Packet, TimerBroadcast, TimerKind};
use crate::tables::CodeTables;
use crate::timestamp::{reconcile, TimerHistory, TimerSample};
use crate::word::{reassemble, split_links, Reassembled, MAX_LINKS};
use crate::DecoderConfig;
use std::ops::AddAssign;
use tpxdaq_core::HitRecord;

/// Last timer broadcasts of one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkState {
    /// Latest timer extension broadcast.
    pub extension: Option<TimerSample>,
    /// Latest shutter timer broadcast.
    pub shutter: Option<TimerSample>,
}

/// Decoder state threaded from one chunk to the next.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecoderState {
    links: [LinkState; MAX_LINKS],
}

impl DecoderState {
    /// State before any word has been seen.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// State of one link.
    ///
    /// # Panics
    /// Panics if `link >= MAX_LINKS`.
    #[must_use]
    pub fn link(&self, link: usize) -> &LinkState {
        &self.links[link]
    }

    fn record(&mut self, broadcast: &TimerBroadcast) {
        let sample = TimerSample {
            index: broadcast.index,
            value: broadcast.value,
        };
        let state = &mut self.links[usize::from(broadcast.link)];
        match broadcast.kind {
            TimerKind::Extension => state.extension = Some(sample),
            TimerKind::Shutter => state.shutter = Some(sample),
        }
    }
}

/// Counters collected while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecodeStats {
    /// Raw words consumed.
    pub raw_words: usize,
    /// Logical words formed.
    pub logical_words: usize,
    /// Pixel hits decoded.
    pub hits: usize,
    /// Timer broadcasts seen.
    pub timer_words: usize,
    /// Control words passed through.
    pub control_words: usize,
    /// Link sub-streams with an odd word count.
    pub framing_errors: usize,
    /// Raw words tagged for an unconfigured link.
    pub stray_words: usize,
    /// Hits whose extension was stepped back once.
    pub corrected_timestamps: usize,
    /// Hits whose overlap bits disagreed even after correction.
    pub timestamp_mismatches: usize,
    /// Hits outside every scan chunk descriptor.
    pub unmatched_hits: usize,
}

impl AddAssign for DecodeStats {
    fn add_assign(&mut self, other: Self) {
        self.raw_words += other.raw_words;
        self.logical_words += other.logical_words;
        self.hits += other.hits;
        self.timer_words += other.timer_words;
        self.control_words += other.control_words;
        self.framing_errors += other.framing_errors;
        self.stray_words += other.stray_words;
        self.corrected_timestamps += other.corrected_timestamps;
        self.timestamp_mismatches += other.timestamp_mismatches;
        self.unmatched_hits += other.unmatched_hits;
    }
}

/// Output of decoding one chunk.
#[derive(Debug, Clone, Default)]
pub struct DecodedChunk {
    /// Hits ordered by stream index, scan tags unset.
    pub hits: Vec<HitRecord>,
    /// Timer broadcasts ordered by stream index.
    pub broadcasts: Vec<TimerBroadcast>,
    /// Counters for this chunk.
    pub stats: DecodeStats,
}

/// Decoder for the Timepix3 48-bit word stream.
#[derive(Clone, Copy)]
pub struct Decoder<'t> {
    config: DecoderConfig,
    tables: &'t CodeTables,
}

impl Decoder<'static> {
    /// Creates a decoder using the process-wide code tables.
    #[must_use]
    pub fn new(config: DecoderConfig) -> Self {
        Self::with_tables(config, CodeTables::get())
    }
}

impl<'t> Decoder<'t> {
    /// Creates a decoder with explicit code tables.
    #[must_use]
    pub fn with_tables(config: DecoderConfig, tables: &'t CodeTables) -> Self {
        Self { config, tables }
    }

    /// Decoder configuration.
    #[must_use]
    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Decodes one chunk of raw words.
    ///
    /// `base_index` is the stream index of `words[0]`; `state` is the state
    /// returned for the preceding chunk. Returns the decoded chunk and the
    /// state to pass to the next one.
    #[must_use]
    pub fn decode(
        &self,
        words: &[u32],
        base_index: u64,
        state: &DecoderState,
    ) -> (DecodedChunk, DecoderState) {
        let mut out = DecodedChunk::default();
        let mut next_state = state.clone();
        out.stats.raw_words = words.len();

        let demux = split_links(words, base_index, self.config.n_links);
        out.stats.stray_words = demux.stray;

        for (link, stream) in demux.links.iter().enumerate() {
            if stream.is_empty() {
                continue;
            }
            let Reassembled {
                words: logical,
                framing_error,
            } = reassemble(link as u8, stream);
            out.stats.framing_errors += usize::from(framing_error);
            out.stats.logical_words += logical.len();

            let link_state = state.link(link);
            let mut extensions = TimerHistory::seeded(link_state.extension);
            let mut shutters = TimerHistory::seeded(link_state.shutter);
            let first_hit = out.hits.len();

            for word in &logical {
                match Packet::decode(word, self.config.chip_mode, self.tables) {
                    Packet::Hit(hit) => out.hits.push(hit),
                    Packet::Timer(broadcast) => {
                        let sample = TimerSample {
                            index: broadcast.index,
                            value: broadcast.value,
                        };
                        match broadcast.kind {
                            TimerKind::Extension => extensions.push(sample),
                            TimerKind::Shutter => shutters.push(sample),
                        }
                        next_state.record(&broadcast);
                        out.broadcasts.push(broadcast);
                    }
                    Packet::Control(_) => out.stats.control_words += 1,
                }
            }

            for hit in &mut out.hits[first_hit..] {
                hit.shutter_timer = shutters.lookup(hit.stream_index).unwrap_or(0);
                match extensions.lookup(hit.stream_index) {
                    Some(extension) => {
                        let r = reconcile(hit.toa, extension);
                        hit.toa_extension = r.extension;
                        hit.timestamp = r.timestamp;
                        out.stats.corrected_timestamps += usize::from(r.corrected);
                        if !r.consistent {
                            out.stats.timestamp_mismatches += 1;
                            log::debug!(
                                "link {link}: TOA {:#06x} inconsistent with extension {extension:#x} at index {}",
                                hit.toa,
                                hit.stream_index
                            );
                        }
                    }
                    None => hit.timestamp = u64::from(hit.toa),
                }
            }
        }

        out.hits.sort_by_key(|h| h.stream_index);
        out.broadcasts.sort_by_key(|b| b.index);
        out.stats.timer_words = out.broadcasts.len();
        out.stats.hits = out.hits.len();
        (out, next_state)
    }

    /// Advances the state over a chunk without decoding its hits.
    ///
    /// Equivalent to the state returned by [`Decoder::decode`], at the cost
    /// of a header check per logical word.
    #[must_use]
    pub fn advance_state(&self, words: &[u32], base_index: u64, state: &DecoderState) -> DecoderState {
        let mut next_state = state.clone();
        let demux = split_links(words, base_index, self.config.n_links);
        for (link, stream) in demux.links.iter().enumerate() {
            for word in reassemble(link as u8, stream).words {
                let class = HeaderClass::from_header(word.header());
                if !matches!(class, HeaderClass::TimerExtension | HeaderClass::ShutterTimer) {
                    continue;
                }
                if let Packet::Timer(broadcast) =
                    Packet::decode(&word, self.config.chip_mode, self.tables)
                {
                    next_state.record(&broadcast);
                }
            }
        }
        next_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{encode_pixel, encode_timer, PixelFields};
    use crate::word::frame_logical;
    use crate::ChipMode;
    use tpxdaq_core::PixelCoord;

    fn hit_word(x: u16, y: u16, toa: u16, tot: u16) -> u64 {
        encode_pixel(
            &PixelFields {
                coord: PixelCoord::new(x, y),
                toa,
                counter: tot,
                hit_counter: 0,
            },
            CodeTables::get(),
        )
    }

    fn push(stream: &mut Vec<u32>, value: u64, link: u8) {
        stream.extend_from_slice(&frame_logical(value, link));
    }

    #[test]
    fn test_decode_single_link() {
        let decoder = Decoder::new(DecoderConfig::default().with_n_links(1));
        let mut words = Vec::new();
        push(&mut words, encode_timer(TimerKind::Extension, 0b110), 0);
        push(&mut words, encode_timer(TimerKind::Shutter, 999), 0);
        push(&mut words, hit_word(5, 41, 0x2001, 12), 0);

        let (chunk, state) = decoder.decode(&words, 0, &DecoderState::new());
        assert_eq!(chunk.stats.logical_words, 3);
        assert_eq!(chunk.stats.timer_words, 2);
        assert_eq!(chunk.hits.len(), 1);

        let hit = chunk.hits[0];
        assert_eq!((hit.x(), hit.y()), (5, 41));
        assert_eq!(hit.tot, 12);
        assert_eq!(hit.stream_index, 4);
        assert_eq!(hit.shutter_timer, 999);
        assert_eq!(hit.toa_extension, 0b110);
        assert_eq!(hit.timestamp, (0b100 << 12) + 0x2001);

        assert_eq!(
            state.link(0).extension,
            Some(TimerSample {
                index: 0,
                value: 0b110
            })
        );
        assert_eq!(state.link(0).shutter.map(|s| s.value), Some(999));
    }

    #[test]
    fn test_decode_applies_correction() {
        let decoder = Decoder::new(DecoderConfig::default());
        let mut words = Vec::new();
        push(&mut words, encode_timer(TimerKind::Extension, 0b1011), 0);
        push(&mut words, hit_word(0, 0, 0b10 << 12, 1), 0);
        let (chunk, _) = decoder.decode(&words, 0, &DecoderState::new());
        assert_eq!(chunk.hits[0].toa_extension, 0b1010);
        assert_eq!(chunk.stats.corrected_timestamps, 1);
        assert_eq!(chunk.stats.timestamp_mismatches, 0);
    }

    #[test]
    fn test_decode_without_extension() {
        let decoder = Decoder::new(DecoderConfig::default());
        let mut words = Vec::new();
        push(&mut words, hit_word(1, 1, 0x155, 3), 0);
        let (chunk, state) = decoder.decode(&words, 0, &DecoderState::new());
        assert_eq!(chunk.hits[0].timestamp, 0x155);
        assert_eq!(chunk.hits[0].toa_extension, 0);
        assert_eq!(state, DecoderState::new());
    }

    #[test]
    fn test_links_do_not_share_broadcasts() {
        let decoder = Decoder::new(DecoderConfig::default().with_n_links(2));
        let mut words = Vec::new();
        push(&mut words, encode_timer(TimerKind::Extension, 0x40), 1);
        push(&mut words, hit_word(2, 2, 0, 1), 0);
        push(&mut words, hit_word(3, 3, 0, 1), 1);
        let (chunk, _) = decoder.decode(&words, 0, &DecoderState::new());
        assert_eq!(chunk.hits.len(), 2);
        assert_eq!(chunk.hits[0].link, 0);
        assert_eq!(chunk.hits[0].toa_extension, 0);
        assert_eq!(chunk.hits[1].link, 1);
        assert_eq!(chunk.hits[1].toa_extension, 0x40);
    }

    #[test]
    fn test_interleaved_pairs_are_merged_by_index() {
        let decoder = Decoder::new(DecoderConfig::default().with_n_links(2));
        let a = frame_logical(hit_word(10, 0, 0, 1), 0);
        let b = frame_logical(hit_word(20, 0, 0, 1), 1);
        // b's first word arrives before a's.
        let words = [b[0], a[0], a[1], b[1]];
        let (chunk, _) = decoder.decode(&words, 50, &DecoderState::new());
        let order: Vec<(u16, u64)> = chunk.hits.iter().map(|h| (h.x(), h.stream_index)).collect();
        assert_eq!(order, vec![(20, 50), (10, 51)]);
    }

    #[test]
    fn test_framing_error_is_counted() {
        let decoder = Decoder::new(DecoderConfig::default());
        let mut words = Vec::new();
        push(&mut words, hit_word(1, 2, 3, 4), 0);
        words.push(0x0000_0001);
        let (chunk, _) = decoder.decode(&words, 0, &DecoderState::new());
        assert_eq!(chunk.stats.framing_errors, 1);
        assert_eq!(chunk.hits.len(), 1);
    }

    #[test]
    fn test_event_count_mode() {
        let decoder = Decoder::new(DecoderConfig::default().with_chip_mode(ChipMode::EventCount));
        let mut words = Vec::new();
        push(&mut words, hit_word(7, 8, 0, 512), 0);
        let (chunk, _) = decoder.decode(&words, 0, &DecoderState::new());
        assert_eq!(chunk.hits[0].event_counter, 512);
        assert_eq!(chunk.hits[0].tot, 0);
    }

    #[test]
    fn test_advance_state_matches_decode() {
        let decoder = Decoder::new(DecoderConfig::default().with_n_links(3));
        let mut words = Vec::new();
        push(&mut words, encode_timer(TimerKind::Extension, 5), 2);
        push(&mut words, hit_word(0, 0, 0, 1), 0);
        push(&mut words, encode_timer(TimerKind::Shutter, 6), 1);
        push(&mut words, encode_timer(TimerKind::Extension, 9), 2);
        let (_, decoded) = decoder.decode(&words, 8, &DecoderState::new());
        let advanced = decoder.advance_state(&words, 8, &DecoderState::new());
        assert_eq!(decoded, advanced);
        assert_eq!(advanced.link(2).extension.map(|s| s.index), Some(14));
    }
}
