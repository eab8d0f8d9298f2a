//! Raw FIFO words and their reassembly into 48-bit logical words.
//!
//! Each raw 32-bit word carries 24 payload bits. The top byte holds framing:
//! bits 27..25 name the receiver link the word came from. Two consecutive
//! words of the same link form one logical word, the second word supplying
//! the high half.

/// Payload bits of a raw word.
pub const PAYLOAD_MASK: u32 = 0x00FF_FFFF;

/// Position of the link id inside a raw word.
pub const LINK_SHIFT: u32 = 25;

/// Width mask of the link id.
pub const LINK_MASK: u32 = 0x7;

/// Largest number of links that fit the link id field.
pub const MAX_LINKS: usize = 8;

/// Mask of the 48 significant bits of a logical word.
pub const LOGICAL_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// Link id carried by a raw word.
#[inline]
#[must_use]
pub fn link_id(raw: u32) -> u8 {
    ((raw >> LINK_SHIFT) & LINK_MASK) as u8
}

/// A raw word with its position in the acquisition stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedWord {
    /// Stream index of the word.
    pub index: u64,
    /// Raw value as read from the FIFO.
    pub raw: u32,
}

/// A reassembled 48-bit word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalWord {
    /// The 48-bit value.
    pub value: u64,
    /// Stream index of the first raw word of the pair.
    pub index: u64,
    /// Link the pair arrived on.
    pub link: u8,
}

impl LogicalWord {
    /// Combines a pair of raw words; `w1` supplies the high 24 bits.
    #[inline]
    #[must_use]
    pub fn from_pair(w0: IndexedWord, w1: IndexedWord, link: u8) -> Self {
        let low = u64::from(w0.raw & PAYLOAD_MASK);
        let high = u64::from(w1.raw & PAYLOAD_MASK);
        Self {
            value: (high << 24) | low,
            index: w0.index,
            link,
        }
    }

    /// Header nibble (bits 47..44).
    #[inline]
    #[must_use]
    pub fn header(&self) -> u8 {
        ((self.value >> 44) & 0xF) as u8
    }
}

/// Splits a logical word into the two raw words that carry it on `link`.
#[must_use]
pub fn frame_logical(value: u64, link: u8) -> [u32; 2] {
    let tag = (u32::from(link) & LINK_MASK) << LINK_SHIFT;
    let low = (value & u64::from(PAYLOAD_MASK)) as u32;
    let high = ((value >> 24) & u64::from(PAYLOAD_MASK)) as u32;
    [tag | low, tag | high]
}

/// Raw words sorted into per-link sub-streams.
#[derive(Debug, Clone, Default)]
pub struct LinkDemux {
    /// Sub-stream of each link, in original order.
    pub links: Vec<Vec<IndexedWord>>,
    /// Words whose link id exceeded the configured link count.
    pub stray: usize,
}

/// Sorts raw words into per-link sub-streams.
///
/// `base_index` is the stream index of `words[0]`. Order within each link is
/// preserved; words tagged with a link id `>= n_links` are counted and
/// dropped.
#[must_use]
pub fn split_links(words: &[u32], base_index: u64, n_links: usize) -> LinkDemux {
    let n_links = n_links.clamp(1, MAX_LINKS);
    let mut demux = LinkDemux {
        links: (0..n_links)
            .map(|_| Vec::with_capacity(words.len() / n_links + 1))
            .collect(),
        stray: 0,
    };
    for (offset, &raw) in words.iter().enumerate() {
        let link = usize::from(link_id(raw));
        let word = IndexedWord {
            index: base_index + offset as u64,
            raw,
        };
        match demux.links.get_mut(link) {
            Some(stream) => stream.push(word),
            None => demux.stray += 1,
        }
    }
    if demux.stray > 0 {
        log::warn!(
            "dropped {} raw word(s) tagged for links beyond {}",
            demux.stray,
            n_links
        );
    }
    demux
}

/// Result of pairing one link's sub-stream.
#[derive(Debug, Clone, Default)]
pub struct Reassembled {
    /// Logical words in stream order.
    pub words: Vec<LogicalWord>,
    /// Set when the sub-stream had an odd word count.
    pub framing_error: bool,
}

/// Pairs one link's raw words into logical words.
///
/// An odd trailing word is dropped and reported as a framing error; this
/// never fails.
#[must_use]
pub fn reassemble(link: u8, stream: &[IndexedWord]) -> Reassembled {
    let framing_error = stream.len() % 2 != 0;
    if framing_error {
        if let Some(last) = stream.last() {
            log::warn!(
                "link {link}: odd word count {}, dropping trailing word at index {}",
                stream.len(),
                last.index
            );
        }
    }
    let words = stream
        .chunks_exact(2)
        .map(|pair| LogicalWord::from_pair(pair[0], pair[1], link))
        .collect();
    Reassembled {
        words,
        framing_error,
    }
}
