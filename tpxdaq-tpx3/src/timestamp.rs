//! Wide timestamps from timer extension broadcasts.
//!
//! The 14-bit TOA counter of a hit rolls over every 16384 ticks. The readout
//! firmware periodically broadcasts a coarse extension counter that
//! advances once per 4096 TOA ticks, so its two lowest bits overlap TOA bits
//! 13..12. A hit is combined with the most recent extension seen on its link;
//! the overlap bits tell whether that extension was sampled after the hit
//! rolled into the next quarter period, in which case it is one step ahead.

/// TOA bit position of the extension counter's least significant bit.
pub const EXTENSION_TICK_SHIFT: u32 = 12;

/// Extension bits that overlap the TOA counter.
pub const OVERLAP_MASK: u64 = 0b11;

/// A timer value together with the stream index it was observed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerSample {
    /// Stream index of the broadcast.
    pub index: u64,
    /// Counter value.
    pub value: u64,
}

/// Broadcasts of one kind on one link, in stream order.
#[derive(Debug, Clone, Default)]
pub struct TimerHistory {
    indices: Vec<u64>,
    values: Vec<u64>,
}

impl TimerHistory {
    /// Creates a history that starts with the sample carried over from a
    /// previous chunk, if any.
    #[must_use]
    pub fn seeded(previous: Option<TimerSample>) -> Self {
        let mut history = Self::default();
        if let Some(sample) = previous {
            history.push(sample);
        }
        history
    }

    /// Records a broadcast. Samples must arrive in stream order.
    pub fn push(&mut self, sample: TimerSample) {
        debug_assert!(self.indices.last().is_none_or(|&last| last <= sample.index));
        self.indices.push(sample.index);
        self.values.push(sample.value);
    }

    /// Value of the latest broadcast at or before `index`.
    ///
    /// Falls back to the first recorded broadcast when none precedes the
    /// index; `None` only when the history is empty.
    #[must_use]
    pub fn lookup(&self, index: u64) -> Option<u64> {
        let pos = self.indices.partition_point(|&i| i <= index);
        self.values.get(pos.saturating_sub(1)).copied()
    }

    /// Most recent sample, to be carried into the next chunk.
    #[must_use]
    pub fn last(&self) -> Option<TimerSample> {
        Some(TimerSample {
            index: *self.indices.last()?,
            value: *self.values.last()?,
        })
    }

    /// Number of recorded broadcasts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Returns true if no broadcast was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// TOA bits 13..12, the part shared with the extension counter.
#[inline]
#[must_use]
pub fn toa_overlap(toa: u16) -> u64 {
    u64::from(toa >> EXTENSION_TICK_SHIFT) & OVERLAP_MASK
}

/// Outcome of combining a hit's TOA with an extension value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    /// Extension after correction.
    pub extension: u64,
    /// Combined wide timestamp in TOA ticks.
    pub timestamp: u64,
    /// Set when the extension had to be stepped back.
    pub corrected: bool,
    /// Set when the overlap bits agree after correction.
    pub consistent: bool,
}

/// Combines a decoded TOA with the extension sampled nearest before it.
#[must_use]
pub fn reconcile(toa: u16, extension: u64) -> Reconciled {
    let overlap = toa_overlap(toa);
    let mut corrected = false;
    let mut ext = extension;
    if ext & OVERLAP_MASK != overlap {
        if let Some(previous) = ext.checked_sub(1) {
            ext = previous;
            corrected = true;
        }
    }
    Reconciled {
        extension: ext,
        timestamp: combine(toa, ext),
        corrected,
        consistent: ext & OVERLAP_MASK == overlap,
    }
}

/// Extension bits above the overlap, followed by the 14 TOA bits.
#[inline]
#[must_use]
pub fn combine(toa: u16, extension: u64) -> u64 {
    ((extension & !OVERLAP_MASK) << EXTENSION_TICK_SHIFT) + u64::from(toa & 0x3FFF)
}
