//! Lookup tables that invert the Timepix3 counter encodings.
//!
//! The chip stores its 10-bit counters (event count, TOT) as states of a
//! linear-feedback shift register and its 14-bit TOA as Gray code. Both are
//! inverted through tables built once per process by [`CodeTables::get`].

use std::sync::OnceLock;

/// Number of states of the 10-bit counter register.
pub const LFSR10_STATES: usize = 1 << 10;

/// Number of values of the 14-bit TOA counter.
pub const GRAY14_VALUES: usize = 1 << 14;

/// Seed state of the 10-bit counter register.
pub const LFSR10_SEED: u16 = 0b11_1111_1111;

const LFSR10_MASK: u16 = 0x3FF;
const GRAY14_MASK: u16 = 0x3FFF;

/// Inverse tables for the two counter encodings.
pub struct CodeTables {
    lfsr10_event: Box<[u16; LFSR10_STATES]>,
    lfsr10_tot: Box<[u16; LFSR10_STATES]>,
    lfsr10_states: Box<[u16; LFSR10_STATES]>,
    gray14: Box<[u16; GRAY14_VALUES]>,
}

static TABLES: OnceLock<CodeTables> = OnceLock::new();

impl CodeTables {
    /// Returns the process-wide tables, building them on first use.
    pub fn get() -> &'static CodeTables {
        TABLES.get_or_init(CodeTables::build)
    }

    /// Builds a fresh set of tables.
    #[must_use]
    pub fn build() -> Self {
        let (lfsr10_event, lfsr10_states) = build_lfsr10();
        let (lfsr10_tot, _) = build_lfsr10();
        Self {
            lfsr10_event,
            lfsr10_tot,
            lfsr10_states,
            gray14: build_gray14(),
        }
    }

    /// Decodes a 10-bit event counter register state.
    #[inline]
    #[must_use]
    pub fn event_counter(&self, state: u16) -> u16 {
        self.lfsr10_event[usize::from(state & LFSR10_MASK)]
    }

    /// Decodes a 10-bit TOT register state.
    #[inline]
    #[must_use]
    pub fn tot(&self, state: u16) -> u16 {
        self.lfsr10_tot[usize::from(state & LFSR10_MASK)]
    }

    /// Decodes a 14-bit Gray-coded TOA.
    #[inline]
    #[must_use]
    pub fn toa(&self, gray: u16) -> u16 {
        self.gray14[usize::from(gray & GRAY14_MASK)]
    }

    /// Register state reached after `count` steps from the seed.
    #[inline]
    #[must_use]
    pub fn lfsr10_encode(&self, count: u16) -> u16 {
        self.lfsr10_states[usize::from(count & LFSR10_MASK)]
    }
}

/// Advances the 10-bit register by one step.
///
/// Feedback polynomial x^10 + x^7 + 1: bits 9 and 6 are XORed into bit 0.
#[inline]
#[must_use]
pub fn lfsr10_step(state: u16) -> u16 {
    let feedback = ((state >> 9) ^ (state >> 6)) & 1;
    ((state << 1) | feedback) & LFSR10_MASK
}

/// Returns `(inverse, states)`: `inverse[state] = count`, `states[count] = state`.
fn build_lfsr10() -> (Box<[u16; LFSR10_STATES]>, Box<[u16; LFSR10_STATES]>) {
    let mut inverse = Box::new([0u16; LFSR10_STATES]);
    let mut states = Box::new([0u16; LFSR10_STATES]);
    let mut state = LFSR10_SEED;
    for count in 0..LFSR10_STATES {
        inverse[usize::from(state)] = count as u16;
        states[count] = state;
        state = lfsr10_step(state);
    }
    // The register has 1023 live states; count 1023 lands back on the seed.
    inverse[usize::from(LFSR10_SEED)] = 0;
    (inverse, states)
}

fn build_gray14() -> Box<[u16; GRAY14_VALUES]> {
    let mut table = Box::new([0u16; GRAY14_VALUES]);
    for (gray, slot) in table.iter_mut().enumerate() {
        *slot = gray_decode(gray as u16, 14);
    }
    table
}

/// Encodes a value as reflected-binary Gray code.
#[inline]
#[must_use]
pub fn gray14_encode(value: u16) -> u16 {
    let value = value & GRAY14_MASK;
    value ^ (value >> 1)
}

/// Recovers binary from a `width`-bit Gray code, MSB first.
#[must_use]
pub fn gray_decode(gray: u16, width: u32) -> u16 {
    let mut binary = 0u16;
    let mut prev = 0u16;
    for bit in (0..width).rev() {
        prev ^= (gray >> bit) & 1;
        binary |= prev << bit;
    }
    binary
}
