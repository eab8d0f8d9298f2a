//! Header dispatch and field extraction for 48-bit logical words.

use crate::tables::{gray14_encode, CodeTables};
use crate::word::LogicalWord;
use crate::ChipMode;
use tpxdaq_core::{HitRecord, PixelCoord};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Pixel data, header variant 0xA.
pub const HEADER_PIXEL_A: u8 = 0xA;
/// Pixel data, header variant 0xB.
pub const HEADER_PIXEL_B: u8 = 0xB;
/// Timer extension broadcast inserted by the readout firmware.
pub const HEADER_TIMER_EXTENSION: u8 = 0x5;
/// Shutter timer broadcast inserted by the readout firmware.
pub const HEADER_SHUTTER_TIMER: u8 = 0x6;

/// Payload bits of a timer broadcast (everything below the header nibble).
pub const TIMER_VALUE_MASK: u64 = 0x0FFF_FFFF_FFFF;

const PIXEL_SHIFT: u32 = 28;
const SUPER_PIXEL_SHIFT: u32 = PIXEL_SHIFT + 3;
const EOC_SHIFT: u32 = SUPER_PIXEL_SHIFT + 6;
const TOA_SHIFT: u32 = 14;
const COUNTER_SHIFT: u32 = 4;

/// Class of a logical word, from its top nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum HeaderClass {
    /// Pixel hit data.
    PixelHit,
    /// Wide timer extension broadcast.
    TimerExtension,
    /// Shutter timer broadcast.
    ShutterTimer,
    /// Periphery and configuration acknowledgements.
    Control,
}

impl HeaderClass {
    /// Classifies a header nibble.
    #[must_use]
    pub fn from_header(header: u8) -> Self {
        match header {
            HEADER_PIXEL_A | HEADER_PIXEL_B => HeaderClass::PixelHit,
            HEADER_TIMER_EXTENSION => HeaderClass::TimerExtension,
            HEADER_SHUTTER_TIMER => HeaderClass::ShutterTimer,
            _ => HeaderClass::Control,
        }
    }
}

/// Which timer a broadcast carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TimerKind {
    /// Coarse TOA extension counter.
    Extension,
    /// Shutter timer.
    Shutter,
}

impl TimerKind {
    /// Header nibble used for this kind of broadcast.
    #[must_use]
    pub fn header(self) -> u8 {
        match self {
            TimerKind::Extension => HEADER_TIMER_EXTENSION,
            TimerKind::Shutter => HEADER_SHUTTER_TIMER,
        }
    }
}

/// A chip-wide timer value observed on one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TimerBroadcast {
    /// Timer kind.
    pub kind: TimerKind,
    /// Link the broadcast arrived on.
    pub link: u8,
    /// Stream index of the broadcast's first raw word.
    pub index: u64,
    /// Counter value.
    pub value: u64,
}

/// Address fields of a pixel hit word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelAddress {
    /// End-of-column (column pair) address, 7 bits.
    pub eoc: u8,
    /// Super-pixel address within the column pair, 6 bits.
    pub super_pixel: u8,
    /// Pixel within the super pixel, 3 bits (4..7 are the right column).
    pub pixel: u8,
}

impl PixelAddress {
    /// Extracts the address fields of a logical word.
    #[inline]
    #[must_use]
    pub fn from_word(value: u64) -> Self {
        Self {
            eoc: ((value >> EOC_SHIFT) & 0x7F) as u8,
            super_pixel: ((value >> SUPER_PIXEL_SHIFT) & 0x3F) as u8,
            pixel: ((value >> PIXEL_SHIFT) & 0x7) as u8,
        }
    }

    /// Address of a matrix coordinate.
    #[must_use]
    pub fn from_coord(coord: PixelCoord) -> Self {
        let right = u16::from(coord.is_right());
        Self {
            eoc: (coord.eoc() & 0x7F) as u8,
            super_pixel: ((coord.y / 4) & 0x3F) as u8,
            pixel: ((coord.y % 4) + 4 * right) as u8,
        }
    }

    /// Matrix coordinate of this address.
    #[inline]
    #[must_use]
    pub fn coord(&self) -> PixelCoord {
        let right = u16::from(self.pixel > 3);
        let y = u16::from(self.super_pixel) * 4 + (u16::from(self.pixel) - 4 * right);
        let x = u16::from(self.eoc) * 2 + right;
        PixelCoord::new(x, y)
    }

    /// Address bits placed at their word positions.
    #[must_use]
    pub fn to_bits(&self) -> u64 {
        (u64::from(self.eoc & 0x7F) << EOC_SHIFT)
            | (u64::from(self.super_pixel & 0x3F) << SUPER_PIXEL_SHIFT)
            | (u64::from(self.pixel & 0x7) << PIXEL_SHIFT)
    }
}

/// A classified and decoded logical word.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Packet {
    /// Pixel hit; timing and scan tags are not yet filled in.
    Hit(HitRecord),
    /// Timer broadcast.
    Timer(TimerBroadcast),
    /// Control word, passed through undecoded.
    Control(LogicalWord),
}

impl Packet {
    /// Decodes a logical word.
    #[must_use]
    pub fn decode(word: &LogicalWord, mode: ChipMode, tables: &CodeTables) -> Self {
        let value = word.value;
        let header = word.header();
        match HeaderClass::from_header(header) {
            HeaderClass::PixelHit => Packet::Hit(decode_pixel(word, header, mode, tables)),
            HeaderClass::TimerExtension => Packet::Timer(TimerBroadcast {
                kind: TimerKind::Extension,
                link: word.link,
                index: word.index,
                value: value & TIMER_VALUE_MASK,
            }),
            HeaderClass::ShutterTimer => Packet::Timer(TimerBroadcast {
                kind: TimerKind::Shutter,
                link: word.link,
                index: word.index,
                value: value & TIMER_VALUE_MASK,
            }),
            HeaderClass::Control => Packet::Control(*word),
        }
    }

    /// Returns true if this is a hit packet.
    #[must_use]
    pub fn is_hit(&self) -> bool {
        matches!(self, Packet::Hit(_))
    }
}

fn decode_pixel(word: &LogicalWord, header: u8, mode: ChipMode, tables: &CodeTables) -> HitRecord {
    let value = word.value;
    let coord = PixelAddress::from_word(value).coord();
    let toa = tables.toa(((value >> TOA_SHIFT) & 0x3FFF) as u16);
    let counter = ((value >> COUNTER_SHIFT) & 0x3FF) as u16;

    let (tot, event_counter, hit_counter) = match mode {
        ChipMode::ToaTot => (tables.tot(counter), 0, (value & 0xF) as u8),
        ChipMode::EventCount => (0, tables.event_counter(counter), 0),
    };

    HitRecord {
        data_header: ((value >> 47) & 1) as u8,
        header,
        coord,
        toa,
        tot,
        event_counter,
        hit_counter,
        link: word.link,
        stream_index: word.index,
        ..HitRecord::default()
    }
}

/// Field values of a pixel hit, before encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PixelFields {
    /// Pixel position.
    pub coord: PixelCoord,
    /// Binary TOA, 14 bits.
    pub toa: u16,
    /// TOT or event count (mode dependent), 10 bits.
    pub counter: u16,
    /// Hit counter, 4 bits.
    pub hit_counter: u8,
}

/// Encodes pixel fields the way the chip transmits them.
#[must_use]
pub fn encode_pixel(fields: &PixelFields, tables: &CodeTables) -> u64 {
    (u64::from(HEADER_PIXEL_B) << 44)
        | PixelAddress::from_coord(fields.coord).to_bits()
        | (u64::from(gray14_encode(fields.toa)) << TOA_SHIFT)
        | (u64::from(tables.lfsr10_encode(fields.counter)) << COUNTER_SHIFT)
        | u64::from(fields.hit_counter & 0xF)
}

/// Encodes a timer broadcast word.
#[must_use]
pub fn encode_timer(kind: TimerKind, value: u64) -> u64 {
    (u64::from(kind.header()) << 44) | (value & TIMER_VALUE_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logical(value: u64) -> LogicalWord {
        LogicalWord {
            value,
            index: 0,
            link: 0,
        }
    }

    #[test]
    fn test_header_class() {
        assert_eq!(HeaderClass::from_header(0xA), HeaderClass::PixelHit);
        assert_eq!(HeaderClass::from_header(0xB), HeaderClass::PixelHit);
        assert_eq!(HeaderClass::from_header(0x5), HeaderClass::TimerExtension);
        assert_eq!(HeaderClass::from_header(0x6), HeaderClass::ShutterTimer);
        assert_eq!(HeaderClass::from_header(0x7), HeaderClass::Control);
        assert_eq!(HeaderClass::from_header(0x0), HeaderClass::Control);
    }

    #[test]
    fn test_reference_pixel_address() {
        let addr = PixelAddress {
            eoc: 2,
            super_pixel: 10,
            pixel: 5,
        };
        assert_eq!(addr.coord(), PixelCoord::new(5, 41));
        assert_eq!(PixelAddress::from_word(addr.to_bits()), addr);
    }

    #[test]
    fn test_pixel_address_exhaustive() {
        for eoc in 0..128u8 {
            for super_pixel in 0..64u8 {
                for pixel in 0..8u8 {
                    let addr = PixelAddress {
                        eoc,
                        super_pixel,
                        pixel,
                    };
                    let right = u16::from(pixel > 3);
                    let coord = addr.coord();
                    assert_eq!(coord.x, u16::from(eoc) * 2 + right);
                    assert_eq!(
                        coord.y,
                        u16::from(super_pixel) * 4 + u16::from(pixel) - 4 * right
                    );
                    assert_eq!(PixelAddress::from_coord(coord), addr);
                    assert_eq!(PixelAddress::from_word(addr.to_bits()), addr);
                }
            }
        }
    }

    #[test]
    fn test_decode_pixel_toa_tot() {
        let tables = CodeTables::get();
        let fields = PixelFields {
            coord: PixelCoord::new(5, 41),
            toa: 0x2ABC,
            counter: 321,
            hit_counter: 9,
        };
        let word = logical(encode_pixel(&fields, tables));
        let Packet::Hit(hit) = Packet::decode(&word, ChipMode::ToaTot, tables) else {
            panic!("expected a hit");
        };
        assert_eq!(hit.coord, fields.coord);
        assert_eq!(hit.toa, 0x2ABC);
        assert_eq!(hit.tot, 321);
        assert_eq!(hit.hit_counter, 9);
        assert_eq!(hit.event_counter, 0);
        assert_eq!(hit.header, 0xB);
        assert_eq!(hit.data_header, 1);
    }

    #[test]
    fn test_decode_pixel_event_count() {
        let tables = CodeTables::get();
        let fields = PixelFields {
            coord: PixelCoord::new(200, 3),
            toa: 17,
            counter: 700,
            hit_counter: 0xF,
        };
        let word = logical(encode_pixel(&fields, tables));
        let Packet::Hit(hit) = Packet::decode(&word, ChipMode::EventCount, tables) else {
            panic!("expected a hit");
        };
        assert_eq!(hit.coord, PixelCoord::new(200, 3));
        assert_eq!(hit.event_counter, 700);
        assert_eq!(hit.tot, 0);
        assert_eq!(hit.hit_counter, 0);
    }

    #[test]
    fn test_decode_timer_words() {
        let tables = CodeTables::get();
        let word = LogicalWord {
            value: encode_timer(TimerKind::Extension, 0x0123_4567_89AB),
            index: 42,
            link: 2,
        };
        let packet = Packet::decode(&word, ChipMode::ToaTot, tables);
        assert_eq!(
            packet,
            Packet::Timer(TimerBroadcast {
                kind: TimerKind::Extension,
                link: 2,
                index: 42,
                value: 0x0123_4567_89AB,
            })
        );

        let word = logical(encode_timer(TimerKind::Shutter, 77));
        assert!(matches!(
            Packet::decode(&word, ChipMode::ToaTot, tables),
            Packet::Timer(TimerBroadcast {
                kind: TimerKind::Shutter,
                value: 77,
                ..
            })
        ));
    }

    #[test]
    fn test_control_passthrough() {
        let tables = CodeTables::get();
        let word = logical(0x7100_0000_0000);
        let packet = Packet::decode(&word, ChipMode::ToaTot, tables);
        assert_eq!(packet, Packet::Control(word));
        assert!(!packet.is_hit());
    }
}
