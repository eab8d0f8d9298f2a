//! Hit records decoded from Timepix3 pixel words.

use crate::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Side length of the Timepix3 pixel matrix.
pub const MATRIX_SIZE: u16 = 256;

/// Pixel coordinate on the sensor matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PixelCoord {
    /// X coordinate (column).
    pub x: u16,
    /// Y coordinate (row).
    pub y: u16,
}

impl PixelCoord {
    /// Creates a new pixel coordinate.
    #[inline]
    #[must_use]
    pub fn new(x: u16, y: u16) -> Self {
        Self { x, y }
    }

    /// Creates a coordinate, rejecting positions outside the matrix.
    ///
    /// # Errors
    /// Returns [`Error::InvalidCoordinate`] if either axis is >= 256.
    pub fn try_new(x: u16, y: u16) -> Result<Self> {
        if x >= MATRIX_SIZE || y >= MATRIX_SIZE {
            return Err(Error::InvalidCoordinate { x, y });
        }
        Ok(Self { x, y })
    }

    /// End-of-column address (column pair) of this pixel.
    #[inline]
    #[must_use]
    pub fn eoc(&self) -> u16 {
        self.x / 2
    }

    /// Whether this pixel sits in the right column of its column pair.
    #[inline]
    #[must_use]
    pub fn is_right(&self) -> bool {
        self.x % 2 == 1
    }
}

/// A fully decoded and tagged pixel hit.
///
/// Produced once by the decode pipeline; timing and scan tags are filled in
/// before the record leaves the decoder and are never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HitRecord {
    /// Data/non-data flag (bit 47 of the logical word).
    pub data_header: u8,
    /// Header nibble (bits 47..44).
    pub header: u8,
    /// Pixel position.
    pub coord: PixelCoord,
    /// Decoded 14-bit time of arrival.
    pub toa: u16,
    /// Decoded 10-bit time over threshold.
    pub tot: u16,
    /// Decoded 10-bit event counter (event-count mode only).
    pub event_counter: u16,
    /// 4-bit hit counter (ToA/ToT mode only).
    pub hit_counter: u8,
    /// Physical link the hit arrived on.
    pub link: u8,
    /// Index of the first raw word of this hit in the acquisition stream.
    pub stream_index: u64,
    /// Scan parameter id of the readout burst containing the hit.
    pub scan_param_id: u32,
    /// Wall-clock start of the readout burst containing the hit.
    pub chunk_start_time: f64,
    /// Timer extension value used for this hit (after correction).
    pub toa_extension: u64,
    /// Most recent shutter timer broadcast on the hit's link.
    pub shutter_timer: u64,
    /// Combined wide timestamp in TOA clock ticks.
    pub timestamp: u64,
}

impl HitRecord {
    /// X coordinate.
    #[inline]
    #[must_use]
    pub fn x(&self) -> u16 {
        self.coord.x
    }

    /// Y coordinate.
    #[inline]
    #[must_use]
    pub fn y(&self) -> u16 {
        self.coord.y
    }
}

/// Trait for anything that carries pixel hit data.
pub trait Hit: Send + Sync {
    /// Returns the pixel coordinate of the hit.
    fn coord(&self) -> PixelCoord;

    /// Returns the time over threshold (charge proxy).
    fn tot(&self) -> u16;

    /// Returns the wide timestamp in TOA clock ticks.
    fn timestamp(&self) -> u64;
}

impl Hit for HitRecord {
    #[inline]
    fn coord(&self) -> PixelCoord {
        self.coord
    }

    #[inline]
    fn tot(&self) -> u16 {
        self.tot
    }

    #[inline]
    fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_coord_bounds() {
        assert!(PixelCoord::try_new(255, 255).is_ok());
        assert!(matches!(
            PixelCoord::try_new(256, 0),
            Err(Error::InvalidCoordinate { x: 256, y: 0 })
        ));
        assert!(PixelCoord::try_new(0, 300).is_err());
    }

    #[test]
    fn test_pixel_coord_column_pair() {
        let left = PixelCoord::new(4, 10);
        let right = PixelCoord::new(5, 10);
        assert_eq!(left.eoc(), 2);
        assert_eq!(right.eoc(), 2);
        assert!(!left.is_right());
        assert!(right.is_right());
    }

    #[test]
    fn test_hit_trait_accessors() {
        let hit = HitRecord {
            coord: PixelCoord::new(5, 41),
            tot: 12,
            timestamp: 0x1_0000,
            ..HitRecord::default()
        };
        assert_eq!(hit.x(), 5);
        assert_eq!(hit.y(), 41);
        assert_eq!(Hit::tot(&hit), 12);
        assert_eq!(Hit::timestamp(&hit), 0x1_0000);
    }
}
