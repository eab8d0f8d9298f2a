//! Error types for tpxdaq-core.

use thiserror::Error;

/// Result type alias for tpxdaq-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Pixel coordinate outside the 256 x 256 matrix.
    #[error("invalid pixel coordinate: ({x}, {y})")]
    InvalidCoordinate { x: u16, y: u16 },

    /// Chunk offsets that run backwards within one descriptor.
    #[error("chunk range is inverted: start {start} > stop {stop}")]
    InvertedChunk { start: u32, stop: u32 },

    /// Chunk that starts before the previous chunk ended.
    #[error("chunk starting at {start} overlaps previous chunk ending at {previous_stop}")]
    OverlappingChunk { start: u32, previous_stop: u32 },
}
