//! tpxdaq-core: Core data model for Timepix3 readout and decoding.
//!
//! This crate provides the records shared between the decoder and the
//! acquisition layer: decoded hits, pixel coordinates, and the scan chunk
//! table that maps raw word offsets to scan parameters.
//!

pub mod chunk;
pub mod error;
pub mod hit;

pub use chunk::{ChunkTable, ScanChunk};
pub use error::{Error, Result};
pub use hit::{Hit, HitRecord, PixelCoord, MATRIX_SIZE};
