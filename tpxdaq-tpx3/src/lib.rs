//! tpxdaq-tpx3: Timepix3 word reassembly, hit decoding and timestamp extension.
//!
//! This crate turns the raw 32-bit FIFO words of a Timepix3 readout into
//! decoded, timestamped and scan-tagged hit records.
//!
//! # Key Components
//!
//! - [`CodeTables`] - inverse tables for the LFSR counters and Gray-coded TOA
//! - [`word`] - link demultiplexing and 48-bit word reassembly
//! - [`Packet`] - header dispatch and pixel field extraction
//! - [`timestamp`] - wide timestamps from timer extension broadcasts
//! - [`Decoder`] - chunk decoder with explicitly threaded [`DecoderState`]
//! - [`mapper`] - scan chunk tagging and chunk-wise (parallel) decoding
//!
//! # Processing Pipeline
//!
//! raw words -> per-link sub-streams -> logical words -> packets ->
//! reconciled hits -> tagged hits

mod decoder;
mod error;
pub mod mapper;
pub mod packet;
pub mod tables;
pub mod timestamp;
pub mod word;

pub use decoder::{DecodeStats, DecodedChunk, Decoder, DecoderState, LinkState};
pub use error::{Error, Result};
pub use mapper::{
    decode_chunk, decode_chunks, decode_chunks_parallel, decode_stream, tag_hits, ChunkMapper,
    StreamDecode,
};
pub use packet::{HeaderClass, Packet, PixelAddress, TimerBroadcast, TimerKind};
pub use tables::CodeTables;

// Re-export core types for convenience
pub use tpxdaq_core::{ChunkTable, HitRecord, PixelCoord, ScanChunk};

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Chip operating mode; selects which counter the 10-bit field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChipMode {
    /// TOA and TOT, with the 4-bit hit counter.
    #[default]
    ToaTot,
    /// TOA and event counter.
    EventCount,
}

/// Decoder configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Chip operating mode.
    pub chip_mode: ChipMode,
    /// Number of receiver links multiplexed onto the FIFO.
    pub n_links: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            chip_mode: ChipMode::ToaTot,
            n_links: word::MAX_LINKS,
        }
    }
}

// Configuration files nest the decoder settings under "decoder".
#[derive(Deserialize, Default)]
#[serde(default)]
struct JsonConfig {
    decoder: DecoderConfig,
}

impl DecoderConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the chip operating mode.
    #[must_use]
    pub fn with_chip_mode(mut self, chip_mode: ChipMode) -> Self {
        self.chip_mode = chip_mode;
        self
    }

    /// Sets the number of links.
    #[must_use]
    pub fn with_n_links(mut self, n_links: usize) -> Self {
        self.n_links = n_links;
        self
    }

    /// Loads the `decoder` section of a JSON configuration file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is malformed, or the
    /// configuration is invalid.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let config: JsonConfig = serde_json::from_reader(BufReader::new(file))?;
        config.decoder.validate()?;
        Ok(config.decoder)
    }

    /// Loads the `decoder` section of a JSON configuration string.
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or the configuration is invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: JsonConfig = serde_json::from_str(json)?;
        config.decoder.validate()?;
        Ok(config.decoder)
    }

    /// Checks that the link count fits the link id field.
    ///
    /// # Errors
    /// Returns [`Error::ConfigError`] if `n_links` is 0 or exceeds 8.
    pub fn validate(&self) -> Result<()> {
        if self.n_links == 0 || self.n_links > word::MAX_LINKS {
            return Err(Error::ConfigError(format!(
                "n_links must be between 1 and {}, got {}",
                word::MAX_LINKS,
                self.n_links
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DecoderConfig::default();
        assert_eq!(config.chip_mode, ChipMode::ToaTot);
        assert_eq!(config.n_links, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_loading() {
        let json = r#"{ "decoder": { "chip_mode": "event_count", "n_links": 3 } }"#;
        let config = DecoderConfig::from_json(json).expect("valid config");
        assert_eq!(config.chip_mode, ChipMode::EventCount);
        assert_eq!(config.n_links, 3);
    }

    #[test]
    fn test_json_partial_config() {
        let config = DecoderConfig::from_json(r#"{ "decoder": { "n_links": 2 } }"#).unwrap();
        assert_eq!(config.chip_mode, ChipMode::ToaTot);
        assert_eq!(config.n_links, 2);

        // Other sections are ignored, a missing decoder section means defaults.
        let config = DecoderConfig::from_json(r#"{ "readout": {} }"#).unwrap();
        assert_eq!(config, DecoderConfig::default());
    }

    #[test]
    fn test_json_invalid_link_count() {
        let err = DecoderConfig::from_json(r#"{ "decoder": { "n_links": 9 } }"#).unwrap_err();
        assert!(err.to_string().contains("n_links"), "{err}");
        assert!(DecoderConfig::from_json(r#"{ "decoder": { "n_links": 0 } }"#).is_err());
    }

    #[test]
    fn test_json_unknown_mode() {
        let result = DecoderConfig::from_json(r#"{ "decoder": { "chip_mode": "itot" } }"#);
        assert!(matches!(result, Err(Error::JsonError(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "decoder": {{ "n_links": 4 }} }}"#).unwrap();
        file.flush().unwrap();
        let config = DecoderConfig::from_file(file.path()).unwrap();
        assert_eq!(config.n_links, 4);
    }
}
