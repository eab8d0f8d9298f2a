//! Readout error types.

use std::time::Duration;
use thiserror::Error;

/// Result type for file and configuration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from raw dump files and readout configuration.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid file format.
    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid readout configuration.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] tpxdaq_core::Error),

    /// Decoder error.
    #[error("decoder error: {0}")]
    DecoderError(#[from] tpxdaq_tpx3::Error),
}

/// Errors produced by a readout device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The transport to the device failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The device did not answer in time.
    #[error("device timed out after {0:?}")]
    Timeout(Duration),

    /// Channel index outside the device.
    #[error("no such channel: {0}")]
    NoSuchChannel(usize),
}

/// Faults reported by the FIFO readout engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadoutError {
    /// `start` was called while an acquisition is active.
    #[error("readout already running")]
    AlreadyRunning,

    /// The engine configuration failed validation.
    #[error("invalid readout configuration: {0}")]
    InvalidConfig(String),

    /// `stop` was called without an active acquisition.
    #[error("readout not running")]
    NotRunning,

    /// No read returned data within the configured window.
    #[error("received no data for {0:?}")]
    NoDataTimeout(Duration),

    /// The reader did not drain the FIFO in time and was force-stopped.
    #[error("readout stop timed out after {0:?}")]
    StopTimeout(Duration),

    /// The device failed.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Enabled channels without receiver sync.
    #[error("no RX sync on channel(s) {0:?}")]
    RxSync(Vec<usize>),

    /// Enabled channels whose receiver FIFO discarded words, as
    /// `(channel, count)`.
    #[error("RX FIFO discard error(s): {0:?}")]
    FifoDiscard(Vec<(usize, u32)>),

    /// Enabled channels with 8b10b decode errors, as `(channel, count)`.
    #[error("RX decode error(s): {0:?}")]
    DecodeErrors(Vec<(usize, u32)>),

    /// A data handler returned an error.
    #[error("data handler failed: {0}")]
    Handler(String),

    /// A readout thread could not be spawned.
    #[error("failed to spawn {thread} thread: {message}")]
    Spawn {
        /// Thread role.
        thread: &'static str,
        /// OS error text.
        message: String,
    },

    /// A readout thread panicked.
    #[error("{0} thread panicked")]
    Panicked(&'static str),
}
