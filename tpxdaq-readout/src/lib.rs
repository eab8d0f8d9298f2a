//! tpxdaq-readout: Threaded FIFO readout for Timepix3 systems.
//!
//! This crate drains a readout device's FIFO on a background thread, hands
//! each burst to a data handler on a second thread, and watches the
//! receiver links on a third. Raw dumps are written and memory-mapped back
//! via memmap2.
//!
//! # Key Components
//!
//! - [`FifoReadout`] - start/stop lifecycle and the readout threads
//! - [`Device`] - the FIFO and receiver interface of a board
//! - [`DecodingHandler`] - decodes bursts and records the chunk table
//! - [`SimulatedDevice`] - in-memory board with a synthetic word generator
//! - [`raw_file`] - raw word dumps and chunk table files

mod config;
mod device;
mod error;
mod fifo;
mod handler;
pub mod raw_file;
mod simulated;

pub use config::{ReadoutConfig, StartOptions};
pub use device::{link_faults, ChannelStatus, Device};
pub use error::{DeviceError, Error, ReadoutError, Result};
pub use fifo::{FifoReadout, ReadoutState, StopTimeout};
pub use handler::{
    BurstHandler, DataHandler, DecodedBurst, DecodingHandler, ErrorHandler, FaultLog,
    HandlerError, ReadoutChunk, ScanParameter,
};
pub use raw_file::{RawWordReader, RawWordWriter};
pub use simulated::{GeneratorConfig, SimulatedDevice, WordGenerator};
