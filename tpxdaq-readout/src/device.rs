//! Readout device abstraction.

use crate::error::{DeviceError, ReadoutError};

/// Receiver status of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStatus {
    /// Channel is included in the readout.
    pub enabled: bool,
    /// Receiver is locked to the chip's link.
    pub sync_ok: bool,
    /// Words dropped by the receiver FIFO since the last reset.
    pub discard_count: u32,
    /// 8b10b decode errors since the last reset.
    pub decode_error_count: u32,
}

/// A FIFO-based readout device.
///
/// The reader thread is the only caller of [`Device::read_data`]; the status
/// accessors may be called concurrently from the watchdog.
pub trait Device: Send + Sync {
    /// Drains the words currently held by the FIFO.
    ///
    /// # Errors
    /// Returns an error if the transport fails.
    fn read_data(&self) -> Result<Vec<u32>, DeviceError>;

    /// Number of receiver channels.
    fn channel_count(&self) -> usize;

    /// Status of one receiver channel.
    ///
    /// # Errors
    /// Returns an error if the channel cannot be queried.
    fn channel_status(&self, channel: usize) -> Result<ChannelStatus, DeviceError>;

    /// Words currently buffered in the FIFO.
    ///
    /// # Errors
    /// Returns an error if the FIFO cannot be queried.
    fn fifo_occupancy(&self) -> Result<usize, DeviceError>;

    /// Resets every receiver and its error counters.
    ///
    /// # Errors
    /// Returns an error if the reset fails.
    fn reset_receivers(&self) -> Result<(), DeviceError>;

    /// Empties the FIFO.
    ///
    /// # Errors
    /// Returns an error if the reset fails.
    fn reset_fifo(&self) -> Result<(), DeviceError>;
}

/// Checks the health of every enabled channel.
///
/// Returns one fault per failing check: missing sync, FIFO discards and
/// decode errors, in that order.
pub fn link_faults<D: Device + ?Sized>(device: &D) -> Vec<ReadoutError> {
    let mut unsynced = Vec::new();
    let mut discards = Vec::new();
    let mut decode_errors = Vec::new();
    let mut faults = Vec::new();

    for channel in 0..device.channel_count() {
        let status = match device.channel_status(channel) {
            Ok(status) => status,
            Err(err) => {
                faults.push(ReadoutError::Device(err));
                continue;
            }
        };
        if !status.enabled {
            continue;
        }
        if !status.sync_ok {
            unsynced.push(channel);
        }
        if status.discard_count > 0 {
            discards.push((channel, status.discard_count));
        }
        if status.decode_error_count > 0 {
            decode_errors.push((channel, status.decode_error_count));
        }
    }

    if !unsynced.is_empty() {
        faults.push(ReadoutError::RxSync(unsynced));
    }
    if !discards.is_empty() {
        faults.push(ReadoutError::FifoDiscard(discards));
    }
    if !decode_errors.is_empty() {
        faults.push(ReadoutError::DecodeErrors(decode_errors));
    }
    faults
}
