//! In-process stand-in for a readout board.
//!
//! [`SimulatedDevice`] keeps a FIFO of raw words that tests fill directly or
//! that a [`WordGenerator`] refills on every read while the shutter is open.
//! Receiver status and read failures can be injected at any time.

use crate::device::{ChannelStatus, Device};
use crate::error::DeviceError;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use tpxdaq_core::{PixelCoord, MATRIX_SIZE};
use tpxdaq_tpx3::packet::{encode_pixel, encode_timer, PixelFields};
use tpxdaq_tpx3::timestamp::EXTENSION_TICK_SHIFT;
use tpxdaq_tpx3::word::{frame_logical, MAX_LINKS};
use tpxdaq_tpx3::{CodeTables, TimerKind};

// Hits lag the clock by less than this many ticks.
const MAX_HIT_LAG: u64 = 600;

/// Parameters of the synthetic word stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorConfig {
    /// Links carrying data, at most 8.
    pub n_links: usize,
    /// Pixel hits produced per read.
    pub hits_per_read: usize,
    /// TOA ticks the chip clock advances per read.
    pub ticks_per_read: u64,
    /// Random seed.
    pub seed: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            n_links: 4,
            hits_per_read: 64,
            ticks_per_read: 2_000,
            seed: 0x5EED,
        }
    }
}

/// Deterministic generator of multi-link Timepix3 bursts.
///
/// Every burst starts with a timer extension broadcast on each link, the
/// first burst also with a shutter timer broadcast. Hits follow on random
/// links with TOA values at most a few hundred ticks behind the chip clock.
pub struct WordGenerator {
    config: GeneratorConfig,
    rng: StdRng,
    clock: u64,
    bursts: u64,
    hits: u64,
}

impl WordGenerator {
    /// Creates a generator.
    #[must_use]
    pub fn new(config: GeneratorConfig) -> Self {
        let config = GeneratorConfig {
            n_links: config.n_links.clamp(1, MAX_LINKS),
            ..config
        };
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            clock: 1 << 16,
            bursts: 0,
            hits: 0,
        }
    }

    /// Produces the raw words of the next burst.
    #[allow(clippy::cast_possible_truncation)]
    pub fn next_burst(&mut self) -> Vec<u32> {
        let tables = CodeTables::get();
        let n_links = self.config.n_links;
        let mut words = Vec::with_capacity(2 * (n_links * 2 + self.config.hits_per_read));

        self.clock += self.config.ticks_per_read;
        for link in 0..n_links as u8 {
            let extension =
                encode_timer(TimerKind::Extension, self.clock >> EXTENSION_TICK_SHIFT);
            words.extend(frame_logical(extension, link));
            if self.bursts == 0 {
                words.extend(frame_logical(encode_timer(TimerKind::Shutter, self.clock), link));
            }
        }

        for _ in 0..self.config.hits_per_read {
            let link = self.rng.gen_range(0..n_links) as u8;
            let hit_time = self
                .clock
                .saturating_sub(self.rng.gen_range(0..MAX_HIT_LAG));
            let fields = PixelFields {
                coord: PixelCoord::new(
                    self.rng.gen_range(0..MATRIX_SIZE),
                    self.rng.gen_range(0..MATRIX_SIZE),
                ),
                toa: (hit_time & 0x3FFF) as u16,
                counter: self.rng.gen_range(1..1023),
                hit_counter: self.rng.gen_range(0..16),
            };
            words.extend(frame_logical(encode_pixel(&fields, tables), link));
        }

        self.bursts += 1;
        self.hits += self.config.hits_per_read as u64;
        words
    }

    /// Current chip clock in TOA ticks.
    #[must_use]
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Hits produced so far.
    #[must_use]
    pub fn hits_generated(&self) -> u64 {
        self.hits
    }
}

struct State {
    channels: Vec<ChannelStatus>,
    fifo: VecDeque<u32>,
    failures: VecDeque<DeviceError>,
    generator: Option<WordGenerator>,
    reads: u64,
}

/// A readout device backed by memory.
pub struct SimulatedDevice {
    state: Mutex<State>,
}

impl SimulatedDevice {
    /// Creates a device with `channels` enabled, synchronized channels and an
    /// empty FIFO.
    #[must_use]
    pub fn new(channels: usize) -> Self {
        let healthy = ChannelStatus {
            enabled: true,
            sync_ok: true,
            ..ChannelStatus::default()
        };
        Self {
            state: Mutex::new(State {
                channels: vec![healthy; channels],
                fifo: VecDeque::new(),
                failures: VecDeque::new(),
                generator: None,
                reads: 0,
            }),
        }
    }

    /// Appends words to the FIFO.
    pub fn push_words(&self, words: &[u32]) {
        self.state.lock().fifo.extend(words.iter().copied());
    }

    /// Starts producing a burst on every read.
    pub fn open_shutter(&self, config: GeneratorConfig) {
        self.state.lock().generator = Some(WordGenerator::new(config));
    }

    /// Stops producing data; returns the number of hits generated.
    pub fn close_shutter(&self) -> u64 {
        self.state
            .lock()
            .generator
            .take()
            .map_or(0, |generator| generator.hits_generated())
    }

    /// Makes the next read fail with `error`. Failures queue up.
    pub fn fail_next_read(&self, error: DeviceError) {
        self.state.lock().failures.push_back(error);
    }

    /// Sets the sync flag of a channel.
    pub fn set_sync(&self, channel: usize, sync_ok: bool) {
        if let Some(status) = self.state.lock().channels.get_mut(channel) {
            status.sync_ok = sync_ok;
        }
    }

    /// Enables or disables a channel.
    pub fn set_enabled(&self, channel: usize, enabled: bool) {
        if let Some(status) = self.state.lock().channels.get_mut(channel) {
            status.enabled = enabled;
        }
    }

    /// Adds receiver FIFO discards on a channel.
    pub fn add_discards(&self, channel: usize, count: u32) {
        if let Some(status) = self.state.lock().channels.get_mut(channel) {
            status.discard_count = status.discard_count.saturating_add(count);
        }
    }

    /// Adds decode errors on a channel.
    pub fn add_decode_errors(&self, channel: usize, count: u32) {
        if let Some(status) = self.state.lock().channels.get_mut(channel) {
            status.decode_error_count = status.decode_error_count.saturating_add(count);
        }
    }

    /// Number of `read_data` calls so far.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.state.lock().reads
    }
}

impl Device for SimulatedDevice {
    fn read_data(&self) -> Result<Vec<u32>, DeviceError> {
        let mut state = self.state.lock();
        state.reads += 1;
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        if let Some(burst) = state.generator.as_mut().map(WordGenerator::next_burst) {
            state.fifo.extend(burst);
        }
        Ok(state.fifo.drain(..).collect())
    }

    fn channel_count(&self) -> usize {
        self.state.lock().channels.len()
    }

    fn channel_status(&self, channel: usize) -> Result<ChannelStatus, DeviceError> {
        self.state
            .lock()
            .channels
            .get(channel)
            .copied()
            .ok_or(DeviceError::NoSuchChannel(channel))
    }

    fn fifo_occupancy(&self) -> Result<usize, DeviceError> {
        Ok(self.state.lock().fifo.len())
    }

    fn reset_receivers(&self) -> Result<(), DeviceError> {
        for status in &mut self.state.lock().channels {
            status.discard_count = 0;
            status.decode_error_count = 0;
        }
        Ok(())
    }

    fn reset_fifo(&self) -> Result<(), DeviceError> {
        self.state.lock().fifo.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpxdaq_tpx3::{Decoder, DecoderConfig, DecoderState};

    #[test]
    fn test_fifo_drains_on_read() {
        let device = SimulatedDevice::new(1);
        device.push_words(&[1, 2, 3]);
        assert_eq!(device.fifo_occupancy().unwrap(), 3);
        assert_eq!(device.read_data().unwrap(), vec![1, 2, 3]);
        assert!(device.read_data().unwrap().is_empty());
        assert_eq!(device.reads(), 2);
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let device = SimulatedDevice::new(1);
        device.push_words(&[7]);
        device.fail_next_read(DeviceError::Transport("link down".into()));
        assert!(device.read_data().is_err());
        assert_eq!(device.read_data().unwrap(), vec![7]);
    }

    #[test]
    fn test_reset_clears_counters_and_fifo() {
        let device = SimulatedDevice::new(2);
        device.add_discards(0, 3);
        device.add_decode_errors(1, 5);
        device.push_words(&[1, 2]);
        device.reset_receivers().unwrap();
        device.reset_fifo().unwrap();
        assert_eq!(device.channel_status(0).unwrap().discard_count, 0);
        assert_eq!(device.channel_status(1).unwrap().decode_error_count, 0);
        assert_eq!(device.fifo_occupancy().unwrap(), 0);
        assert_eq!(device.channel_status(2), Err(DeviceError::NoSuchChannel(2)));
    }

    #[test]
    fn test_generated_bursts_decode_cleanly() {
        let config = GeneratorConfig {
            n_links: 3,
            hits_per_read: 50,
            ticks_per_read: 3_000,
            seed: 11,
        };
        let mut generator = WordGenerator::new(config);
        let decoder = Decoder::new(DecoderConfig::default().with_n_links(3));
        let mut state = DecoderState::new();
        let mut base = 0u64;

        for _ in 0..20 {
            let burst = generator.next_burst();
            let clock = generator.clock();
            let (decoded, next) = decoder.decode(&burst, base, &state);
            assert_eq!(decoded.hits.len(), 50);
            assert_eq!(decoded.stats.framing_errors, 0);
            assert_eq!(decoded.stats.timestamp_mismatches, 0);
            for hit in &decoded.hits {
                assert!(hit.timestamp <= clock && hit.timestamp > clock - MAX_HIT_LAG);
            }
            base += burst.len() as u64;
            state = next;
        }
        assert_eq!(generator.hits_generated(), 1000);
    }

    #[test]
    fn test_shutter_controls_generation() {
        let device = SimulatedDevice::new(4);
        device.open_shutter(GeneratorConfig::default());
        assert!(!device.read_data().unwrap().is_empty());
        assert_eq!(device.close_shutter(), 64);
        assert!(device.read_data().unwrap().is_empty());
    }
}
