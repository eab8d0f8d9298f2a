//! Readout engine configuration.
//!
//! Configuration files are JSON; durations are given in seconds:
//!
//! ```json
//! {
//!   "readout": {
//!     "poll_interval": 0.05,
//!     "watchdog_interval": 0.5,
//!     "no_data_timeout": 10.0,
//!     "stop_timeout": 10.0,
//!     "rate_window": 20
//!   }
//! }
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

/// Default FIFO poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Watchdog period in poll intervals.
pub const WATCHDOG_POLL_FACTOR: u32 = 10;

/// Default time `stop` waits for the FIFO to drain.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Timing parameters of the readout engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadoutConfig {
    /// Period of the FIFO read loop.
    pub poll_interval: Duration,
    /// Period of the link health checks.
    pub watchdog_interval: Duration,
    /// Default no-data timeout for acquisitions; `None` disables it.
    pub no_data_timeout: Option<Duration>,
    /// Default drain timeout for `stop`; `None` waits forever.
    pub stop_timeout: Option<Duration>,
    /// Number of recent reads averaged by the word rate estimate.
    pub rate_window: usize,
}

impl Default for ReadoutConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            watchdog_interval: DEFAULT_POLL_INTERVAL * WATCHDOG_POLL_FACTOR,
            no_data_timeout: None,
            stop_timeout: Some(DEFAULT_STOP_TIMEOUT),
            rate_window: 20,
        }
    }
}

// Seconds-based mirror of the "readout" section.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct ReadoutSection {
    poll_interval: f64,
    watchdog_interval: Option<f64>,
    no_data_timeout: Option<f64>,
    stop_timeout: Option<f64>,
    rate_window: usize,
}

impl Default for ReadoutSection {
    fn default() -> Self {
        let defaults = ReadoutConfig::default();
        Self {
            poll_interval: defaults.poll_interval.as_secs_f64(),
            watchdog_interval: None,
            no_data_timeout: None,
            stop_timeout: defaults.stop_timeout.map(|d| d.as_secs_f64()),
            rate_window: defaults.rate_window,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JsonConfig {
    readout: ReadoutSection,
}

fn seconds(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        Error::ConfigError(format!(
            "{name} must be a non-negative number of seconds, got {value}"
        ))
    })
}

impl ReadoutConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the poll interval and derives the watchdog interval from it.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.watchdog_interval = poll_interval * WATCHDOG_POLL_FACTOR;
        self
    }

    /// Sets the watchdog interval.
    #[must_use]
    pub fn with_watchdog_interval(mut self, watchdog_interval: Duration) -> Self {
        self.watchdog_interval = watchdog_interval;
        self
    }

    /// Sets the default no-data timeout.
    #[must_use]
    pub fn with_no_data_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.no_data_timeout = timeout;
        self
    }

    /// Sets the default stop timeout.
    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Sets the word rate window.
    #[must_use]
    pub fn with_rate_window(mut self, reads: usize) -> Self {
        self.rate_window = reads;
        self
    }

    /// Loads the `readout` section of a JSON configuration file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is malformed, or the
    /// configuration is invalid.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let config: JsonConfig = serde_json::from_reader(BufReader::new(file))?;
        Self::from_section(&config.readout)
    }

    /// Loads the `readout` section of a JSON configuration string.
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or the configuration is invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: JsonConfig = serde_json::from_str(json)?;
        Self::from_section(&config.readout)
    }

    fn from_section(section: &ReadoutSection) -> Result<Self> {
        let poll_interval = seconds("poll_interval", section.poll_interval)?;
        let watchdog_interval = match section.watchdog_interval {
            Some(value) => seconds("watchdog_interval", value)?,
            None => poll_interval * WATCHDOG_POLL_FACTOR,
        };
        let config = Self {
            poll_interval,
            watchdog_interval,
            no_data_timeout: section
                .no_data_timeout
                .map(|v| seconds("no_data_timeout", v))
                .transpose()?,
            stop_timeout: section
                .stop_timeout
                .map(|v| seconds("stop_timeout", v))
                .transpose()?,
            rate_window: section.rate_window,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the timing parameters.
    ///
    /// # Errors
    /// Returns [`Error::ConfigError`] for a zero poll interval, a watchdog
    /// interval shorter than the poll interval, or an empty rate window.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::ConfigError("poll_interval must be positive".into()));
        }
        if self.watchdog_interval < self.poll_interval {
            return Err(Error::ConfigError(format!(
                "watchdog_interval ({:?}) is shorter than poll_interval ({:?})",
                self.watchdog_interval, self.poll_interval
            )));
        }
        if self.rate_window == 0 {
            return Err(Error::ConfigError("rate_window must be at least 1".into()));
        }
        Ok(())
    }
}

/// Per-acquisition options for `FifoReadout::start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartOptions {
    /// Reset the receivers before starting.
    pub reset_rx: bool,
    /// Empty the FIFO before starting.
    pub reset_fifo: bool,
    /// Drop the retained replay buffer.
    pub clear_buffer: bool,
    /// Retain every chunk in the replay buffer.
    pub fill_buffer: bool,
    /// Report once when no read returned data for this long.
    pub no_data_timeout: Option<Duration>,
}

impl StartOptions {
    /// Options with the configuration's default no-data timeout.
    #[must_use]
    pub fn from_config(config: &ReadoutConfig) -> Self {
        Self {
            no_data_timeout: config.no_data_timeout,
            ..Self::default()
        }
    }

    /// Resets receivers and FIFO before starting.
    #[must_use]
    pub fn with_reset(mut self) -> Self {
        self.reset_rx = true;
        self.reset_fifo = true;
        self
    }

    /// Retains chunks in the replay buffer, optionally clearing it first.
    #[must_use]
    pub fn with_buffer(mut self, clear: bool) -> Self {
        self.fill_buffer = true;
        self.clear_buffer = clear;
        self
    }

    /// Sets the no-data timeout.
    #[must_use]
    pub fn with_no_data_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.no_data_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ReadoutConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.watchdog_interval, Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_poll_interval_drives_watchdog() {
        let config = ReadoutConfig::new().with_poll_interval(Duration::from_millis(5));
        assert_eq!(config.watchdog_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_json_loading() {
        let json = r#"{ "readout": { "poll_interval": 0.01, "no_data_timeout": 2.5, "stop_timeout": null } }"#;
        let config = ReadoutConfig::from_json(json).unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.watchdog_interval, Duration::from_millis(100));
        assert_eq!(config.no_data_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(config.stop_timeout, None);
    }

    #[test]
    fn test_json_defaults_and_other_sections() {
        let config = ReadoutConfig::from_json(r#"{ "decoder": { "n_links": 2 } }"#).unwrap();
        assert_eq!(config, ReadoutConfig::default());
    }

    #[test]
    fn test_validation() {
        assert!(ReadoutConfig::from_json(r#"{ "readout": { "poll_interval": 0 } }"#).is_err());
        assert!(ReadoutConfig::from_json(r#"{ "readout": { "poll_interval": -1.0 } }"#).is_err());
        let err = ReadoutConfig::from_json(
            r#"{ "readout": { "poll_interval": 0.1, "watchdog_interval": 0.05 } }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("watchdog_interval"), "{err}");
        assert!(ReadoutConfig::new().with_rate_window(0).validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "readout": {{ "rate_window": 5 }} }}"#).unwrap();
        file.flush().unwrap();
        let config = ReadoutConfig::from_file(file.path()).unwrap();
        assert_eq!(config.rate_window, 5);
    }

    #[test]
    fn test_start_options() {
        let config = ReadoutConfig::new().with_no_data_timeout(Some(Duration::from_secs(1)));
        let options = StartOptions::from_config(&config).with_reset().with_buffer(true);
        assert!(options.reset_rx && options.reset_fifo);
        assert!(options.fill_buffer && options.clear_buffer);
        assert_eq!(options.no_data_timeout, Some(Duration::from_secs(1)));
    }
}
