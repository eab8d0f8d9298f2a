//! Threaded FIFO readout.
//!
//! An acquisition runs up to three threads:
//!
//! - **reader**: polls the device FIFO once per poll interval and queues
//!   every read, stamped with its readout interval
//! - **worker**: hands queued reads to the data handler, one at a time, in
//!   read order
//! - **watchdog**: checks link health of enabled channels
//!
//! `stop` lets the reader drain the FIFO before it exits, then joins all
//! threads; no handler is called once `stop` has returned.

use crate::config::{ReadoutConfig, StartOptions};
use crate::device::{link_faults, Device};
use crate::error::ReadoutError;
use crate::handler::{DataHandler, ErrorHandler, ReadoutChunk};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadoutState {
    /// No acquisition active.
    #[default]
    Idle,
    /// Threads running.
    Running,
    /// Waiting for the reader to drain the FIFO.
    Stopping,
}

/// How long `stop` waits for the FIFO to drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopTimeout {
    /// Force-stop the reader after this long.
    After(Duration),
    /// Wait as long as it takes.
    Unbounded,
}

impl StopTimeout {
    /// The configuration's default stop timeout.
    #[must_use]
    pub fn from_config(config: &ReadoutConfig) -> Self {
        config.stop_timeout.map_or(Self::Unbounded, Self::After)
    }
}

enum QueueItem {
    Chunk(ReadoutChunk),
    End,
}

// Set once per acquisition; wakes every thread sleeping on it.
#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    fn set(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleeps up to `timeout`; returns true once the signal is set.
    fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        self.cond
            .wait_while_for(&mut stopped, |stopped| !*stopped, timeout);
        *stopped
    }
}

// State that outlives a single acquisition.
#[derive(Default)]
struct Shared {
    buffer: Mutex<Vec<ReadoutChunk>>,
    total_words: AtomicU64,
    recent_reads: Mutex<VecDeque<usize>>,
}

impl Shared {
    fn record_read(&self, words: usize, window: usize) {
        self.total_words.fetch_add(words as u64, Ordering::Relaxed);
        let mut recent = self.recent_reads.lock();
        if recent.len() >= window {
            recent.pop_front();
        }
        recent.push_back(words);
    }
}

struct Run {
    signal: Arc<StopSignal>,
    force_stop: Arc<AtomicBool>,
    // Disconnects when the reader exits.
    reader_done: Receiver<()>,
    reader: JoinHandle<Option<ReadoutError>>,
    worker: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
}

/// FIFO readout engine for one device.
pub struct FifoReadout<D: Device + 'static> {
    device: Arc<D>,
    config: ReadoutConfig,
    state: ReadoutState,
    shared: Arc<Shared>,
    run: Option<Run>,
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

fn spawn<T, F>(role: &'static str, f: F) -> Result<JoinHandle<T>, ReadoutError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new()
        .name(format!("fifo-{role}"))
        .spawn(f)
        .map_err(|err| ReadoutError::Spawn {
            thread: role,
            message: err.to_string(),
        })
}

impl<D: Device + 'static> FifoReadout<D> {
    /// Creates an idle engine.
    #[must_use]
    pub fn new(device: Arc<D>, config: ReadoutConfig) -> Self {
        Self {
            device,
            config,
            state: ReadoutState::Idle,
            shared: Arc::default(),
            run: None,
        }
    }

    /// The device being read.
    #[must_use]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &ReadoutConfig {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ReadoutState {
        self.state
    }

    /// Returns true while an acquisition is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state != ReadoutState::Idle
    }

    /// Starts an acquisition.
    ///
    /// The worker thread runs only with a data handler, the watchdog only
    /// with an error handler. Without an error handler, a device fault ends
    /// the acquisition and is returned by [`FifoReadout::stop`].
    ///
    /// # Errors
    /// Returns [`ReadoutError::AlreadyRunning`] unless idle,
    /// [`ReadoutError::InvalidConfig`] if the timing parameters do not
    /// validate, a device error from a requested reset, or a spawn failure.
    pub fn start(
        &mut self,
        options: StartOptions,
        handler: Option<Box<dyn DataHandler>>,
        errors: Option<Arc<dyn ErrorHandler>>,
    ) -> Result<(), ReadoutError> {
        if self.state != ReadoutState::Idle {
            return Err(ReadoutError::AlreadyRunning);
        }
        self.config
            .validate()
            .map_err(|err| ReadoutError::InvalidConfig(err.to_string()))?;
        if options.reset_rx {
            self.reset_rx()?;
        }
        if options.reset_fifo {
            self.reset_fifo()?;
        }
        if options.clear_buffer {
            self.shared.buffer.lock().clear();
        }
        self.shared.recent_reads.lock().clear();

        let signal = Arc::new(StopSignal::default());
        let force_stop = Arc::new(AtomicBool::new(false));

        let (queue, worker) = match handler {
            Some(handler) => {
                let (tx, rx) = mpsc::channel();
                let errors = errors.clone();
                let idle = self.config.poll_interval / 2;
                let worker = spawn("worker", move || {
                    run_worker(&rx, handler, errors.as_deref(), idle);
                })?;
                (Some(tx), Some(worker))
            }
            None => (None, None),
        };

        let watchdog = match &errors {
            Some(errors) => {
                let device = Arc::clone(&self.device);
                let errors = Arc::clone(errors);
                let signal = Arc::clone(&signal);
                let period = self.config.watchdog_interval;
                Some(spawn("watchdog", move || {
                    run_watchdog(&*device, &*errors, &signal, period);
                })?)
            }
            None => None,
        };

        let (done_tx, reader_done) = mpsc::channel::<()>();
        let reader = Reader {
            device: Arc::clone(&self.device),
            shared: Arc::clone(&self.shared),
            signal: Arc::clone(&signal),
            force_stop: Arc::clone(&force_stop),
            queue,
            errors,
            poll_interval: self.config.poll_interval,
            rate_window: self.config.rate_window,
            fill_buffer: options.fill_buffer,
            no_data_timeout: options.no_data_timeout,
        };
        let reader = match spawn("reader", move || {
            let _done = done_tx;
            reader.run()
        }) {
            Ok(handle) => handle,
            Err(err) => {
                // The worker exits once its queue disconnects.
                signal.set();
                return Err(err);
            }
        };

        self.run = Some(Run {
            signal,
            force_stop,
            reader_done,
            reader,
            worker,
            watchdog,
        });
        self.state = ReadoutState::Running;
        log::info!(
            "readout started (poll {:?}, watchdog {:?})",
            self.config.poll_interval,
            self.config.watchdog_interval
        );
        Ok(())
    }

    /// Stops the acquisition and joins its threads.
    ///
    /// # Errors
    /// Returns [`ReadoutError::NotRunning`] when idle,
    /// [`ReadoutError::StopTimeout`] when the FIFO did not drain in time, or
    /// the fault that ended an acquisition without an error handler.
    pub fn stop(&mut self, timeout: StopTimeout) -> Result<(), ReadoutError> {
        let Some(run) = self.run.take() else {
            return Err(ReadoutError::NotRunning);
        };
        self.state = ReadoutState::Stopping;
        run.signal.set();

        let mut result = Ok(());
        match timeout {
            StopTimeout::After(limit) => {
                if let Err(RecvTimeoutError::Timeout) = run.reader_done.recv_timeout(limit) {
                    log::error!("FIFO not drained after {limit:?}, forcing readout stop");
                    run.force_stop.store(true, Ordering::Release);
                    result = Err(ReadoutError::StopTimeout(limit));
                }
            }
            StopTimeout::Unbounded => {
                while let Err(RecvTimeoutError::Timeout) =
                    run.reader_done.recv_timeout(self.config.watchdog_interval)
                {
                    log::warn!("waiting for the FIFO to drain");
                }
            }
        }

        match run.reader.join() {
            Ok(Some(fault)) if result.is_ok() => result = Err(fault),
            Ok(_) => {}
            Err(_) => result = Err(ReadoutError::Panicked("reader")),
        }
        for (role, handle) in [("worker", run.worker), ("watchdog", run.watchdog)] {
            if let Some(handle) = handle {
                if handle.join().is_err() && result.is_ok() {
                    result = Err(ReadoutError::Panicked(role));
                }
            }
        }

        self.state = ReadoutState::Idle;
        log::info!(
            "readout stopped ({} words total)",
            self.shared.total_words.load(Ordering::Relaxed)
        );
        result
    }

    /// Resets the receivers and their error counters.
    ///
    /// # Errors
    /// Returns the device error if the reset fails.
    pub fn reset_rx(&self) -> Result<(), ReadoutError> {
        log::info!("resetting RX");
        self.device.reset_receivers()?;
        Ok(())
    }

    /// Empties the FIFO and checks that it stayed empty.
    ///
    /// # Errors
    /// Returns the device error if the reset or the occupancy query fails.
    pub fn reset_fifo(&self) -> Result<(), ReadoutError> {
        self.device.reset_fifo()?;
        let occupancy = self.device.fifo_occupancy()?;
        if occupancy != 0 {
            log::warn!("FIFO not empty after reset: {occupancy} words");
        }
        Ok(())
    }

    /// Words read since the engine was created.
    #[must_use]
    pub fn total_words(&self) -> u64 {
        self.shared.total_words.load(Ordering::Relaxed)
    }

    /// Average word rate over the most recent reads.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn words_per_second(&self) -> f64 {
        let recent = self.shared.recent_reads.lock();
        if recent.is_empty() {
            return 0.0;
        }
        let words: usize = recent.iter().sum();
        words as f64 / (self.config.poll_interval.as_secs_f64() * recent.len() as f64)
    }

    /// Logs FIFO occupancy, word rate and per-channel receiver status.
    pub fn log_status(&self) {
        match self.device.fifo_occupancy() {
            Ok(words) => log::info!(
                "FIFO: {words} words, {:.1} words/s, {} words total",
                self.words_per_second(),
                self.total_words()
            ),
            Err(err) => log::warn!("FIFO status unavailable: {err}"),
        }
        for channel in 0..self.device.channel_count() {
            match self.device.channel_status(channel) {
                Ok(status) => log::info!(
                    "channel {channel}: enabled={} sync={} discards={} decode_errors={}",
                    status.enabled,
                    status.sync_ok,
                    status.discard_count,
                    status.decode_error_count
                ),
                Err(err) => log::warn!("channel {channel}: status unavailable: {err}"),
            }
        }
    }

    /// Removes and returns the retained chunks.
    pub fn take_buffer(&self) -> Vec<ReadoutChunk> {
        std::mem::take(&mut *self.shared.buffer.lock())
    }

    /// Concatenated words of every retained chunk, in read order.
    #[must_use]
    pub fn raw_words(&self) -> Vec<u32> {
        self.shared
            .buffer
            .lock()
            .iter()
            .flat_map(|chunk| chunk.words.iter().copied())
            .collect()
    }
}

impl<D: Device + 'static> Drop for FifoReadout<D> {
    fn drop(&mut self) {
        if self.run.is_some() {
            if let Err(err) = self.stop(StopTimeout::After(Duration::ZERO)) {
                log::warn!("readout dropped while running: {err}");
            }
        }
    }
}

struct Reader<D> {
    device: Arc<D>,
    shared: Arc<Shared>,
    signal: Arc<StopSignal>,
    force_stop: Arc<AtomicBool>,
    queue: Option<Sender<QueueItem>>,
    errors: Option<Arc<dyn ErrorHandler>>,
    poll_interval: Duration,
    rate_window: usize,
    fill_buffer: bool,
    no_data_timeout: Option<Duration>,
}

impl<D: Device> Reader<D> {
    /// Read loop; returns the fault that ended it when no error handler is
    /// installed.
    fn run(mut self) -> Option<ReadoutError> {
        let mut last_data = Instant::now();
        let mut interval_start = epoch_seconds();
        let mut fault = None;

        loop {
            let cycle = Instant::now();
            if self.force_stop.load(Ordering::Acquire) {
                log::warn!("reader force-stopped");
                break;
            }

            if let Some(timeout) = self.no_data_timeout {
                if last_data.elapsed() >= timeout {
                    self.no_data_timeout = None;
                    if let Some(err) = self.report(ReadoutError::NoDataTimeout(timeout)) {
                        fault = Some(err);
                        break;
                    }
                }
            }

            // A failed read counts as drained.
            let drained = match self.device.read_data() {
                Ok(words) => {
                    let empty = words.is_empty();
                    if !empty {
                        last_data = Instant::now();
                    }
                    self.publish(words, &mut interval_start);
                    empty
                }
                Err(err) => {
                    if let Some(err) = self.report(err.into()) {
                        fault = Some(err);
                        break;
                    }
                    true
                }
            };

            if self.signal.is_set() {
                if drained {
                    break;
                }
            } else {
                self.signal
                    .wait(self.poll_interval.saturating_sub(cycle.elapsed()));
            }
        }

        if let Some(queue) = &self.queue {
            // Fails only if the worker is already gone.
            let _ = queue.send(QueueItem::End);
        }
        fault
    }

    /// Forwards a fault to the error handler; without one, hands it back
    /// to end the acquisition.
    fn report(&self, err: ReadoutError) -> Option<ReadoutError> {
        match &self.errors {
            Some(errors) => {
                errors.handle_error(err);
                None
            }
            None => {
                log::error!("readout aborted: {err}");
                Some(err)
            }
        }
    }

    fn publish(&self, words: Vec<u32>, interval_start: &mut f64) {
        let interval_stop = epoch_seconds();
        let chunk = ReadoutChunk {
            words: words.into(),
            timestamp_start: *interval_start,
            timestamp_stop: interval_stop,
            status: 0,
        };
        *interval_start = interval_stop;
        self.shared.record_read(chunk.len(), self.rate_window);

        if self.fill_buffer {
            self.shared.buffer.lock().push(chunk.clone());
        }
        if let Some(queue) = &self.queue {
            if queue.send(QueueItem::Chunk(chunk)).is_err() {
                log::warn!("data worker gone, dropping burst");
            }
        }
    }
}

fn run_worker(
    queue: &Receiver<QueueItem>,
    mut handler: Box<dyn DataHandler>,
    errors: Option<&dyn ErrorHandler>,
    idle: Duration,
) {
    loop {
        match queue.recv_timeout(idle) {
            Ok(QueueItem::Chunk(chunk)) => {
                if let Err(err) = handler.handle_chunk(chunk) {
                    let fault = ReadoutError::Handler(err.to_string());
                    match errors {
                        Some(errors) => errors.handle_error(fault),
                        None => log::error!("{fault}"),
                    }
                }
            }
            Ok(QueueItem::End) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

fn run_watchdog<D: Device + ?Sized>(
    device: &D,
    errors: &dyn ErrorHandler,
    signal: &StopSignal,
    period: Duration,
) {
    while !signal.wait(period) {
        for fault in link_faults(device) {
            errors.handle_error(fault);
        }
    }
}
