//! Callbacks invoked by the readout engine.
//!
//! The worker thread hands every readout burst to a [`DataHandler`]; faults
//! from any readout thread go to an [`ErrorHandler`]. Closures implement
//! both traits. [`DecodingHandler`] is a data handler that decodes bursts,
//! records them in a [`ChunkTable`] and passes the hits on.

use crate::error::ReadoutError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tpxdaq_core::{ChunkTable, HitRecord, ScanChunk};
use tpxdaq_tpx3::{tag_hits, DecodeStats, Decoder, DecoderConfig, DecoderState};

/// Error type returned by handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// One FIFO read.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadoutChunk {
    /// Raw words in FIFO order.
    pub words: Arc<[u32]>,
    /// Start of the readout interval, seconds since the epoch.
    pub timestamp_start: f64,
    /// End of the readout interval, seconds since the epoch.
    pub timestamp_stop: f64,
    /// Readout status flags.
    pub status: u32,
}

impl ReadoutChunk {
    /// Number of raw words.
    #[must_use]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Returns true if the read returned no words.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Consumer of readout bursts, called serially from the worker thread.
pub trait DataHandler: Send {
    /// Processes one burst.
    ///
    /// # Errors
    /// A returned error is forwarded to the error handler; the worker keeps
    /// running.
    fn handle_chunk(&mut self, chunk: ReadoutChunk) -> Result<(), HandlerError>;
}

impl<F> DataHandler for F
where
    F: FnMut(ReadoutChunk) -> Result<(), HandlerError> + Send,
{
    fn handle_chunk(&mut self, chunk: ReadoutChunk) -> Result<(), HandlerError> {
        self(chunk)
    }
}

/// Receiver of readout faults. May be called from any readout thread.
pub trait ErrorHandler: Send + Sync {
    /// Reports one fault.
    fn handle_error(&self, error: ReadoutError);
}

impl<F> ErrorHandler for F
where
    F: Fn(ReadoutError) + Send + Sync,
{
    fn handle_error(&self, error: ReadoutError) {
        self(error);
    }
}

/// Error handler that logs and keeps every fault.
#[derive(Debug, Default)]
pub struct FaultLog {
    faults: Mutex<Vec<ReadoutError>>,
}

impl FaultLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Faults reported so far.
    #[must_use]
    pub fn faults(&self) -> Vec<ReadoutError> {
        self.faults.lock().clone()
    }

    /// Removes and returns the reported faults.
    pub fn take(&self) -> Vec<ReadoutError> {
        std::mem::take(&mut *self.faults.lock())
    }

    /// Number of faults reported so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.faults.lock().len()
    }

    /// Returns true if no fault was reported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.faults.lock().is_empty()
    }
}

impl ErrorHandler for FaultLog {
    fn handle_error(&self, error: ReadoutError) {
        log::error!("readout fault: {error}");
        self.faults.lock().push(error);
    }
}

/// Scan parameter id shared between the acquisition layer and the decoder.
#[derive(Debug, Clone, Default)]
pub struct ScanParameter(Arc<AtomicU32>);

impl ScanParameter {
    /// Sets the id recorded for subsequent bursts.
    pub fn set(&self, id: u32) {
        self.0.store(id, Ordering::Release);
    }

    /// Current id.
    #[must_use]
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

/// A decoded readout burst.
#[derive(Debug, Clone)]
pub struct DecodedBurst {
    /// Tagged hits in stream order.
    pub hits: Vec<HitRecord>,
    /// Descriptor recorded for the burst.
    pub chunk: ScanChunk,
    /// Start of the readout interval.
    pub timestamp_start: f64,
    /// End of the readout interval.
    pub timestamp_stop: f64,
    /// Readout status flags.
    pub status: u32,
    /// Decoder counters for the burst.
    pub stats: DecodeStats,
}

/// Consumer of decoded bursts.
pub trait BurstHandler: Send {
    /// Processes one decoded burst.
    ///
    /// # Errors
    /// A returned error is forwarded to the error handler.
    fn handle_burst(&mut self, burst: DecodedBurst) -> Result<(), HandlerError>;
}

impl<F> BurstHandler for F
where
    F: FnMut(DecodedBurst) -> Result<(), HandlerError> + Send,
{
    fn handle_burst(&mut self, burst: DecodedBurst) -> Result<(), HandlerError> {
        self(burst)
    }
}

/// Data handler that decodes bursts as they arrive.
///
/// Decoder state is carried from one burst to the next, so a hit whose
/// timer broadcast arrived in an earlier burst is still extended. Every
/// burst is appended to the shared chunk table under the current
/// [`ScanParameter`] id, empty reads included.
pub struct DecodingHandler<H> {
    decoder: Decoder<'static>,
    state: DecoderState,
    table: Arc<Mutex<ChunkTable>>,
    scan_param: ScanParameter,
    totals: Arc<Mutex<DecodeStats>>,
    inner: H,
}

impl<H: BurstHandler> DecodingHandler<H> {
    /// Creates a handler passing decoded bursts to `inner`.
    #[must_use]
    pub fn new(config: DecoderConfig, inner: H) -> Self {
        Self {
            decoder: Decoder::new(config),
            state: DecoderState::new(),
            table: Arc::default(),
            scan_param: ScanParameter::default(),
            totals: Arc::default(),
            inner,
        }
    }

    /// Continues a stream whose earlier bursts are already in `table`.
    #[must_use]
    pub fn with_table(mut self, table: Arc<Mutex<ChunkTable>>) -> Self {
        self.table = table;
        self
    }

    /// Shared chunk table.
    #[must_use]
    pub fn chunk_table(&self) -> Arc<Mutex<ChunkTable>> {
        Arc::clone(&self.table)
    }

    /// Handle for updating the scan parameter id.
    #[must_use]
    pub fn scan_parameter(&self) -> ScanParameter {
        self.scan_param.clone()
    }

    /// Shared counters accumulated over all bursts.
    #[must_use]
    pub fn totals(&self) -> Arc<Mutex<DecodeStats>> {
        Arc::clone(&self.totals)
    }

    /// Decoder state after the last burst.
    #[must_use]
    pub fn state(&self) -> &DecoderState {
        &self.state
    }
}

impl<H: BurstHandler> DataHandler for DecodingHandler<H> {
    fn handle_chunk(&mut self, chunk: ReadoutChunk) -> Result<(), HandlerError> {
        let descriptor = {
            let mut table = self.table.lock();
            let start = table.end_offset();
            let length =
                u32::try_from(chunk.len()).map_err(|_| "burst exceeds the 32-bit index range")?;
            let stop = start
                .checked_add(length)
                .ok_or("stream exceeds the 32-bit index range")?;
            let descriptor = ScanChunk::new(start, stop, self.scan_param.get())
                .with_interval(chunk.timestamp_start, chunk.timestamp_stop)
                .with_error(chunk.status);
            table.push(descriptor)?;
            descriptor
        };

        let (mut decoded, next) =
            self.decoder
                .decode(&chunk.words, u64::from(descriptor.index_start), &self.state);
        self.state = next;
        tag_hits(&mut decoded.hits, &descriptor);
        *self.totals.lock() += decoded.stats;

        self.inner.handle_burst(DecodedBurst {
            hits: decoded.hits,
            chunk: descriptor,
            timestamp_start: chunk.timestamp_start,
            timestamp_stop: chunk.timestamp_stop,
            status: chunk.status,
            stats: decoded.stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{GeneratorConfig, WordGenerator};

    fn chunk(words: Vec<u32>, start: f64) -> ReadoutChunk {
        ReadoutChunk {
            words: words.into(),
            timestamp_start: start,
            timestamp_stop: start + 0.05,
            status: 0,
        }
    }

    #[test]
    fn test_closure_handlers() {
        let mut seen = 0;
        {
            let mut handler = |c: ReadoutChunk| -> Result<(), HandlerError> {
                seen += c.len();
                Ok(())
            };
            handler.handle_chunk(chunk(vec![1, 2, 3], 0.0)).unwrap();
        }
        assert_eq!(seen, 3);

        let log = FaultLog::new();
        log.handle_error(ReadoutError::NotRunning);
        assert_eq!(log.faults(), vec![ReadoutError::NotRunning]);
        assert_eq!(log.take().len(), 1);
        assert!(log.is_empty());
    }

    #[test]
    fn test_decoding_handler_records_bursts() {
        let mut generator = WordGenerator::new(GeneratorConfig {
            n_links: 2,
            hits_per_read: 10,
            ticks_per_read: 1_000,
            seed: 3,
        });
        let bursts: Arc<Mutex<Vec<DecodedBurst>>> = Arc::default();
        let sink = Arc::clone(&bursts);
        let mut handler = DecodingHandler::new(
            DecoderConfig::default().with_n_links(2),
            move |burst: DecodedBurst| -> Result<(), HandlerError> {
                sink.lock().push(burst);
                Ok(())
            },
        );
        let scan = handler.scan_parameter();
        let table = handler.chunk_table();

        for (i, id) in [4u32, 4, 5].into_iter().enumerate() {
            scan.set(id);
            let words = generator.next_burst();
            handler.handle_chunk(chunk(words, i as f64)).unwrap();
        }
        handler.handle_chunk(chunk(Vec::new(), 3.0)).unwrap();

        let table = table.lock();
        assert_eq!(table.len(), 4);
        let ids: Vec<u32> = table.iter().map(|c| c.scan_param_id).collect();
        assert_eq!(ids, vec![4, 4, 5, 5]);
        assert!(table.as_slice()[3].is_empty());

        let bursts = bursts.lock();
        assert_eq!(bursts.len(), 4);
        assert!(bursts[2].hits.iter().all(|h| h.scan_param_id == 5));
        assert!(bursts[1]
            .hits
            .iter()
            .all(|h| bursts[1].chunk.contains(h.stream_index)));
        assert_eq!(handler.totals().lock().hits, 30);
        assert_eq!(handler.totals().lock().timestamp_mismatches, 0);
    }

    #[test]
    fn test_decoding_handler_continues_table() {
        let table = Arc::new(Mutex::new(
            ChunkTable::from_chunks([ScanChunk::new(0, 4, 0)]).unwrap(),
        ));
        let mut handler = DecodingHandler::new(
            DecoderConfig::default(),
            |_: DecodedBurst| -> Result<(), HandlerError> { Ok(()) },
        )
        .with_table(Arc::clone(&table));
        handler.handle_chunk(chunk(vec![0; 2], 0.0)).unwrap();
        assert_eq!(table.lock().as_slice()[1].index_start, 4);
        assert_eq!(table.lock().end_offset(), 6);
    }
}
