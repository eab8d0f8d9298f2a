//! tpxdaq CLI: Timepix3 raw dump decoding and simulated acquisition.
//!
//! Raw dumps are little-endian `u32` FIFO words; each dump has a chunk table
//! next to it (`run.raw` -> `run.chunks.json`).
#![allow(
    clippy::uninlined_format_args,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

use clap::{Parser, Subcommand, ValueEnum};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tpxdaq_readout::raw_file::{chunk_table_path, load_chunk_table, save_chunk_table};
use tpxdaq_readout::{
    DataHandler, DecodedBurst, DecodingHandler, ErrorHandler, FaultLog, FifoReadout,
    GeneratorConfig, HandlerError, RawWordReader, RawWordWriter, ReadoutChunk, ReadoutConfig,
    SimulatedDevice, StartOptions, StopTimeout,
};
use tpxdaq_tpx3::word::{reassemble, split_links, MAX_LINKS};
use tpxdaq_tpx3::{
    decode_chunks, decode_chunks_parallel, ChipMode, ChunkTable, DecodeStats, Decoder,
    DecoderConfig, DecoderState, HeaderClass, HitRecord,
};

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Readout error: {0}")]
    Readout(#[from] tpxdaq_readout::Error),

    #[error("Acquisition error: {0}")]
    Acquisition(#[from] tpxdaq_readout::ReadoutError),

    #[error("Decoder error: {0}")]
    Decoder(#[from] tpxdaq_tpx3::Error),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Chip operating mode.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// TOA and TOT with hit counter
    ToaTot,
    /// TOA and event counter
    EventCount,
}

impl From<Mode> for ChipMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::ToaTot => ChipMode::ToaTot,
            Mode::EventCount => ChipMode::EventCount,
        }
    }
}

/// Timepix3 FIFO readout and 48-bit word decoder.
#[derive(Parser)]
#[command(name = "tpxdaq")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct DecoderArgs {
    /// JSON configuration file with "decoder" and "readout" sections
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of receiver links (overrides the configuration)
    #[arg(long)]
    n_links: Option<usize>,

    /// Chip operating mode (overrides the configuration)
    #[arg(long, value_enum)]
    mode: Option<Mode>,
}

impl DecoderArgs {
    fn decoder_config(&self) -> Result<DecoderConfig> {
        let mut config = match &self.config {
            Some(path) => DecoderConfig::from_file(path)?,
            None => DecoderConfig::default(),
        };
        if let Some(n_links) = self.n_links {
            config = config.with_n_links(n_links);
        }
        if let Some(mode) = self.mode {
            config = config.with_chip_mode(mode.into());
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a raw dump into JSON lines of hits
    Decode {
        /// Input raw dump
        input: PathBuf,

        /// Chunk table (defaults to the file next to the dump)
        #[arg(long)]
        chunks: Option<PathBuf>,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Decode chunks in parallel
        #[arg(short, long)]
        parallel: bool,

        /// Worker threads for parallel decoding
        #[arg(long)]
        threads: Option<usize>,

        #[command(flatten)]
        decoder: DecoderArgs,
    },

    /// Show word, link and header statistics of a raw dump
    Info {
        /// Input raw dump
        input: PathBuf,
    },

    /// Run a simulated acquisition into a raw dump
    Acquire {
        /// Output raw dump
        #[arg(short, long)]
        output: PathBuf,

        /// Acquisition time per scan step (seconds)
        #[arg(long, default_value = "1.0")]
        seconds: f64,

        /// Number of scan parameter steps
        #[arg(long, default_value = "1")]
        steps: u32,

        /// Pixel hits per FIFO read
        #[arg(long, default_value = "64")]
        hits_per_read: usize,

        /// Random seed of the simulated chip
        #[arg(long, default_value = "24301")]
        seed: u64,

        #[command(flatten)]
        decoder: DecoderArgs,
    },
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Decode {
            input,
            chunks,
            output,
            parallel,
            threads,
            decoder,
        } => {
            if let Some(threads) = threads {
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build_global()?;
            }
            let config = decoder.decoder_config()?;
            decode_dump(&input, chunks.as_deref(), output.as_deref(), parallel, config)?;
        }

        Commands::Info { input } => {
            dump_info(&input)?;
        }

        Commands::Acquire {
            output,
            seconds,
            steps,
            hits_per_read,
            seed,
            decoder,
        } => {
            let readout_config = match &decoder.config {
                Some(path) => ReadoutConfig::from_file(path)?,
                None => ReadoutConfig::default(),
            };
            let config = decoder.decoder_config()?;
            let generator = GeneratorConfig {
                n_links: config.n_links,
                hits_per_read,
                seed,
                ..GeneratorConfig::default()
            };
            let step_time = Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO);
            acquire(&output, readout_config, config, generator, steps, step_time)?;
        }
    }

    Ok(())
}

fn print_stats(stats: &DecodeStats) {
    eprintln!("Raw words: {}", stats.raw_words);
    eprintln!("Logical words: {}", stats.logical_words);
    eprintln!("Hits: {}", stats.hits);
    eprintln!("Timer broadcasts: {}", stats.timer_words);
    eprintln!("Control words: {}", stats.control_words);
    eprintln!("Framing errors: {}", stats.framing_errors);
    eprintln!("Stray words: {}", stats.stray_words);
    eprintln!("Corrected timestamps: {}", stats.corrected_timestamps);
    eprintln!("Timestamp mismatches: {}", stats.timestamp_mismatches);
    eprintln!("Unmatched hits: {}", stats.unmatched_hits);
}

fn decode_dump(
    input: &Path,
    chunks: Option<&Path>,
    output: Option<&Path>,
    parallel: bool,
    config: DecoderConfig,
) -> Result<()> {
    let start = Instant::now();
    let reader = RawWordReader::open(input)?;
    let words = reader.words();
    let decoder = Decoder::new(config);

    let table_path = chunks.map_or_else(|| chunk_table_path(input), Path::to_path_buf);
    let table = if table_path.exists() {
        load_chunk_table(&table_path)?
    } else {
        log::warn!(
            "no chunk table at {}, hits are left untagged",
            table_path.display()
        );
        ChunkTable::new()
    };

    let (hits, stats, trailing): (Vec<HitRecord>, DecodeStats, usize) = if table.is_empty() {
        let (decoded, _) = decoder.decode(&words, 0, &DecoderState::new());
        (decoded.hits, decoded.stats, 0)
    } else if parallel {
        let out = decode_chunks_parallel(&decoder, &words, &table);
        (out.hits, out.stats, out.trailing_words)
    } else {
        let out = decode_chunks(&decoder, &words, &table);
        (out.hits, out.stats, out.trailing_words)
    };

    let sink: Box<dyn Write> = match output {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout().lock()),
    };
    let mut sink = BufWriter::new(sink);
    for hit in &hits {
        serde_json::to_writer(&mut sink, hit)?;
        writeln!(sink)?;
    }
    sink.flush()?;

    eprintln!(
        "Decoded {} ({} chunks) in {:.2}s",
        input.display(),
        table.len(),
        start.elapsed().as_secs_f64()
    );
    print_stats(&stats);
    if trailing > 0 {
        eprintln!("Words past the chunk table: {trailing}");
    }
    Ok(())
}

fn dump_info(input: &Path) -> Result<()> {
    let reader = RawWordReader::open(input)?;
    let words = reader.words();
    println!("File: {}", input.display());
    println!("Words: {}", words.len());

    let demux = split_links(&words, 0, MAX_LINKS);
    let mut classes: BTreeMap<&'static str, usize> = BTreeMap::new();
    for (link, stream) in demux.links.iter().enumerate() {
        if stream.is_empty() {
            continue;
        }
        let reassembled = reassemble(link as u8, stream);
        println!(
            "Link {}: {} words, {} logical{}",
            link,
            stream.len(),
            reassembled.words.len(),
            if reassembled.framing_error {
                " (odd word count)"
            } else {
                ""
            }
        );
        for word in &reassembled.words {
            let name = match HeaderClass::from_header(word.header()) {
                HeaderClass::PixelHit => "pixel hits",
                HeaderClass::TimerExtension => "timer extensions",
                HeaderClass::ShutterTimer => "shutter timers",
                HeaderClass::Control => "control words",
            };
            *classes.entry(name).or_default() += 1;
        }
    }
    for (name, count) in &classes {
        println!("{}: {}", name, count);
    }

    let table_path = chunk_table_path(input);
    if table_path.exists() {
        let table = load_chunk_table(&table_path)?;
        let mut scan_ids: Vec<u32> = table.iter().map(|c| c.scan_param_id).collect();
        scan_ids.dedup();
        println!("Chunks: {}", table.len());
        println!("Scan parameter ids: {:?}", scan_ids);
        if let (Some(first), Some(last)) = (table.as_slice().first(), table.as_slice().last()) {
            println!(
                "Readout span: {:.3}s",
                last.timestamp_stop - first.timestamp_start
            );
        }
        if u64::from(table.end_offset()) != words.len() as u64 {
            println!(
                "Warning: chunk table covers {} of {} words",
                table.end_offset(),
                words.len()
            );
        }
    }
    Ok(())
}

fn acquire(
    output: &Path,
    readout_config: ReadoutConfig,
    config: DecoderConfig,
    generator: GeneratorConfig,
    steps: u32,
    step_time: Duration,
) -> Result<()> {
    let device = Arc::new(SimulatedDevice::new(config.n_links));
    let mut readout = FifoReadout::new(Arc::clone(&device), readout_config);

    let writer = Arc::new(Mutex::new(RawWordWriter::create(output)?));
    let bursts = Arc::new(Mutex::new(0usize));
    let burst_count = Arc::clone(&bursts);
    let count_bursts = move |burst: DecodedBurst| -> std::result::Result<(), HandlerError> {
        if !burst.hits.is_empty() {
            *burst_count.lock() += 1;
        }
        Ok(())
    };
    let mut decoding = DecodingHandler::new(config, count_bursts);
    let table = decoding.chunk_table();
    let totals = decoding.totals();
    let scan = decoding.scan_parameter();

    // Every burst is dumped before it is decoded, so chunk offsets are file offsets.
    let dump = Arc::clone(&writer);
    let handler = move |chunk: ReadoutChunk| -> std::result::Result<(), HandlerError> {
        dump.lock().write_words(&chunk.words)?;
        decoding.handle_chunk(chunk)
    };

    let faults = Arc::new(FaultLog::new());
    let errors: Arc<dyn ErrorHandler> = faults.clone();
    let options = StartOptions::from_config(&readout_config).with_reset();

    let start = Instant::now();
    readout.start(options, Some(Box::new(handler)), Some(errors))?;
    let mut generated = 0;
    for step in 0..steps {
        scan.set(step);
        device.open_shutter(GeneratorConfig {
            seed: generator.seed.wrapping_add(u64::from(step)),
            ..generator
        });
        thread::sleep(step_time);
        generated += device.close_shutter();
        readout.log_status();
    }
    readout.stop(StopTimeout::from_config(&readout_config))?;

    let words = Arc::try_unwrap(writer)
        .map_err(|_| io::Error::other("raw writer still in use"))?
        .into_inner()
        .finish()?;
    let table_path = chunk_table_path(output);
    save_chunk_table(&table_path, &table.lock())?;

    eprintln!(
        "Acquired {} words in {:.2}s ({} bursts with hits, {} hits generated)",
        words,
        start.elapsed().as_secs_f64(),
        *bursts.lock(),
        generated
    );
    eprintln!("Raw dump: {}", output.display());
    eprintln!("Chunk table: {}", table_path.display());
    print_stats(&totals.lock());
    let faults = faults.take();
    if !faults.is_empty() {
        eprintln!("Readout faults: {}", faults.len());
    }
    Ok(())
}
