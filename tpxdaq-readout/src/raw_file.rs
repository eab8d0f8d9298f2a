//! Raw word dump files.
//!
//! A dump is the FIFO word stream as little-endian `u32` values with no
//! header. Its chunk table is stored next to it as a JSON array of scan
//! chunk rows (`run.raw` -> `run.chunks.json`).

use crate::{Error, Result};
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tpxdaq_core::{ChunkTable, ScanChunk};

const WORD_BYTES: usize = 4;

/// Buffered writer of raw FIFO words.
pub struct RawWordWriter {
    writer: BufWriter<File>,
    words: u64,
}

impl RawWordWriter {
    /// Creates (or truncates) a dump file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            words: 0,
        })
    }

    /// Appends words.
    ///
    /// # Errors
    /// Returns an error if writing fails.
    pub fn write_words(&mut self, words: &[u32]) -> Result<()> {
        for word in words {
            self.writer.write_all(&word.to_le_bytes())?;
        }
        self.words += words.len() as u64;
        Ok(())
    }

    /// Words written so far.
    #[must_use]
    pub fn words_written(&self) -> u64 {
        self.words
    }

    /// Flushes buffered words to the file.
    ///
    /// # Errors
    /// Returns an error if flushing fails.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and closes the file; returns the number of words written.
    ///
    /// # Errors
    /// Returns an error if flushing fails.
    pub fn finish(mut self) -> Result<u64> {
        self.flush()?;
        Ok(self.words)
    }
}

/// Memory-mapped reader of a raw word dump.
pub struct RawWordReader {
    mmap: Mmap,
    path: PathBuf,
}

impl RawWordReader {
    /// Maps a dump file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be mapped or its size is not a
    /// whole number of words.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        // SAFETY: The file is opened read-only and we assume it is not modified concurrently.
        // This is the standard safety contract for memory mapping.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() % WORD_BYTES != 0 {
            return Err(Error::InvalidFormat(format!(
                "{}: {} bytes is not a whole number of 32-bit words",
                path.as_ref().display(),
                mmap.len()
            )));
        }
        Ok(Self {
            mmap,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Path of the mapped file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of words.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.len() / WORD_BYTES
    }

    /// Returns true if the dump holds no words.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Word at `index`.
    #[must_use]
    pub fn word(&self, index: usize) -> Option<u32> {
        let offset = index.checked_mul(WORD_BYTES)?;
        let bytes = self.mmap.get(offset..offset.checked_add(WORD_BYTES)?)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Iterates over the words in file order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.mmap
            .chunks_exact(WORD_BYTES)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Copies all words into memory.
    #[must_use]
    pub fn words(&self) -> Vec<u32> {
        self.iter().collect()
    }
}

/// Chunk table path belonging to a dump file.
#[must_use]
pub fn chunk_table_path(raw_path: &Path) -> PathBuf {
    raw_path.with_extension("chunks.json")
}

/// Writes a chunk table as JSON.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn save_chunk_table<P: AsRef<Path>>(path: P, table: &ChunkTable) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, table)?;
    writer.flush()?;
    Ok(())
}

/// Reads a chunk table and validates its row order.
///
/// # Errors
/// Returns an error if the file is unreadable, malformed, or its rows are
/// inverted or overlapping.
pub fn load_chunk_table<P: AsRef<Path>>(path: P) -> Result<ChunkTable> {
    let file = File::open(path)?;
    let rows: Vec<ScanChunk> = serde_json::from_reader(BufReader::new(file))?;
    Ok(ChunkTable::from_chunks(rows)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_write_then_map() {
        let file = NamedTempFile::new().unwrap();
        let mut writer = RawWordWriter::create(file.path()).unwrap();
        writer.write_words(&[0x0123_4567, 0x89AB_CDEF]).unwrap();
        writer.write_words(&[7]).unwrap();
        assert_eq!(writer.finish().unwrap(), 3);

        let bytes = std::fs::read(file.path()).unwrap();
        assert_eq!(&bytes[..4], &[0x67, 0x45, 0x23, 0x01]);

        let reader = RawWordReader::open(file.path()).unwrap();
        assert_eq!(reader.len(), 3);
        assert_eq!(reader.words(), vec![0x0123_4567, 0x89AB_CDEF, 7]);
        assert_eq!(reader.word(2), Some(7));
        assert_eq!(reader.word(3), None);
        assert_eq!(reader.word(usize::MAX / WORD_BYTES), None);
        assert_eq!(reader.word(usize::MAX), None);
    }

    #[test]
    fn test_truncated_dump_is_rejected() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), [1u8, 2, 3, 4, 5]).unwrap();
        let result = RawWordReader::open(file.path());
        assert!(matches!(result, Err(Error::InvalidFormat(_))));
    }

    #[test]
    fn test_chunk_table_file() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("run_0001.raw");
        let path = chunk_table_path(&raw);
        assert_eq!(path.file_name().unwrap(), "run_0001.chunks.json");

        let table = ChunkTable::from_chunks([
            ScanChunk::new(0, 6, 1).with_interval(10.0, 10.05),
            ScanChunk::new(6, 6, 1).with_interval(10.05, 10.1),
            ScanChunk::new(6, 20, 2).with_error(4),
        ])
        .unwrap();
        save_chunk_table(&path, &table).unwrap();

        let json = std::fs::read_to_string(&path).unwrap();
        for field in ["index_start", "data_length", "scan_param_id", "trigger"] {
            assert!(json.contains(field), "missing {field}");
        }
        let back = load_chunk_table(&path).unwrap();
        assert_eq!(back.as_slice(), table.as_slice());
    }

    #[test]
    fn test_overlapping_rows_are_rejected() {
        let file = NamedTempFile::new().unwrap();
        let rows = vec![ScanChunk::new(0, 10, 0), ScanChunk::new(5, 12, 1)];
        std::fs::write(file.path(), serde_json::to_string(&rows).unwrap()).unwrap();
        assert!(matches!(
            load_chunk_table(file.path()),
            Err(Error::CoreError(_))
        ));
    }
}
