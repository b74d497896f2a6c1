//! Record-file sources and sinks.
//!
//! A record file is a plain concatenation of fixed-size records; the file
//! size must be an exact multiple of the record size. Reads and writes go
//! through [`footfall_store::SequentialFile`], so the same source runs
//! over plaintext footprint-update files and encrypted state files alike.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use tracing::debug;

use footfall_error::{FootfallError, Result};
use footfall_store::SequentialFile;
use footfall_types::params::FILE_BLOCK_BYTES;
use footfall_types::FixedRecord;

use crate::Source;

/// Streams records out of a [`SequentialFile`] with chunked buffering.
#[derive(Debug)]
pub struct RecordSource<T: FixedRecord, F: SequentialFile> {
    file: F,
    total_records: u64,
    remaining: u64,
    buffer: Vec<u8>,
    /// Records currently decodable from `buffer`.
    buffered: usize,
    cursor: usize,
    _record: PhantomData<T>,
}

impl<T: FixedRecord, F: SequentialFile> RecordSource<T, F> {
    /// Open a source over `file`. `path` is used for diagnostics only.
    pub fn new(mut file: F, path: &Path) -> Result<Self> {
        let size = file.size()?;
        if size % T::ENCODED_LEN as u64 != 0 {
            return Err(FootfallError::MisalignedRecordFile {
                path: path.to_path_buf(),
                size,
                record_size: T::ENCODED_LEN,
            });
        }
        let total_records = size / T::ENCODED_LEN as u64;
        debug!(path = %path.display(), records = total_records, "opened record source");
        Ok(Self {
            file,
            total_records,
            remaining: total_records,
            buffer: Vec::new(),
            buffered: 0,
            cursor: 0,
            _record: PhantomData,
        })
    }

    /// Number of records in the whole file.
    pub fn record_count(&self) -> u64 {
        self.total_records
    }

    /// True when the file holds no records at all.
    pub fn is_empty_file(&self) -> bool {
        self.total_records == 0
    }

    fn refill(&mut self) -> Result<bool> {
        let chunk_records = (FILE_BLOCK_BYTES / T::ENCODED_LEN).max(1) as u64;
        let n = self.remaining.min(chunk_records);
        if n == 0 {
            return Ok(false);
        }
        self.buffer.resize(n as usize * T::ENCODED_LEN, 0);
        self.file.read_exact(&mut self.buffer)?;
        self.remaining -= n;
        self.buffered = n as usize;
        self.cursor = 0;
        Ok(true)
    }
}

impl<T: FixedRecord, F: SequentialFile> Source for RecordSource<T, F> {
    type Item = T;

    fn next(&mut self) -> Result<Option<T>> {
        if self.cursor == self.buffered && !self.refill()? {
            return Ok(None);
        }
        let at = self.cursor * T::ENCODED_LEN;
        self.cursor += 1;
        Ok(Some(T::decode(&self.buffer[at..at + T::ENCODED_LEN])))
    }
}

/// Writes records into a [`SequentialFile`], flushing in 1 MiB chunks.
pub struct RecordSink<T: FixedRecord, F: SequentialFile> {
    file: F,
    path: PathBuf,
    buffer: Vec<u8>,
    written: u64,
    _record: PhantomData<T>,
}

impl<T: FixedRecord, F: SequentialFile> RecordSink<T, F> {
    pub fn new(file: F, path: &Path) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
            buffer: Vec::with_capacity(FILE_BLOCK_BYTES),
            written: 0,
            _record: PhantomData,
        }
    }

    pub fn push(&mut self, record: &T) -> Result<()> {
        let start = self.buffer.len();
        self.buffer.resize(start + T::ENCODED_LEN, 0);
        record.encode_into(&mut self.buffer[start..]);
        self.written += 1;
        if self.buffer.len() >= FILE_BLOCK_BYTES {
            self.file.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }

    /// Flush and complete the file; returns the number of records written.
    pub fn finish(mut self) -> Result<u64> {
        if !self.buffer.is_empty() {
            self.file.write_all(&self.buffer)?;
        }
        self.file.finish()?;
        debug!(path = %self.path.display(), records = self.written, "record sink finished");
        Ok(self.written)
    }
}

/// An in-memory source, used by tests and the sort fast path.
pub struct VecSource<T> {
    items: std::vec::IntoIter<T>,
}

impl<T> VecSource<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }
}

impl<T> Source for VecSource<T> {
    type Item = T;

    fn next(&mut self) -> Result<Option<T>> {
        Ok(self.items.next())
    }
}
