//! File-backed storage for the analytics core.
//!
//! Three file disciplines live here:
//! - [`EncryptedFile`]: the authenticated-encrypted random-access file
//!   holding cumulative footprint state between invocations,
//! - [`PlainFile`]: host-supplied plaintext inputs (footprint-update
//!   files and their metadata sidecars),
//! - [`SealedStore`]: the single sealed state record, bound to an
//!   associated-data tag.

pub mod encrypted_file;
pub mod plain;
pub mod sealed;

pub use encrypted_file::EncryptedFile;
pub use plain::PlainFile;
pub use sealed::{SealedStore, STATE_AAD};

use footfall_error::Result;

/// Mode a storage file is opened in. Files are either consumed or produced
/// within one invocation, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    /// Create or truncate.
    WriteOnly,
}

/// A file read or written front to back, with exact-size reads.
///
/// Implemented by [`PlainFile`] and [`EncryptedFile`] so record streams
/// can run over either.
pub trait SequentialFile {
    /// Total plaintext size in bytes.
    fn size(&mut self) -> Result<u64>;

    /// Fill `buf` completely or fail with a short-read error.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Append `buf`.
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Flush buffered writes and complete the file. No further writes may
    /// follow.
    fn finish(&mut self) -> Result<()>;
}
