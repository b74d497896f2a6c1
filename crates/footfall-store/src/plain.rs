//! Plaintext host-supplied files.
//!
//! Footprint-update files are produced by the host next to the trusted
//! core, so they arrive unencrypted and are read straight from disk.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

use footfall_error::{FootfallError, Result};

use crate::{OpenMode, SequentialFile};

/// A plain file with the same sequential access surface as
/// [`crate::EncryptedFile`].
#[derive(Debug)]
pub struct PlainFile {
    path: PathBuf,
    file: File,
}

impl PlainFile {
    pub fn open(path: &Path, mode: OpenMode) -> Result<Self> {
        let file = match mode {
            OpenMode::ReadOnly => File::open(path),
            OpenMode::WriteOnly => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path),
        }
        .map_err(|e| FootfallError::BadInputFile {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a whole file into a string (metadata sidecars).
    pub fn read_to_string(path: &Path) -> Result<String> {
        std::fs::read_to_string(path).map_err(|e| FootfallError::BadInputFile {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    pub fn remove(path: &Path) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }
}

impl SequentialFile for PlainFile {
    fn size(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(FootfallError::ShortRead {
                    expected: buf.len(),
                    actual: filled,
                });
            }
            filled += n;
        }
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        use std::io::Write;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        use std::io::Write;
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("h_file");
        let mut file = PlainFile::open(&path, OpenMode::WriteOnly).unwrap();
        file.write_all(b"abcdef").unwrap();
        file.finish().unwrap();

        let mut file = PlainFile::open(&path, OpenMode::ReadOnly).unwrap();
        assert_eq!(file.size().unwrap(), 6);
        let mut buf = [0u8; 6];
        file.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abcdef");
        assert!(file.read_exact(&mut buf).is_err());
    }

    #[test]
    fn missing_file_is_a_bad_input() {
        let dir = tempdir().unwrap();
        let err = PlainFile::open(&dir.path().join("nope"), OpenMode::ReadOnly).unwrap_err();
        assert!(matches!(err, FootfallError::BadInputFile { .. }));
    }
}
