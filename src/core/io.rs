//! Disk I/O for archive files
//!
//! Archive readers share one descriptor per file between all open entries,
//! so reads are positioned (`seek` + `read_exact` under a lock). Every
//! descriptor opened through [`ArchiveFile`] is counted in [`IoCounters`],
//! which makes descriptor leaks observable.

use crate::core::error::Result;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Descriptor open/close counters
#[derive(Debug, Default)]
pub struct IoCounters {
    opens: AtomicU64,
    closes: AtomicU64,
}

impl IoCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    /// Descriptors currently open
    pub fn open_descriptors(&self) -> u64 {
        self.opens().saturating_sub(self.closes())
    }
}

/// Read-only archive file with positioned reads
pub struct ArchiveFile {
    file: Mutex<File>,
    path: PathBuf,
    len: u64,
    counters: Arc<IoCounters>,
}

impl ArchiveFile {
    /// Open an existing archive file for reading
    pub fn open<P: AsRef<Path>>(path: P, counters: &Arc<IoCounters>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        counters.opens.fetch_add(1, Ordering::SeqCst);

        Ok(ArchiveFile {
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
            len,
            counters: Arc::clone(counters),
        })
    }

    /// Fill `buf` from `offset`
    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Read `len` bytes from `offset` into a new buffer
    pub fn read_vec_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        self.read_exact_at(offset, &mut buffer)?;
        Ok(buffer)
    }

    /// Read up to `buf.len()` bytes from `offset`, returning the count read
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read(buf)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ArchiveFile {
    fn drop(&mut self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ArchiveFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveFile")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_positioned_reads() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"0123456789").unwrap();
        temp.flush().unwrap();

        let counters = IoCounters::new();
        let file = ArchiveFile::open(temp.path(), &counters).unwrap();
        assert_eq!(file.len(), 10);
        assert_eq!(file.read_vec_at(3, 4).unwrap(), b"3456");

        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(8, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
    }

    #[test]
    fn test_read_past_end_fails() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"short").unwrap();
        temp.flush().unwrap();

        let counters = IoCounters::new();
        let file = ArchiveFile::open(temp.path(), &counters).unwrap();
        assert!(file.read_vec_at(2, 10).is_err());
    }

    #[test]
    fn test_counters_track_descriptors() {
        let temp = NamedTempFile::new().unwrap();
        let counters = IoCounters::new();

        let a = ArchiveFile::open(temp.path(), &counters).unwrap();
        let b = ArchiveFile::open(temp.path(), &counters).unwrap();
        assert_eq!(counters.open_descriptors(), 2);

        drop(a);
        assert_eq!(counters.open_descriptors(), 1);
        drop(b);
        assert_eq!(counters.opens(), 2);
        assert_eq!(counters.closes(), 2);
    }

    #[test]
    fn test_open_missing_file() {
        let counters = IoCounters::new();
        assert!(ArchiveFile::open("/nonexistent/archive.pak", &counters).is_err());
        assert_eq!(counters.opens(), 0);
    }
}
