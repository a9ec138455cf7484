//! Archive readers
//!
//! Two on-disk formats can be mounted as search paths:
//!
//! - [`sequential::SequentialArchive`] - a single container file with a
//!   central directory of (optionally compressed) entries. It can live at an
//!   offset inside a larger host file.
//! - [`indexed::IndexedStore`] - an index file plus numbered chunk files,
//!   with a SHA-256 per entry and an optional Ed25519 signature over the index.
//!
//! Both are reached through [`Archive`], which dispatches the
//! [`ArchiveReader`] operations to the variant.

pub mod indexed;
pub mod sequential;

use crate::core::error::{FsError, Result};
use crate::core::hash::ContentHash;
use crate::core::io::ArchiveFile;
use crate::core::pattern::{split_wildcard, PatternMatcher};
use indexed::IndexedStore;
use sequential::SequentialArchive;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

/// Shared ownership of one opened archive
pub type ArchiveHandle = Arc<Archive>;

/// On-disk archive format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Sequential,
    Indexed,
}

/// Names under one directory matching a wildcard, partitioned by kind
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EntryListing {
    pub dirs: Vec<String>,
    pub files: Vec<String>,
}

impl EntryListing {
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty() && self.files.is_empty()
    }
}

/// An entry opened from an archive
pub struct OpenedEntry {
    pub stream: EntryStream,
    /// Content hash of the served bytes, when the format checks one
    pub hash: Option<ContentHash>,
}

/// Operations every archive format provides
pub trait ArchiveReader {
    /// Path the archive was mounted from
    fn path(&self) -> &Path;

    /// Open an entry by logical name (case-insensitive)
    fn open_entry(&self, name: &str) -> Result<Option<OpenedEntry>>;

    /// All names matching `pattern` one directory level below its literal part
    fn list_entries(&self, pattern: &str) -> EntryListing;

    fn contains(&self, name: &str) -> bool;

    fn entry_count(&self) -> usize;
}

/// An opened archive of either format
#[derive(Debug)]
pub enum Archive {
    Sequential(SequentialArchive),
    Indexed(IndexedStore),
}

impl Archive {
    pub fn kind(&self) -> ArchiveKind {
        match self {
            Archive::Sequential(_) => ArchiveKind::Sequential,
            Archive::Indexed(_) => ArchiveKind::Indexed,
        }
    }

    pub fn as_sequential(&self) -> Option<&SequentialArchive> {
        match self {
            Archive::Sequential(a) => Some(a),
            Archive::Indexed(_) => None,
        }
    }

    pub fn as_indexed(&self) -> Option<&IndexedStore> {
        match self {
            Archive::Indexed(s) => Some(s),
            Archive::Sequential(_) => None,
        }
    }

    pub fn is_map_embedded(&self) -> bool {
        self.as_sequential().map(|a| a.is_map_embedded()).unwrap_or(false)
    }

    fn reader(&self) -> &dyn ArchiveReader {
        match self {
            Archive::Sequential(a) => a,
            Archive::Indexed(s) => s,
        }
    }
}

impl ArchiveReader for Archive {
    fn path(&self) -> &Path {
        self.reader().path()
    }

    fn open_entry(&self, name: &str) -> Result<Option<OpenedEntry>> {
        self.reader().open_entry(name)
    }

    fn list_entries(&self, pattern: &str) -> EntryListing {
        self.reader().list_entries(pattern)
    }

    fn contains(&self, name: &str) -> bool {
        self.reader().contains(name)
    }

    fn entry_count(&self) -> usize {
        self.reader().entry_count()
    }
}

/// Normalized lookup key for an entry name
pub(crate) fn entry_key(name: &str) -> String {
    crate::core::symbol::normalize_key(name.trim_start_matches(['/', '\\']))
}

/// Shared listing logic over an archive's entry names
pub(crate) fn list_names<'a, I>(names: I, pattern: &str) -> EntryListing
where
    I: IntoIterator<Item = &'a str>,
{
    let (dir, file_pattern) = split_wildcard(pattern);
    let dir = entry_key(&dir);
    let mut listing = EntryListing::default();
    let mut seen_dirs = ahash::AHashSet::new();

    for name in names {
        let rest = if dir.is_empty() {
            name
        } else {
            match name.get(..dir.len()) {
                Some(prefix) if prefix.eq_ignore_ascii_case(&dir) => {
                    match name[dir.len()..].strip_prefix('/') {
                        Some(rest) => rest,
                        None => continue,
                    }
                }
                _ => continue,
            }
        };

        match rest.split_once('/') {
            Some((child, _)) => {
                if PatternMatcher::matches_segment(&file_pattern, child)
                    && seen_dirs.insert(child.to_ascii_lowercase())
                {
                    listing.dirs.push(child.to_string());
                }
            }
            None => {
                if PatternMatcher::matches_segment(&file_pattern, rest) {
                    listing.files.push(rest.to_string());
                }
            }
        }
    }

    listing
}

/// Readable, seekable view of one archive entry
pub enum EntryStream {
    /// Fully decoded in memory
    Buffered(Cursor<Arc<[u8]>>),
    /// Read lazily from a byte range of an archive file
    Windowed {
        file: Arc<ArchiveFile>,
        start: u64,
        len: u64,
        pos: u64,
    },
}

impl EntryStream {
    pub fn buffered(data: Arc<[u8]>) -> Self {
        EntryStream::Buffered(Cursor::new(data))
    }

    pub fn windowed(file: Arc<ArchiveFile>, start: u64, len: u64) -> Self {
        EntryStream::Windowed {
            file,
            start,
            len,
            pos: 0,
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            EntryStream::Buffered(c) => c.get_ref().len() as u64,
            EntryStream::Windowed { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self) -> u64 {
        match self {
            EntryStream::Buffered(c) => c.position(),
            EntryStream::Windowed { pos, .. } => *pos,
        }
    }

    /// Decoded bytes when the entry is held in memory
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            EntryStream::Buffered(c) => Some(c.get_ref()),
            EntryStream::Windowed { .. } => None,
        }
    }

    /// Read the remainder of the entry
    pub fn read_all(&mut self) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.len().saturating_sub(self.position()) as usize);
        self.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Read for EntryStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            EntryStream::Buffered(c) => c.read(buf),
            EntryStream::Windowed {
                file,
                start,
                len,
                pos,
            } => {
                if *pos >= *len {
                    return Ok(0);
                }
                let want = buf.len().min((*len - *pos) as usize);
                let n = file.read_at(*start + *pos, &mut buf[..want])?;
                *pos += n as u64;
                Ok(n)
            }
        }
    }
}

impl Seek for EntryStream {
    fn seek(&mut self, target: SeekFrom) -> std::io::Result<u64> {
        match self {
            EntryStream::Buffered(c) => c.seek(target),
            EntryStream::Windowed { len, pos, .. } => {
                let next = seek_target(target, *pos, *len)?;
                *pos = next;
                Ok(next)
            }
        }
    }
}

/// Resolve a `SeekFrom` against a stream of length `len`
pub(crate) fn seek_target(target: SeekFrom, pos: u64, len: u64) -> std::io::Result<u64> {
    let (base, delta) = match target {
        SeekFrom::Start(n) => return Ok(n),
        SeekFrom::Current(d) => (pos, d),
        SeekFrom::End(d) => (len, d),
    };
    base.checked_add_signed(delta).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "invalid seek to a negative or overflowing position",
        )
    })
}

/// Little-endian field reader over an in-memory structure
pub(crate) struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
    path: &'a Path,
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(buf: &'a [u8], path: &'a Path) -> Self {
        FieldReader { buf, pos: 0, path }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(FsError::malformed(
                self.path,
                format!("truncated structure at byte {}", self.pos),
            ));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    /// `u16` length-prefixed UTF-8 name, normalized to `/` separators
    pub(crate) fn name(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        let name = std::str::from_utf8(raw)
            .map_err(|_| FsError::malformed(self.path, "entry name is not UTF-8"))?;
        let name = name.replace('\\', "/");
        let name = name.trim_start_matches('/');
        if name.is_empty() {
            return Err(FsError::malformed(self.path, "empty entry name"));
        }
        Ok(name.to_string())
    }
}
