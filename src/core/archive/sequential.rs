//! Sequential archive reader
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Header (24 bytes)                            │
//! │  magic "SPAK" | version u16 | flags u16      │
//! │  entry_count u32 | dir_offset u64 | dir u32  │
//! ├──────────────────────────────────────────────┤
//! │ Entry data (stored / LZ4 / Zstd)             │
//! ├──────────────────────────────────────────────┤
//! │ Directory (entry_count records)              │
//! │  name_len u16 | name | method u8 | crc32 u32 │
//! │  compressed u64 | uncompressed u64 | off u64 │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! All offsets are relative to the archive start, so the same bytes can be
//! mounted standalone or from an [`EmbeddedWindow`] inside a host file.
//!
//! Map-embedded archives do not hold their descriptor between uses. The
//! descriptor is opened by the outermost [`SequentialArchive::begin_access`]
//! and closed by the matching [`SequentialArchive::end_access`]; entry opens
//! outside any window open and close it around the read.

use super::{entry_key, list_names, ArchiveReader, EntryListing, EntryStream, FieldReader, OpenedEntry};
use crate::core::compression::{decompress, CompressionMethod};
use crate::core::error::{FsError, Result};
use crate::core::io::{ArchiveFile, IoCounters};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

pub const SPAK_MAGIC: [u8; 4] = *b"SPAK";
pub const SPAK_VERSION: u16 = 1;
pub const SPAK_HEADER_SIZE: usize = 24;

/// Byte range of a host file holding an embedded archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddedWindow {
    pub offset: u64,
    pub length: u64,
}

/// One directory record
#[derive(Debug, Clone)]
pub struct SequentialEntry {
    pub name: String,
    pub method: CompressionMethod,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub data_offset: u64,
}

#[derive(Debug, Default)]
struct AccessState {
    depth: usize,
    file: Option<Arc<ArchiveFile>>,
}

/// Reader for a sequential (`.pak`) archive
#[derive(Debug)]
pub struct SequentialArchive {
    path: PathBuf,
    window: Option<EmbeddedWindow>,
    map_embedded: bool,
    entries: Vec<SequentialEntry>,
    by_name: AHashMap<String, usize>,
    access: Mutex<AccessState>,
    counters: Arc<IoCounters>,
}

impl SequentialArchive {
    /// Open a standalone archive; the descriptor stays open for its lifetime
    pub fn open<P: AsRef<Path>>(
        path: P,
        counters: &Arc<IoCounters>,
        max_entry_size: u64,
    ) -> Result<Self> {
        let file = Arc::new(ArchiveFile::open(path.as_ref(), counters)?);
        let window = EmbeddedWindow {
            offset: 0,
            length: file.len(),
        };
        let entries = read_directory(&file, window, max_entry_size)?;

        Ok(Self::build(
            path.as_ref(),
            None,
            false,
            entries,
            AccessState {
                depth: 0,
                file: Some(file),
            },
            counters,
        ))
    }

    /// Open an archive embedded in `host`
    ///
    /// Map-embedded archives release their descriptor once the directory is
    /// read; other embedded archives keep it like standalone ones.
    pub fn open_embedded<P: AsRef<Path>>(
        host: P,
        window: EmbeddedWindow,
        map_embedded: bool,
        counters: &Arc<IoCounters>,
        max_entry_size: u64,
    ) -> Result<Self> {
        let file = Arc::new(ArchiveFile::open(host.as_ref(), counters)?);
        let in_bounds = window
            .offset
            .checked_add(window.length)
            .map(|end| end <= file.len())
            .unwrap_or(false);
        if !in_bounds {
            return Err(FsError::malformed(
                host.as_ref(),
                format!(
                    "embedded window {}+{} exceeds host size {}",
                    window.offset,
                    window.length,
                    file.len()
                ),
            ));
        }

        let entries = read_directory(&file, window, max_entry_size)?;
        let state = if map_embedded {
            AccessState::default()
        } else {
            AccessState {
                depth: 0,
                file: Some(file),
            }
        };

        Ok(Self::build(
            host.as_ref(),
            Some(window),
            map_embedded,
            entries,
            state,
            counters,
        ))
    }

    fn build(
        path: &Path,
        window: Option<EmbeddedWindow>,
        map_embedded: bool,
        entries: Vec<SequentialEntry>,
        access: AccessState,
        counters: &Arc<IoCounters>,
    ) -> Self {
        let mut by_name = AHashMap::with_capacity(entries.len());
        for (idx, entry) in entries.iter().enumerate() {
            // First record wins on duplicate names
            by_name.entry(entry_key(&entry.name)).or_insert(idx);
        }
        debug!(
            "Opened sequential archive {} ({} entries)",
            path.display(),
            entries.len()
        );

        SequentialArchive {
            path: path.to_path_buf(),
            window,
            map_embedded,
            entries,
            by_name,
            access: Mutex::new(access),
            counters: Arc::clone(counters),
        }
    }

    pub fn window(&self) -> Option<EmbeddedWindow> {
        self.window
    }

    pub fn is_map_embedded(&self) -> bool {
        self.map_embedded
    }

    pub fn entries(&self) -> &[SequentialEntry] {
        &self.entries
    }

    /// Enter an access window; nested calls are counted
    pub fn begin_access(&self) -> Result<()> {
        let mut state = self.access.lock();
        if self.map_embedded && state.depth == 0 {
            trace!("Opening map-embedded archive {}", self.path.display());
            state.file = Some(Arc::new(ArchiveFile::open(&self.path, &self.counters)?));
        }
        state.depth += 1;
        Ok(())
    }

    /// Leave an access window; the outermost exit closes a map-embedded descriptor
    pub fn end_access(&self) {
        let mut state = self.access.lock();
        if state.depth == 0 {
            return;
        }
        state.depth -= 1;
        if self.map_embedded && state.depth == 0 {
            trace!("Closing map-embedded archive {}", self.path.display());
            state.file = None;
        }
    }

    /// RAII form of `begin_access`/`end_access`
    pub fn access(&self) -> Result<AccessWindow<'_>> {
        self.begin_access()?;
        Ok(AccessWindow { archive: self })
    }

    /// Current access window nesting depth
    pub fn access_depth(&self) -> usize {
        self.access.lock().depth
    }

    fn base_offset(&self) -> u64 {
        self.window.map(|w| w.offset).unwrap_or(0)
    }

    fn read_entry(&self, entry: &SequentialEntry) -> Result<Vec<u8>> {
        let _window = self.access()?;
        let file = self
            .access
            .lock()
            .file
            .clone()
            .ok_or_else(|| FsError::malformed(&self.path, "archive descriptor is closed"))?;

        let raw = file.read_vec_at(
            self.base_offset() + entry.data_offset,
            entry.compressed_size as usize,
        )?;
        let data = decompress(&raw, entry.method, entry.uncompressed_size as usize)?;

        if crc32fast::hash(&data) != entry.crc32 {
            return Err(FsError::ChecksumMismatch(format!(
                "{}/{}",
                self.path.display(),
                entry.name
            )));
        }
        Ok(data)
    }
}

impl ArchiveReader for SequentialArchive {
    fn path(&self) -> &Path {
        &self.path
    }

    fn open_entry(&self, name: &str) -> Result<Option<OpenedEntry>> {
        let Some(&idx) = self.by_name.get(&entry_key(name)) else {
            return Ok(None);
        };
        let data = self.read_entry(&self.entries[idx])?;
        Ok(Some(OpenedEntry {
            stream: EntryStream::buffered(Arc::from(data)),
            hash: None,
        }))
    }

    fn list_entries(&self, pattern: &str) -> EntryListing {
        list_names(self.entries.iter().map(|e| e.name.as_str()), pattern)
    }

    fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(&entry_key(name))
    }

    fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

/// Guard holding an archive access window open
pub struct AccessWindow<'a> {
    archive: &'a SequentialArchive,
}

impl Drop for AccessWindow<'_> {
    fn drop(&mut self) {
        self.archive.end_access();
    }
}

fn read_directory(
    file: &ArchiveFile,
    window: EmbeddedWindow,
    max_entry_size: u64,
) -> Result<Vec<SequentialEntry>> {
    let path = file.path();
    if window.length < SPAK_HEADER_SIZE as u64 {
        return Err(FsError::malformed(path, "archive is smaller than its header"));
    }

    let header = file.read_vec_at(window.offset, SPAK_HEADER_SIZE)?;
    let mut reader = FieldReader::new(&header, path);
    if reader.array::<4>()? != SPAK_MAGIC {
        return Err(FsError::malformed(path, "invalid magic"));
    }
    let version = reader.u16()?;
    if version != SPAK_VERSION {
        return Err(FsError::malformed(
            path,
            format!("unsupported version {}", version),
        ));
    }
    let _flags = reader.u16()?;
    let entry_count = reader.u32()? as usize;
    let dir_offset = reader.u64()?;
    let dir_size = reader.u32()? as u64;

    if entry_count == 0 {
        return Err(FsError::malformed(path, "archive is empty"));
    }
    if dir_offset
        .checked_add(dir_size)
        .map(|end| end > window.length)
        .unwrap_or(true)
    {
        return Err(FsError::malformed(path, "directory lies outside the archive"));
    }

    let directory = file.read_vec_at(window.offset + dir_offset, dir_size as usize)?;
    let mut reader = FieldReader::new(&directory, path);
    let mut entries = Vec::with_capacity(entry_count);

    for _ in 0..entry_count {
        let name = reader.name()?;
        let method = CompressionMethod::from_u8(reader.u8()?).ok_or_else(|| {
            FsError::malformed(path, format!("unknown compression method for {}", name))
        })?;
        let crc32 = reader.u32()?;
        let compressed_size = reader.u64()?;
        let uncompressed_size = reader.u64()?;
        let data_offset = reader.u64()?;

        if data_offset
            .checked_add(compressed_size)
            .map(|end| end > window.length)
            .unwrap_or(true)
        {
            return Err(FsError::malformed(
                path,
                format!("data for {} lies outside the archive", name),
            ));
        }
        if uncompressed_size > max_entry_size {
            return Err(FsError::malformed(
                path,
                format!("{} exceeds the entry size limit", name),
            ));
        }
        if method == CompressionMethod::None && compressed_size != uncompressed_size {
            return Err(FsError::malformed(
                path,
                format!("stored entry {} has mismatched sizes", name),
            ));
        }

        entries.push(SequentialEntry {
            name,
            method,
            crc32,
            compressed_size,
            uncompressed_size,
            data_offset,
        });
    }

    Ok(entries)
}
