//! Open file handles

use crate::core::archive::EntryStream;
use crate::core::registry::StoreId;
use serde::Serialize;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// How a file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OpenMode {
    Read,
    /// Create or truncate
    Write,
    /// Create, writes go to the end
    Append,
    /// Existing file, read and write
    ReadUpdate,
}

impl OpenMode {
    /// Parse an fopen-style mode string (`"rb"`, `"wb"`, `"ab"`, `"r+b"`)
    pub fn parse(mode: &str) -> Option<Self> {
        let core: String = mode.chars().filter(|c| !matches!(c, 'b' | 't')).collect();
        match core.as_str() {
            "r" => Some(OpenMode::Read),
            "w" | "w+" => Some(OpenMode::Write),
            "a" | "a+" => Some(OpenMode::Append),
            "r+" => Some(OpenMode::ReadUpdate),
            _ => None,
        }
    }

    pub fn is_read_only(self) -> bool {
        self == OpenMode::Read
    }

    pub(crate) fn options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        match self {
            OpenMode::Read => options.read(true),
            OpenMode::Write => options.write(true).create(true).truncate(true),
            OpenMode::Append => options.append(true).create(true),
            OpenMode::ReadUpdate => options.read(true).write(true),
        };
        options
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OpenMode::Read => "read",
            OpenMode::Write => "write",
            OpenMode::Append => "append",
            OpenMode::ReadUpdate => "read-update",
        })
    }
}

impl FromStr for OpenMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(OpenMode::Read),
            "write" => Ok(OpenMode::Write),
            "append" => Ok(OpenMode::Append),
            "read-update" => Ok(OpenMode::ReadUpdate),
            other => OpenMode::parse(other).ok_or_else(|| format!("unknown open mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Loose,
    Archive,
    /// Served from the memory cache
    Memory,
    /// Absolute OS path outside the search path
    Direct,
}

/// Where an open file came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadSource {
    pub kind: SourceKind,
    /// Search path directory, archive file, or the file itself for direct opens
    pub location: PathBuf,
    pub group: Option<String>,
    pub store_id: Option<StoreId>,
    pub trusted: bool,
}

impl LoadSource {
    pub(crate) fn memory() -> Self {
        LoadSource {
            kind: SourceKind::Memory,
            location: PathBuf::new(),
            group: None,
            store_id: None,
            trusted: false,
        }
    }

    pub(crate) fn direct(path: &std::path::Path) -> Self {
        LoadSource {
            kind: SourceKind::Direct,
            location: path.to_path_buf(),
            group: None,
            store_id: None,
            trusted: false,
        }
    }
}

enum HandleInner {
    Loose(File),
    Archive(EntryStream),
    Memory(Cursor<Arc<[u8]>>),
}

/// A resolved, open file
pub struct FileHandle {
    inner: HandleInner,
    mode: OpenMode,
    source: LoadSource,
}

impl FileHandle {
    pub(crate) fn loose(file: File, mode: OpenMode, source: LoadSource) -> Self {
        FileHandle {
            inner: HandleInner::Loose(file),
            mode,
            source,
        }
    }

    pub(crate) fn archive(stream: EntryStream, source: LoadSource) -> Self {
        FileHandle {
            inner: HandleInner::Archive(stream),
            mode: OpenMode::Read,
            source,
        }
    }

    pub(crate) fn memory(data: Arc<[u8]>) -> Self {
        FileHandle {
            inner: HandleInner::Memory(Cursor::new(data)),
            mode: OpenMode::Read,
            source: LoadSource::memory(),
        }
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn source(&self) -> &LoadSource {
        &self.source
    }

    /// Current position
    pub fn tell(&mut self) -> io::Result<u64> {
        self.stream_position()
    }

    /// Total length in bytes
    pub fn size(&self) -> io::Result<u64> {
        match &self.inner {
            HandleInner::Loose(file) => Ok(file.metadata()?.len()),
            HandleInner::Archive(stream) => Ok(stream.len()),
            HandleInner::Memory(cursor) => Ok(cursor.get_ref().len() as u64),
        }
    }

    /// Flush pending writes and close
    pub fn close(mut self) -> io::Result<()> {
        self.flush()
    }

    /// Read everything from the current position on
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Read for FileHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            HandleInner::Loose(file) => file.read(buf),
            HandleInner::Archive(stream) => stream.read(buf),
            HandleInner::Memory(cursor) => cursor.read(buf),
        }
    }
}

impl Write for FileHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            HandleInner::Loose(file) if !self.mode.is_read_only() => file.write(buf),
            _ => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "file is open read-only",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            HandleInner::Loose(file) => file.flush(),
            _ => Ok(()),
        }
    }
}

impl Seek for FileHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match &mut self.inner {
            HandleInner::Loose(file) => file.seek(pos),
            HandleInner::Archive(stream) => stream.seek(pos),
            HandleInner::Memory(cursor) => cursor.seek(pos),
        }
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("mode", &self.mode)
            .field("source", &self.source)
            .finish()
    }
}
