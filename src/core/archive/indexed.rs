//! Indexed store reader
//!
//! An indexed store is an index file (`assets.idx`) describing entries that
//! live in numbered chunk files next to it (`assets.000`, `assets.001`, ...).
//!
//! ```text
//! Index
//!   magic "SIDX" | version u16 | flags u16 | entry_count u32 | chunk_count u32
//!   entry_count x  name_len u16 | name | chunk u16 | offset u64 | length u64 | sha256 [32]
//!   chunk_count x  chunk u16 | size u64 | sha256 [32]
//!   (flags & SIGNED)  signer [32] | signature [64]
//! ```
//!
//! The Ed25519 signature covers every index byte before the signer key.
//! Chunk descriptors are opened on first use and kept until the store drops.
//! Every opened entry is hashed and checked against its index record.

use super::{entry_key, list_names, ArchiveReader, EntryListing, EntryStream, FieldReader, OpenedEntry};
use crate::core::error::{FsError, Result};
use crate::core::hash::ContentHash;
use crate::core::io::{ArchiveFile, IoCounters};
use ahash::AHashMap;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

pub const SIDX_MAGIC: [u8; 4] = *b"SIDX";
pub const SIDX_VERSION: u16 = 1;
pub const SIDX_FLAG_SIGNED: u16 = 0x0001;

const SIDX_HEADER_SIZE: usize = 16;
const SIGNATURE_SECTION_SIZE: usize = 32 + 64;

#[derive(Debug, Clone)]
pub struct IndexedEntry {
    pub name: String,
    pub chunk: u16,
    pub offset: u64,
    pub length: u64,
    pub hash: ContentHash,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkRecord {
    pub chunk: u16,
    pub size: u64,
    pub hash: ContentHash,
}

/// Signer key and signature stored at the end of a signed index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSignature {
    pub signer: [u8; 32],
    pub signature: [u8; 64],
}

/// Reader for an indexed (`.idx`) store
#[derive(Debug)]
pub struct IndexedStore {
    index_path: PathBuf,
    index: ArchiveFile,
    entries: Vec<IndexedEntry>,
    by_name: AHashMap<String, usize>,
    chunks: AHashMap<u16, ChunkRecord>,
    chunk_files: Mutex<AHashMap<u16, Arc<ArchiveFile>>>,
    signed_len: usize,
    signature: Option<StoreSignature>,
    signature_valid: OnceLock<bool>,
    counters: Arc<IoCounters>,
}

impl IndexedStore {
    /// Open an index file and validate its structure
    pub fn open<P: AsRef<Path>>(index_path: P, counters: &Arc<IoCounters>) -> Result<Self> {
        let path = index_path.as_ref();
        let index = ArchiveFile::open(path, counters)?;
        let bytes = index.read_vec_at(0, index.len() as usize)?;
        let mut reader = FieldReader::new(&bytes, path);

        if bytes.len() < SIDX_HEADER_SIZE || reader.array::<4>()? != SIDX_MAGIC {
            return Err(FsError::malformed(path, "invalid magic"));
        }
        let version = reader.u16()?;
        if version != SIDX_VERSION {
            return Err(FsError::malformed(
                path,
                format!("unsupported version {}", version),
            ));
        }
        let flags = reader.u16()?;
        let entry_count = reader.u32()? as usize;
        let chunk_count = reader.u32()? as usize;

        if entry_count == 0 {
            return Err(FsError::malformed(path, "store is empty"));
        }

        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let name = reader.name()?;
            let chunk = reader.u16()?;
            let offset = reader.u64()?;
            let length = reader.u64()?;
            let hash = ContentHash(reader.array()?);
            entries.push(IndexedEntry {
                name,
                chunk,
                offset,
                length,
                hash,
            });
        }

        let mut chunks = AHashMap::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            let chunk = reader.u16()?;
            let size = reader.u64()?;
            let hash = ContentHash(reader.array()?);
            chunks.insert(chunk, ChunkRecord { chunk, size, hash });
        }

        for entry in &entries {
            let fits = chunks
                .get(&entry.chunk)
                .and_then(|c| entry.offset.checked_add(entry.length).map(|end| end <= c.size))
                .unwrap_or(false);
            if !fits {
                return Err(FsError::malformed(
                    path,
                    format!("{} lies outside chunk {}", entry.name, entry.chunk),
                ));
            }
        }

        let signed_len = reader.position();
        let signature = if flags & SIDX_FLAG_SIGNED != 0 {
            if reader.remaining() != SIGNATURE_SECTION_SIZE {
                return Err(FsError::malformed(path, "signature section has the wrong size"));
            }
            let signer = reader.array::<32>()?;
            let signature = reader.array::<64>()?;
            Some(StoreSignature { signer, signature })
        } else {
            None
        };
        if reader.remaining() != 0 {
            return Err(FsError::malformed(path, "trailing bytes after index"));
        }

        let mut by_name = AHashMap::with_capacity(entries.len());
        for (idx, entry) in entries.iter().enumerate() {
            by_name.entry(entry_key(&entry.name)).or_insert(idx);
        }

        debug!(
            "Opened indexed store {} ({} entries, {} chunks, signed: {})",
            path.display(),
            entries.len(),
            chunks.len(),
            signature.is_some()
        );

        Ok(IndexedStore {
            index_path: path.to_path_buf(),
            index,
            entries,
            by_name,
            chunks,
            chunk_files: Mutex::new(AHashMap::new()),
            signed_len,
            signature,
            signature_valid: OnceLock::new(),
            counters: Arc::clone(counters),
        })
    }

    pub fn entries(&self) -> &[IndexedEntry] {
        &self.entries
    }

    /// Path of the numbered chunk file
    pub fn chunk_path(&self, chunk: u16) -> PathBuf {
        self.index_path.with_extension(format!("{:03}", chunk))
    }

    /// Hash recorded in the index for a chunk
    pub fn chunk_hash(&self, chunk: u16) -> Option<ContentHash> {
        self.chunks.get(&chunk).map(|c| c.hash)
    }

    /// Chunk records in chunk order
    pub fn chunk_records(&self) -> Vec<ChunkRecord> {
        let mut records: Vec<ChunkRecord> = self.chunks.values().copied().collect();
        records.sort_by_key(|c| c.chunk);
        records
    }

    /// Number of chunk descriptors opened so far
    pub fn open_chunk_count(&self) -> usize {
        self.chunk_files.lock().len()
    }

    pub fn signature(&self) -> Option<&StoreSignature> {
        self.signature.as_ref()
    }

    pub fn signer(&self) -> Option<[u8; 32]> {
        self.signature.map(|s| s.signer)
    }

    /// Whether the stored signature verifies against the stored signer key
    ///
    /// Computed on first call and cached for the life of the store.
    pub fn signature_valid(&self) -> bool {
        *self.signature_valid.get_or_init(|| match self.verify_signature() {
            Ok(valid) => valid,
            Err(e) => {
                warn!(
                    "Could not verify signature of {}: {}",
                    self.index_path.display(),
                    e
                );
                false
            }
        })
    }

    fn verify_signature(&self) -> Result<bool> {
        let Some(sig) = self.signature else {
            return Ok(false);
        };
        let Ok(key) = VerifyingKey::from_bytes(&sig.signer) else {
            return Ok(false);
        };
        let signed = self.index.read_vec_at(0, self.signed_len)?;
        let signature = Signature::from_bytes(&sig.signature);
        Ok(key.verify(&signed, &signature).is_ok())
    }

    /// Re-hash an entry's bytes and compare against the index
    pub fn verify_entry(&self, name: &str) -> Result<bool> {
        let Some(&idx) = self.by_name.get(&entry_key(name)) else {
            return Ok(false);
        };
        let entry = &self.entries[idx];
        let file = self.chunk_file(entry.chunk)?;
        let stream = EntryStream::windowed(file, entry.offset, entry.length);
        Ok(ContentHash::of_reader(stream)? == entry.hash)
    }

    /// Re-hash a whole chunk file and compare against the index
    pub fn verify_chunk(&self, chunk: u16) -> Result<bool> {
        let Some(record) = self.chunks.get(&chunk) else {
            return Ok(false);
        };
        let file = self.chunk_file(chunk)?;
        let stream = EntryStream::windowed(file, 0, record.size);
        Ok(ContentHash::of_reader(stream)? == record.hash)
    }

    fn chunk_file(&self, chunk: u16) -> Result<Arc<ArchiveFile>> {
        let mut files = self.chunk_files.lock();
        if let Some(file) = files.get(&chunk) {
            return Ok(Arc::clone(file));
        }

        let record = self.chunks.get(&chunk).ok_or_else(|| {
            FsError::malformed(&self.index_path, format!("unknown chunk {}", chunk))
        })?;
        let file = Arc::new(ArchiveFile::open(self.chunk_path(chunk), &self.counters)?);
        if file.len() < record.size {
            return Err(FsError::malformed(
                self.chunk_path(chunk),
                format!("chunk is {} bytes, index expects {}", file.len(), record.size),
            ));
        }

        files.insert(chunk, Arc::clone(&file));
        Ok(file)
    }
}

impl ArchiveReader for IndexedStore {
    fn path(&self) -> &Path {
        &self.index_path
    }

    fn open_entry(&self, name: &str) -> Result<Option<OpenedEntry>> {
        let Some(&idx) = self.by_name.get(&entry_key(name)) else {
            return Ok(None);
        };
        let entry = &self.entries[idx];
        let file = self.chunk_file(entry.chunk)?;
        let data = file.read_vec_at(entry.offset, entry.length as usize)?;

        // Served bytes must match the index, signed or not
        let hash = ContentHash::of(&data);
        if hash != entry.hash {
            warn!(
                "{} in {} does not match its indexed hash",
                entry.name,
                self.index_path.display()
            );
            return Err(FsError::ChecksumMismatch(format!(
                "{}/{}",
                self.index_path.display(),
                entry.name
            )));
        }
        Ok(Some(OpenedEntry {
            stream: EntryStream::buffered(Arc::from(data)),
            hash: Some(hash),
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
