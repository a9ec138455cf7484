//! Archive fixture writers for unit tests

use crate::core::archive::indexed::{SIDX_FLAG_SIGNED, SIDX_MAGIC, SIDX_VERSION};
use crate::core::archive::sequential::{SPAK_HEADER_SIZE, SPAK_MAGIC, SPAK_VERSION};
use crate::core::compression::{compress, CompressionMethod};
use ed25519_dalek::{Signer, SigningKey};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub struct SeqEntry {
    pub name: String,
    pub method: CompressionMethod,
    pub data: Vec<u8>,
}

impl SeqEntry {
    pub fn stored(name: &str, data: &[u8]) -> Self {
        Self::with_method(name, data, CompressionMethod::None)
    }

    pub fn lz4(name: &str, data: &[u8]) -> Self {
        Self::with_method(name, data, CompressionMethod::Lz4)
    }

    pub fn zstd(name: &str, data: &[u8]) -> Self {
        Self::with_method(name, data, CompressionMethod::Zstd)
    }

    fn with_method(name: &str, data: &[u8], method: CompressionMethod) -> Self {
        SeqEntry {
            name: name.to_string(),
            method,
            data: data.to_vec(),
        }
    }
}

/// Serialize a sequential archive; entry data follows the header directly
pub fn build_sequential(entries: &[SeqEntry]) -> Vec<u8> {
    let mut body = Vec::new();
    let mut directory = Vec::new();

    for entry in entries {
        let packed = compress(&entry.data, entry.method);
        let offset = (SPAK_HEADER_SIZE + body.len()) as u64;
        body.extend_from_slice(&packed);

        directory.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
        directory.extend_from_slice(entry.name.as_bytes());
        directory.push(entry.method as u8);
        directory.extend_from_slice(&crc32fast::hash(&entry.data).to_le_bytes());
        directory.extend_from_slice(&(packed.len() as u64).to_le_bytes());
        directory.extend_from_slice(&(entry.data.len() as u64).to_le_bytes());
        directory.extend_from_slice(&offset.to_le_bytes());
    }

    let mut out = Vec::with_capacity(SPAK_HEADER_SIZE + body.len() + directory.len());
    out.extend_from_slice(&SPAK_MAGIC);
    out.extend_from_slice(&SPAK_VERSION.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    out.extend_from_slice(&((SPAK_HEADER_SIZE + body.len()) as u64).to_le_bytes());
    out.extend_from_slice(&(directory.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&directory);
    out
}

pub struct IdxEntry {
    pub name: String,
    pub chunk: u16,
    pub data: Vec<u8>,
}

impl IdxEntry {
    pub fn new(name: &str, chunk: u16, data: &[u8]) -> Self {
        IdxEntry {
            name: name.to_string(),
            chunk,
            data: data.to_vec(),
        }
    }
}

/// Write an indexed store (`<stem>.idx` plus chunk files) into `dir`
pub fn build_indexed(
    dir: &Path,
    stem: &str,
    entries: &[IdxEntry],
    signer: Option<&SigningKey>,
) -> PathBuf {
    let index_path = dir.join(format!("{}.idx", stem));
    let mut chunks: BTreeMap<u16, Vec<u8>> = BTreeMap::new();
    let mut records = Vec::new();

    for IdxEntry { name, chunk, data } in entries {
        let blob = chunks.entry(*chunk).or_default();
        let offset = blob.len() as u64;
        blob.extend_from_slice(data);

        records.extend_from_slice(&(name.len() as u16).to_le_bytes());
        records.extend_from_slice(name.as_bytes());
        records.extend_from_slice(&chunk.to_le_bytes());
        records.extend_from_slice(&offset.to_le_bytes());
        records.extend_from_slice(&(data.len() as u64).to_le_bytes());
        records.extend_from_slice(&Sha256::digest(data));
    }

    let mut index = Vec::new();
    index.extend_from_slice(&SIDX_MAGIC);
    index.extend_from_slice(&SIDX_VERSION.to_le_bytes());
    let flags = if signer.is_some() { SIDX_FLAG_SIGNED } else { 0 };
    index.extend_from_slice(&flags.to_le_bytes());
    index.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    index.extend_from_slice(&(chunks.len() as u32).to_le_bytes());
    index.extend_from_slice(&records);

    for (chunk, blob) in &chunks {
        index.extend_from_slice(&chunk.to_le_bytes());
        index.extend_from_slice(&(blob.len() as u64).to_le_bytes());
        index.extend_from_slice(&Sha256::digest(blob));
        std::fs::write(dir.join(format!("{}.{:03}", stem, chunk)), blob).unwrap();
    }

    if let Some(key) = signer {
        let signature = key.sign(&index);
        index.extend_from_slice(&key.verifying_key().to_bytes());
        index.extend_from_slice(&signature.to_bytes());
    }

    std::fs::write(&index_path, index).unwrap();
    index_path
}
