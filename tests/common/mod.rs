//! Shared fixtures for the integration suites
//!
//! Archive writers live here rather than in the library, which only reads.

#![allow(dead_code)]

use ed25519_dalek::{Signer, SigningKey};
use pakfs::{FileSystem, SearchPosition};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const METHOD_STORED: u8 = 0;
pub const METHOD_LZ4: u8 = 1;
pub const METHOD_ZSTD: u8 = 2;

/// Sequential archive bytes; entries are `(name, method, data)`
pub fn sequential_archive(entries: &[(&str, u8, &[u8])]) -> Vec<u8> {
    const HEADER: usize = 24;
    let mut body = Vec::new();
    let mut directory = Vec::new();

    for &(name, method, data) in entries {
        let packed = match method {
            METHOD_LZ4 => lz4_flex::compress_prepend_size(data),
            METHOD_ZSTD => zstd::bulk::compress(data, 3).unwrap(),
            _ => data.to_vec(),
        };
        let offset = (HEADER + body.len()) as u64;
        body.extend_from_slice(&packed);

        directory.extend_from_slice(&(name.len() as u16).to_le_bytes());
        directory.extend_from_slice(name.as_bytes());
        directory.push(method);
        directory.extend_from_slice(&crc32fast::hash(data).to_le_bytes());
        directory.extend_from_slice(&(packed.len() as u64).to_le_bytes());
        directory.extend_from_slice(&(data.len() as u64).to_le_bytes());
        directory.extend_from_slice(&offset.to_le_bytes());
    }

    let mut out = Vec::new();
    out.extend_from_slice(b"SPAK");
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    out.extend_from_slice(&((HEADER + body.len()) as u64).to_le_bytes());
    out.extend_from_slice(&(directory.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&directory);
    out
}

/// Stored-only sequential archive written to `path`
pub fn write_pak(path: &Path, files: &[(&str, &[u8])]) {
    let entries: Vec<(&str, u8, &[u8])> = files
        .iter()
        .map(|&(name, data)| (name, METHOD_STORED, data))
        .collect();
    write_file(path, &sequential_archive(&entries));
}

/// Indexed store `<stem>.idx` plus chunk files; entries are `(name, chunk, data)`
pub fn write_indexed(
    dir: &Path,
    stem: &str,
    entries: &[(&str, u16, &[u8])],
    signer: Option<&SigningKey>,
) -> PathBuf {
    let mut chunks: BTreeMap<u16, Vec<u8>> = BTreeMap::new();
    let mut records = Vec::new();

    for &(name, chunk, data) in entries {
        let blob = chunks.entry(chunk).or_default();
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
    index.extend_from_slice(b"SIDX");
    index.extend_from_slice(&1u16.to_le_bytes());
    let flags: u16 = if signer.is_some() { 1 } else { 0 };
    index.extend_from_slice(&flags.to_le_bytes());
    index.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    index.extend_from_slice(&(chunks.len() as u32).to_le_bytes());
    index.extend_from_slice(&records);

    for (chunk, blob) in &chunks {
        index.extend_from_slice(&chunk.to_le_bytes());
        index.extend_from_slice(&(blob.len() as u64).to_le_bytes());
        index.extend_from_slice(&Sha256::digest(blob));
        write_file(&dir.join(format!("{}.{:03}", stem, chunk)), blob);
    }

    if let Some(key) = signer {
        let signature = key.sign(&index);
        index.extend_from_slice(&key.verifying_key().to_bytes());
        index.extend_from_slice(&signature.to_bytes());
    }

    let path = dir.join(format!("{}.idx", stem));
    write_file(&path, &index);
    path
}

pub fn write_file(path: &Path, data: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, data).unwrap();
}

pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

/// Filesystem rooted at a fresh temp directory
pub fn filesystem(dir: &TempDir) -> FileSystem {
    FileSystem::builder()
        .base_dir(dir.path())
        .worker_threads(2)
        .build()
        .unwrap()
}

pub fn add(fs: &FileSystem, location: &str, group: &str) {
    assert!(
        fs.add_search_path(location, group, SearchPosition::Tail),
        "failed to mount {}",
        location
    );
}

pub fn read_string(fs: &FileSystem, name: &str, group: Option<&str>) -> String {
    String::from_utf8(fs.read_file(name, group).unwrap()).unwrap()
}
