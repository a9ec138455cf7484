//! Entry codecs for sequential archives
//!
//! The archive stores a method byte per entry. Decoding is bounded by the
//! entry's declared uncompressed size, and the result must match it exactly.

use crate::core::error::{FsError, Result};

/// Compression method of an archive entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionMethod {
    /// Stored as-is
    None = 0,
    /// LZ4 block with prepended size
    Lz4 = 1,
    /// Zstd frame
    Zstd = 2,
}

impl CompressionMethod {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionMethod::None),
            1 => Some(CompressionMethod::Lz4),
            2 => Some(CompressionMethod::Zstd),
            _ => None,
        }
    }
}

/// Decompress `data`, which must expand to exactly `expected_len` bytes
pub fn decompress(data: &[u8], method: CompressionMethod, expected_len: usize) -> Result<Vec<u8>> {
    let out = match method {
        CompressionMethod::None => data.to_vec(),
        CompressionMethod::Lz4 => decompress_lz4(data, expected_len)?,
        CompressionMethod::Zstd => zstd::bulk::decompress(data, expected_len)
            .map_err(|e| FsError::Decompression(format!("Zstd: {}", e)))?,
    };

    if out.len() != expected_len {
        return Err(FsError::Decompression(format!(
            "expected {} bytes, got {}",
            expected_len,
            out.len()
        )));
    }
    Ok(out)
}

/// LZ4 block with a `u32` size prefix, decoded into exactly `expected_len` bytes
fn decompress_lz4(data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    if data.len() < 4 {
        return Err(FsError::Decompression("LZ4: missing size prefix".to_string()));
    }
    let (prefix, block) = data.split_at(4);
    let declared = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if declared != expected_len {
        return Err(FsError::Decompression(format!(
            "LZ4: block declares {} bytes, directory {}",
            declared, expected_len
        )));
    }

    let mut out = vec![0u8; expected_len];
    let written = lz4_flex::block::decompress_into(block, &mut out)
        .map_err(|e| FsError::Decompression(format!("LZ4: {}", e)))?;
    out.truncate(written);
    Ok(out)
}

/// Compress `data`; only fixtures and tooling write archives
#[cfg(test)]
pub fn compress(data: &[u8], method: CompressionMethod) -> Vec<u8> {
    match method {
        CompressionMethod::None => data.to_vec(),
        CompressionMethod::Lz4 => lz4_flex::compress_prepend_size(data),
        CompressionMethod::Zstd => zstd::bulk::compress(data, 3).unwrap(),
    }
}
