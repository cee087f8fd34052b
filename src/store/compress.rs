//! Optional LZ4 compression of chunk payloads.
//!
//! The stored form is decided per chunk at put time: when the compressed
//! bytes are not smaller than the original, the payload is stored raw and
//! the index entry's flag records that. Reads always hand back the
//! original bytes.

use crate::store::error::{StoreError, StoreResult};

/// Stored form of a payload, recorded per index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Lz4,
}

impl Compression {
    pub fn flag(self) -> u32 {
        match self {
            Compression::None => 0,
            Compression::Lz4 => 1,
        }
    }

    pub fn from_flag(flag: u32) -> StoreResult<Self> {
        match flag {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Lz4),
            other => Err(StoreError::Compression(format!(
                "unknown compression flag {}",
                other
            ))),
        }
    }
}

/// Compress a payload for storage, falling back to the raw bytes when
/// compression does not shrink it.
pub fn compress_payload(payload: &[u8]) -> (Compression, Vec<u8>) {
    if payload.is_empty() {
        return (Compression::None, Vec::new());
    }
    let compressed = lz4_flex::compress_prepend_size(payload);
    if compressed.len() < payload.len() {
        (Compression::Lz4, compressed)
    } else {
        (Compression::None, payload.to_vec())
    }
}

/// Restore a stored payload to its original bytes.
pub fn decompress_payload(compression: Compression, stored: &[u8]) -> StoreResult<Vec<u8>> {
    match compression {
        Compression::None => Ok(stored.to_vec()),
        Compression::Lz4 => lz4_flex::decompress_size_prepended(stored)
            .map_err(|e| StoreError::Compression(format!("LZ4 decompression failed: {}", e))),
    }
}
