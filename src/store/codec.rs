//! Fixed-record byte-order codec for the on-disk index and data formats.
//!
//! Everything multi-byte is big-endian on disk, so a store written on one
//! architecture reads back on any other. Fields are encoded one at a time;
//! the in-memory structs are never written raw.
//!
//! Index file layout:
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ Header (16 bytes)                    │
//! │ ├─ magic "SPDX"        (4 bytes)     │
//! │ ├─ format version      (i32)         │
//! │ ├─ entry count         (i32)         │
//! │ └─ entry record size   (i32)         │
//! ├──────────────────────────────────────┤
//! │ IndexEntry records (52 bytes each)   │
//! └──────────────────────────────────────┘
//! ```
//!
//! Data file layout: an 8-byte header (magic "SPDD", format version)
//! followed by raw payload bytes back to back. There is no per-payload
//! framing; offsets and lengths live in the index.

use crate::store::error::{StoreError, StoreResult};

pub const INDEX_MAGIC: [u8; 4] = *b"SPDX";
pub const DATA_MAGIC: [u8; 4] = *b"SPDD";
pub const FORMAT_VERSION: i32 = 1;

pub const INDEX_HEADER_LEN: usize = 16;
pub const ENTRY_LEN: usize = 52;
pub const DATA_HEADER_LEN: usize = 8;

/// Index file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub version: i32,
    pub entry_count: i32,
    pub entry_len: i32,
}

impl IndexHeader {
    pub fn new(entry_count: i32) -> Self {
        Self {
            version: FORMAT_VERSION,
            entry_count,
            entry_len: ENTRY_LEN as i32,
        }
    }
}

/// One chunk's index record: the chunk key and time fields plus the
/// location of the payload in the paired data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub data_type: u32,
    pub data_type2: u32,
    pub valid_time: i64,
    pub expire_time: i64,
    pub write_time: i64,
    /// Absolute byte offset of the stored payload in the data file.
    pub offset: u32,
    /// Stored payload length in bytes (after compression, if any).
    pub len: u32,
    /// Data-file slot abandoned by an OVER replacement, -1 if none.
    pub prev_offset: i32,
    /// Stored-form flag, see the compress module.
    pub compression: u32,
    /// CRC32 of the uncompressed payload.
    pub checksum: u32,
}

pub fn encode_index_header(header: &IndexHeader) -> [u8; INDEX_HEADER_LEN] {
    let mut buf = [0u8; INDEX_HEADER_LEN];
    buf[0..4].copy_from_slice(&INDEX_MAGIC);
    buf[4..8].copy_from_slice(&header.version.to_be_bytes());
    buf[8..12].copy_from_slice(&header.entry_count.to_be_bytes());
    buf[12..16].copy_from_slice(&header.entry_len.to_be_bytes());
    buf
}

pub fn decode_index_header(buf: &[u8]) -> StoreResult<IndexHeader> {
    if buf.len() != INDEX_HEADER_LEN {
        return Err(StoreError::Format(format!(
            "index header is {} bytes, expected {}",
            buf.len(),
            INDEX_HEADER_LEN
        )));
    }
    if buf[0..4] != INDEX_MAGIC {
        return Err(StoreError::CorruptIndex(format!(
            "bad index magic {:02x?}",
            &buf[0..4]
        )));
    }
    let version = be_i32(buf, 4);
    if version != FORMAT_VERSION {
        return Err(StoreError::CorruptIndex(format!(
            "unsupported index version {}",
            version
        )));
    }
    let entry_len = be_i32(buf, 12);
    if entry_len != ENTRY_LEN as i32 {
        return Err(StoreError::CorruptIndex(format!(
            "index declares {}-byte entries, expected {}",
            entry_len, ENTRY_LEN
        )));
    }
    Ok(IndexHeader {
        version,
        entry_count: be_i32(buf, 8),
        entry_len,
    })
}

pub fn encode_entry(entry: &IndexEntry) -> [u8; ENTRY_LEN] {
    let mut buf = [0u8; ENTRY_LEN];
    buf[0..4].copy_from_slice(&entry.data_type.to_be_bytes());
    buf[4..8].copy_from_slice(&entry.data_type2.to_be_bytes());
    buf[8..16].copy_from_slice(&entry.valid_time.to_be_bytes());
    buf[16..24].copy_from_slice(&entry.expire_time.to_be_bytes());
    buf[24..32].copy_from_slice(&entry.write_time.to_be_bytes());
    buf[32..36].copy_from_slice(&entry.offset.to_be_bytes());
    buf[36..40].copy_from_slice(&entry.len.to_be_bytes());
    buf[40..44].copy_from_slice(&entry.prev_offset.to_be_bytes());
    buf[44..48].copy_from_slice(&entry.compression.to_be_bytes());
    buf[48..52].copy_from_slice(&entry.checksum.to_be_bytes());
    buf
}

pub fn decode_entry(buf: &[u8]) -> StoreResult<IndexEntry> {
    if buf.len() != ENTRY_LEN {
        return Err(StoreError::Format(format!(
            "index entry is {} bytes, expected {}",
            buf.len(),
            ENTRY_LEN
        )));
    }
    Ok(IndexEntry {
        data_type: be_u32(buf, 0),
        data_type2: be_u32(buf, 4),
        valid_time: be_i64(buf, 8),
        expire_time: be_i64(buf, 16),
        write_time: be_i64(buf, 24),
        offset: be_u32(buf, 32),
        len: be_u32(buf, 36),
        prev_offset: be_i32(buf, 40),
        compression: be_u32(buf, 44),
        checksum: be_u32(buf, 48),
    })
}

pub fn encode_data_header() -> [u8; DATA_HEADER_LEN] {
    let mut buf = [0u8; DATA_HEADER_LEN];
    buf[0..4].copy_from_slice(&DATA_MAGIC);
    buf[4..8].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
    buf
}

pub fn decode_data_header(buf: &[u8]) -> StoreResult<()> {
    if buf.len() != DATA_HEADER_LEN {
        return Err(StoreError::Format(format!(
            "data header is {} bytes, expected {}",
            buf.len(),
            DATA_HEADER_LEN
        )));
    }
    if buf[0..4] != DATA_MAGIC {
        return Err(StoreError::CorruptIndex(format!(
            "bad data file magic {:02x?}",
            &buf[0..4]
        )));
    }
    let version = be_i32(buf, 4);
    if version != FORMAT_VERSION {
        return Err(StoreError::CorruptIndex(format!(
            "unsupported data file version {}",
            version
        )));
    }
    Ok(())
}

fn be_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(bytes)
}

fn be_i32(buf: &[u8], at: usize) -> i32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    i32::from_be_bytes(bytes)
}

fn be_i64(buf: &[u8], at: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    i64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> IndexEntry {
        IndexEntry {
            data_type: 1001,
            data_type2: 7,
            valid_time: 1_700_000_000,
            expire_time: 1_700_003_600,
            write_time: 1_700_000_010,
            offset: 8,
            len: 128,
            prev_offset: -1,
            compression: 0,
            checksum: 0xdead_beef,
        }
    }

    #[test]
    fn header_round_trip() {
        let header = IndexHeader::new(42);
        let decoded = decode_index_header(&encode_index_header(&header)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn entry_round_trip() {
        let entry = sample_entry();
        let decoded = decode_entry(&encode_entry(&entry)).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn entry_is_big_endian() {
        let encoded = encode_entry(&sample_entry());
        // data_type 1001 = 0x03e9 in the first four bytes, high byte first.
        assert_eq!(&encoded[0..4], &[0x00, 0x00, 0x03, 0xe9]);
        // valid_time occupies bytes 8..16, high byte first.
        assert_eq!(&encoded[8..16], &1_700_000_000i64.to_be_bytes());
    }

    #[test]
    fn wrong_length_is_format_error() {
        assert!(matches!(
            decode_index_header(&[0u8; 10]),
            Err(StoreError::Format(_))
        ));
        assert!(matches!(decode_entry(&[0u8; 51]), Err(StoreError::Format(_))));
        assert!(matches!(
            decode_data_header(&[0u8; 4]),
            Err(StoreError::Format(_))
        ));
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let mut buf = encode_index_header(&IndexHeader::new(0));
        buf[0] = b'X';
        assert!(matches!(
            decode_index_header(&buf),
            Err(StoreError::CorruptIndex(_))
        ));

        let mut buf = encode_data_header();
        buf[1] = 0;
        assert!(matches!(
            decode_data_header(&buf),
            Err(StoreError::CorruptIndex(_))
        ));
    }

    #[test]
    fn bad_version_is_corrupt() {
        let mut buf = encode_index_header(&IndexHeader::new(0));
        buf[4..8].copy_from_slice(&99i32.to_be_bytes());
        assert!(matches!(
            decode_index_header(&buf),
            Err(StoreError::CorruptIndex(_))
        ));
    }

    #[test]
    fn bad_entry_size_is_corrupt() {
        let mut buf = encode_index_header(&IndexHeader::new(0));
        buf[12..16].copy_from_slice(&40i32.to_be_bytes());
        assert!(matches!(
            decode_index_header(&buf),
            Err(StoreError::CorruptIndex(_))
        ));
    }
}
