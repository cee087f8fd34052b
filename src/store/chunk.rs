//! Chunk value objects and put semantics.

use chrono::Utc;

use crate::store::error::{StoreError, StoreResult};

/// How a put treats an existing entry with the same
/// (data_type, data_type2, valid_time) key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PutMode {
    /// Always append a new entry, even when the key already exists.
    Add,
    /// Replace a matching entry, keeping a breadcrumb to the old payload
    /// slot for later compaction.
    #[default]
    Over,
    /// As `Over`, but reject the put when an identical chunk (same key,
    /// same payload hash) is already stored.
    Unique,
}

/// One stored product: an opaque payload plus key and time metadata.
///
/// Chunks are immutable once constructed; the builder-style setters
/// consume and return the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Primary classification key, often a hashed 4-character id.
    pub data_type: u32,
    /// Secondary classification key, 0 when unused.
    pub data_type2: u32,
    /// Unix seconds at which the data becomes valid.
    pub valid_time: i64,
    /// Unix seconds after which the data is stale. Never before
    /// `valid_time`; equal means instantaneous data.
    pub expire_time: i64,
    /// Unix seconds at which the chunk was committed.
    pub write_time: i64,
    pub payload: Vec<u8>,
}

impl Chunk {
    /// A chunk valid at `valid_time` with no forecast window.
    pub fn new(data_type: u32, valid_time: i64, payload: Vec<u8>) -> Self {
        Self {
            data_type,
            data_type2: 0,
            valid_time,
            expire_time: valid_time,
            write_time: Utc::now().timestamp(),
            payload,
        }
    }

    pub fn data_type2(mut self, data_type2: u32) -> Self {
        self.data_type2 = data_type2;
        self
    }

    pub fn expire_time(mut self, expire_time: i64) -> Self {
        self.expire_time = expire_time;
        self
    }

    pub fn write_time(mut self, write_time: i64) -> Self {
        self.write_time = write_time;
        self
    }

    /// Reject malformed chunks before any I/O happens.
    pub fn validate(&self, max_payload_len: usize) -> StoreResult<()> {
        if self.expire_time < self.valid_time {
            return Err(StoreError::Validation(format!(
                "expire_time {} before valid_time {}",
                self.expire_time, self.valid_time
            )));
        }
        if self.payload.len() > max_payload_len {
            return Err(StoreError::Validation(format!(
                "payload is {} bytes, limit is {}",
                self.payload.len(),
                max_payload_len
            )));
        }
        Ok(())
    }
}

/// Type-key match with zero as wildcard: a requested data_type of 0
/// matches any stored value, and likewise for data_type2.
pub fn types_match(entry_dt: u32, entry_dt2: u32, want_dt: u32, want_dt2: u32) -> bool {
    (want_dt == 0 || entry_dt == want_dt) && (want_dt2 == 0 || entry_dt2 == want_dt2)
}

/// Pack up to four ASCII id characters into a type key, first character
/// in the low byte. Never returns 0 for a non-empty id.
pub fn hash_data_type(id: &str) -> u32 {
    let mut value: u32 = 0;
    for (i, byte) in id.bytes().take(4).enumerate() {
        value |= (byte as u32) << (i * 8);
    }
    if value == 0 && !id.is_empty() {
        value = 1;
    }
    value
}

/// Recover the id characters from a hashed type key. Zero padding and
/// non-printable bytes are dropped, so a purely numeric key usually
/// yields an empty string.
pub fn unhash_data_type(key: u32) -> String {
    let mut out = String::new();
    for i in 0..4 {
        let byte = ((key >> (i * 8)) & 0xff) as u8;
        if byte.is_ascii_graphic() {
            out.push(byte as char);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let chunk = Chunk::new(1001, 1_700_000_000, b"obs".to_vec());
        assert_eq!(chunk.data_type2, 0);
        assert_eq!(chunk.expire_time, chunk.valid_time);

        let chunk = chunk.data_type2(5).expire_time(1_700_003_600);
        assert_eq!(chunk.data_type2, 5);
        assert_eq!(chunk.expire_time, 1_700_003_600);
    }

    #[test]
    fn validate_rejects_inverted_interval() {
        let chunk = Chunk::new(1, 100, Vec::new()).expire_time(99);
        assert!(matches!(
            chunk.validate(1024),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn validate_rejects_oversized_payload() {
        let chunk = Chunk::new(1, 100, vec![0u8; 32]);
        assert!(matches!(chunk.validate(16), Err(StoreError::Validation(_))));
        assert!(chunk.validate(32).is_ok());
    }

    #[test]
    fn zero_is_wildcard() {
        assert!(types_match(1001, 7, 0, 0));
        assert!(types_match(1001, 7, 1001, 0));
        assert!(types_match(1001, 7, 0, 7));
        assert!(!types_match(1001, 7, 1002, 0));
        assert!(!types_match(1001, 7, 1001, 8));
    }

    #[test]
    fn hash_round_trip() {
        for id in ["KDEN", "KFTG", "AMA", "X"] {
            let key = hash_data_type(id);
            assert_ne!(key, 0);
            assert_eq!(unhash_data_type(key), id);
        }
    }

    #[test]
    fn hash_empty_is_zero() {
        assert_eq!(hash_data_type(""), 0);
        assert_eq!(unhash_data_type(0), "");
    }

    #[test]
    fn hash_uses_first_four_chars() {
        assert_eq!(hash_data_type("BOULDER"), hash_data_type("BOUL"));
    }
}
