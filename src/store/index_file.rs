//! Sorted chunk index for one period.
//!
//! The whole index is held in memory while open: a header plus an array
//! of fixed-size entries kept sorted by valid_time, with an in-memory
//! type map rebuilt after load and mutation for type-keyed scans.
//! Mutations only mark the index dirty; nothing reaches disk until
//! [`IndexFile::flush`], which rewrites the file through a temp-file and
//! rename swap so a concurrent reader sees either the old index or the
//! new one, never a mix.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::store::chunk::{types_match, PutMode};
use crate::store::codec::{self, IndexEntry, IndexHeader, ENTRY_LEN, INDEX_HEADER_LEN};
use crate::store::error::{StoreError, StoreResult};

#[derive(Debug)]
pub struct IndexFile {
    path: PathBuf,
    entries: Vec<IndexEntry>,
    by_type: HashMap<(u32, u32), Vec<usize>>,
    dirty: bool,
}

impl IndexFile {
    /// Read an index into memory, or start an empty one when the file is
    /// missing and `create_if_missing` is set. The empty index reaches
    /// disk on the first flush.
    pub fn open(path: &Path, create_if_missing: bool) -> StoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                return Ok(Self {
                    path: path.to_path_buf(),
                    entries: Vec::new(),
                    by_type: HashMap::new(),
                    dirty: true,
                });
            }
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("index file {} does not exist", path.display()),
            )));
        }

        let bytes = fs::read(path)?;
        if bytes.len() < INDEX_HEADER_LEN {
            return Err(StoreError::CorruptIndex(format!(
                "{} is {} bytes, shorter than the header",
                path.display(),
                bytes.len()
            )));
        }
        let header = codec::decode_index_header(&bytes[..INDEX_HEADER_LEN])?;
        if header.entry_count < 0 {
            return Err(StoreError::CorruptIndex(format!(
                "{} declares {} entries",
                path.display(),
                header.entry_count
            )));
        }
        let expected = INDEX_HEADER_LEN + header.entry_count as usize * ENTRY_LEN;
        if bytes.len() != expected {
            return Err(StoreError::CorruptIndex(format!(
                "{} declares {} entries but is {} bytes, expected {}",
                path.display(),
                header.entry_count,
                bytes.len(),
                expected
            )));
        }

        let mut entries = Vec::with_capacity(header.entry_count as usize);
        for i in 0..header.entry_count as usize {
            let at = INDEX_HEADER_LEN + i * ENTRY_LEN;
            entries.push(codec::decode_entry(&bytes[at..at + ENTRY_LEN])?);
        }
        if entries.windows(2).any(|w| w[0].valid_time > w[1].valid_time) {
            return Err(StoreError::CorruptIndex(format!(
                "{}: entries out of valid_time order",
                path.display()
            )));
        }

        let mut index = Self {
            path: path.to_path_buf(),
            entries,
            by_type: HashMap::new(),
            dirty: false,
        };
        index.rebuild_type_map();
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries in valid_time order.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Total bytes of stored payload still referenced by the index.
    pub fn live_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.len as u64).sum()
    }

    /// Insert an entry under the given put mode. The payload the entry
    /// points at has already been written by the caller.
    pub fn insert(&mut self, entry: IndexEntry, mode: PutMode) -> StoreResult<()> {
        match mode {
            PutMode::Add => self.insert_sorted(entry),
            PutMode::Over => {
                match self.position_of_key(entry.data_type, entry.data_type2, entry.valid_time) {
                    Some(at) => self.entries[at] = entry,
                    None => self.insert_sorted(entry),
                }
            }
            PutMode::Unique => {
                if self.duplicate_of(
                    entry.data_type,
                    entry.data_type2,
                    entry.valid_time,
                    entry.checksum,
                ) {
                    return Err(StoreError::DuplicateKey(format!(
                        "identical chunk already stored for type ({}, {}) at {}",
                        entry.data_type, entry.data_type2, entry.valid_time
                    )));
                }
                match self.position_of_key(entry.data_type, entry.data_type2, entry.valid_time) {
                    Some(at) => self.entries[at] = entry,
                    None => self.insert_sorted(entry),
                }
            }
        }
        self.dirty = true;
        self.rebuild_type_map();
        Ok(())
    }

    /// The first entry carrying exactly this key, if any.
    pub fn find_key(&self, data_type: u32, data_type2: u32, valid_time: i64) -> Option<&IndexEntry> {
        self.position_of_key(data_type, data_type2, valid_time)
            .map(|at| &self.entries[at])
    }

    /// Whether an entry with this exact key and payload checksum exists.
    pub fn duplicate_of(
        &self,
        data_type: u32,
        data_type2: u32,
        valid_time: i64,
        checksum: u32,
    ) -> bool {
        let start = self.entries.partition_point(|e| e.valid_time < valid_time);
        self.entries[start..]
            .iter()
            .take_while(|e| e.valid_time == valid_time)
            .any(|e| {
                e.data_type == data_type && e.data_type2 == data_type2 && e.checksum == checksum
            })
    }

    /// Entries with lo <= valid_time <= hi matching the type keys
    /// (0 = wildcard), in valid_time order.
    pub fn query_time_range(&self, lo: i64, hi: i64, data_type: u32, data_type2: u32) -> Vec<IndexEntry> {
        let start = self.entries.partition_point(|e| e.valid_time < lo);
        self.entries[start..]
            .iter()
            .take_while(|e| e.valid_time <= hi)
            .filter(|e| types_match(e.data_type, e.data_type2, data_type, data_type2))
            .copied()
            .collect()
    }

    /// Entries for one type key, in valid_time order. A `None` secondary
    /// key matches every data_type2.
    pub fn query_by_type(&self, data_type: u32, data_type2: Option<u32>) -> Vec<IndexEntry> {
        match data_type2 {
            Some(dt2) => match self.by_type.get(&(data_type, dt2)) {
                Some(posns) => posns.iter().map(|&at| self.entries[at]).collect(),
                None => Vec::new(),
            },
            None => self
                .entries
                .iter()
                .filter(|e| e.data_type == data_type)
                .copied()
                .collect(),
        }
    }

    /// Greatest valid_time <= `t` (and >= `earliest`) carrying a matching
    /// entry.
    pub fn latest_time_at_or_before(
        &self,
        t: i64,
        earliest: i64,
        data_type: u32,
        data_type2: u32,
    ) -> Option<i64> {
        let end = self.entries.partition_point(|e| e.valid_time <= t);
        self.entries[..end]
            .iter()
            .rev()
            .take_while(|e| e.valid_time >= earliest)
            .find(|e| types_match(e.data_type, e.data_type2, data_type, data_type2))
            .map(|e| e.valid_time)
    }

    /// Smallest valid_time >= `t` (and <= `latest`) carrying a matching
    /// entry.
    pub fn earliest_time_at_or_after(
        &self,
        t: i64,
        latest: i64,
        data_type: u32,
        data_type2: u32,
    ) -> Option<i64> {
        let start = self.entries.partition_point(|e| e.valid_time < t);
        self.entries[start..]
            .iter()
            .take_while(|e| e.valid_time <= latest)
            .find(|e| types_match(e.data_type, e.data_type2, data_type, data_type2))
            .map(|e| e.valid_time)
    }

    /// Remove entries at `valid_time` matching the type keys. Freed data
    /// slots become fragmentation until compaction.
    pub fn erase(&mut self, valid_time: i64, data_type: u32, data_type2: u32) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| {
            !(e.valid_time == valid_time
                && types_match(e.data_type, e.data_type2, data_type, data_type2))
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            self.dirty = true;
            self.rebuild_type_map();
        }
        removed
    }

    /// Swap in a rewritten entry set. Used by compaction after payloads
    /// have been moved.
    pub(crate) fn replace_entries(&mut self, entries: Vec<IndexEntry>) {
        self.entries = entries;
        self.dirty = true;
        self.rebuild_type_map();
    }

    /// Write the index back to disk atomically. No-op when clean.
    pub fn flush(&mut self) -> StoreResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(INDEX_HEADER_LEN + self.entries.len() * ENTRY_LEN);
        let header = IndexHeader::new(self.entries.len() as i32);
        buf.extend_from_slice(&codec::encode_index_header(&header));
        for entry in &self.entries {
            buf.extend_from_slice(&codec::encode_entry(entry));
        }

        let tmp = tmp_path(&self.path);
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;
        self.dirty = false;
        Ok(())
    }

    fn insert_sorted(&mut self, entry: IndexEntry) {
        // Upper bound keeps same-time entries in insertion order.
        let at = self
            .entries
            .partition_point(|e| e.valid_time <= entry.valid_time);
        self.entries.insert(at, entry);
    }

    fn position_of_key(&self, data_type: u32, data_type2: u32, valid_time: i64) -> Option<usize> {
        let start = self.entries.partition_point(|e| e.valid_time < valid_time);
        self.entries[start..]
            .iter()
            .take_while(|e| e.valid_time == valid_time)
            .position(|e| e.data_type == data_type && e.data_type2 == data_type2)
            .map(|at| start + at)
    }

    fn rebuild_type_map(&mut self) {
        self.by_type.clear();
        for (at, entry) in self.entries.iter().enumerate() {
            self.by_type
                .entry((entry.data_type, entry.data_type2))
                .or_default()
                .push(at);
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(data_type: u32, valid_time: i64, offset: u32, checksum: u32) -> IndexEntry {
        IndexEntry {
            data_type,
            data_type2: 0,
            valid_time,
            expire_time: valid_time,
            write_time: valid_time,
            offset,
            len: 16,
            prev_offset: -1,
            compression: 0,
            checksum,
        }
    }

    #[test]
    fn add_keeps_time_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.indx");
        let mut index = IndexFile::open(&path, true).unwrap();

        for t in [100, 110, 105] {
            index.insert(entry(1, t, 8, t as u32), PutMode::Add).unwrap();
        }
        let times: Vec<i64> = index.entries().iter().map(|e| e.valid_time).collect();
        assert_eq!(times, vec![100, 105, 110]);
    }

    #[test]
    fn flush_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.indx");

        let mut index = IndexFile::open(&path, true).unwrap();
        index.insert(entry(1001, 100, 8, 0xaa), PutMode::Add).unwrap();
        index.insert(entry(1002, 200, 24, 0xbb), PutMode::Add).unwrap();
        assert!(index.is_dirty());
        index.flush().unwrap();
        assert!(!index.is_dirty());

        let reopened = IndexFile::open(&path, false).unwrap();
        assert_eq!(reopened.entries(), index.entries());
    }

    #[test]
    fn over_replaces_matching_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.indx");
        let mut index = IndexFile::open(&path, true).unwrap();

        index.insert(entry(1001, 100, 8, 0xaa), PutMode::Over).unwrap();
        let mut second = entry(1001, 100, 24, 0xbb);
        second.prev_offset = 8;
        index.insert(second, PutMode::Over).unwrap();

        assert_eq!(index.len(), 1);
        assert_eq!(index.entries()[0].offset, 24);
        assert_eq!(index.entries()[0].prev_offset, 8);
    }

    #[test]
    fn over_with_new_key_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.indx");
        let mut index = IndexFile::open(&path, true).unwrap();

        index.insert(entry(1001, 100, 8, 0xaa), PutMode::Over).unwrap();
        index.insert(entry(1002, 100, 24, 0xbb), PutMode::Over).unwrap();
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn unique_rejects_identical_checksum() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.indx");
        let mut index = IndexFile::open(&path, true).unwrap();

        index.insert(entry(1001, 100, 8, 0xaa), PutMode::Unique).unwrap();
        let err = index
            .insert(entry(1001, 100, 24, 0xaa), PutMode::Unique)
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(_)));
        assert_eq!(index.len(), 1);
        assert_eq!(index.entries()[0].offset, 8);
    }

    #[test]
    fn unique_replaces_changed_payload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.indx");
        let mut index = IndexFile::open(&path, true).unwrap();

        index.insert(entry(1001, 100, 8, 0xaa), PutMode::Unique).unwrap();
        index.insert(entry(1001, 100, 24, 0xbb), PutMode::Unique).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.entries()[0].checksum, 0xbb);
    }

    #[test]
    fn time_range_query_filters_types() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.indx");
        let mut index = IndexFile::open(&path, true).unwrap();

        index.insert(entry(1, 100, 8, 1), PutMode::Add).unwrap();
        index.insert(entry(2, 150, 24, 2), PutMode::Add).unwrap();
        index.insert(entry(1, 200, 40, 3), PutMode::Add).unwrap();

        assert_eq!(index.query_time_range(100, 200, 0, 0).len(), 3);
        let only_type_1 = index.query_time_range(100, 200, 1, 0);
        assert_eq!(only_type_1.len(), 2);
        assert!(only_type_1.iter().all(|e| e.data_type == 1));
        assert_eq!(index.query_time_range(120, 160, 0, 0).len(), 1);
    }

    #[test]
    fn query_by_type_uses_the_map() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.indx");
        let mut index = IndexFile::open(&path, true).unwrap();

        let mut tagged = entry(5, 100, 8, 1);
        tagged.data_type2 = 9;
        index.insert(tagged, PutMode::Add).unwrap();
        index.insert(entry(5, 200, 24, 2), PutMode::Add).unwrap();

        assert_eq!(index.query_by_type(5, Some(9)).len(), 1);
        assert_eq!(index.query_by_type(5, Some(0)).len(), 1);
        assert_eq!(index.query_by_type(5, None).len(), 2);
        assert!(index.query_by_type(6, None).is_empty());
    }

    #[test]
    fn before_and_after_searches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.indx");
        let mut index = IndexFile::open(&path, true).unwrap();

        index.insert(entry(1, 100, 8, 1), PutMode::Add).unwrap();
        index.insert(entry(2, 150, 24, 2), PutMode::Add).unwrap();

        assert_eq!(index.latest_time_at_or_before(149, 0, 0, 0), Some(100));
        assert_eq!(index.latest_time_at_or_before(150, 0, 0, 0), Some(150));
        assert_eq!(index.latest_time_at_or_before(149, 120, 0, 0), None);
        assert_eq!(index.latest_time_at_or_before(149, 0, 2, 0), None);

        assert_eq!(index.earliest_time_at_or_after(101, i64::MAX, 0, 0), Some(150));
        assert_eq!(index.earliest_time_at_or_after(101, 140, 0, 0), None);
        assert_eq!(index.earliest_time_at_or_after(0, i64::MAX, 1, 0), Some(100));
    }

    #[test]
    fn erase_drops_matching_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.indx");
        let mut index = IndexFile::open(&path, true).unwrap();

        index.insert(entry(1, 100, 8, 1), PutMode::Add).unwrap();
        index.insert(entry(2, 100, 24, 2), PutMode::Add).unwrap();
        index.insert(entry(1, 200, 40, 3), PutMode::Add).unwrap();

        assert_eq!(index.erase(100, 1, 0), 1);
        assert_eq!(index.len(), 2);
        assert_eq!(index.erase(100, 0, 0), 1);
        assert_eq!(index.erase(300, 0, 0), 0);
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.indx");

        let mut index = IndexFile::open(&path, true).unwrap();
        index.insert(entry(1, 100, 8, 1), PutMode::Add).unwrap();
        index.flush().unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();
        assert!(matches!(
            IndexFile::open(&path, false),
            Err(StoreError::CorruptIndex(_))
        ));
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.indx");
        fs::write(&path, vec![0u8; INDEX_HEADER_LEN]).unwrap();
        assert!(matches!(
            IndexFile::open(&path, false),
            Err(StoreError::CorruptIndex(_))
        ));
    }

    #[test]
    fn empty_index_flushes_header_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.indx");

        let mut index = IndexFile::open(&path, true).unwrap();
        index.flush().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), INDEX_HEADER_LEN as u64);

        let reopened = IndexFile::open(&path, false).unwrap();
        assert!(reopened.is_empty());
    }
}
