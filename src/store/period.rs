//! One UTC day's index and data pair.
//!
//! A period directory holds the sorted index, the payload blob file, and
//! the writer lock sentinel. Puts serialize on the lock and re-read the
//! index from disk every time, so concurrent writers from other processes
//! are always folded in. Reads take no lock: the index is republished by
//! atomic rename and payload slots are never moved while referenced, so a
//! reader sees a coherent index, and the per-chunk checksum catches the
//! narrow race against a compaction swap.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::store::chunk::{types_match, Chunk, PutMode};
use crate::store::codec::{IndexEntry, DATA_HEADER_LEN};
use crate::store::compress::{self, Compression};
use crate::store::data_file::DataFile;
use crate::store::engine::StoreConfig;
use crate::store::error::{StoreError, StoreResult};
use crate::store::index_file::IndexFile;
use crate::store::lock::PeriodLock;

/// Index file name within a period directory.
pub const INDEX_FILE_NAME: &str = "chunks.indx";
/// Data file name within a period directory.
pub const DATA_FILE_NAME: &str = "chunks.data";
const LOCK_FILE_NAME: &str = "period.lock";

// Defrag trigger thresholds, checked after a put.
const FRAG_MIN_BYTES: u64 = 10_000;
const FRAG_MIN_FRACTION: f64 = 0.05;
const FRAG_FORCE_FRACTION: f64 = 0.3;

/// Size and fragmentation numbers for one period.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeriodStats {
    pub entries: usize,
    /// Data file length, header included.
    pub data_bytes: u64,
    /// Payload bytes still referenced by the index.
    pub live_bytes: u64,
    /// Payload bytes abandoned by overwrites and erases.
    pub fragmented_bytes: u64,
}

/// Storage for one UTC day, created lazily on first write.
#[derive(Debug)]
pub struct PeriodStore {
    dir: PathBuf,
    config: StoreConfig,
    /// Cached read handle, dropped whenever the data file is rewritten.
    data: Option<DataFile>,
}

impl PeriodStore {
    pub fn new(dir: PathBuf, config: StoreConfig) -> Self {
        Self {
            dir,
            config,
            data: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE_NAME)
    }

    pub fn data_path(&self) -> PathBuf {
        self.dir.join(DATA_FILE_NAME)
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE_NAME)
    }

    /// Whether this period has ever been written.
    pub fn exists(&self) -> bool {
        self.index_path().is_file()
    }

    /// Store one chunk under the period write lock.
    pub fn put(&mut self, chunk: &Chunk, mode: PutMode) -> StoreResult<()> {
        chunk.validate(self.config.max_chunk_len)?;
        fs::create_dir_all(&self.dir)?;

        let _lock = self.lock()?;

        // Another process may have written since this handle last looked,
        // so the index is re-read from disk for every put.
        let mut index = IndexFile::open(&self.index_path(), true)?;
        let mut data = DataFile::open(&self.data_path(), true)?;

        let (compression, stored) = if self.config.compress {
            compress::compress_payload(&chunk.payload)
        } else {
            (Compression::None, chunk.payload.clone())
        };
        let checksum = crc32fast::hash(&chunk.payload);
        let stored_len = stored.len() as u32;

        if mode == PutMode::Unique
            && index.duplicate_of(chunk.data_type, chunk.data_type2, chunk.valid_time, checksum)
        {
            return Err(StoreError::DuplicateKey(format!(
                "identical chunk already stored for type ({}, {}) at {}",
                chunk.data_type, chunk.data_type2, chunk.valid_time
            )));
        }

        let replaced = match mode {
            PutMode::Add => None,
            PutMode::Over | PutMode::Unique => index
                .find_key(chunk.data_type, chunk.data_type2, chunk.valid_time)
                .copied(),
        };

        let (offset, prev_offset) = match replaced {
            // Same stored length: reuse the slot in place.
            Some(old) if old.len == stored_len => {
                data.overwrite_at(old.offset, &stored)?;
                (old.offset, old.prev_offset)
            }
            // Different length: append and abandon the old slot.
            Some(old) => (data.append(&stored)?, old.offset as i32),
            None => (data.append(&stored)?, -1),
        };

        // The payload must be durable before the index referencing it is
        // published; a crash in between leaves an inert orphan, never a
        // dangling index entry.
        data.sync()?;

        let entry = IndexEntry {
            data_type: chunk.data_type,
            data_type2: chunk.data_type2,
            valid_time: chunk.valid_time,
            expire_time: chunk.expire_time,
            write_time: chunk.write_time,
            offset,
            len: stored_len,
            prev_offset,
            compression: compression.flag(),
            checksum,
        };
        index.insert(entry, mode)?;
        index.flush()?;

        debug!(
            dir = %self.dir.display(),
            valid_time = chunk.valid_time,
            bytes = stored_len,
            "stored chunk"
        );

        if self.config.auto_compact && should_compact(&index, &data) {
            self.compact_locked(&mut index)?;
        } else {
            self.data = Some(data);
        }
        Ok(())
    }

    /// Matching chunks with lo <= valid_time <= hi, in valid_time order.
    pub fn get_interval(&mut self, lo: i64, hi: i64, data_type: u32, data_type2: u32) -> StoreResult<Vec<Chunk>> {
        let index = match self.load_index()? {
            Some(index) => index,
            None => return Ok(Vec::new()),
        };
        let entries = index.query_time_range(lo, hi, data_type, data_type2);
        self.fetch(&entries)
    }

    /// Matching chunks stored at exactly `t`.
    pub fn get_at(&mut self, t: i64, data_type: u32, data_type2: u32) -> StoreResult<Vec<Chunk>> {
        self.get_interval(t, t, data_type, data_type2)
    }

    /// Matching chunks whose validity interval covers `t`.
    pub fn get_valid(&mut self, t: i64, data_type: u32, data_type2: u32) -> StoreResult<Vec<Chunk>> {
        let index = match self.load_index()? {
            Some(index) => index,
            None => return Ok(Vec::new()),
        };
        let entries: Vec<IndexEntry> = index
            .entries()
            .iter()
            .filter(|e| {
                e.valid_time <= t
                    && e.expire_time >= t
                    && types_match(e.data_type, e.data_type2, data_type, data_type2)
            })
            .copied()
            .collect();
        self.fetch(&entries)
    }

    /// Greatest valid_time <= `t` (and >= `earliest`) with matching data.
    pub fn latest_time_at_or_before(
        &self,
        t: i64,
        earliest: i64,
        data_type: u32,
        data_type2: u32,
    ) -> StoreResult<Option<i64>> {
        Ok(self
            .load_index()?
            .and_then(|index| index.latest_time_at_or_before(t, earliest, data_type, data_type2)))
    }

    /// Smallest valid_time >= `t` (and <= `latest`) with matching data.
    pub fn earliest_time_at_or_after(
        &self,
        t: i64,
        latest: i64,
        data_type: u32,
        data_type2: u32,
    ) -> StoreResult<Option<i64>> {
        Ok(self
            .load_index()?
            .and_then(|index| index.earliest_time_at_or_after(t, latest, data_type, data_type2)))
    }

    /// Every valid_time in the period, ascending, duplicates included.
    pub fn valid_times(&self) -> StoreResult<Vec<i64>> {
        Ok(self
            .load_index()?
            .map(|index| index.entries().iter().map(|e| e.valid_time).collect())
            .unwrap_or_default())
    }

    /// Remove matching entries at `valid_time`. Their payload slots
    /// persist as fragmentation until compaction.
    pub fn erase(&mut self, valid_time: i64, data_type: u32, data_type2: u32) -> StoreResult<usize> {
        if !self.exists() {
            return Ok(0);
        }
        let _lock = self.lock()?;
        let mut index = IndexFile::open(&self.index_path(), false)?;
        let removed = index.erase(valid_time, data_type, data_type2);
        if removed > 0 {
            index.flush()?;
            debug!(dir = %self.dir.display(), valid_time, removed, "erased chunks");
        }
        Ok(removed)
    }

    /// Rewrite the data file keeping only live payloads. Returns bytes
    /// reclaimed.
    pub fn compact(&mut self) -> StoreResult<u64> {
        if !self.exists() {
            return Ok(0);
        }
        let _lock = self.lock()?;
        let mut index = IndexFile::open(&self.index_path(), false)?;
        self.compact_locked(&mut index)
    }

    /// Current size and fragmentation numbers.
    pub fn stats(&self) -> StoreResult<PeriodStats> {
        let index = match self.load_index()? {
            Some(index) => index,
            None => return Ok(PeriodStats::default()),
        };
        let data_bytes = fs::metadata(self.data_path())?.len();
        let payload_region = data_bytes.saturating_sub(DATA_HEADER_LEN as u64);
        let live_bytes = index.live_bytes();
        Ok(PeriodStats {
            entries: index.len(),
            data_bytes,
            live_bytes,
            fragmented_bytes: payload_region.saturating_sub(live_bytes),
        })
    }

    /// Read the current index, `None` when the period has never been
    /// written.
    pub fn load_index(&self) -> StoreResult<Option<IndexFile>> {
        if !self.exists() {
            return Ok(None);
        }
        IndexFile::open(&self.index_path(), false).map(Some)
    }

    fn lock(&self) -> StoreResult<PeriodLock> {
        PeriodLock::acquire(
            &self.lock_path(),
            Duration::from_millis(self.config.lock_timeout_ms),
            Duration::from_millis(self.config.lock_poll_ms),
        )
    }

    /// Copy out the payloads for a set of index entries.
    fn fetch(&mut self, entries: &[IndexEntry]) -> StoreResult<Vec<Chunk>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        // A writer in another process may have grown the file since this
        // handle was cached; reopen when an entry points past its end.
        let need: u64 = entries
            .iter()
            .map(|e| e.offset as u64 + e.len as u64)
            .max()
            .unwrap_or(0);
        let stale = self.data.as_ref().map(|d| d.len() < need).unwrap_or(true);
        if stale {
            self.data = Some(DataFile::open(&self.data_path(), false)?);
        }

        let mut out = Vec::with_capacity(entries.len());
        if let Some(data) = self.data.as_mut() {
            for entry in entries {
                let stored = data.read_at(entry.offset, entry.len)?;
                let compression = Compression::from_flag(entry.compression)?;
                let payload = compress::decompress_payload(compression, &stored)?;
                if crc32fast::hash(&payload) != entry.checksum {
                    return Err(StoreError::Format(format!(
                        "checksum mismatch for chunk at {} in {}",
                        entry.valid_time,
                        self.dir.display()
                    )));
                }
                out.push(Chunk {
                    data_type: entry.data_type,
                    data_type2: entry.data_type2,
                    valid_time: entry.valid_time,
                    expire_time: entry.expire_time,
                    write_time: entry.write_time,
                    payload,
                });
            }
        }
        Ok(out)
    }

    fn compact_locked(&mut self, index: &mut IndexFile) -> StoreResult<u64> {
        let data_path = self.data_path();
        let mut old = DataFile::open(&data_path, false)?;
        let old_len = old.len();

        let tmp = {
            let mut os = data_path.as_os_str().to_os_string();
            os.push(".tmp");
            PathBuf::from(os)
        };
        // A leftover temp file from an interrupted compaction is stale.
        if tmp.exists() {
            fs::remove_file(&tmp)?;
        }

        let mut fresh = DataFile::open(&tmp, true)?;
        let mut rewritten = Vec::with_capacity(index.len());
        for entry in index.entries() {
            let payload = old.read_at(entry.offset, entry.len)?;
            let mut moved = *entry;
            moved.offset = fresh.append(&payload)?;
            moved.prev_offset = -1;
            rewritten.push(moved);
        }
        fresh.sync()?;
        let new_len = fresh.len();
        drop(fresh);
        drop(old);

        fs::rename(&tmp, &data_path)?;
        index.replace_entries(rewritten);
        index.flush()?;
        self.data = None;

        let reclaimed = old_len.saturating_sub(new_len);
        debug!(dir = %self.dir.display(), reclaimed, "compacted period");
        Ok(reclaimed)
    }
}

fn should_compact(index: &IndexFile, data: &DataFile) -> bool {
    let payload_region = data.len().saturating_sub(DATA_HEADER_LEN as u64);
    if payload_region == 0 {
        return false;
    }
    let fragmented = payload_region.saturating_sub(index.live_bytes());
    let fraction = fragmented as f64 / payload_region as f64;
    (fragmented > FRAG_MIN_BYTES && fraction > FRAG_MIN_FRACTION) || fraction > FRAG_FORCE_FRACTION
}
