//! Multi-period chunk store engine.
//!
//! The engine resolves a logical time/key query across the day
//! directories under one storage root and routes puts to the period
//! owning the chunk's valid time. It is constructed explicitly with its
//! configuration and passed to collaborators; there is no process-global
//! instance.

use std::fs;
use std::path::PathBuf;

use chrono::{NaiveDate, TimeZone, Utc};
use tracing::{debug, warn};

use crate::store::chunk::{Chunk, PutMode};
use crate::store::error::{StoreError, StoreResult};
use crate::store::period::{PeriodStore, INDEX_FILE_NAME};

const SECS_PER_DAY: i64 = 86_400;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Storage root; period directories are created beneath it.
    pub root: PathBuf,
    /// Largest accepted payload, in bytes.
    pub max_chunk_len: usize,
    /// Compress payloads on put.
    pub compress: bool,
    /// Total time a writer waits for a period lock, in milliseconds.
    pub lock_timeout_ms: u64,
    /// Poll interval while waiting for a period lock, in milliseconds.
    pub lock_poll_ms: u64,
    /// Open period handles kept before the least recently used one is
    /// evicted.
    pub max_open_periods: usize,
    /// Rewrite a period's data file when fragmentation crosses the
    /// defrag thresholds after a put.
    pub auto_compact: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./spdb_data"),
            max_chunk_len: 64 * 1024 * 1024,
            compress: false,
            lock_timeout_ms: 5_000,
            lock_poll_ms: 25,
            max_open_periods: 16,
            auto_compact: true,
        }
    }
}

impl StoreConfig {
    /// Default configuration rooted at `root`.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }
}

/// Aggregate statistics over every period under the root.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub periods: usize,
    pub entries: usize,
    pub data_bytes: u64,
    pub fragmented_bytes: u64,
}

/// Process-facing chunk store over a day-partitioned directory tree.
#[derive(Debug)]
pub struct SpdbChunkStore {
    config: StoreConfig,
    put_mode: PutMode,
    /// Open period handles, most recently used last.
    periods: Vec<(i64, PeriodStore)>,
}

impl SpdbChunkStore {
    pub fn new(config: StoreConfig) -> Self {
        debug!(root = %config.root.display(), "opened chunk store");
        Self {
            config,
            put_mode: PutMode::default(),
            periods: Vec::new(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Put mode applied by subsequent [`SpdbChunkStore::put`] calls.
    pub fn set_put_mode(&mut self, mode: PutMode) {
        self.put_mode = mode;
    }

    pub fn put_mode(&self) -> PutMode {
        self.put_mode
    }

    /// Store one chunk in the period owning its valid time, creating the
    /// period on first write.
    pub fn put(&mut self, chunk: &Chunk) -> StoreResult<()> {
        let mode = self.put_mode;
        self.period(day_of(chunk.valid_time))?.put(chunk, mode)
    }

    /// All chunks stored at exactly `valid_time`.
    pub fn get_exact(&mut self, valid_time: i64, data_type: u32, data_type2: u32) -> StoreResult<Vec<Chunk>> {
        self.period(day_of(valid_time))?
            .get_at(valid_time, data_type, data_type2)
    }

    /// Union of matching chunks over [start, end] across every
    /// overlapping period, in valid_time order. A period that fails to
    /// read is logged and contributes nothing.
    pub fn get_interval(&mut self, start: i64, end: i64, data_type: u32, data_type2: u32) -> StoreResult<Vec<Chunk>> {
        if end < start {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for day in self.days_in(start, end)? {
            match self.period(day)?.get_interval(start, end, data_type, data_type2) {
                Ok(mut chunks) => out.append(&mut chunks),
                Err(e) => warn!(day, error = %e, "skipping unreadable period in interval query"),
            }
        }
        Ok(out)
    }

    /// Chunks at the greatest valid_time at or before `t`, looking back
    /// at most `margin` seconds.
    pub fn get_first_before(&mut self, t: i64, margin: i64, data_type: u32, data_type2: u32) -> StoreResult<Vec<Chunk>> {
        match self.search_before(t, t.saturating_sub(margin), data_type, data_type2)? {
            Some(found) => self.get_exact(found, data_type, data_type2),
            None => Ok(Vec::new()),
        }
    }

    /// Chunks at the smallest valid_time at or after `t`, looking ahead
    /// at most `margin` seconds.
    pub fn get_first_after(&mut self, t: i64, margin: i64, data_type: u32, data_type2: u32) -> StoreResult<Vec<Chunk>> {
        match self.search_after(t, t.saturating_add(margin), data_type, data_type2)? {
            Some(found) => self.get_exact(found, data_type, data_type2),
            None => Ok(Vec::new()),
        }
    }

    /// Chunks at the valid_time closest to `t` within `margin` seconds
    /// either way, preferring the earlier time on a tie.
    pub fn get_closest(&mut self, t: i64, margin: i64, data_type: u32, data_type2: u32) -> StoreResult<Vec<Chunk>> {
        let before = self.search_before(t, t.saturating_sub(margin), data_type, data_type2)?;
        let after = self.search_after(t, t.saturating_add(margin), data_type, data_type2)?;
        let found = match (before, after) {
            (Some(b), Some(a)) => {
                if t - b <= a - t {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (found, None) | (None, found) => found,
        };
        match found {
            Some(found) => self.get_exact(found, data_type, data_type2),
            None => Ok(Vec::new()),
        }
    }

    /// Chunks whose validity interval covers `t`: valid on or before it,
    /// expiring on or after it.
    pub fn get_valid(&mut self, t: i64, data_type: u32, data_type2: u32) -> StoreResult<Vec<Chunk>> {
        let hi = day_of(t);
        let days: Vec<i64> = self
            .period_days()?
            .into_iter()
            .filter(|day| *day <= hi)
            .collect();
        let mut out = Vec::new();
        for day in days {
            match self.period(day)?.get_valid(t, data_type, data_type2) {
                Ok(mut chunks) => out.append(&mut chunks),
                Err(e) => warn!(day, error = %e, "skipping unreadable period in valid query"),
            }
        }
        Ok(out)
    }

    /// Chunks within `margin` seconds of the newest matching valid time.
    pub fn get_latest(&mut self, margin: i64, data_type: u32, data_type2: u32) -> StoreResult<Vec<Chunk>> {
        let last = match self.search_before(i64::MAX, i64::MIN, data_type, data_type2)? {
            Some(last) => last,
            None => return Ok(Vec::new()),
        };
        self.get_interval(
            last.saturating_sub(margin),
            last.saturating_add(margin),
            data_type,
            data_type2,
        )
    }

    /// First and last valid times present in the store.
    pub fn get_times(&mut self) -> StoreResult<Option<(i64, i64)>> {
        let days = self.period_days()?;

        let mut first = None;
        for day in &days {
            if let Some(t) = self.period(*day)?.valid_times()?.first() {
                first = Some(*t);
                break;
            }
        }
        let mut last = None;
        for day in days.iter().rev() {
            if let Some(t) = self.period(*day)?.valid_times()?.last() {
                last = Some(*t);
                break;
            }
        }
        Ok(first.zip(last))
    }

    /// Valid times in [start, end], thinned so that within each period a
    /// time is kept only when at least `minimum_interval` seconds after
    /// the previously kept one.
    pub fn compile_time_list(&mut self, start: i64, end: i64, minimum_interval: i64) -> StoreResult<Vec<i64>> {
        let mut out = Vec::new();
        for day in self.days_in(start, end)? {
            let times = self.period(day)?.valid_times()?;
            let mut last_kept: Option<i64> = None;
            for t in times {
                if t < start || t > end {
                    continue;
                }
                let keep = match last_kept {
                    None => true,
                    Some(prev) => t - prev >= minimum_interval,
                };
                if keep {
                    out.push(t);
                    last_kept = Some(t);
                }
            }
        }
        Ok(out)
    }

    /// Remove matching chunks at `valid_time`. Returns how many entries
    /// were dropped.
    pub fn erase(&mut self, valid_time: i64, data_type: u32, data_type2: u32) -> StoreResult<usize> {
        self.period(day_of(valid_time))?
            .erase(valid_time, data_type, data_type2)
    }

    /// Compact every period overlapping [start, end]. Returns total
    /// bytes reclaimed.
    pub fn compact(&mut self, start: i64, end: i64) -> StoreResult<u64> {
        let mut reclaimed = 0;
        for day in self.days_in(start, end)? {
            reclaimed += self.period(day)?.compact()?;
        }
        Ok(reclaimed)
    }

    /// Aggregate statistics across every period under the root.
    pub fn stats(&mut self) -> StoreResult<StoreStats> {
        let mut stats = StoreStats::default();
        for day in self.period_days()? {
            let period = self.period(day)?.stats()?;
            stats.periods += 1;
            stats.entries += period.entries;
            stats.data_bytes += period.data_bytes;
            stats.fragmented_bytes += period.fragmented_bytes;
        }
        Ok(stats)
    }

    /// Handle for the period owning `t`, for inspection tooling.
    pub fn period_for_time(&mut self, t: i64) -> StoreResult<&mut PeriodStore> {
        self.period(day_of(t))
    }

    /// Newest matching valid time at or before `t`, walking periods
    /// backward to `earliest`.
    fn search_before(&mut self, t: i64, earliest: i64, data_type: u32, data_type2: u32) -> StoreResult<Option<i64>> {
        for day in self.days_in(earliest, t)?.into_iter().rev() {
            let period = self.period(day)?;
            let found = match period.latest_time_at_or_before(t, earliest, data_type, data_type2) {
                Ok(found) => found,
                Err(e) => {
                    warn!(day, error = %e, "skipping unreadable period in before search");
                    None
                }
            };
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// Oldest matching valid time at or after `t`, walking periods
    /// forward to `latest`.
    fn search_after(&mut self, t: i64, latest: i64, data_type: u32, data_type2: u32) -> StoreResult<Option<i64>> {
        for day in self.days_in(t, latest)? {
            let period = self.period(day)?;
            let found = match period.earliest_time_at_or_after(t, latest, data_type, data_type2) {
                Ok(found) => found,
                Err(e) => {
                    warn!(day, error = %e, "skipping unreadable period in after search");
                    None
                }
            };
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// Existing period days overlapping [start, end], ascending.
    fn days_in(&self, start: i64, end: i64) -> StoreResult<Vec<i64>> {
        let lo = day_of(start);
        let hi = day_of(end);
        Ok(self
            .period_days()?
            .into_iter()
            .filter(|day| (lo..=hi).contains(day))
            .collect())
    }

    /// Day numbers of every period present under the root, ascending.
    fn period_days(&self) -> StoreResult<Vec<i64>> {
        let mut days = Vec::new();
        let dir = match fs::read_dir(&self.config.root) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(days),
            Err(e) => return Err(e.into()),
        };
        for dirent in dir {
            let dirent = dirent?;
            if let Some(day) = dirent.file_name().to_str().and_then(parse_day_dir_name) {
                if dirent.path().join(INDEX_FILE_NAME).is_file() {
                    days.push(day);
                }
            }
        }
        days.sort_unstable();
        Ok(days)
    }

    /// Cached handle for one day, opening and LRU-evicting as needed.
    /// Evicting drops the handle, which closes its files.
    fn period(&mut self, day: i64) -> StoreResult<&mut PeriodStore> {
        if let Some(at) = self.periods.iter().position(|(d, _)| *d == day) {
            let held = self.periods.remove(at);
            self.periods.push(held);
        } else {
            let dir = self.config.root.join(day_dir_name(day)?);
            self.periods.push((day, PeriodStore::new(dir, self.config.clone())));
            if self.periods.len() > self.config.max_open_periods.max(1) {
                self.periods.remove(0);
            }
        }
        let last = self.periods.len() - 1;
        Ok(&mut self.periods[last].1)
    }
}

/// Keep only the newest chunk per (data_type, data_type2) key, breaking
/// valid_time ties by write_time.
pub fn unique_latest(chunks: Vec<Chunk>) -> Vec<Chunk> {
    let mut best: Vec<Chunk> = Vec::new();
    for chunk in chunks {
        match best
            .iter_mut()
            .find(|c| c.data_type == chunk.data_type && c.data_type2 == chunk.data_type2)
        {
            Some(held) => {
                if chunk.valid_time > held.valid_time
                    || (chunk.valid_time == held.valid_time && chunk.write_time >= held.write_time)
                {
                    *held = chunk;
                }
            }
            None => best.push(chunk),
        }
    }
    best
}

/// Keep only the oldest chunk per (data_type, data_type2) key.
pub fn unique_earliest(chunks: Vec<Chunk>) -> Vec<Chunk> {
    let mut best: Vec<Chunk> = Vec::new();
    for chunk in chunks {
        match best
            .iter_mut()
            .find(|c| c.data_type == chunk.data_type && c.data_type2 == chunk.data_type2)
        {
            Some(held) => {
                if chunk.valid_time < held.valid_time {
                    *held = chunk;
                }
            }
            None => best.push(chunk),
        }
    }
    best
}

/// Day number a unix time falls in (UTC).
fn day_of(t: i64) -> i64 {
    t.div_euclid(SECS_PER_DAY)
}

/// Directory name for a day number, e.g. `20231114`.
fn day_dir_name(day: i64) -> StoreResult<String> {
    day.checked_mul(SECS_PER_DAY)
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .map(|dt| dt.format("%Y%m%d").to_string())
        .ok_or_else(|| {
            StoreError::Validation(format!("time out of calendar range (day {})", day))
        })
}

/// Parse a period directory name back to its day number.
fn parse_day_dir_name(name: &str) -> Option<i64> {
    if name.len() != 8 || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let date = NaiveDate::parse_from_str(name, "%Y%m%d").ok()?;
    let midnight = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?);
    Some(day_of(midnight.timestamp()))
}
