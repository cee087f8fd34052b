//! # spdb
//!
//! Day-partitioned chunk store for time-stamped weather products.
//!
//! Chunks are opaque binary payloads tagged with a validity interval and
//! a pair of 32-bit type keys. Each UTC day gets its own index and data
//! file pair under the storage root; the index is big-endian on disk and
//! kept sorted by valid time, so stores are portable across architectures
//! and time-range queries stay cheap. Writers from independent processes
//! serialize per period through an advisory file lock; readers take no
//! lock because the index is republished by atomic rename.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use spdb::{Chunk, PutMode, SpdbChunkStore, StoreConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut store = SpdbChunkStore::new(StoreConfig::new("/data/spdb/metars"));
//!     store.set_put_mode(PutMode::Over);
//!
//!     let station = spdb::hash_data_type("KDEN");
//!     let now = chrono::Utc::now().timestamp();
//!     let report = Chunk::new(station, now, b"KDEN 270253Z 36008KT 10SM".to_vec())
//!         .expire_time(now + 3600);
//!     store.put(&report)?;
//!
//!     let reports = store.get_closest(now, 1800, station, 0)?;
//!     println!("found {} reports", reports.len());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod store;

pub use config::{Config, ConfigError};
pub use store::{
    hash_data_type, unhash_data_type, unique_earliest, unique_latest, Chunk, Compression,
    IndexEntry, PutMode, SpdbChunkStore, StoreConfig, StoreError, StoreResult, StoreStats,
};
