//! Day-partitioned chunk storage.
//!
//! Component layering, leaf first: the byte-order codec, the chunk value
//! objects, then the per-period index and data files, the period store
//! that pairs them under a writer lock, and finally the engine that
//! routes queries and puts across periods.

pub mod chunk;
pub mod codec;
pub mod compress;
pub mod data_file;
pub mod engine;
pub mod error;
pub mod index_file;
pub mod lock;
pub mod period;

pub use chunk::{hash_data_type, types_match, unhash_data_type, Chunk, PutMode};
pub use codec::{IndexEntry, IndexHeader};
pub use compress::Compression;
pub use data_file::DataFile;
pub use engine::{unique_earliest, unique_latest, SpdbChunkStore, StoreConfig, StoreStats};
pub use error::{StoreError, StoreResult};
pub use index_file::IndexFile;
pub use lock::PeriodLock;
pub use period::{PeriodStats, PeriodStore};
