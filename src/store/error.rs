//! Error types for the chunk store.

use thiserror::Error;

/// Errors surfaced by the chunk store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("format error: {0}")]
    Format(String),

    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    #[error("lock timeout: {0}")]
    LockTimeout(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("range error: {0}")]
    Range(String),

    #[error("compression error: {0}")]
    Compression(String),
}

/// Result alias used throughout the store.
pub type StoreResult<T> = Result<T, StoreError>;
