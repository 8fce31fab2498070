//! Error types for the module cache.
//!
//! One enum covers every backend. Store, mapping, and lock failures are
//! environment problems and surface as hard errors; corrupt or stale modules
//! are ordinary misses unless strict verification is enabled.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] heed::Error),

    #[error("entry already cached: {0:?}")]
    AlreadyCached(String),

    #[error("module blob malformed: {0}")]
    Malformed(&'static str),

    #[error("module hash mismatch (stored={stored:#018x}, computed={computed:#018x})")]
    HashMismatch { stored: u64, computed: u64 },

    #[error("module version mismatch (stored={stored}, expected={expected})")]
    VersionMismatch { stored: u32, expected: u32 },

    #[error("invalid cache geometry: {0}")]
    Geometry(&'static str),

    #[error("shared mapping failed: {0}")]
    Map(String),

    #[error("process-shared lock failed: {0}")]
    Lock(String),

    #[error("reset aborted: {readers} reader(s) still active after drain budget")]
    ResetTimeout { readers: u64 },
}
