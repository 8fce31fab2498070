//! Cache statistics snapshots.

use serde::{Deserialize, Serialize};

/// An immutable snapshot of cache counters.
///
/// Fields a backend does not track remain zero. All counters are monotonic
/// except `current_entries` and `current_size`, which drop on eviction or
/// reset. Taking a snapshot never mutates cache state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStat {
    /// Total bytes ever stored.
    pub total_size: u64,

    /// Bytes currently resident.
    pub current_size: u64,

    /// Slot-table capacity (shared-memory backend).
    pub table_size: u64,

    /// Arena capacity in bytes (shared-memory backend).
    pub data_size: u64,

    /// Entries ever added.
    pub total_entries: u64,

    /// Entries currently resident.
    pub current_entries: u64,

    /// Successful lookups.
    pub hits: u64,

    /// Failed lookups.
    pub misses: u64,

    /// Modules currently checked out by readers.
    pub readers: u64,

    /// Lookups or inserts that landed on a slot held by a different key.
    pub collisions: u64,
}
